//! Run lifecycle: start, observe, cancel and collect keyword-filtered comment runs.
//!
//! Each run is driven by an [`Orchestrator`] on its own task. The [`RunRegistry`]
//! owns the handles and answers progress and result queries without blocking the
//! pipeline.

pub mod dedup;
pub mod orchestrator;
pub mod registry;

pub use orchestrator::Orchestrator;
pub use registry::{RunHandle, RunRegistry};

#[cfg(test)]
mod tests;
