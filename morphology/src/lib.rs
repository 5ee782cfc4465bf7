//! Keyword relevance over inflected text.
//!
//! A [`Normalizer`] collapses inflected words to a comparable canonical form and
//! the [`KeywordMatcher`] applies it to both the keywords and every token of a
//! comment. Russian text goes through the OpenCorpora dictionary
//! ([`DictionaryNormalizer`]); Snowball stemming covers the rest.

pub mod dictionary;
pub mod matcher;
pub mod normalizer;

pub use dictionary::DictionaryNormalizer;
pub use matcher::{tokenize, KeywordMatcher};
pub use normalizer::{clean_word, LowercaseNormalizer, Normalizer, Script, SnowballNormalizer};
