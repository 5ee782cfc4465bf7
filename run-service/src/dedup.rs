use harvester_core::{ChannelRef, RawComment, UniqueAuthor};
use std::collections::HashSet;

/// Keep the first comment of every author, in retrieval order.
pub fn first_occurrence<'a, I>(comments: I, channel: &ChannelRef) -> Vec<UniqueAuthor>
where
    I: IntoIterator<Item = &'a RawComment>,
{
    let mut seen = HashSet::new();
    comments
        .into_iter()
        .filter(|comment| seen.insert(comment.author_id))
        .map(|comment| UniqueAuthor::from_comment(comment, channel))
        .collect()
}
