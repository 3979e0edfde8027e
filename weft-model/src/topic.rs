//! Topic - hierarchical message names and interest filters
//!
//! A topic is a `/`-joined path. A filter is a sorted, duplicate-free list of
//! topic prefixes; matching is component-aligned, so filter entry `a/b`
//! matches `a/b` and `a/b/c` but not `a/bc`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved path component for internal store channels.
pub const STORE_CHANNEL: &str = "<store>";

/// Topic on which a named store's master receives commands.
pub fn store_master_topic(name: &str) -> Topic {
    Topic::new(format!("{name}/{STORE_CHANNEL}/master"))
}

/// Topic on which a named store's clones receive updates and snapshots.
pub fn store_clone_topic(name: &str) -> Topic {
    Topic::new(format!("{name}/{STORE_CHANNEL}/clone"))
}

/// A hierarchical message name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` is a component-aligned prefix of `topic`.
    pub fn is_prefix_of(&self, topic: &Topic) -> bool {
        let prefix = self.0.as_str();
        let full = topic.0.as_str();
        full == prefix
            || (full.len() > prefix.len()
                && full.starts_with(prefix)
                && full.as_bytes()[prefix.len()] == b'/')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Topic::new(s)
    }
}

/// A sorted, duplicate-free set of topic prefixes.
///
/// The canonical form (sorted, unique) is re-established after every
/// mutation, so observers can rely on it at any moment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Vec<Topic>);

impl Filter {
    pub fn new() -> Self {
        Filter(Vec::new())
    }

    /// Append entries, then restore canonical form. Returns true if the
    /// filter actually grew.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = Topic>) -> bool {
        let before = self.0.len();
        self.0.extend(entries);
        self.0.sort();
        self.0.dedup();
        self.0.len() != before
    }

    /// True if any entry is a prefix of `topic`.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.0.iter().any(|entry| entry.is_prefix_of(topic))
    }

    /// True if the filter carries exactly this entry.
    pub fn has_entry(&self, entry: &Topic) -> bool {
        self.0.binary_search(entry).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: Into<Topic>> FromIterator<T> for Filter {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut filter = Filter::new();
        filter.extend(iter.into_iter().map(Into::into));
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_is_component_aligned() {
        let entry = Topic::new("a/b");
        assert!(entry.is_prefix_of(&Topic::new("a/b")));
        assert!(entry.is_prefix_of(&Topic::new("a/b/c")));
        assert!(!entry.is_prefix_of(&Topic::new("a/bc")));
        assert!(!entry.is_prefix_of(&Topic::new("a")));
    }

    #[test]
    fn filter_stays_sorted_and_unique() {
        let mut filter = Filter::new();
        assert!(filter.extend([Topic::new("z"), Topic::new("a"), Topic::new("z")]));
        let entries: Vec<_> = filter.iter().map(|t| t.as_str().to_string()).collect();
        assert_eq!(entries, ["a", "z"]);

        // Re-adding existing entries reports no growth.
        assert!(!filter.extend([Topic::new("a")]));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn filter_matches_by_prefix() {
        let filter: Filter = ["x"].into_iter().collect();
        assert!(filter.matches(&Topic::new("x/y")));
        assert!(!filter.matches(&Topic::new("z")));
    }

    #[test]
    fn reserved_store_topics() {
        let master = store_master_topic("kv");
        assert_eq!(master.as_str(), "kv/<store>/master");
        assert!(store_clone_topic("kv").as_str().ends_with("/clone"));
    }
}
