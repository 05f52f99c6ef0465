//! Topics and subscription filters.
//!
//! A topic is a non-empty `/`-separated string. A filter is a canonical set
//! of topic prefixes: a topic matches a filter if some member is either equal
//! to the topic or is followed in the topic by a `/` separator.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix reserved for clone-to-master traffic. Messages on such topics are
/// never forwarded beyond the immediate recipient.
pub const CLONE_SUFFIX: &str = "/clone";

/// Namespace reserved for endpoint-local status and error events.
pub const INTERNAL_PREFIX: &str = "broker";

/// Internal topic carrying transport and protocol errors.
pub const ERRORS_TOPIC: &str = "broker/errors";

/// Internal topic carrying peer lifecycle status events.
pub const STATUSES_TOPIC: &str = "broker/statuses";

/// Hierarchical topic name for message routing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a new topic.
    ///
    /// # Errors
    /// Returns an error if the name is empty or contains an empty segment.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidTopic { message: "topic name cannot be empty".to_string() });
        }
        if name.split('/').any(str::is_empty) {
            return Err(Error::InvalidTopic {
                message: format!("topic '{name}' contains an empty segment"),
            });
        }
        Ok(Self(name))
    }

    /// Get the topic name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to the owned name.
    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether this topic carries clone-to-master traffic (`*/clone`).
    pub fn is_clone_traffic(&self) -> bool {
        self.0.ends_with(CLONE_SUFFIX)
    }

    /// Whether this topic lives in the reserved `broker/` namespace.
    pub fn is_internal(&self) -> bool {
        self.0 == INTERNAL_PREFIX || self.0.starts_with("broker/")
    }

    /// The clone channel derived from this topic (`<topic>/clone`).
    pub fn clone_channel(&self) -> Self {
        Self(format!("{}{CLONE_SUFFIX}", self.0))
    }

    /// Whether `self` is a prefix of `topic` in the path sense: equal, or
    /// followed in `topic` by a `/` separator.
    pub fn prefix_of(&self, topic: &Self) -> bool {
        let (p, t) = (self.0.as_str(), topic.0.as_str());
        t == p || (t.starts_with(p) && t.as_bytes().get(p.len()) == Some(&b'/'))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical set of topic prefixes.
///
/// No member is ever a proper path-prefix of another: inserting a broader
/// prefix absorbs the narrower ones it covers, and inserting a prefix that is
/// already covered is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    prefixes: Vec<Topic>,
}

impl Filter {
    /// The empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from topics, canonicalizing as it goes.
    pub fn from_topics(topics: impl IntoIterator<Item = Topic>) -> Self {
        let mut filter = Self::new();
        for t in topics {
            filter.insert(t);
        }
        filter
    }

    /// Insert a prefix. Returns whether the filter changed.
    pub fn insert(&mut self, prefix: Topic) -> bool {
        if self.prefixes.iter().any(|p| p.prefix_of(&prefix)) {
            return false;
        }
        self.prefixes.retain(|p| !prefix.prefix_of(p));
        let at = self.prefixes.partition_point(|p| *p < prefix);
        self.prefixes.insert(at, prefix);
        true
    }

    /// Extend with every member of `other` accepted by `keep`.
    /// Returns whether the filter changed.
    pub fn extend_filtered(&mut self, other: &Self, keep: impl Fn(&Topic) -> bool) -> bool {
        let mut changed = false;
        for prefix in &other.prefixes {
            if keep(prefix) {
                changed |= self.insert(prefix.clone());
            }
        }
        changed
    }

    /// Extend with every member of `other`. Returns whether the filter changed.
    pub fn extend(&mut self, other: &Self) -> bool {
        self.extend_filtered(other, |_| true)
    }

    /// Whether `topic` matches any member prefix.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.prefixes.iter().any(|p| p.prefix_of(topic))
    }

    /// Whether the filter has no members.
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Number of member prefixes.
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Iterate the member prefixes in order.
    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.prefixes.iter()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, p) in self.prefixes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Topic {
        Topic::new(name).expect("valid topic")
    }

    #[test]
    fn test_topic_validation() {
        assert!(Topic::new("a/b/c").is_ok());
        assert!(Topic::new("").is_err());
        assert!(Topic::new("/a").is_err());
        assert!(Topic::new("a//b").is_err());
        assert!(Topic::new("a/").is_err());
    }

    #[test]
    fn test_prefix_matching_requires_separator() {
        assert!(topic("sensors").prefix_of(&topic("sensors/rack1")));
        assert!(topic("sensors").prefix_of(&topic("sensors")));
        assert!(!topic("sensors").prefix_of(&topic("sensorsX")));
        assert!(!topic("sensors/rack1").prefix_of(&topic("sensors")));
    }

    #[test]
    fn test_reserved_names() {
        assert!(topic("store/clone").is_clone_traffic());
        assert!(!topic("store/cloned").is_clone_traffic());
        assert!(topic(ERRORS_TOPIC).is_internal());
        assert!(topic(STATUSES_TOPIC).is_internal());
        assert!(topic("broker").is_internal());
        assert!(!topic("brokerage").is_internal());
        assert_eq!(topic("store").clone_channel(), topic("store/clone"));
    }

    #[test]
    fn test_filter_canonicalization() {
        let mut f = Filter::new();
        assert!(f.insert(topic("a/b")));
        assert!(f.insert(topic("a/c")));
        assert_eq!(f.len(), 2);
        // A broader prefix absorbs both narrower members.
        assert!(f.insert(topic("a")));
        assert_eq!(f.len(), 1);
        // Anything it covers is now a no-op.
        assert!(!f.insert(topic("a/d")));
        assert!(f.matches(&topic("a/d/e")));
        assert!(!f.matches(&topic("ab")));
    }

    #[test]
    fn test_filter_extend_reports_change() {
        let mut f = Filter::from_topics([topic("x")]);
        let other = Filter::from_topics([topic("x/y"), topic("z")]);
        assert!(f.extend(&other));
        assert_eq!(f.len(), 2);
        assert!(!f.extend(&other));
    }
}
