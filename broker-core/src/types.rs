//! Fundamental identifier and time types used throughout the overlay.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    time::Duration,
};
use uuid::Uuid;

/// Logical timestamp attached to subscription updates.
pub type LogicalTime = u64;

/// Unique identifier for an endpoint in the overlay.
///
/// Peer ids are opaque ordered tokens. The overlay tie-breaks equal-distance
/// routes lexicographically, so the token ordering must be total and stable
/// across processes; a plain byte-string comparison gives exactly that.
/// The empty token is the invalid sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new random peer id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The invalid sentinel (empty token).
    pub fn invalid() -> Self {
        Self(String::new())
    }

    /// Whether this id names an actual endpoint.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    /// Get the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<String> for PeerId {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Signed span of time with nanosecond resolution.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timespan(i64);

impl Timespan {
    /// Create a timespan from raw nanoseconds.
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a timespan from whole milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Create a timespan from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Raw nanosecond count.
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Convert to a [`Duration`]. Negative spans yield `None`.
    pub fn to_duration(&self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_nanos)
    }
}

impl From<Duration> for Timespan {
    fn from(d: Duration) -> Self {
        Self(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_validity() {
        assert!(!PeerId::invalid().is_valid());
        assert!(PeerId::from("a").is_valid());
        assert!(PeerId::random().is_valid());
    }

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        let a = PeerId::from("a");
        let ab = PeerId::from("ab");
        let b = PeerId::from("b");
        assert!(a < ab);
        assert!(ab < b);
    }

    #[test]
    fn test_timespan_conversions() {
        assert_eq!(Timespan::from_secs(2).as_nanos(), 2_000_000_000);
        assert_eq!(Timespan::from_millis(5), Timespan::from_nanos(5_000_000));
        assert_eq!(Timespan::from_secs(1).to_duration(), Some(Duration::from_secs(1)));
        assert_eq!(Timespan::from_nanos(-1).to_duration(), None);
    }
}
