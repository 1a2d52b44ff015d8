//! QueueName - one logical name per durable broker queue.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a durable broker queue.
///
/// Queue names are fixed string constants, one per task purpose. The well-known
/// ones live here as associated constants; collaborators may define their own
/// with [`QueueName::from_static`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(Cow<'static, str>);

impl QueueName {
    /// Shared queue used for timed redelivery. Owned by the delay scheduler.
    pub const DELAY: QueueName = QueueName(Cow::Borrowed("delay"));

    pub const APP_REFRESH: QueueName = QueueName(Cow::Borrowed("app-refresh"));
    pub const PLAYER_REFRESH: QueueName = QueueName(Cow::Borrowed("player-refresh"));
    pub const BUNDLE_REFRESH: QueueName = QueueName(Cow::Borrowed("bundle-refresh"));

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_delay(&self) -> bool {
        *self == Self::DELAY
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for QueueName {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_and_owned_names_compare_equal() {
        assert_eq!(QueueName::from_static("delay"), QueueName::new("delay"));
        assert!(QueueName::new(String::from("delay")).is_delay());
        assert!(!QueueName::APP_REFRESH.is_delay());
    }

    #[test]
    fn serializes_as_plain_string() {
        let s = serde_json::to_string(&QueueName::PLAYER_REFRESH).unwrap();
        assert_eq!(s, "\"player-refresh\"");

        let back: QueueName = serde_json::from_str(&s).unwrap();
        assert_eq!(back, QueueName::PLAYER_REFRESH);
    }
}
