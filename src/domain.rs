//! Presence domain types.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Availability state of the user.
///
/// `Unset` is a sentinel: it marks an empty save slot or an unknown report,
/// and is never requested from the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceKind {
    #[default]
    Unset,
    Offline,
    Available,
    Away,
    ExtendedAway,
    Hidden,
    Busy,
}

impl PresenceKind {
    /// Every kind, `Unset` included.
    pub const ALL: [Self; 7] = [
        Self::Unset,
        Self::Offline,
        Self::Available,
        Self::Away,
        Self::ExtendedAway,
        Self::Hidden,
        Self::Busy,
    ];

    /// Get the kind as its textual name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Offline => "offline",
            Self::Available => "available",
            Self::Away => "away",
            Self::ExtendedAway => "extended-away",
            Self::Hidden => "hidden",
            Self::Busy => "busy",
        }
    }

    /// Status text shown when no explicit status is set.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Busy => "Busy",
            Self::Away | Self::ExtendedAway => "Away",
            Self::Hidden => "Invisible",
            Self::Offline | Self::Unset => "Offline",
        }
    }

    /// Away or extended away.
    pub fn is_away(self) -> bool {
        matches!(self, Self::Away | Self::ExtendedAway)
    }

    /// The user deliberately isn't visible (offline or hidden).
    pub fn is_withdrawn(self) -> bool {
        matches!(self, Self::Unset | Self::Offline | Self::Hidden)
    }
}

impl fmt::Display for PresenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown presence name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown presence: {0}")]
pub struct ParsePresenceKindError(String);

impl FromStr for PresenceKind {
    type Err = ParsePresenceKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| ParsePresenceKindError(s.to_string()))
    }
}

/// A presence kind together with its optional status text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Presence {
    pub kind: PresenceKind,
    pub status: Option<String>,
}

impl Presence {
    /// Create a new presence. Empty status text is stored as no status.
    pub fn new(kind: PresenceKind, status: Option<String>) -> Self {
        Self {
            kind,
            status: non_empty(status),
        }
    }

    /// Get the status, falling back to the kind's default message.
    pub fn status_or_default(&self) -> &str {
        self.status
            .as_deref()
            .unwrap_or_else(|| self.kind.default_message())
    }
}

/// Treat empty status text as absent.
pub(crate) fn non_empty(status: Option<String>) -> Option<String> {
    status.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("available".parse::<PresenceKind>(), Ok(PresenceKind::Available));
        assert_eq!("Extended-Away".parse::<PresenceKind>(), Ok(PresenceKind::ExtendedAway));
        assert_eq!("extended_away".parse::<PresenceKind>(), Ok(PresenceKind::ExtendedAway));
        assert_eq!(" busy ".parse::<PresenceKind>(), Ok(PresenceKind::Busy));
        assert!("dnd".parse::<PresenceKind>().is_err());
    }

    #[test]
    fn test_names_round_trip_through_display() {
        for kind in PresenceKind::ALL {
            assert_eq!(kind.to_string().parse::<PresenceKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_withdrawn_kinds() {
        assert!(PresenceKind::Offline.is_withdrawn());
        assert!(PresenceKind::Hidden.is_withdrawn());
        assert!(PresenceKind::Unset.is_withdrawn());
        assert!(!PresenceKind::Away.is_withdrawn());
        assert!(!PresenceKind::Busy.is_withdrawn());
    }

    #[test]
    fn test_status_or_default() {
        let presence = Presence::new(PresenceKind::ExtendedAway, Some(String::new()));
        assert_eq!(presence.status, None);
        assert_eq!(presence.status_or_default(), "Away");

        let presence = Presence::new(PresenceKind::Busy, Some("In a meeting".to_string()));
        assert_eq!(presence.status_or_default(), "In a meeting");
    }
}
