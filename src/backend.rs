//! Connection manager backends.
//!
//! The connection manager owns the accounts and is the authority on the
//! user's actual presence. The coordinator only asks it for a presence and
//! listens for what it reports back.

mod mission_control;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
pub use mission_control::MissionControl;
use thiserror::Error;

use crate::domain::Presence;
use crate::domain::PresenceKind;

/// Presence codes understood by Mission Control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum McPresence {
    Unset = 0,
    Offline = 1,
    Available = 2,
    Away = 3,
    ExtendedAway = 4,
    Hidden = 5,
    DoNotDisturb = 6,
}

impl McPresence {
    /// Decode a wire code. Unknown codes decode as `Unset`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Offline,
            2 => Self::Available,
            3 => Self::Away,
            4 => Self::ExtendedAway,
            5 => Self::Hidden,
            6 => Self::DoNotDisturb,
            _ => Self::Unset,
        }
    }

    /// Get the wire code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Translate a presence kind for a request.
    ///
    /// # Panics
    ///
    /// `PresenceKind::Unset` has no requestable equivalent; passing it is a
    /// programming error.
    pub fn from_kind(kind: PresenceKind) -> Self {
        match kind {
            PresenceKind::Offline => Self::Offline,
            PresenceKind::Available => Self::Available,
            PresenceKind::Away => Self::Away,
            PresenceKind::ExtendedAway => Self::ExtendedAway,
            PresenceKind::Hidden => Self::Hidden,
            PresenceKind::Busy => Self::DoNotDisturb,
            PresenceKind::Unset => unreachable!("the unset presence cannot be requested"),
        }
    }

    /// Translate back to a presence kind.
    pub fn to_kind(self) -> PresenceKind {
        match self {
            Self::Unset => PresenceKind::Unset,
            Self::Offline => PresenceKind::Offline,
            Self::Available => PresenceKind::Available,
            Self::Away => PresenceKind::Away,
            Self::ExtendedAway => PresenceKind::ExtendedAway,
            Self::Hidden => PresenceKind::Hidden,
            Self::DoNotDisturb => PresenceKind::Busy,
        }
    }
}

/// Trait for connection manager backends.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    /// Get the presence currently in effect.
    async fn actual_presence(&self) -> Result<McPresence, BackendError>;

    /// Get the status message currently in effect.
    async fn actual_message(&self) -> Result<Option<String>, BackendError>;

    /// Request a new presence.
    async fn set_presence(
        &self,
        presence: McPresence,
        message: Option<&str>,
    ) -> Result<(), BackendError>;

    /// Subscribe to presence changes reported by the backend.
    async fn presence_changes(&self) -> Result<BoxStream<'static, Presence>, BackendError>;
}

/// Errors that can occur talking to a connection manager.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("DBus error: {0}")]
    Dbus(#[from] zbus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requestable_kinds_round_trip() {
        for kind in PresenceKind::ALL {
            if kind == PresenceKind::Unset {
                continue;
            }
            let presence = McPresence::from_kind(kind);
            assert_eq!(McPresence::from_code(presence.code()), presence);
            assert_eq!(presence.to_kind(), kind);
        }
    }

    #[test]
    fn test_busy_is_do_not_disturb() {
        assert_eq!(
            McPresence::from_kind(PresenceKind::Busy),
            McPresence::DoNotDisturb
        );
        assert_eq!(McPresence::DoNotDisturb.code(), 6);
    }

    #[test]
    fn test_unknown_code_is_unset() {
        assert_eq!(McPresence::from_code(0), McPresence::Unset);
        assert_eq!(McPresence::from_code(42), McPresence::Unset);
    }

    #[test]
    #[should_panic(expected = "unset presence cannot be requested")]
    fn test_unset_is_not_requestable() {
        let _ = McPresence::from_kind(PresenceKind::Unset);
    }
}
