//! Session idle detection.
//!
//! Provides idle state tracking from the GNOME session manager, or by
//! polling systemd-logind when no session manager is around.

mod gnome;
mod logind;

use async_trait::async_trait;
pub use gnome::GnomeSessionSource;
pub use gnome::SessionStatus;
pub use logind::LogindSource;
use thiserror::Error;

/// Trait for session idle sources.
#[async_trait]
pub trait IdleSource: Send {
    /// Wait for the next idle state report.
    ///
    /// Sources may report the same state twice; consumers compare against
    /// what they last saw.
    async fn next_change(&mut self) -> Result<bool, IdleError>;
}

/// Errors that can occur in idle detection.
#[derive(Error, Debug)]
pub enum IdleError {
    #[error("DBus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("Unexpected DBus value: {0}")]
    Variant(#[from] zbus::zvariant::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Idle source closed")]
    Closed,
}
