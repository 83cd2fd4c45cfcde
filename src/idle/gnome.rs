//! Idle detection via the GNOME session manager.
//!
//! Follows the `StatusChanged` signal of the session presence object.

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use zbus::Connection;
use zbus::Message;
use zbus::proxy::SignalStream;

use super::IdleError;
use super::IdleSource;

/// `DBus` service, path and interface for session presence.
const SM_SERVICE: &str = "org.gnome.SessionManager";
const SM_PATH: &str = "/org/gnome/SessionManager/Presence";
const SM_PRESENCE_INTERFACE: &str = "org.gnome.SessionManager.Presence";

/// Session status as reported by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Available,
    Invisible,
    Busy,
    Idle,
    Unknown,
}

impl SessionStatus {
    /// Decode a `StatusChanged` value.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Available,
            1 => Self::Invisible,
            2 => Self::Busy,
            3 => Self::Idle,
            _ => Self::Unknown,
        }
    }

    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }
}

/// Idle source backed by the GNOME session manager.
pub struct GnomeSessionSource {
    status_changes: SignalStream<'static>,
}

impl GnomeSessionSource {
    /// Subscribe to session status changes on the session bus.
    pub async fn connect(conn: &Connection) -> Result<Self, IdleError> {
        let proxy = zbus::Proxy::new(conn, SM_SERVICE, SM_PATH, SM_PRESENCE_INTERFACE).await?;
        let status_changes = proxy.receive_signal("StatusChanged").await?;
        debug!("Subscribed to session manager StatusChanged");
        Ok(Self { status_changes })
    }
}

#[async_trait]
impl IdleSource for GnomeSessionSource {
    async fn next_change(&mut self) -> Result<bool, IdleError> {
        loop {
            let msg = self.status_changes.next().await.ok_or(IdleError::Closed)?;
            if let Some(status) = decode_status(&msg) {
                return Ok(status.is_idle());
            }
        }
    }
}

/// Decode a `StatusChanged` signal, skipping malformed ones.
fn decode_status(msg: &Message) -> Option<SessionStatus> {
    match msg.body().deserialize::<u32>() {
        Ok(code) => {
            let status = SessionStatus::from_code(code);
            trace!("Session status: {:?} ({})", status, code);
            Some(status)
        }
        Err(e) => {
            warn!("Ignoring malformed StatusChanged signal: {}", e);
            None
        }
    }
}
