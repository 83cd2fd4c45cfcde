//! Telepathy Mission Control backend.
//!
//! Talks to Mission Control on the session bus: queries the actual presence,
//! requests new presences and follows `PresenceChanged` signals.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use zbus::Connection;

use super::BackendError;
use super::McPresence;
use super::PresenceBackend;
use crate::domain::Presence;

/// `DBus` service, path and interface for Mission Control.
const MC_SERVICE: &str = "org.freedesktop.Telepathy.MissionControl";
const MC_PATH: &str = "/org/freedesktop/Telepathy/MissionControl";
const MC_INTERFACE: &str = "org.freedesktop.Telepathy.MissionControl";

/// Mission Control presence backend.
pub struct MissionControl {
    proxy: zbus::Proxy<'static>,
}

impl MissionControl {
    /// Create a Mission Control proxy on the given connection.
    ///
    /// This does not require Mission Control to be running yet; calls are
    /// routed to it once it owns its bus name.
    pub async fn connect(conn: &Connection) -> Result<Self, BackendError> {
        let proxy = zbus::Proxy::new(conn, MC_SERVICE, MC_PATH, MC_INTERFACE).await?;
        debug!("Created Mission Control proxy");
        Ok(Self { proxy })
    }
}

#[async_trait]
impl PresenceBackend for MissionControl {
    async fn actual_presence(&self) -> Result<McPresence, BackendError> {
        let code: u32 = self.proxy.call("GetPresenceActual", &()).await?;
        trace!("GetPresenceActual -> {}", code);
        Ok(McPresence::from_code(code))
    }

    async fn actual_message(&self) -> Result<Option<String>, BackendError> {
        let message: String = self.proxy.call("GetPresenceMessageActual", &()).await?;
        Ok(Some(message).filter(|m| !m.is_empty()))
    }

    async fn set_presence(
        &self,
        presence: McPresence,
        message: Option<&str>,
    ) -> Result<(), BackendError> {
        let message = message.unwrap_or_default();
        debug!("SetPresence({:?}, {:?})", presence, message);
        self.proxy
            .call::<_, _, ()>("SetPresence", &(presence.code(), message))
            .await?;
        Ok(())
    }

    async fn presence_changes(&self) -> Result<BoxStream<'static, Presence>, BackendError> {
        let signals = self.proxy.receive_signal("PresenceChanged").await?;

        let changes = signals.filter_map(|msg| async move {
            match msg.body().deserialize::<(u32, String)>() {
                Ok((code, message)) => {
                    trace!("PresenceChanged({}, {:?})", code, message);
                    let kind = McPresence::from_code(code).to_kind();
                    Some(Presence::new(kind, Some(message)))
                }
                Err(e) => {
                    warn!("Ignoring malformed PresenceChanged signal: {}", e);
                    None
                }
            }
        });

        Ok(changes.boxed())
    }
}
