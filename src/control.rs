//! `DBus` control interface.
//!
//! Exposes the coordinator's properties on the session bus so panels, status
//! icons and scripts can read and change the user's presence. Writes are
//! queued to the service; reads come from the last published snapshot.
//!
//! Setters don't announce anything themselves: a write only takes effect once
//! the service has handled it (and, while online, once Mission Control has
//! echoed it). `PropertiesChanged` is sent from the published snapshots only.

use std::borrow::Cow;
use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use zbus::Connection;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::Interface;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::Value;

use crate::coordinator::Snapshot;
use crate::domain::PresenceKind;
use crate::service::Handle;
use crate::service::Input;

/// Well-known bus name and object path of the control interface.
pub const CONTROL_SERVICE: &str = "io.github.presenced";
pub const CONTROL_PATH: &str = "/io/github/presenced/Presence";

/// Control object served on the session bus.
pub struct PresenceControl {
    inputs: mpsc::Sender<Input>,
    snapshot: watch::Receiver<Snapshot>,
}

impl PresenceControl {
    pub fn new(handle: &Handle) -> Self {
        Self {
            inputs: handle.sender(),
            snapshot: handle.watch(),
        }
    }

    async fn send(&self, input: Input) -> fdo::Result<()> {
        self.inputs
            .send(input)
            .await
            .map_err(|_| fdo::Error::Failed("presence service has stopped".to_string()))
    }

    fn current(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }
}

#[interface(name = "io.github.presenced.Presence1")]
impl PresenceControl {
    /// Set presence kind and status in one go.
    async fn set_presence(&self, state: &str, status: &str) -> fdo::Result<()> {
        let kind = parse_requested_kind(state)?;
        self.send(Input::SetPresence(kind, status_arg(status)))
            .await
    }

    #[zbus(property(emits_changed_signal = "false"))]
    async fn state(&self) -> String {
        self.current().state.to_string()
    }

    #[zbus(property)]
    async fn set_state(&mut self, value: String) -> fdo::Result<()> {
        let kind = parse_requested_kind(&value)?;
        self.send(Input::SetState(kind)).await
    }

    #[zbus(property(emits_changed_signal = "false"))]
    async fn status(&self) -> String {
        self.current().status_or_default().to_string()
    }

    #[zbus(property)]
    async fn set_status(&mut self, value: String) -> fdo::Result<()> {
        self.send(Input::SetStatus(status_arg(&value))).await
    }

    #[zbus(property(emits_changed_signal = "false"))]
    async fn flash_state(&self) -> String {
        self.current().flash_state.to_string()
    }

    #[zbus(property)]
    async fn set_flash_state(&mut self, value: String) -> fdo::Result<()> {
        let kind = value
            .parse::<PresenceKind>()
            .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
        self.send(Input::SetFlashState(kind)).await
    }

    #[zbus(property(emits_changed_signal = "false"))]
    async fn auto_away(&self) -> bool {
        self.current().auto_away
    }

    #[zbus(property)]
    async fn set_auto_away(&mut self, value: bool) -> fdo::Result<()> {
        self.send(Input::SetAutoAway(value)).await
    }

    #[zbus(property(emits_changed_signal = "false"))]
    async fn use_connectivity(&self) -> bool {
        self.current().use_connectivity
    }

    #[zbus(property)]
    async fn set_use_connectivity(&mut self, value: bool) -> fdo::Result<()> {
        self.send(Input::SetUseConnectivity(value)).await
    }

    #[zbus(property)]
    async fn idle(&self) -> bool {
        self.current().idle
    }

    #[zbus(property)]
    async fn online(&self) -> bool {
        self.current().online
    }
}

/// Parse a presence the caller wants to switch to.
///
/// `unset` is a sentinel and can't be requested.
fn parse_requested_kind(value: &str) -> fdo::Result<PresenceKind> {
    match value.parse::<PresenceKind>() {
        Ok(PresenceKind::Unset) => Err(fdo::Error::InvalidArgs(
            "the unset presence cannot be requested".to_string(),
        )),
        Ok(kind) => Ok(kind),
        Err(e) => Err(fdo::Error::InvalidArgs(e.to_string())),
    }
}

/// `DBus` strings can't be absent: empty means no status.
fn status_arg(value: &str) -> Option<String> {
    Some(value.to_string()).filter(|s| !s.is_empty())
}

/// Serve the control interface and relay property changes.
///
/// The returned task emits `PropertiesChanged` whenever a new snapshot is
/// published, until cancelled.
pub async fn serve(
    conn: &Connection,
    handle: &Handle,
    cancel: CancellationToken,
) -> zbus::Result<JoinHandle<()>> {
    conn.object_server()
        .at(CONTROL_PATH, PresenceControl::new(handle))
        .await?;
    conn.request_name(CONTROL_SERVICE).await?;
    info!("Control interface at {} {}", CONTROL_SERVICE, CONTROL_PATH);

    let emitter = SignalEmitter::new(conn, CONTROL_PATH)?;
    let mut snapshots = handle.watch();

    Ok(tokio::spawn(async move {
        let mut previous = snapshots.borrow_and_update().clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = snapshots.borrow_and_update().clone();
                    if let Err(e) = notify_changes(&emitter, &previous, &current).await {
                        warn!("Failed to emit property changes: {}", e);
                    }
                    previous = current;
                }
            }
        }

        debug!("Control interface relay stopped");
    }))
}

/// Property values that differ between two snapshots, keyed by `DBus` name.
fn changed_properties(
    previous: &Snapshot,
    current: &Snapshot,
) -> HashMap<&'static str, Value<'static>> {
    let mut changed = HashMap::new();

    if previous.state != current.state {
        changed.insert("State", Value::from(current.state.to_string()));
    }
    // The displayed status depends on the state
    if previous.status_or_default() != current.status_or_default() {
        changed.insert("Status", Value::from(current.status_or_default().to_string()));
    }
    if previous.flash_state != current.flash_state {
        changed.insert("FlashState", Value::from(current.flash_state.to_string()));
    }
    if previous.auto_away != current.auto_away {
        changed.insert("AutoAway", Value::from(current.auto_away));
    }
    if previous.use_connectivity != current.use_connectivity {
        changed.insert("UseConnectivity", Value::from(current.use_connectivity));
    }
    if previous.idle != current.idle {
        changed.insert("Idle", Value::from(current.idle));
    }
    if previous.online != current.online {
        changed.insert("Online", Value::from(current.online));
    }

    changed
}

/// Emit one `PropertiesChanged` carrying every changed value.
async fn notify_changes(
    emitter: &SignalEmitter<'_>,
    previous: &Snapshot,
    current: &Snapshot,
) -> zbus::Result<()> {
    let changed = changed_properties(previous, current);
    if changed.is_empty() {
        return Ok(());
    }

    trace!("Properties changed: {:?}", changed.keys());
    fdo::Properties::properties_changed(
        emitter,
        PresenceControl::name(),
        changed,
        Cow::Borrowed(&[]),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requested_kind() {
        assert_eq!(parse_requested_kind("busy").unwrap(), PresenceKind::Busy);
        assert_eq!(
            parse_requested_kind("extended-away").unwrap(),
            PresenceKind::ExtendedAway
        );
        assert!(matches!(
            parse_requested_kind("unset"),
            Err(fdo::Error::InvalidArgs(_))
        ));
        assert!(matches!(
            parse_requested_kind("lurking"),
            Err(fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_empty_status_arg_is_none() {
        assert_eq!(status_arg(""), None);
        assert_eq!(status_arg("Out to lunch"), Some("Out to lunch".to_string()));
    }

    #[test]
    fn test_changed_properties() {
        let previous = Snapshot {
            state: PresenceKind::Available,
            online: true,
            ..Default::default()
        };
        assert!(changed_properties(&previous, &previous).is_empty());

        let current = Snapshot {
            state: PresenceKind::Away,
            idle: true,
            ..previous.clone()
        };
        let changed = changed_properties(&previous, &current);
        assert_eq!(changed.len(), 3);
        assert_eq!(changed.get("State"), Some(&Value::from("away")));
        assert_eq!(changed.get("Status"), Some(&Value::from("Away")));
        assert_eq!(changed.get("Idle"), Some(&Value::from(true)));
    }

    #[test]
    fn test_changed_properties_carry_new_values() {
        let previous = Snapshot {
            auto_away: true,
            use_connectivity: true,
            ..Default::default()
        };
        let current = Snapshot {
            auto_away: false,
            flash_state: PresenceKind::Busy,
            ..previous.clone()
        };

        let changed = changed_properties(&previous, &current);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed.get("AutoAway"), Some(&Value::from(false)));
        assert_eq!(changed.get("FlashState"), Some(&Value::from("busy")));
    }

    #[test]
    fn test_status_unchanged_when_default_message_matches() {
        // Away and extended away share a default message
        let previous = Snapshot {
            state: PresenceKind::Away,
            ..Default::default()
        };
        let current = Snapshot {
            state: PresenceKind::ExtendedAway,
            ..Default::default()
        };
        let changed = changed_properties(&previous, &current);
        assert!(changed.contains_key("State"));
        assert!(!changed.contains_key("Status"));
    }
}
