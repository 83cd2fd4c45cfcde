//! Presence coordinator state machine.
//!
//! Reconciles the presence the user asked for with session idleness and
//! network connectivity:
//! - Session goes idle: remember the presence, go away, arm extended away
//! - Session becomes active: cancel extended away, restore the presence
//! - Network drops: remember the presence, go offline
//! - Network returns: restore the presence remembered at disconnect
//!
//! Presence requests are queued for the connection manager and never wait
//! for it. The local state follows what the connection manager reports back.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::backend::McPresence;
use crate::backend::PresenceBackend;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::domain::Presence;
use crate::domain::PresenceKind;
use crate::domain::non_empty;

/// Capacity of the property change channel.
const EVENT_CAPACITY: usize = 64;

/// A presence request for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRequest {
    pub presence: McPresence,
    pub message: Option<String>,
}

/// A coordinator property changed. Sent after the new value is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "property", content = "value", rename_all = "kebab-case")]
pub enum PresenceEvent {
    State(PresenceKind),
    Status(Option<String>),
    FlashState(PresenceKind),
    AutoAway(bool),
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Snapshot {
    pub state: PresenceKind,
    pub status: Option<String>,
    pub flash_state: PresenceKind,
    pub auto_away: bool,
    pub idle: bool,
    pub online: bool,
    pub use_connectivity: bool,
}

impl Snapshot {
    /// Status text to display, falling back to the state's default message.
    pub fn status_or_default(&self) -> &str {
        self.status
            .as_deref()
            .unwrap_or_else(|| self.state.default_message())
    }
}

/// Coordinator behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub auto_away: bool,
    pub ext_away_delay: Duration,
    pub manual_change_cancels_ext_away: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CoordinatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            auto_away: config.auto_away,
            ext_away_delay: config.ext_away_delay(),
            manual_change_cancels_ext_away: config.manual_change_cancels_ext_away,
        }
    }
}

/// Ask the connection manager which presence is in effect.
///
/// Failures are logged and fall back to offline with no status.
pub async fn query_initial_presence(backend: &dyn PresenceBackend) -> Presence {
    let kind = match backend.actual_presence().await {
        Ok(presence) => match presence.to_kind() {
            PresenceKind::Unset => PresenceKind::Offline,
            kind => kind,
        },
        Err(e) => {
            debug!("Error getting actual presence: {}", e);
            PresenceKind::Offline
        }
    };

    let status = match backend.actual_message().await {
        Ok(message) => message,
        Err(e) => {
            debug!("Error getting actual presence message: {}", e);
            None
        }
    };

    Presence::new(kind, status)
}

/// Presence coordinator.
#[derive(Debug)]
pub struct Coordinator {
    /// Presence last reported by the connection manager.
    state: PresenceKind,
    status: Option<String>,

    /// Advisory state for a blinking indicator.
    flash_state: PresenceKind,
    auto_away: bool,

    /// Presence to restore when the session becomes active.
    away_saved_state: PresenceKind,

    /// Presence to restore when the network returns.
    saved_state: PresenceKind,
    saved_status: Option<String>,

    is_idle: bool,
    ext_away_deadline: Option<Instant>,
    ext_away_delay: Duration,
    manual_change_cancels_ext_away: bool,

    connectivity: Connectivity,
    requests: mpsc::UnboundedSender<PresenceRequest>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Coordinator {
    /// Create a coordinator starting from the given presence.
    ///
    /// Returns the receiving end of the presence request queue, to be
    /// drained into the connection manager.
    pub fn new(
        initial: Presence,
        connectivity: Connectivity,
        options: &CoordinatorOptions,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceRequest>) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let state = match initial.kind {
            PresenceKind::Unset => PresenceKind::Offline,
            kind => kind,
        };

        let coordinator = Self {
            state,
            status: non_empty(initial.status),
            flash_state: PresenceKind::Unset,
            auto_away: options.auto_away,
            away_saved_state: PresenceKind::Unset,
            saved_state: PresenceKind::Unset,
            saved_status: None,
            is_idle: false,
            ext_away_deadline: None,
            ext_away_delay: options.ext_away_delay,
            manual_change_cancels_ext_away: options.manual_change_cancels_ext_away,
            connectivity,
            requests,
            events,
        };

        (coordinator, requests_rx)
    }

    pub fn state(&self) -> PresenceKind {
        self.state
    }

    /// Explicit status text, if any.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Status text to display, falling back to the state's default message.
    pub fn status_or_default(&self) -> &str {
        self.status
            .as_deref()
            .unwrap_or_else(|| self.state.default_message())
    }

    pub fn flash_state(&self) -> PresenceKind {
        self.flash_state
    }

    pub fn auto_away(&self) -> bool {
        self.auto_away
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Presence remembered at disconnect, `Unset` if none.
    pub fn disconnect_saved_state(&self) -> PresenceKind {
        self.saved_state
    }

    /// Presence remembered when going idle, `Unset` if none.
    pub fn idle_saved_state(&self) -> PresenceKind {
        self.away_saved_state
    }

    /// When extended away is due, if armed.
    pub fn ext_away_deadline(&self) -> Option<Instant> {
        self.ext_away_deadline
    }

    /// Subscribe to property changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Get a sender that new subscribers can be created from.
    pub fn event_sender(&self) -> broadcast::Sender<PresenceEvent> {
        self.events.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            status: self.status.clone(),
            flash_state: self.flash_state,
            auto_away: self.auto_away,
            idle: self.is_idle,
            online: self.connectivity.is_online(),
            use_connectivity: self.connectivity.use_conn(),
        }
    }

    /// The connection manager reported a presence change.
    ///
    /// Updates the cached state only; nothing is requested in return.
    pub fn external_presence_changed(&mut self, kind: PresenceKind, status: Option<String>) {
        // Unset from the connection manager means we aren't connected
        let kind = match kind {
            PresenceKind::Unset => PresenceKind::Offline,
            kind => kind,
        };

        debug!("Presence changed to '{:?}' ({})", status, kind);

        self.state = kind;
        self.status = non_empty(status);

        self.emit(PresenceEvent::State(self.state));
        self.emit(PresenceEvent::Status(self.status.clone()));
    }

    /// The session idle state changed.
    pub fn session_idle_changed(&mut self, is_idle: bool) {
        debug!(
            "Session idle state changed, {} -> {}",
            yes_no(self.is_idle),
            yes_no(is_idle)
        );

        if !self.auto_away
            || (self.saved_state == PresenceKind::Unset && self.state.is_withdrawn())
        {
            // Auto away is off, or the user asked to be offline or hidden
            if !is_idle {
                self.stop_ext_away();
            }
            self.is_idle = is_idle;
            return;
        }

        if is_idle && !self.is_idle {
            self.start_ext_away();

            // While disconnected, coming back should restore the presence
            // from before the disconnection
            self.away_saved_state = if self.saved_state == PresenceKind::Unset {
                self.state
            } else {
                self.saved_state
            };

            let new_state = if self.state == PresenceKind::ExtendedAway {
                PresenceKind::ExtendedAway
            } else {
                PresenceKind::Away
            };

            info!(
                "Going to auto-away. Saved state={}, new state={}",
                self.away_saved_state, new_state
            );
            self.apply_state(new_state);
        } else if !is_idle && self.is_idle {
            self.stop_ext_away();

            if self.away_saved_state == PresenceKind::Unset {
                debug!("No presence saved when going idle, nothing to restore");
            } else {
                let (restored, status) = if self.away_saved_state.is_away() {
                    (PresenceKind::Available, None)
                } else {
                    (self.away_saved_state, self.status.clone())
                };

                info!(
                    "Back from auto-away. Restoring state to {}, status to {:?}",
                    restored, status
                );
                self.apply_presence(restored, status);
                self.away_saved_state = PresenceKind::Unset;
            }
        }

        self.is_idle = is_idle;
    }

    /// The extended away deadline passed.
    pub fn ext_away_timer_fired(&mut self) {
        if self.ext_away_deadline.take().is_none() {
            return;
        }

        if !(self.is_idle && self.auto_away) {
            debug!("Extended away due but no longer idle or auto-away, ignoring");
            return;
        }

        info!("Going to extended auto-away");
        self.apply_state(PresenceKind::ExtendedAway);
    }

    /// The online view changed from `was_online` to `is_online`.
    pub fn connectivity_changed(&mut self, was_online: bool, is_online: bool) {
        if was_online && !is_online {
            info!(
                "Disconnected: saving state {} ({:?})",
                self.state, self.status
            );
            self.saved_state = self.state;
            self.saved_status = self.status.clone();
            self.apply_state(PresenceKind::Offline);
        } else if !was_online && is_online && self.saved_state != PresenceKind::Unset {
            let state = std::mem::replace(&mut self.saved_state, PresenceKind::Unset);
            let status = self.saved_status.take();
            info!("Reconnected: restoring state {} ({:?})", state, status);
            self.apply_presence(state, status);
        }
    }

    /// Connectivity stopped being followed.
    ///
    /// Restores the presence kind saved at disconnect, whatever the network
    /// state. The current status is kept, so a status set while offline
    /// survives.
    pub fn connectivity_usage_disabled(&mut self) {
        if self.saved_state == PresenceKind::Unset {
            return;
        }

        let state = std::mem::replace(&mut self.saved_state, PresenceKind::Unset);
        self.saved_status = None;
        info!(
            "No longer following connectivity: restoring state {} ({:?})",
            state, self.status
        );
        self.apply_state(state);
    }

    /// NetworkManager reported a new network state.
    pub fn network_changed(&mut self, connected: bool) {
        if let Some(transition) = self.connectivity.set_connected(connected) {
            self.connectivity_changed(transition.was_online, transition.is_online);
        }
    }

    /// Start or stop following network connectivity.
    pub fn set_use_connectivity(&mut self, use_conn: bool) {
        let transition = self.connectivity.set_use_conn(use_conn);

        if !use_conn {
            self.connectivity_usage_disabled();
        } else if let Some(transition) = transition {
            self.connectivity_changed(transition.was_online, transition.is_online);
        }
    }

    /// User picked a new presence kind, keeping the status.
    pub fn set_state(&mut self, kind: PresenceKind) {
        self.manual_change(kind);
        self.apply_state(kind);
    }

    /// User picked a new status, keeping the presence kind.
    pub fn set_status(&mut self, status: Option<String>) {
        self.apply_presence(self.state, status);
    }

    /// User picked a new presence kind and status.
    pub fn set_presence(&mut self, kind: PresenceKind, status: Option<String>) {
        self.manual_change(kind);
        self.apply_presence(kind, status);
    }

    pub fn set_auto_away(&mut self, auto_away: bool) {
        self.auto_away = auto_away;
        self.emit(PresenceEvent::AutoAway(auto_away));
    }

    pub fn set_flash_state(&mut self, kind: PresenceKind) {
        self.flash_state = kind;
        self.emit(PresenceEvent::FlashState(kind));
    }

    /// Cancel pending work before the coordinator goes away.
    pub fn shutdown(&mut self) {
        self.stop_ext_away();
        debug!("Coordinator shut down");
    }

    fn manual_change(&mut self, kind: PresenceKind) {
        if self.manual_change_cancels_ext_away
            && !kind.is_away()
            && self.ext_away_deadline.is_some()
        {
            debug!("Manual change to {}, cancelling extended away", kind);
            self.stop_ext_away();
        }
    }

    fn start_ext_away(&mut self) {
        if self.ext_away_deadline.is_some() {
            return;
        }

        // A delay past the clock's range never escalates
        self.ext_away_deadline = Instant::now().checked_add(self.ext_away_delay);
        if self.ext_away_deadline.is_none() {
            warn!(
                "Extended away delay of {:?} is out of range, never escalating",
                self.ext_away_delay
            );
        }
    }

    fn stop_ext_away(&mut self) {
        self.ext_away_deadline = None;
    }

    fn apply_state(&mut self, kind: PresenceKind) {
        let status = self.status.clone();
        self.apply_presence(kind, status);
    }

    fn apply_presence(&mut self, kind: PresenceKind, status: Option<String>) {
        debug!("Changing presence to {:?} ({})", status, kind);

        // Never store a default message as if the user had typed it
        let status = non_empty(status).filter(|s| s != kind.default_message());

        if !self.connectivity.is_online() {
            debug!("Not online, keeping status locally");

            if self.status != status {
                self.status.clone_from(&status);
                self.emit(PresenceEvent::Status(status.clone()));
            }
        }

        let request = PresenceRequest {
            presence: McPresence::from_kind(kind),
            message: status,
        };

        if self.requests.send(request).is_err() {
            trace!("No presence forwarder, request dropped");
        }
    }

    fn emit(&self, event: PresenceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
