//! Network connectivity tracking via NetworkManager.

use futures_util::Stream;
use futures_util::StreamExt;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use zbus::Connection;
use zbus::proxy::SignalStream;

/// `DBus` service, path and interface for NetworkManager.
const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_INTERFACE: &str = "org.freedesktop.NetworkManager";

/// `NM_STATE_CONNECTED_GLOBAL`: full network access.
const NM_STATE_CONNECTED_GLOBAL: u32 = 70;

/// A change of the online view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub was_online: bool,
    pub is_online: bool,
}

/// Tracks whether presence should consider the user online.
///
/// When connectivity isn't used, the user is always considered online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    connected: bool,
    use_conn: bool,
}

impl Connectivity {
    /// Create a tracker with the given initial network state.
    pub fn new(use_conn: bool, connected: bool) -> Self {
        Self {
            connected,
            use_conn,
        }
    }

    /// Whether the user counts as online.
    pub fn is_online(&self) -> bool {
        !self.use_conn || self.connected
    }

    /// Whether the network state is followed at all.
    pub fn use_conn(&self) -> bool {
        self.use_conn
    }

    /// Record the network state.
    ///
    /// Returns a transition only if connectivity is used and the online view
    /// changed.
    pub fn set_connected(&mut self, connected: bool) -> Option<Transition> {
        let was_online = self.is_online();
        self.connected = connected;
        self.transition_from(was_online)
    }

    /// Start or stop following the network state.
    pub fn set_use_conn(&mut self, use_conn: bool) -> Option<Transition> {
        let was_online = self.is_online();
        self.use_conn = use_conn;
        self.transition_from(was_online)
    }

    fn transition_from(&self, was_online: bool) -> Option<Transition> {
        let is_online = self.is_online();
        (was_online != is_online).then_some(Transition {
            was_online,
            is_online,
        })
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// Whether a NetworkManager state means the network is usable.
pub fn is_connected_state(state: u32) -> bool {
    state == NM_STATE_CONNECTED_GLOBAL
}

/// Follows NetworkManager's global state.
pub struct NetworkMonitor {
    proxy: zbus::Proxy<'static>,
    state_changes: SignalStream<'static>,
}

impl NetworkMonitor {
    /// Subscribe to NetworkManager state changes on the system bus.
    pub async fn connect(conn: &Connection) -> zbus::Result<Self> {
        let proxy = zbus::Proxy::new(conn, NM_SERVICE, NM_PATH, NM_INTERFACE).await?;
        let state_changes = proxy.receive_signal("StateChanged").await?;
        Ok(Self {
            proxy,
            state_changes,
        })
    }

    /// Read the current connectivity.
    pub async fn is_connected(&self) -> zbus::Result<bool> {
        let state: u32 = self.proxy.get_property("State").await?;
        debug!("NetworkManager state: {}", state);
        Ok(is_connected_state(state))
    }

    /// Turn the signal subscription into a stream of connectivity values.
    pub fn into_stream(self) -> impl Stream<Item = bool> + Send + 'static {
        self.state_changes.filter_map(|msg| async move {
            match msg.body().deserialize::<u32>() {
                Ok(state) => {
                    trace!("NetworkManager StateChanged({})", state);
                    Some(is_connected_state(state))
                }
                Err(e) => {
                    warn!("Ignoring malformed StateChanged signal: {}", e);
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_states() {
        assert!(is_connected_state(70));
        assert!(!is_connected_state(20)); // disconnected
        assert!(!is_connected_state(50)); // local only
        assert!(!is_connected_state(60)); // site only
    }

    #[test]
    fn test_transitions_when_tracking() {
        let mut conn = Connectivity::new(true, true);
        assert!(conn.is_online());

        assert_eq!(
            conn.set_connected(false),
            Some(Transition {
                was_online: true,
                is_online: false
            })
        );
        assert!(!conn.is_online());

        // Same state again: nothing to report
        assert_eq!(conn.set_connected(false), None);

        assert_eq!(
            conn.set_connected(true),
            Some(Transition {
                was_online: false,
                is_online: true
            })
        );
    }

    #[test]
    fn test_always_online_when_not_tracking() {
        let mut conn = Connectivity::new(false, true);
        assert_eq!(conn.set_connected(false), None);
        assert!(conn.is_online());
    }

    #[test]
    fn test_toggle_use_conn() {
        let mut conn = Connectivity::new(true, false);
        assert!(!conn.is_online());

        assert_eq!(
            conn.set_use_conn(false),
            Some(Transition {
                was_online: false,
                is_online: true
            })
        );
        assert!(!conn.use_conn());

        assert_eq!(
            conn.set_use_conn(true),
            Some(Transition {
                was_online: true,
                is_online: false
            })
        );
    }
}
