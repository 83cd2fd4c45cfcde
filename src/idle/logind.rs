//! Idle detection via systemd-logind `DBus` interface.
//!
//! Polls `IdleHint` property from the current session and reports changes.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use zbus::Connection;

use super::IdleError;
use super::IdleSource;

/// `DBus` service and path for login1.
const LOGIND_SERVICE: &str = "org.freedesktop.login1";
const LOGIND_PATH: &str = "/org/freedesktop/login1";
const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Idle source that polls systemd-logind.
pub struct LogindSource {
    /// System bus connection.
    conn: Connection,

    /// Session object path in `DBus`.
    session_path: String,

    /// Poll timer.
    interval: Interval,

    /// Last observed idle hint.
    hint: HintTracker,
}

impl LogindSource {
    /// Resolve the current session and prepare polling.
    pub async fn connect(conn: &Connection, poll_interval: Duration) -> Result<Self, IdleError> {
        let session_path = resolve_session_path(conn).await?;
        info!(
            "Resolved session path: {}, polling every {:?}",
            session_path, poll_interval
        );

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            conn: conn.clone(),
            session_path,
            interval,
            hint: HintTracker::default(),
        })
    }
}

/// Remembers the last polled hint.
#[derive(Debug, Default)]
struct HintTracker {
    last: Option<bool>,
}

impl HintTracker {
    /// Record a polled hint, returning it if it differs from the last one.
    fn observe(&mut self, idle: bool) -> Option<bool> {
        let prev = self.last.replace(idle);
        (prev != Some(idle)).then_some(idle)
    }
}

#[async_trait]
impl IdleSource for LogindSource {
    async fn next_change(&mut self) -> Result<bool, IdleError> {
        loop {
            self.interval.tick().await;

            match get_idle_hint(&self.conn, &self.session_path).await {
                Ok(idle) => {
                    if let Some(changed) = self.hint.observe(idle) {
                        debug!("Idle hint changed: {}", changed);
                        return Ok(changed);
                    }
                    trace!("Idle hint: {}", idle);
                }
                // Don't give up on transient errors, just log
                Err(e) => warn!("Failed to poll idle state: {}", e),
            }
        }
    }
}

/// Session paths to probe when `XDG_SESSION_ID` isn't set.
fn fallback_session_paths() -> [String; 2] {
    [
        format!("{LOGIND_PATH}/session/self"),
        format!("{LOGIND_PATH}/session/auto"),
    ]
}

/// Resolve the session object path for the current session.
async fn resolve_session_path(conn: &Connection) -> Result<String, IdleError> {
    // First try XDG_SESSION_ID if available
    if let Ok(session_id) = env::var("XDG_SESSION_ID") {
        debug!("Using XDG_SESSION_ID: {}", session_id);

        let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, LOGIND_PATH, MANAGER_INTERFACE).await?;
        let path: zbus::zvariant::OwnedObjectPath =
            proxy.call("GetSession", &(session_id.as_str(),)).await?;

        return Ok(path.to_string());
    }

    debug!("XDG_SESSION_ID not set, probing session/self and session/auto");

    for path in fallback_session_paths() {
        if get_idle_hint(conn, &path).await.is_ok() {
            return Ok(path);
        }
    }

    Err(IdleError::SessionNotFound(
        "set XDG_SESSION_ID or ensure a logind session is available".to_string(),
    ))
}

/// Get the `IdleHint` property from a session.
async fn get_idle_hint(conn: &Connection, session_path: &str) -> Result<bool, IdleError> {
    let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, session_path, PROPERTIES_INTERFACE).await?;

    let value: zbus::zvariant::OwnedValue = proxy
        .call("Get", &(SESSION_INTERFACE, "IdleHint"))
        .await?;

    let idle: bool = value.downcast_ref::<bool>()?;
    Ok(idle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_session_paths() {
        let [self_path, auto_path] = fallback_session_paths();
        assert_eq!(self_path, "/org/freedesktop/login1/session/self");
        assert_eq!(auto_path, "/org/freedesktop/login1/session/auto");
    }

    #[test]
    fn test_hint_tracker_reports_only_changes() {
        let mut hint = HintTracker::default();
        // The first poll is always reported
        assert_eq!(hint.observe(false), Some(false));
        assert_eq!(hint.observe(false), None);
        assert_eq!(hint.observe(true), Some(true));
        assert_eq!(hint.observe(true), None);
        assert_eq!(hint.observe(false), Some(false));
    }
}
