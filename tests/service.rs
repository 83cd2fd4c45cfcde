//! End-to-end tests of the presence service against a fake connection manager.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use futures_util::stream::BoxStream;
use presenced::backend::BackendError;
use presenced::backend::McPresence;
use presenced::backend::PresenceBackend;
use presenced::connectivity::Connectivity;
use presenced::coordinator::Coordinator;
use presenced::coordinator::CoordinatorOptions;
use presenced::coordinator::Snapshot;
use presenced::coordinator::query_initial_presence;
use presenced::domain::Presence;
use presenced::domain::PresenceKind;
use presenced::service::Handle;
use presenced::service::Input;
use presenced::service::Service;
use presenced::service::forward_requests;
use presenced::service::spawn_pump;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EXT_AWAY_DELAY: Duration = Duration::from_secs(1800);

/// Connection manager that applies every request and reports it back.
struct FakeMissionControl {
    current: Mutex<(McPresence, Option<String>)>,
    requested: Mutex<Vec<McPresence>>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<Presence>>>,
    notify: mpsc::UnboundedSender<Presence>,
    fail_queries: bool,
}

impl FakeMissionControl {
    fn new(presence: McPresence) -> Self {
        let (notify, changes) = mpsc::unbounded_channel();
        Self {
            current: Mutex::new((presence, None)),
            requested: Mutex::new(Vec::new()),
            changes: Mutex::new(Some(changes)),
            notify,
            fail_queries: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail_queries: true,
            ..Self::new(McPresence::Available)
        }
    }

    fn requested(&self) -> Vec<McPresence> {
        self.requested.lock().unwrap().clone()
    }
}

/// What a call looks like when Mission Control isn't on the bus.
fn not_running() -> BackendError {
    BackendError::Dbus(zbus::Error::Failure(
        "Mission Control is not running".to_string(),
    ))
}

#[async_trait]
impl PresenceBackend for FakeMissionControl {
    async fn actual_presence(&self) -> Result<McPresence, BackendError> {
        if self.fail_queries {
            return Err(not_running());
        }
        Ok(self.current.lock().unwrap().0)
    }

    async fn actual_message(&self) -> Result<Option<String>, BackendError> {
        if self.fail_queries {
            return Err(not_running());
        }
        Ok(self.current.lock().unwrap().1.clone())
    }

    async fn set_presence(
        &self,
        presence: McPresence,
        message: Option<&str>,
    ) -> Result<(), BackendError> {
        let message = message.map(str::to_string);
        *self.current.lock().unwrap() = (presence, message.clone());
        self.requested.lock().unwrap().push(presence);
        let _ = self
            .notify
            .send(Presence::new(presence.to_kind(), message));
        Ok(())
    }

    async fn presence_changes(&self) -> Result<BoxStream<'static, Presence>, BackendError> {
        let changes = self
            .changes
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| {
                BackendError::Dbus(zbus::Error::Failure("already subscribed".to_string()))
            })?;

        Ok(stream::unfold(changes, |mut changes| async move {
            changes.recv().await.map(|presence| (presence, changes))
        })
        .boxed())
    }
}

/// A running daemon minus the buses.
struct Daemon {
    backend: Arc<FakeMissionControl>,
    handle: Handle,
    cancel: CancellationToken,
    service: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl Daemon {
    async fn start(backend: FakeMissionControl) -> Self {
        let backend = Arc::new(backend);
        let initial = query_initial_presence(backend.as_ref()).await;

        let options = CoordinatorOptions {
            ext_away_delay: EXT_AWAY_DELAY,
            ..CoordinatorOptions::default()
        };
        let (coordinator, requests) =
            Coordinator::new(initial, Connectivity::new(true, true), &options);
        let (service, handle) = Service::new(coordinator);
        let cancel = CancellationToken::new();

        let changes = backend.presence_changes().await.unwrap();
        let pump = spawn_pump(
            "presence",
            changes.map(Input::PresenceChanged),
            handle.sender(),
            cancel.clone(),
        );
        let forwarder = tokio::spawn(forward_requests(backend.clone(), requests));
        let service = tokio::spawn(service.run(cancel.clone()));

        Self {
            backend,
            handle,
            cancel,
            service,
            forwarder,
            pump,
        }
    }

    async fn wait_for(&self, what: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        let mut snapshots = self.handle.watch();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(what))
            .await
            .expect("timed out waiting for snapshot")
            .expect("service stopped")
            .clone();
        snapshot
    }

    async fn stop(self) -> Vec<McPresence> {
        self.cancel.cancel();
        self.service.await.unwrap();
        self.forwarder.await.unwrap();
        self.pump.await.unwrap();
        self.backend.requested()
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_escalates_to_extended_away_once() {
    let daemon = Daemon::start(FakeMissionControl::new(McPresence::Available)).await;
    assert_eq!(daemon.handle.snapshot().state, PresenceKind::Available);

    daemon.handle.send(Input::IdleChanged(true)).await.unwrap();
    daemon.wait_for(|s| s.state == PresenceKind::Away).await;

    tokio::time::sleep(EXT_AWAY_DELAY + Duration::from_secs(1)).await;
    daemon
        .wait_for(|s| s.state == PresenceKind::ExtendedAway)
        .await;

    // Much later, still extended away and nothing new requested
    tokio::time::sleep(EXT_AWAY_DELAY * 2).await;

    daemon.handle.send(Input::IdleChanged(false)).await.unwrap();
    let snapshot = daemon
        .wait_for(|s| s.state == PresenceKind::Available)
        .await;
    assert!(!snapshot.idle);

    assert_eq!(
        daemon.stop().await,
        vec![
            McPresence::Away,
            McPresence::ExtendedAway,
            McPresence::Available
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_activity_before_delay_prevents_extended_away() {
    let daemon = Daemon::start(FakeMissionControl::new(McPresence::DoNotDisturb)).await;
    assert_eq!(daemon.handle.snapshot().state, PresenceKind::Busy);

    daemon.handle.send(Input::IdleChanged(true)).await.unwrap();
    daemon.wait_for(|s| s.state == PresenceKind::Away).await;

    tokio::time::sleep(EXT_AWAY_DELAY / 2).await;
    daemon.handle.send(Input::IdleChanged(false)).await.unwrap();
    daemon.wait_for(|s| s.state == PresenceKind::Busy).await;

    tokio::time::sleep(EXT_AWAY_DELAY * 2).await;
    assert_eq!(daemon.handle.snapshot().state, PresenceKind::Busy);

    assert_eq!(
        daemon.stop().await,
        vec![McPresence::Away, McPresence::DoNotDisturb]
    );
}

#[tokio::test(start_paused = true)]
async fn test_network_loss_goes_offline_and_restores() {
    let daemon = Daemon::start(FakeMissionControl::new(McPresence::Available)).await;

    daemon
        .handle
        .send(Input::SetStatus(Some("Writing docs".to_string())))
        .await
        .unwrap();
    daemon
        .wait_for(|s| s.status.as_deref() == Some("Writing docs"))
        .await;

    daemon.handle.send(Input::NetworkChanged(false)).await.unwrap();
    let snapshot = daemon
        .wait_for(|s| s.state == PresenceKind::Offline)
        .await;
    assert!(!snapshot.online);

    daemon.handle.send(Input::NetworkChanged(true)).await.unwrap();
    let snapshot = daemon
        .wait_for(|s| s.state == PresenceKind::Available)
        .await;
    assert!(snapshot.online);
    assert_eq!(snapshot.status.as_deref(), Some("Writing docs"));

    assert_eq!(
        daemon.stop().await,
        vec![
            McPresence::Available,
            McPresence::Offline,
            McPresence::Available
        ]
    );
}

#[tokio::test]
async fn test_unreachable_connection_manager_starts_offline() {
    let daemon = Daemon::start(FakeMissionControl::failing()).await;

    let snapshot = daemon.handle.snapshot();
    assert_eq!(snapshot.state, PresenceKind::Offline);
    assert_eq!(snapshot.status, None);
    assert_eq!(snapshot.status_or_default(), "Offline");

    assert!(daemon.stop().await.is_empty());
}

#[tokio::test]
async fn test_stopped_service_rejects_inputs() {
    let daemon = Daemon::start(FakeMissionControl::new(McPresence::Available)).await;
    let handle = daemon.handle.clone();

    daemon.stop().await;

    assert!(handle.send(Input::SetAutoAway(false)).await.is_err());
}
