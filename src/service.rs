//! Coordinator event loop.
//!
//! The coordinator lives on a single task. Everything that wants to change
//! it sends an [`Input`] through a [`Handle`]; inputs are handled one at a
//! time, in order, each to completion.

use std::pin::pin;
use std::sync::Arc;

use futures_util::Stream;
use futures_util::StreamExt;
use futures_util::stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::PresenceBackend;
use crate::coordinator::Coordinator;
use crate::coordinator::PresenceEvent;
use crate::coordinator::PresenceRequest;
use crate::coordinator::Snapshot;
use crate::domain::Presence;
use crate::domain::PresenceKind;
use crate::idle::IdleSource;

/// Capacity of the service inbox.
const INBOX_CAPACITY: usize = 64;

/// Something the coordinator should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The connection manager reported a presence.
    PresenceChanged(Presence),
    /// The session became idle (`true`) or active (`false`).
    IdleChanged(bool),
    /// The network became usable (`true`) or not (`false`).
    NetworkChanged(bool),
    SetState(PresenceKind),
    SetStatus(Option<String>),
    SetPresence(PresenceKind, Option<String>),
    SetAutoAway(bool),
    SetFlashState(PresenceKind),
    SetUseConnectivity(bool),
}

/// The service has stopped and no longer takes inputs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Presence service has stopped")]
pub struct ServiceStopped;

/// Cloneable access to a running service.
#[derive(Debug, Clone)]
pub struct Handle {
    inputs: mpsc::Sender<Input>,
    snapshot: watch::Receiver<Snapshot>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Handle {
    /// Queue an input for the coordinator.
    pub async fn send(&self, input: Input) -> Result<(), ServiceStopped> {
        self.inputs.send(input).await.map_err(|_| ServiceStopped)
    }

    /// Get a raw sender, e.g. for a pump.
    pub fn sender(&self) -> mpsc::Sender<Input> {
        self.inputs.clone()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch published snapshots.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to property changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}

/// Owner of the coordinator.
pub struct Service {
    coordinator: Coordinator,
    inbox: mpsc::Receiver<Input>,
    snapshot: watch::Sender<Snapshot>,
}

impl Service {
    /// Wrap a coordinator into a service and its handle.
    pub fn new(coordinator: Coordinator) -> (Self, Handle) {
        let (inputs, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(coordinator.snapshot());

        let handle = Handle {
            inputs,
            snapshot: snapshot_rx,
            events: coordinator.event_sender(),
        };

        let service = Self {
            coordinator,
            inbox,
            snapshot,
        };

        (service, handle)
    }

    /// Run until cancelled.
    ///
    /// On the way out the pending extended away timer is cancelled and the
    /// coordinator is dropped, which closes the presence request queue.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Presence service started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                input = self.inbox.recv() => {
                    let Some(input) = input else {
                        debug!("All handles dropped");
                        cancel.cancelled().await;
                        break;
                    };
                    self.handle(input);
                }

                () = ext_away_timer(self.coordinator.ext_away_deadline()) => {
                    self.coordinator.ext_away_timer_fired();
                }
            }

            self.publish();
        }

        self.coordinator.shutdown();
        self.publish();
        info!("Presence service stopped");
    }

    fn handle(&mut self, input: Input) {
        debug!("Handling {:?}", input);

        let coordinator = &mut self.coordinator;
        match input {
            Input::PresenceChanged(presence) => {
                coordinator.external_presence_changed(presence.kind, presence.status);
            }
            Input::IdleChanged(idle) => coordinator.session_idle_changed(idle),
            Input::NetworkChanged(connected) => coordinator.network_changed(connected),
            Input::SetState(kind) => coordinator.set_state(kind),
            Input::SetStatus(status) => coordinator.set_status(status),
            Input::SetPresence(kind, status) => coordinator.set_presence(kind, status),
            Input::SetAutoAway(auto_away) => coordinator.set_auto_away(auto_away),
            Input::SetFlashState(kind) => coordinator.set_flash_state(kind),
            Input::SetUseConnectivity(use_conn) => coordinator.set_use_connectivity(use_conn),
        }
    }

    fn publish(&self) {
        let snapshot = self.coordinator.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Sleep until the extended away deadline, forever if there is none.
async fn ext_away_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Send queued presence requests to the connection manager.
///
/// Failures are logged and dropped. Returns once the coordinator is gone.
pub async fn forward_requests(
    backend: Arc<dyn PresenceBackend>,
    mut requests: mpsc::UnboundedReceiver<PresenceRequest>,
) {
    while let Some(request) = requests.recv().await {
        debug!(
            "Requesting presence {:?} ({:?})",
            request.presence, request.message
        );
        if let Err(e) = backend
            .set_presence(request.presence, request.message.as_deref())
            .await
        {
            warn!("Failed to set presence {:?}: {}", request.presence, e);
        }
    }
    debug!("Presence request queue closed");
}

/// Forward a stream of inputs into the service until it ends or is cancelled.
pub fn spawn_pump<S>(
    name: &'static str,
    inputs: S,
    sender: mpsc::Sender<Input>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: Stream<Item = Input> + Send + 'static,
{
    tokio::spawn(async move {
        let mut inputs = pin!(inputs);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                input = inputs.next() => {
                    let Some(input) = input else {
                        info!("{} source ended", name);
                        break;
                    };
                    if sender.send(input).await.is_err() {
                        debug!("{} pump: service stopped", name);
                        break;
                    }
                }
            }
        }

        debug!("{} pump stopped", name);
    })
}

/// Adapt an idle source into a stream of inputs.
///
/// The stream ends when the source fails; idle-driven away then never
/// triggers.
pub fn idle_inputs(source: Box<dyn IdleSource>) -> impl Stream<Item = Input> + Send + 'static {
    stream::unfold(source, |mut source| async move {
        match source.next_change().await {
            Ok(idle) => Some((Input::IdleChanged(idle), source)),
            Err(e) => {
                warn!("Idle source failed: {}. Auto-away on idle disabled.", e);
                None
            }
        }
    })
}
