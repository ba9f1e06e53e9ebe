//! The per-service coordinator: single writer of the node list of one service.
//!
//! A coordinator is two tasks. The refresh loop periodically reads the service from
//! the registry and forwards the snapshot. The coordinator loop owns the node list
//! and consumes one inbox of [`Event`]s (refreshes, pushes from the change stream and
//! exclusions from `mark`) strictly in order, rebuilding the picker whenever the
//! node list changes.

use crate::retry::{with_retry, RetryError};
use crate::strategy::{unavailable, Next};
use crate::{Error, Node, Registry, RetryPolicy, ServiceSnapshot, Strategy};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_futures::Instrument;

// Determines the size of the inbox of a coordinator.
// Refreshes are rare and pushes are deduplicated upstream,
// so this mostly bounds how many `mark` calls can queue up.
static COORDINATOR_INBOX_SIZE: usize = 64;

/// Everything a coordinator can be asked to do.
#[derive(Debug)]
pub(crate) enum Event {
    /// Snapshot read by the periodic refresh.
    Refresh(ServiceSnapshot),
    /// Snapshot pushed by the registry through the change stream.
    Push(ServiceSnapshot),
    /// Remove every node listening on `address`, then acknowledge.
    Exclude {
        address: String,
        ack: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Startup {
    Pending,
    Ready,
    /// Subscribing to pushes failed before the first snapshot was applied.
    Failed(String),
}

/// The node list and picker currently in use for a service.
pub(crate) struct Active {
    pub(crate) nodes: Arc<[Node]>,
    pub(crate) next: Next,
}

pub(crate) type View = Arc<RwLock<Active>>;

/// Settings shared by every coordinator of a selector.
#[derive(Clone)]
pub(crate) struct CoordinatorConfig {
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) strategy: Arc<dyn Strategy>,
    pub(crate) refresh_interval: Duration,
    pub(crate) refresh_jitter: Duration,
    pub(crate) retry: RetryPolicy,
}

impl CoordinatorConfig {
    /// Refresh period of one coordinator: the base interval plus a random share of the jitter,
    /// so that coordinators created together do not hit the registry together.
    fn jittered_interval(&self) -> Duration {
        let jitter_ms = u64::try_from(self.refresh_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        self.refresh_interval
            .saturating_add(jitter)
            .max(Duration::from_millis(1))
    }
}

/// Handle to a running coordinator.
#[derive(Clone)]
pub(crate) struct CoordinatorHandle {
    service: Arc<str>,
    inbox: mpsc::Sender<Event>,
    view: View,
    startup: Arc<watch::Sender<Startup>>,
}

/// Start the coordinator and the refresh loop of `service`.
///
/// Both tasks stop when `shutdown` is cancelled.
pub(crate) fn spawn(
    service: &str,
    config: &CoordinatorConfig,
    tasks: &TaskTracker,
    shutdown: &CancellationToken,
) -> CoordinatorHandle {
    let service: Arc<str> = service.into();
    let (inbox, receiver) = mpsc::channel(COORDINATOR_INBOX_SIZE);
    let (startup, _) = watch::channel(Startup::Pending);
    let startup = Arc::new(startup);
    let view: View = Arc::new(RwLock::new(Active {
        nodes: Arc::from(Vec::new()),
        next: unavailable(),
    }));

    let coordinator = Coordinator {
        strategy: Arc::clone(&config.strategy),
        nodes: Vec::new(),
        view: Arc::clone(&view),
        startup: Arc::clone(&startup),
        ready: false,
    };
    let span = tracing::debug_span!("coordinator", service = %service);
    tasks.spawn(
        coordinator
            .run(receiver, shutdown.clone())
            .instrument(span.clone()),
    );

    let refresh = RefreshLoop {
        service: Arc::clone(&service),
        registry: Arc::clone(&config.registry),
        retry: config.retry,
        interval: config.jittered_interval(),
        inbox: inbox.clone(),
    };
    tasks.spawn(refresh.run(shutdown.clone()).instrument(span));

    CoordinatorHandle {
        service,
        inbox,
        view,
        startup,
    }
}

impl CoordinatorHandle {
    pub(crate) fn view(&self) -> View {
        Arc::clone(&self.view)
    }

    /// Forward a snapshot pushed by the registry.
    pub(crate) async fn push(&self, snapshot: ServiceSnapshot) -> Result<(), Error> {
        self.inbox
            .send(Event::Push(snapshot))
            .await
            .map_err(|_| Error::EngineClosed)
    }

    /// Remove `address` from the node list and wait until the picker has been rebuilt.
    pub(crate) async fn exclude(&self, address: String) -> Result<(), Error> {
        let (ack, acked) = oneshot::channel();
        self.inbox
            .send(Event::Exclude { address, ack })
            .await
            .map_err(|_| Error::EngineClosed)?;
        // A coordinator that stops first drops the ack sender.
        acked.await.map_err(|_| Error::EngineClosed)
    }

    /// Wait for the first snapshot to be applied.
    ///
    /// A subscription failure ends the wait early, unless it had already been reported
    /// when the wait started: callers coming back after a failure wait for the periodic
    /// refresh instead.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<(), Error> {
        let mut startup = self.startup.subscribe();
        let was_pending = *startup.borrow() == Startup::Pending;

        let ready = startup.wait_for(|state| match state {
            Startup::Ready => true,
            Startup::Failed(_) => was_pending,
            Startup::Pending => false,
        });

        // Copy the state out so the borrow of `startup` ends here.
        let outcome = match tokio::time::timeout(timeout, ready).await {
            Err(_) => None,
            Ok(Err(_)) => return Err(Error::EngineClosed),
            Ok(Ok(state)) => Some((*state).clone()),
        };

        match outcome {
            None => Err(Error::StartupTimeout {
                service: self.service.to_string(),
                timeout,
            }),
            Some(Startup::Failed(reason)) => Err(Error::Subscribe {
                service: self.service.to_string(),
                reason,
            }),
            Some(Startup::Ready | Startup::Pending) => Ok(()),
        }
    }

    /// Record that push updates are not available for this service.
    ///
    /// Before the first snapshot this fails the callers waiting in [`wait_ready`](Self::wait_ready).
    /// Afterwards the coordinator simply keeps running on periodic refreshes.
    pub(crate) fn subscription_failed(&self, reason: String) {
        let failed_startup = self.startup.send_if_modified(|state| {
            if *state == Startup::Pending {
                *state = Startup::Failed(reason.clone());
                true
            } else {
                false
            }
        });

        if failed_startup {
            tracing::warn!(service = %self.service, %reason, "subscription failed before the first snapshot");
        } else {
            tracing::warn!(service = %self.service, %reason, "subscription failed, falling back to periodic refresh");
        }
    }
}

struct Coordinator {
    strategy: Arc<dyn Strategy>,
    nodes: Vec<Node>,
    view: View,
    startup: Arc<watch::Sender<Startup>>,
    ready: bool,
}

impl Coordinator {
    async fn run(mut self, mut inbox: mpsc::Receiver<Event>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.apply(event);
        }

        // Anything still queued is dropped, which tells pending `mark` callers we are gone.
        inbox.close();
        let mut dropped = 0;
        while inbox.try_recv().is_ok() {
            dropped += 1;
        }
        tracing::debug!(dropped, "coordinator stopped");
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Refresh(snapshot) => {
                tracing::trace!(nodes = snapshot.nodes.len(), "applying refresh");
                self.replace(snapshot.nodes);
            }
            Event::Push(snapshot) => {
                tracing::trace!(nodes = snapshot.nodes.len(), "applying push");
                self.replace(snapshot.nodes);
            }
            Event::Exclude { address, ack } => {
                self.exclude(&address);
                let _ = ack.send(());
            }
        }
    }

    /// Replace the node list with a full snapshot. Any earlier exclusion is forgotten.
    fn replace(&mut self, nodes: Vec<Node>) {
        if !self.ready || nodes != self.nodes {
            self.nodes = nodes;
            self.rebuild();
        }

        if !self.ready {
            self.ready = true;
            self.startup.send_replace(Startup::Ready);
            tracing::debug!(nodes = self.nodes.len(), "first snapshot applied");
        }
    }

    fn exclude(&mut self, address: &str) {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.address != address);

        if self.nodes.len() != before {
            tracing::debug!(%address, "excluding node");
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        let next = self.strategy.build(self.nodes.clone());
        let nodes: Arc<[Node]> = self.nodes.clone().into();

        *self.view.write() = Active { nodes, next };
        tracing::debug!(nodes = self.nodes.len(), "picker rebuilt");
    }
}

struct RefreshLoop {
    service: Arc<str>,
    registry: Arc<dyn Registry>,
    retry: RetryPolicy,
    interval: Duration,
    inbox: mpsc::Sender<Event>,
}

impl RefreshLoop {
    async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The first tick completes immediately.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let result = with_retry(&self.retry, &shutdown, "get_service", || {
                self.registry.get_service(&self.service)
            })
            .await;

            match result {
                Ok(snapshot) => {
                    let snapshot = ServiceSnapshot::new(&*self.service, snapshot.nodes);
                    if self.inbox.send(Event::Refresh(snapshot)).await.is_err() {
                        break;
                    }
                }
                Err(RetryError::Exhausted(err)) => {
                    let error = format!("{err:#}");
                    tracing::warn!(%error, "failed to refresh service, keeping last known nodes");
                }
                Err(RetryError::Cancelled) => break,
            }
        }

        tracing::debug!("refresh loop stopped");
    }
}
