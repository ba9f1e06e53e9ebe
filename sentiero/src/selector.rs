//! Provides the builder and implementation of [`Selector`], the entry point that hands out
//! [`Picker`]s and takes failure reports back.

use crate::coordinator::{self, CoordinatorConfig, CoordinatorHandle};
use crate::watcher::{self, ChangeStream, Subscriptions};
use crate::{
    ConnectionFatal, Error, FailureClassifier, Node, Picker, Random, Registry, RetryPolicy,
    Strategy, WatchError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_futures::Instrument;

/// Default base interval between two registry reads of the same service.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Default upper bound of the random delay added to the refresh interval.
pub const DEFAULT_REFRESH_JITTER: Duration = Duration::from_secs(5);
/// Default time the first `select` of a service waits for a snapshot.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side service discovery with load-balanced node selection.
///
/// For every service it is asked about, the selector keeps a coordinator that follows the
/// service's membership in the [`Registry`], both by subscribing to registry pushes and by
/// periodically reading the service, and rebuilds a [`Picker`] with the configured
/// [`Strategy`] whenever the node list changes.
///
/// ```rust
/// #[tokio::main]
/// async fn main() {
///     use sentiero::{MemoryRegistry, Node, Selector};
///
///     let registry = MemoryRegistry::new();
///     registry.set_nodes("billing", vec![Node::new("a", "10.0.0.1:1111")]);
///
///     let selector = Selector::builder(registry).build();
///
///     let picker = selector.select("billing").await.expect("failed to select");
///     assert_eq!(picker.pick().unwrap().address, "10.0.0.1:1111");
///
///     selector.close().await.expect("already closed");
/// }
/// ```
///
/// Cheap to clone; clones share all state. Dropping the last clone without calling
/// [`close`](Self::close) stops the background tasks but does not unsubscribe from the registry.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<Inner>,
}

struct Inner {
    coordinator: CoordinatorConfig,
    classifier: Arc<dyn FailureClassifier>,
    startup_timeout: Duration,
    services: Arc<Mutex<Services>>,
    subscriptions: Subscriptions,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The coordinators and memoized pickers, guarded together so that concurrent first
/// `select`s of a service agree on a single coordinator.
#[derive(Default)]
struct Services {
    closed: bool,
    entries: HashMap<String, ServiceEntry>,
}

struct ServiceEntry {
    coordinator: CoordinatorHandle,
    picker: Option<Picker>,
}

impl Selector {
    /// Start configuring a [`Selector`] that discovers services through `registry`.
    pub fn builder<R: Registry + 'static>(registry: R) -> SelectorBuilder {
        SelectorBuilder::new(registry)
    }

    /// Return the picker of `service`.
    ///
    /// The first call for a service starts following it and waits until its first snapshot
    /// has been applied, for at most the configured startup timeout. Later calls return the
    /// same picker immediately.
    ///
    /// Failing with [`Error::StartupTimeout`] or [`Error::Subscribe`] does not stop the
    /// service from being followed: a later call may succeed.
    pub async fn select(&self, service: &str) -> Result<Picker, Error> {
        self.select_with_timeout(service, self.inner.startup_timeout)
            .await
    }

    /// Like [`select`](Self::select), with a caller-provided startup deadline.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn select_with_timeout(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<Picker, Error> {
        let coordinator = {
            let mut services = self.inner.services.lock();
            if services.closed {
                return Err(Error::EngineClosed);
            }

            let existing = services
                .entries
                .get(service)
                .map(|entry| (entry.coordinator.clone(), entry.picker.clone()));

            match existing {
                Some((_, Some(picker))) => return Ok(picker),
                Some((coordinator, None)) => coordinator,
                None => {
                    let coordinator = self.inner.follow(service);
                    services.entries.insert(
                        service.to_string(),
                        ServiceEntry {
                            coordinator: coordinator.clone(),
                            picker: None,
                        },
                    );
                    coordinator
                }
            }
        };

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return Err(Error::EngineClosed),
            ready = coordinator.wait_ready(timeout) => ready?,
        }

        let mut services = self.inner.services.lock();
        if services.closed {
            return Err(Error::EngineClosed);
        }
        let entry = services
            .entries
            .get_mut(service)
            .ok_or(Error::EngineClosed)?;
        let picker = entry.picker.get_or_insert_with(|| {
            Picker::new(
                service,
                coordinator.view(),
                self.inner.shutdown.clone(),
            )
        });

        Ok(picker.clone())
    }

    /// Report that a call to `node` of `service` failed with `failure`.
    ///
    /// Does nothing if `failure` is `None`, `service` is empty, the node has no address,
    /// the service was never selected, or the [`FailureClassifier`] does not consider the
    /// failure fatal. Otherwise the node is removed from the service's node list and this
    /// call returns once the picker has been rebuilt without it.
    ///
    /// The exclusion lasts until the next full snapshot of the service replaces the node list,
    /// so a node the registry still reports comes back on the next refresh.
    /// A `pick` that started before the rebuild may still return the excluded node once.
    #[tracing::instrument(level = "debug", skip(self, node, failure), fields(address = %node.address))]
    pub async fn mark(
        &self,
        service: &str,
        node: &Node,
        failure: Option<&(dyn StdError + 'static)>,
    ) -> Result<(), Error> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::EngineClosed);
        }

        let failure = match failure {
            Some(failure) if !service.is_empty() && !node.address.is_empty() => failure,
            _ => return Ok(()),
        };
        // User code, so it runs without holding the services lock.
        if !self.inner.classifier.should_exclude(failure) {
            tracing::trace!("failure does not warrant exclusion");
            return Ok(());
        }

        let coordinator = {
            let services = self.inner.services.lock();
            if services.closed {
                return Err(Error::EngineClosed);
            }
            match services.entries.get(service) {
                Some(entry) => entry.coordinator.clone(),
                None => return Ok(()),
            }
        };

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(Error::EngineClosed),
            acked = coordinator.exclude(node.address.clone()) => acked,
        }
    }

    /// Not supported: exclusions already expire with the next snapshot of the service.
    pub fn reset(&self, _service: &str) {}

    /// Stop following every service.
    ///
    /// Waits for every background task to finish, then unsubscribes from the registry.
    /// Every later operation fails with [`Error::EngineClosed`], a second `close` with
    /// [`Error::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), Error> {
        let entries = {
            let mut services = self.inner.services.lock();
            if services.closed {
                return Err(Error::AlreadyClosed);
            }
            services.closed = true;
            self.inner.shutdown.cancel();
            std::mem::take(&mut services.entries)
        };

        tracing::debug!(services = entries.len(), "closing selector");
        drop(entries);

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.subscriptions.unsubscribe_all().await;

        tracing::debug!("selector closed");
        Ok(())
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services = self.inner.services.lock();
        f.debug_struct("Selector")
            .field("closed", &services.closed)
            .field("services", &services.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Inner {
    /// Spawn the coordinator of `service` and subscribe to its pushes.
    fn follow(&self, service: &str) -> CoordinatorHandle {
        let coordinator = coordinator::spawn(service, &self.coordinator, &self.tasks, &self.shutdown);

        let subscriptions = self.subscriptions.clone();
        let shutdown = self.shutdown.clone();
        let handle = coordinator.clone();
        let name = service.to_string();
        let span = tracing::debug_span!("subscription", service = %service);
        self.tasks.spawn(
            async move {
                match subscriptions.subscribe(&name, &shutdown).await {
                    Ok(()) | Err(WatchError::Cancelled(_)) => {}
                    Err(WatchError::Subscribe { reason, .. }) => handle.subscription_failed(reason),
                    Err(err) => handle.subscription_failed(err.to_string()),
                }
            }
            .instrument(span),
        );

        coordinator
    }
}

/// Routes every change event to the coordinator of its service.
async fn dispatch(
    mut stream: ChangeStream,
    services: Arc<Mutex<Services>>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let coordinator = services
            .lock()
            .entries
            .get(&event.snapshot.name)
            .map(|entry| entry.coordinator.clone());

        match coordinator {
            Some(coordinator) => {
                tracing::debug!(
                    service = %event.snapshot.name,
                    action = ?event.action,
                    nodes = event.snapshot.nodes.len(),
                    "forwarding change"
                );
                if coordinator.push(event.snapshot).await.is_err() {
                    break;
                }
            }
            None => {
                tracing::trace!(service = %event.snapshot.name, "no coordinator for change");
            }
        }
    }

    tracing::debug!("dispatcher stopped");
}

/// Builder to configure and create a [`Selector`].
pub struct SelectorBuilder {
    registry: Arc<dyn Registry>,
    strategy: Option<Arc<dyn Strategy>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    refresh_interval: Option<Duration>,
    refresh_jitter: Option<Duration>,
    startup_timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl SelectorBuilder {
    /// Start configuring a [`Selector`] that discovers services through `registry`.
    pub fn new<R: Registry + 'static>(registry: R) -> Self {
        Self {
            registry: Arc::new(registry),
            strategy: None,
            classifier: None,
            refresh_interval: None,
            refresh_jitter: None,
            startup_timeout: None,
            retry: None,
        }
    }

    /// Set the [`Strategy`] used to build pickers.
    ///
    /// Defaults to [`Random`].
    pub fn strategy<S: Strategy>(self, strategy: S) -> Self {
        Self {
            strategy: Some(Arc::new(strategy)),
            ..self
        }
    }

    /// Set the [`FailureClassifier`] consulted by [`Selector::mark`].
    ///
    /// Defaults to [`ConnectionFatal`].
    pub fn failure_classifier<C: FailureClassifier>(self, classifier: C) -> Self {
        Self {
            classifier: Some(Arc::new(classifier)),
            ..self
        }
    }

    /// Set how often every service is read from the registry, as a fallback for missed pushes.
    /// Default interval in seconds is 30.
    pub fn refresh_interval(self, interval: Duration) -> Self {
        Self {
            refresh_interval: Some(interval),
            ..self
        }
    }

    /// Set the upper bound of the random delay added to the refresh interval of each service.
    /// Default jitter in seconds is 5.
    pub fn refresh_jitter(self, jitter: Duration) -> Self {
        Self {
            refresh_jitter: Some(jitter),
            ..self
        }
    }

    /// Set how long the first [`Selector::select`] of a service waits for its first snapshot.
    /// Default timeout in seconds is 10.
    pub fn startup_timeout(self, timeout: Duration) -> Self {
        Self {
            startup_timeout: Some(timeout),
            ..self
        }
    }

    /// Set the [`RetryPolicy`] of registry reads, subscriptions and unsubscriptions.
    pub fn retry_policy(self, retry: RetryPolicy) -> Self {
        Self {
            retry: Some(retry),
            ..self
        }
    }

    /// Construct a [`Selector`] from the [`SelectorBuilder`] instance.
    ///
    /// Must be called from within a Tokio runtime: the task routing registry pushes to
    /// coordinators is spawned right away.
    pub fn build(self) -> Selector {
        let retry = self.retry.unwrap_or_default();
        let (subscriptions, stream) = watcher::channel(Arc::clone(&self.registry), retry);

        let coordinator = CoordinatorConfig {
            registry: self.registry,
            strategy: self.strategy.unwrap_or_else(|| Arc::new(Random)),
            refresh_interval: self.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
            refresh_jitter: self.refresh_jitter.unwrap_or(DEFAULT_REFRESH_JITTER),
            retry,
        };

        let services = Arc::new(Mutex::new(Services::default()));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(
            dispatch(stream, Arc::clone(&services), shutdown.clone())
                .instrument(tracing::debug_span!("dispatcher")),
        );

        Selector {
            inner: Arc::new(Inner {
                coordinator,
                classifier: self
                    .classifier
                    .unwrap_or_else(|| Arc::new(ConnectionFatal)),
                startup_timeout: self.startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT),
                services,
                subscriptions,
                shutdown,
                tasks,
            }),
        }
    }
}

const _: () = {
    const fn assert_is_send_sync<T: Send + Sync>() {}
    assert_is_send_sync::<Selector>();
    assert_is_send_sync::<SelectorBuilder>();
    assert_is_send_sync::<Picker>();
};
