//! Turns registry push notifications into [`ChangeEvent`]s.
//!
//! [`Subscriptions`] drives the per-service subscription state machine against a
//! [`Registry`], handing it a [`NotificationSink`] for every service. Everything the
//! registry pushes through those sinks ends up on one bounded queue that is drained
//! by a [`ChangeStream`], which drops errors and empty payloads and suppresses
//! re-deliveries of an unchanged node set.

use crate::retry::{with_retry, RetryError};
use crate::{
    node::address_set, Node, Notification, NotificationSink, Registry, RetryPolicy,
    ServiceSnapshot, WatchError,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// Determines the size of the queue between the registry callbacks
// and the change stream.
// We set the number high so that registry threads never have to drop
// a notification under normal churn.
static NOTIFICATION_CHANNEL_SIZE: usize = 1024;

// Upper bound for a single unsubscribe call.
// Unsubscribing is best effort, a registry that never answers must not block shutdown.
const UNSUBSCRIBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default deadline for subscribing to every service in [`watch`].
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// What happened to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// First node list delivered for the service, or the first one after an empty
    /// or failed notification.
    Create,
    /// The node set of a known service changed.
    Update,
}

/// A normalized membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub action: Action,
    pub snapshot: ServiceSnapshot,
}

/// Lifecycle of the registry subscription of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    /// The retry budget was exhausted. A new call to
    /// [`Subscriptions::subscribe`] starts over.
    Failed,
}

#[derive(Debug)]
struct Subscription {
    state: SubscriptionState,
    /// Reached [`SubscriptionState::Subscribed`] at least once.
    ever_subscribed: bool,
}

/// Create a connected pair of [`Subscriptions`] and [`ChangeStream`] over `registry`.
pub fn channel(registry: Arc<dyn Registry>, retry: RetryPolicy) -> (Subscriptions, ChangeStream) {
    let (sender, receiver) = mpsc::channel(NOTIFICATION_CHANNEL_SIZE);

    let subscriptions = Subscriptions {
        registry,
        sender,
        retry,
        subscriptions: Arc::new(Mutex::new(HashMap::new())),
    };
    let stream = ChangeStream {
        receiver,
        delivered: HashMap::new(),
    };

    (subscriptions, stream)
}

/// Subscribe to every service the registry knows about and return the resulting stream.
///
/// All subscriptions are attempted concurrently. If any of them fails, or they do not
/// all succeed within `timeout`, the ones that did succeed are unsubscribed again and
/// the bootstrap fails as a whole.
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use sentiero::{watch, Action, MemoryRegistry, Node, RetryPolicy, DEFAULT_BOOTSTRAP_TIMEOUT};
///
/// let registry = MemoryRegistry::new();
/// registry.set_nodes("billing", vec![Node::new("a", "10.0.0.1:1111")]);
///
/// let (subscriptions, mut stream) =
///     watch(registry.clone(), RetryPolicy::default(), DEFAULT_BOOTSTRAP_TIMEOUT).await?;
///
/// registry.add_node("billing", Node::new("b", "10.0.0.2:2222"));
///
/// let event = stream.next().await.expect("stream ended");
/// assert_eq!(event.action, Action::Create);
/// assert_eq!(event.snapshot.nodes.len(), 2);
///
/// subscriptions.unsubscribe_all().await;
/// # Ok(())
/// # }
/// ```
#[tracing::instrument(level = "debug", skip(registry, retry))]
pub async fn watch<R>(
    registry: R,
    retry: RetryPolicy,
    timeout: Duration,
) -> Result<(Subscriptions, ChangeStream), WatchError>
where
    R: Registry + 'static,
{
    let registry: Arc<dyn Registry> = Arc::new(registry);
    let services = registry
        .list_services()
        .await
        .map_err(WatchError::ListServices)?;

    let (subscriptions, stream) = channel(registry, retry);
    let shutdown = CancellationToken::new();

    let mut pending = JoinSet::new();
    for service in services {
        let subscriptions = subscriptions.clone();
        let shutdown = shutdown.clone();
        pending.spawn(async move { subscriptions.subscribe(&service.name, &shutdown).await });
    }

    let all_subscribed = async {
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(result) => result?,
                Err(err) => {
                    return Err(WatchError::Subscribe {
                        service: String::from("<unknown>"),
                        reason: err.to_string(),
                    })
                }
            }
        }
        Ok::<(), WatchError>(())
    };

    let outcome = match tokio::time::timeout(timeout, all_subscribed).await {
        Ok(outcome) => outcome,
        Err(_) => Err(WatchError::BootstrapTimeout(timeout)),
    };

    if let Err(err) = outcome {
        tracing::warn!(error = %err, "watch bootstrap failed, rolling back subscriptions");
        shutdown.cancel();
        pending.shutdown().await;
        subscriptions.unsubscribe_all().await;
        return Err(err);
    }

    tracing::debug!("subscribed to every service");
    Ok((subscriptions, stream))
}

/// Manages the registry subscriptions feeding one [`ChangeStream`].
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Subscriptions {
    registry: Arc<dyn Registry>,
    sender: mpsc::Sender<Notification>,
    retry: RetryPolicy,
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
}

impl Subscriptions {
    /// Current state of the subscription of `service`.
    pub fn state(&self, service: &str) -> SubscriptionState {
        self.subscriptions
            .lock()
            .get(service)
            .map(|subscription| subscription.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    fn transition(&self, service: &str, state: SubscriptionState) {
        let mut subscriptions = self.subscriptions.lock();
        let subscription = subscriptions
            .entry(service.to_string())
            .or_insert(Subscription {
                state,
                ever_subscribed: false,
            });
        subscription.state = state;
        subscription.ever_subscribed |= state == SubscriptionState::Subscribed;
    }

    /// Subscribe to the changes of `service`, retrying according to the [`RetryPolicy`].
    ///
    /// Returns immediately if the service is already subscribed.
    #[tracing::instrument(level = "debug", skip(self, shutdown))]
    pub async fn subscribe(
        &self,
        service: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), WatchError> {
        if self.state(service) == SubscriptionState::Subscribed {
            return Ok(());
        }
        self.transition(service, SubscriptionState::Subscribing);

        let sink = NotificationSink::new(service, self.sender.clone());
        let result = with_retry(&self.retry, shutdown, "subscribe", || {
            self.registry.subscribe(service, sink.clone())
        })
        .await;

        match result {
            Ok(()) => {
                self.transition(service, SubscriptionState::Subscribed);
                tracing::debug!("subscribed");
                Ok(())
            }
            Err(RetryError::Exhausted(err)) => {
                self.transition(service, SubscriptionState::Failed);
                let reason = format!("{err:#}");
                tracing::warn!(%reason, "giving up on subscription");
                Err(WatchError::Subscribe {
                    service: service.to_string(),
                    reason,
                })
            }
            // The attempt in flight may have reached the registry, so the state stays
            // `Subscribing` and `unsubscribe_all` still covers it.
            Err(RetryError::Cancelled) => Err(WatchError::Cancelled(service.to_string())),
        }
    }

    /// Unsubscribe every service that reached [`SubscriptionState::Subscribed`] at some point,
    /// or was cancelled mid-subscription.
    ///
    /// Best effort: failures are logged, never returned, and every call to the registry
    /// is abandoned after two seconds.
    pub async fn unsubscribe_all(&self) {
        let services: Vec<String> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, subscription)| {
                subscription.ever_subscribed
                    || subscription.state == SubscriptionState::Subscribing
            })
            .map(|(service, _)| service.clone())
            .collect();

        // Shutdown is usually already cancelled at this point, unsubscribing gets its own token.
        let token = CancellationToken::new();
        let registry = &self.registry;
        for service in services {
            let name = service.as_str();
            let result = with_retry(&self.retry, &token, "unsubscribe", || async move {
                match tokio::time::timeout(UNSUBSCRIBE_ATTEMPT_TIMEOUT, registry.unsubscribe(name))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "no answer within {:?}",
                        UNSUBSCRIBE_ATTEMPT_TIMEOUT
                    )),
                }
            })
            .await;

            match result {
                Ok(()) => tracing::debug!(%service, "unsubscribed"),
                Err(RetryError::Exhausted(err)) => {
                    let error = format!("{err:#}");
                    tracing::warn!(%service, %error, "failed to unsubscribe");
                }
                Err(RetryError::Cancelled) => {}
            }
            self.transition(&service, SubscriptionState::Unsubscribed);
        }
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("retry", &self.retry)
            .field("subscriptions", &*self.subscriptions.lock())
            .finish()
    }
}

/// The consuming end of the notification queue.
#[derive(Debug)]
pub struct ChangeStream {
    receiver: mpsc::Receiver<Notification>,
    /// Address set of the last delivered node list, per service.
    delivered: HashMap<String, BTreeSet<String>>,
}

impl ChangeStream {
    /// Wait for the next membership change.
    ///
    /// Returns `None` once every [`Subscriptions`] handle and [`NotificationSink`] is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            let notification = self.receiver.recv().await?;
            if let Some(event) = self.normalize(notification) {
                return Some(event);
            }
        }
    }

    fn normalize(&mut self, notification: Notification) -> Option<ChangeEvent> {
        let Notification { service, nodes } = notification;

        let nodes: Vec<Node> = match nodes {
            // The coordinator may have applied an empty list through a refresh meanwhile,
            // so the next non-empty list is always delivered.
            Ok(nodes) if nodes.is_empty() => {
                tracing::debug!(%service, "dropping empty notification");
                self.delivered.remove(&service);
                return None;
            }
            Ok(nodes) => nodes,
            Err(err) => {
                let error = format!("{err:#}");
                tracing::warn!(%service, %error, "dropping failed notification");
                self.delivered.remove(&service);
                return None;
            }
        };

        let addresses = address_set(&nodes);
        let action = match self.delivered.get(&service) {
            Some(previous) if *previous == addresses => {
                tracing::trace!(%service, "suppressing unchanged notification");
                return None;
            }
            Some(_) => Action::Update,
            None => Action::Create,
        };
        self.delivered.insert(service.clone(), addresses);

        Some(ChangeEvent {
            action,
            snapshot: ServiceSnapshot::new(service, nodes),
        })
    }
}
