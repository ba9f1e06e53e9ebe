//! Defines the interface that [`Selector`](crate::Selector) requires from a naming registry
//! in order to read and watch the nodes of a service.

use crate::{Node, ServiceSnapshot};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Interface to a naming registry that publishes the membership of services.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Point-in-time read of all the nodes currently registered for `name`.
    ///
    /// A service without nodes is returned as an empty [`ServiceSnapshot`], not as an error.
    async fn get_service(&self, name: &str) -> Result<ServiceSnapshot, anyhow::Error>;

    /// Enumerate every service known to the registry.
    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, anyhow::Error>;

    /// Start pushing membership changes of `name` into `sink`.
    ///
    /// The registry may call [`NotificationSink::notify`] from any thread, at any time,
    /// including re-deliveries of an unchanged node list.
    async fn subscribe(&self, name: &str, sink: NotificationSink) -> Result<(), anyhow::Error>;

    /// Stop pushing membership changes of `name`.
    async fn unsubscribe(&self, name: &str) -> Result<(), anyhow::Error>;
}

/// A raw membership notification, as delivered by the registry.
#[derive(Debug)]
pub struct Notification {
    pub service: String,
    pub nodes: Result<Vec<Node>, anyhow::Error>,
}

/// Callback handed to [`Registry::subscribe`].
///
/// Notifications are queued on a bounded channel and consumed by a
/// [`ChangeStream`](crate::ChangeStream), so calling [`notify`](Self::notify)
/// never blocks the registry's own threads.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    service: Arc<str>,
    sender: mpsc::Sender<Notification>,
}

impl NotificationSink {
    pub(crate) fn new(service: &str, sender: mpsc::Sender<Notification>) -> Self {
        Self {
            service: service.into(),
            sender,
        }
    }

    /// The service this sink was subscribed for.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns `true` once the consuming [`ChangeStream`](crate::ChangeStream) is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Deliver the latest node list of the service, or the error the registry hit
    /// while producing it.
    pub fn notify(&self, nodes: Result<Vec<Node>, anyhow::Error>) {
        let notification = Notification {
            service: self.service.to_string(),
            nodes,
        };

        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The periodic refresh will pick up whatever we drop here.
                tracing::warn!(service = %self.service, "notification queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(service = %self.service, "change stream closed, dropping notification");
            }
        }
    }
}
