use crate::coordinator::View;
use crate::{Error, Node};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Picks nodes of one service, following the node list of its coordinator.
///
/// Returned by [`Selector::select`](crate::Selector::select). Cheap to clone, and every clone
/// follows the same node list. [`pick`](Self::pick) never blocks on I/O.
#[derive(Clone)]
pub struct Picker {
    service: Arc<str>,
    view: View,
    shutdown: CancellationToken,
}

impl Picker {
    pub(crate) fn new(service: &str, view: View, shutdown: CancellationToken) -> Self {
        Self {
            service: service.into(),
            view,
            shutdown,
        }
    }

    /// The service this picker selects nodes of.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Select one node using the configured [`Strategy`](crate::Strategy).
    ///
    /// Fails with [`Error::NoAvailableNode`] if the service currently has no nodes and with
    /// [`Error::EngineClosed`] once the selector has been closed.
    pub fn pick(&self) -> Result<Node, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::EngineClosed);
        }

        let next = Arc::clone(&self.view.read().next);
        next()
    }

    /// The nodes currently in rotation.
    pub fn nodes(&self) -> Arc<[Node]> {
        Arc::clone(&self.view.read().nodes)
    }

    /// Returns `true` if both pickers follow the node list of the same coordinator.
    pub fn shares_nodes_with(&self, other: &Picker) -> bool {
        Arc::ptr_eq(&self.view, &other.view)
    }
}

impl std::fmt::Debug for Picker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picker")
            .field("service", &self.service)
            .field("nodes", &self.view.read().nodes.len())
            .finish()
    }
}
