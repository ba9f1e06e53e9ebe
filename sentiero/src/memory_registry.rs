//! Implements [`Registry`] in memory.

use crate::{Node, NotificationSink, Registry, ServiceSnapshot};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An in-process [`Registry`].
///
/// Every mutation is pushed to the sinks subscribed to the affected service,
/// the same way a naming backend pushes membership changes. Clones share the
/// same state.
///
/// ```rust
/// use sentiero::{MemoryRegistry, Node};
///
/// let registry = MemoryRegistry::new();
/// registry.set_nodes("billing", vec![Node::new("a", "10.0.0.1:1111")]);
/// registry.add_node("billing", Node::new("b", "10.0.0.2:2222"));
/// registry.remove_node("billing", "10.0.0.1:1111");
///
/// assert_eq!(registry.nodes("billing"), vec![Node::new("b", "10.0.0.2:2222")]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    services: BTreeMap<String, Vec<Node>>,
    subscribers: HashMap<String, Vec<NotificationSink>>,
}

impl State {
    fn push(&mut self, service: &str) {
        let nodes = self.services.get(service).cloned().unwrap_or_default();
        if let Some(sinks) = self.subscribers.get_mut(service) {
            sinks.retain(|sink| !sink.is_closed());
            for sink in sinks.iter() {
                sink.notify(Ok(nodes.clone()));
            }
        }
    }
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node list of `service`.
    pub fn set_nodes(&self, service: &str, nodes: Vec<Node>) {
        let mut state = self.state.lock();
        state.services.insert(service.to_string(), nodes);
        state.push(service);
    }

    /// Register one more node for `service`.
    pub fn add_node(&self, service: &str, node: Node) {
        let mut state = self.state.lock();
        state
            .services
            .entry(service.to_string())
            .or_default()
            .push(node);
        state.push(service);
    }

    /// Deregister every node of `service` listening on `address`.
    pub fn remove_node(&self, service: &str, address: &str) {
        let mut state = self.state.lock();
        if let Some(nodes) = state.services.get_mut(service) {
            nodes.retain(|node| node.address != address);
        }
        state.push(service);
    }

    /// Push the current, unchanged, node list of `service` again.
    pub fn renotify(&self, service: &str) {
        self.state.lock().push(service);
    }

    /// Push a delivery error to the subscribers of `service`.
    pub fn notify_error(&self, service: &str, error: anyhow::Error) {
        let state = self.state.lock();
        if let Some(sinks) = state.subscribers.get(service) {
            let reason = format!("{error:#}");
            for sink in sinks {
                sink.notify(Err(anyhow::anyhow!(reason.clone())));
            }
        }
    }

    /// The nodes currently registered for `service`.
    pub fn nodes(&self, service: &str) -> Vec<Node> {
        self.state
            .lock()
            .services
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of live subscriptions for `service`.
    pub fn subscriber_count(&self, service: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(service)
            .map(|sinks| sinks.iter().filter(|sink| !sink.is_closed()).count())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Registry for MemoryRegistry {
    async fn get_service(&self, name: &str) -> Result<ServiceSnapshot, anyhow::Error> {
        Ok(ServiceSnapshot::new(name, self.nodes(name)))
    }

    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, anyhow::Error> {
        Ok(self
            .state
            .lock()
            .services
            .iter()
            .map(|(name, nodes)| ServiceSnapshot::new(name, nodes.clone()))
            .collect())
    }

    async fn subscribe(&self, name: &str, sink: NotificationSink) -> Result<(), anyhow::Error> {
        self.state
            .lock()
            .subscribers
            .entry(name.to_string())
            .or_default()
            .push(sink);
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), anyhow::Error> {
        self.state.lock().subscribers.remove(name);
        Ok(())
    }
}
