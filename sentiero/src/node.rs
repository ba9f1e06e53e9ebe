use std::collections::{BTreeSet, HashMap};

/// A single addressable instance of a service, as reported by the registry.
///
/// Two nodes are the same endpoint for exclusion purposes when their
/// [`address`](Node::address) matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Registry-assigned instance id.
    pub id: String,
    /// `host:port` of the instance.
    pub address: String,
    /// Free-form instance metadata.
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Create a [`Node`] without metadata.
    pub fn new<I: ToString, A: ToString>(id: I, address: A) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry to the node.
    pub fn with_metadata<K: ToString, V: ToString>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// ```
/// let node = sentiero::Node::from(("a", "10.0.0.1:1111"));
/// assert_eq!(node.id, "a");
/// assert_eq!(node.address, "10.0.0.1:1111");
/// ```
impl<I: ToString, A: ToString> From<(I, A)> for Node {
    fn from((id, address): (I, A)) -> Self {
        Self::new(id, address)
    }
}

/// The full list of nodes of one service at a point in time.
///
/// Snapshots are always replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    /// The service name.
    pub name: String,
    /// Nodes in the order the registry reported them.
    pub nodes: Vec<Node>,
}

impl ServiceSnapshot {
    /// Create a [`ServiceSnapshot`] for `name` with the given `nodes`.
    pub fn new<N: ToString>(name: N, nodes: Vec<Node>) -> Self {
        Self {
            name: name.to_string(),
            nodes,
        }
    }

    /// Create a [`ServiceSnapshot`] with no nodes.
    pub fn empty<N: ToString>(name: N) -> Self {
        Self::new(name, Vec::new())
    }

    /// The set of node addresses in this snapshot.
    ///
    /// ```
    /// use sentiero::{Node, ServiceSnapshot};
    ///
    /// let snapshot = ServiceSnapshot::new(
    ///     "svc",
    ///     vec![Node::new("b", "b:2222"), Node::new("a", "a:1111")],
    /// );
    /// let addresses: Vec<_> = snapshot.addresses().into_iter().collect();
    /// assert_eq!(addresses, vec!["a:1111".to_string(), "b:2222".to_string()]);
    /// ```
    pub fn addresses(&self) -> BTreeSet<String> {
        address_set(&self.nodes)
    }

    /// Returns `true` if there are no nodes in the snapshot.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub(crate) fn address_set(nodes: &[Node]) -> BTreeSet<String> {
    nodes.iter().map(|node| node.address.clone()).collect()
}
