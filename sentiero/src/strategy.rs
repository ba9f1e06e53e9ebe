//! Load-balancing strategies turn a node list into a [`Next`] callable.

use crate::{Error, Node};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Returns one node per invocation, or [`Error::NoAvailableNode`] if it was built
/// from an empty node list.
pub type Next = Arc<dyn Fn() -> Result<Node, Error> + Send + Sync>;

/// A load-balancing algorithm.
///
/// [`build`](Strategy::build) is handed an independent copy of the node list every time the
/// list changes and must not assume anything about previous lists.
/// It must accept an empty list, in which case the returned [`Next`] always fails with
/// [`Error::NoAvailableNode`].
///
/// Any `Fn(Vec<Node>) -> Next` closure is a strategy:
///
/// ```rust
/// use sentiero::{Next, Node, Strategy};
/// use std::sync::Arc;
///
/// // Always pick the first node.
/// let first = |nodes: Vec<Node>| -> Next {
///     Arc::new(move || nodes.first().cloned().ok_or(sentiero::Error::NoAvailableNode))
/// };
///
/// let next = first.build(vec![Node::new("a", "a:1111"), Node::new("b", "b:2222")]);
/// assert_eq!(next().unwrap().address, "a:1111");
/// ```
pub trait Strategy: Send + Sync + 'static {
    fn build(&self, nodes: Vec<Node>) -> Next;
}

impl<F> Strategy for F
where
    F: Fn(Vec<Node>) -> Next + Send + Sync + 'static,
{
    fn build(&self, nodes: Vec<Node>) -> Next {
        self(nodes)
    }
}

/// A [`Next`] that never yields a node.
pub fn unavailable() -> Next {
    Arc::new(|| Err(Error::NoAvailableNode))
}

/// Picks a node uniformly at random on every invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl Strategy for Random {
    fn build(&self, nodes: Vec<Node>) -> Next {
        if nodes.is_empty() {
            return unavailable();
        }

        Arc::new(move || {
            let index = rand::thread_rng().gen_range(0..nodes.len());
            Ok(nodes[index].clone())
        })
    }
}

/// Cycles through the nodes in order, starting from a random offset so that
/// many callers do not all hit the first node of a fresh list.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobin;

impl Strategy for RoundRobin {
    fn build(&self, nodes: Vec<Node>) -> Next {
        if nodes.is_empty() {
            return unavailable();
        }

        let cursor = AtomicUsize::new(rand::thread_rng().gen_range(0..nodes.len()));
        Arc::new(move || {
            let index = cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
            Ok(nodes[index].clone())
        })
    }
}
