use sentiero::{Next, Node, RoundRobin, Strategy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Round-robin that counts how many times a picker was built.
#[derive(Clone, Default)]
pub struct CountingStrategy {
    builds: Arc<AtomicUsize>,
}

impl CountingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl Strategy for CountingStrategy {
    fn build(&self, nodes: Vec<Node>) -> Next {
        self.builds.fetch_add(1, Ordering::SeqCst);
        RoundRobin.build(nodes)
    }
}
