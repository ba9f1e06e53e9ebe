use parking_lot::Mutex;
use sentiero::{MemoryRegistry, NotificationSink, Registry, ServiceSnapshot};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A [`MemoryRegistry`] that fails or hangs on demand and counts the calls it receives.
///
/// Clones share the same state, so a test can keep one clone to inject faults
/// while the selector owns another.
#[derive(Clone, Default)]
pub struct FlakyRegistry {
    memory: MemoryRegistry,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Faults {
    get_failures: AtomicUsize,
    subscribe_failures: AtomicUsize,
    unsubscribe_failures: AtomicUsize,
    list_fails: AtomicBool,
    get_hangs: AtomicBool,
    unsubscribe_hangs: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    get_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

/// Consume one injected failure, if any is left.
fn take(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FlakyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry state behind the faults, used to change membership.
    pub fn memory(&self) -> &MemoryRegistry {
        &self.memory
    }

    /// Fail the next `n` calls to `get_service`.
    pub fn fail_get(&self, n: usize) {
        self.faults.get_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `subscribe`.
    pub fn fail_subscribe(&self, n: usize) {
        self.faults.subscribe_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `unsubscribe`.
    pub fn fail_unsubscribe(&self, n: usize) {
        self.faults.unsubscribe_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every call to `list_services`.
    pub fn fail_list(&self) {
        self.faults.list_fails.store(true, Ordering::SeqCst);
    }

    /// Never answer a call to `get_service`.
    pub fn hang_get(&self) {
        self.faults.get_hangs.store(true, Ordering::SeqCst);
    }

    /// Never answer a call to `unsubscribe`.
    pub fn hang_unsubscribe(&self) {
        self.faults.unsubscribe_hangs.store(true, Ordering::SeqCst);
    }

    /// Always fail to subscribe to `service`.
    pub fn reject_subscription(&self, service: &str) {
        self.faults.rejected.lock().insert(service.to_string());
    }

    /// Never answer a subscription to `service`.
    pub fn stall_subscription(&self, service: &str) {
        self.faults.stalled.lock().insert(service.to_string());
    }

    pub fn get_calls(&self) -> usize {
        self.faults.get_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.faults.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.faults.unsubscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Registry for FlakyRegistry {
    async fn get_service(&self, name: &str) -> Result<ServiceSnapshot, anyhow::Error> {
        self.faults.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.get_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take(&self.faults.get_failures) {
            anyhow::bail!("injected get_service failure");
        }
        self.memory.get_service(name).await
    }

    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, anyhow::Error> {
        if self.faults.list_fails.load(Ordering::SeqCst) {
            anyhow::bail!("injected list_services failure");
        }
        self.memory.list_services().await
    }

    async fn subscribe(&self, name: &str, sink: NotificationSink) -> Result<(), anyhow::Error> {
        self.faults.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let stalled = self.faults.stalled.lock().contains(name);
        if stalled {
            std::future::pending::<()>().await;
        }
        let rejected = self.faults.rejected.lock().contains(name);
        if rejected || take(&self.faults.subscribe_failures) {
            anyhow::bail!("injected subscribe failure for '{}'", name);
        }
        self.memory.subscribe(name, sink).await
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), anyhow::Error> {
        self.faults.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.unsubscribe_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take(&self.faults.unsubscribe_failures) {
            anyhow::bail!("injected unsubscribe failure for '{}'", name);
        }
        self.memory.unsubscribe(name).await
    }
}
