use anyhow::Context;

use sentiero::{watch, MemoryRegistry, Node, RetryPolicy, DEFAULT_BOOTSTRAP_TIMEOUT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = MemoryRegistry::new();
    registry.set_nodes("billing", vec![Node::new("billing-1", "10.0.0.1:8080")]);
    registry.set_nodes("ledger", vec![Node::new("ledger-1", "10.0.1.1:8080")]);

    // Subscribe to every service the registry knows about, or to none of them.
    let (subscriptions, mut stream) =
        watch(registry.clone(), RetryPolicy::default(), DEFAULT_BOOTSTRAP_TIMEOUT)
            .await
            .context("failed to watch the registry")?;

    let churn = tokio::spawn(async move {
        registry.add_node("billing", Node::new("billing-2", "10.0.0.2:8080"));
        // Same node set again: suppressed by the stream.
        registry.renotify("billing");
        registry.remove_node("ledger", "10.0.1.1:8080");
        registry.add_node("ledger", Node::new("ledger-2", "10.0.1.2:8080"));
        registry.add_node("billing", Node::new("billing-3", "10.0.0.3:8080"));
    });
    churn.await?;

    for _ in 0..3 {
        let event = stream.next().await.context("stream ended")?;
        println!(
            "{:?} {} -> {:?}",
            event.action,
            event.snapshot.name,
            event.snapshot.addresses()
        );
    }

    subscriptions.unsubscribe_all().await;

    Ok(())
}
