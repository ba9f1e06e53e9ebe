use std::time::Duration;

use anyhow::Context;

use sentiero::{MemoryRegistry, Node, RoundRobin, Selector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = MemoryRegistry::new();
    registry.set_nodes(
        "echo",
        vec![
            Node::new("echo-1", "127.0.0.1:5000"),
            Node::new("echo-2", "127.0.0.1:5001"),
            Node::new("echo-3", "127.0.0.1:5002"),
        ],
    );

    // Round robin makes the rotation visible; the registry is read every 10 seconds.
    let selector = Selector::builder(registry.clone())
        .strategy(RoundRobin)
        .refresh_interval(Duration::from_secs(10))
        .build();

    let picker = selector
        .select("echo")
        .await
        .context("failed to select echo")?;

    for _ in 0..3 {
        let node = picker.pick()?;
        println!("PICKED={}", node.address);
    }

    // Pretend the call to the first node was refused.
    let failure = tonic::Status::unavailable("connection refused");
    selector
        .mark("echo", &Node::new("echo-1", "127.0.0.1:5000"), Some(&failure))
        .await?;
    println!("NODES AFTER MARK={:?}", picker.nodes());

    // A new registration pushes the full node list, bringing the excluded node back.
    registry.add_node("echo", Node::new("echo-4", "127.0.0.1:5003"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("NODES AFTER PUSH={:?}", picker.nodes());

    selector.close().await?;

    Ok(())
}
