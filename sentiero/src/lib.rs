//! `sentiero` discovers the nodes of a service through a pluggable [`Registry`] and load balances
//! calls across them on the client side.
//!
//! # Simple example
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use sentiero::{MemoryRegistry, Node, Selector};
//!
//!     let registry = MemoryRegistry::new();
//!     registry.set_nodes(
//!         "billing",
//!         vec![
//!             Node::new("billing-1", "10.0.0.1:8080"),
//!             Node::new("billing-2", "10.0.0.2:8080"),
//!         ],
//!     );
//!
//!     // Create a selector with the default random strategy.
//!     let selector = Selector::builder(registry).build();
//!
//!     let picker = selector.select("billing").await.expect("failed to select");
//!     let node = picker.pick().expect("no node available");
//!     println!("calling {}", node.address);
//!
//!     selector.close().await.expect("already closed");
//! }
//! ```
//!
//! [`Selector`] also allows plugging in a different [`Strategy`]. Any closure turning a node
//! list into a [`Next`] function is one.
//!
//! ```rust
//! use sentiero::{Next, Node, Error};
//! use std::sync::Arc;
//!
//! // Always the first node.
//! fn first(nodes: Vec<Node>) -> Next {
//!     Arc::new(move || nodes.first().cloned().ok_or(Error::NoAvailableNode))
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     use sentiero::{MemoryRegistry, Selector};
//!
//!     let registry = MemoryRegistry::new();
//!     registry.set_nodes("billing", vec![Node::new("billing-1", "10.0.0.1:8080")]);
//!
//!     let selector = Selector::builder(registry).strategy(first).build();
//!     let picker = selector.select("billing").await.expect("failed to select");
//!
//!     assert_eq!(picker.pick().unwrap().id, "billing-1");
//! }
//! ```
//!
//! Failed calls are reported back with [`Selector::mark`]. Failures the configured
//! [`FailureClassifier`] considers fatal take the node out of rotation until the next full
//! snapshot of the service.
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use sentiero::{MemoryRegistry, Node, RoundRobin, Selector};
//!
//!     let registry = MemoryRegistry::new();
//!     registry.set_nodes(
//!         "billing",
//!         vec![Node::new("1", "10.0.0.1:8080"), Node::new("2", "10.0.0.2:8080")],
//!     );
//!
//!     let selector = Selector::builder(registry).strategy(RoundRobin).build();
//!     let picker = selector.select("billing").await.unwrap();
//!
//!     let node = picker.pick().unwrap();
//!     let failure = tonic::Status::unavailable("connection refused");
//!     selector.mark("billing", &node, Some(&failure)).await.unwrap();
//!
//!     assert_ne!(picker.pick().unwrap(), node);
//! }
//! ```
//!
//! For registries with lower churn, the refresh interval can be raised.
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use sentiero::{MemoryRegistry, SelectorBuilder};
//!
//!     let selector = SelectorBuilder::new(MemoryRegistry::new())
//!         .refresh_interval(std::time::Duration::from_secs(120))
//!         .startup_timeout(std::time::Duration::from_secs(3))
//!         .build();
//! }
//! ```
//!
//! # Internals
//! Every selected service gets a coordinator: a task owning the node list of the service that
//! applies periodic registry reads, registry pushes and exclusions one at a time, and swaps in a
//! freshly built [`Picker`] state whenever the list changes. Registry pushes travel through a
//! single [`ChangeStream`], see [`watch`] to consume one directly.

mod coordinator;
mod error;
mod failure;
mod memory_registry;
mod node;
mod picker;
mod registry;
mod retry;
mod selector;
mod strategy;
mod watcher;

pub use error::*;
pub use failure::*;
pub use memory_registry::*;
pub use node::{Node, ServiceSnapshot};
pub use picker::*;
pub use registry::*;
pub use retry::RetryPolicy;
pub use selector::*;
pub use strategy::*;
pub use watcher::*;
