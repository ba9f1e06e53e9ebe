//! Errors surfaced by [`Selector`](crate::Selector) and [`Picker`](crate::Picker).

use std::time::Duration;

/// Errors returned by the selection engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No snapshot of the service arrived before the startup deadline.
    ///
    /// The coordinator keeps refreshing in the background, so a later
    /// `select` for the same service may succeed.
    #[error("timed out after {timeout:?} waiting for the first snapshot of '{service}'")]
    StartupTimeout { service: String, timeout: Duration },
    /// Subscribing to registry updates for the service failed before any
    /// snapshot was applied.
    #[error("failed to subscribe to '{service}': {reason}")]
    Subscribe { service: String, reason: String },
    /// The selector has been closed.
    #[error("selector has been closed")]
    EngineClosed,
    /// `close` was called more than once.
    #[error("selector was already closed")]
    AlreadyClosed,
    /// The current node list of the service is empty.
    #[error("no available node")]
    NoAvailableNode,
}

/// Errors returned while bootstrapping a [`ChangeStream`](crate::ChangeStream)
/// over every service known to the registry.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to list services: {0:#}")]
    ListServices(anyhow::Error),
    #[error("failed to subscribe to '{service}': {reason}")]
    Subscribe { service: String, reason: String },
    #[error("timed out after {0:?} subscribing to services")]
    BootstrapTimeout(Duration),
    #[error("subscription to '{0}' was cancelled")]
    Cancelled(String),
}
