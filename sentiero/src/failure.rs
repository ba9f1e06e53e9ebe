//! Decides which call failures reported through [`Selector::mark`](crate::Selector::mark)
//! take a node out of rotation.

use std::error::Error as StdError;
use std::io;

/// Classifies a failure reported by a caller.
///
/// Returning `true` means the node is considered unusable and is excluded until the
/// next full snapshot of the service. Anything a classifier does not recognise should
/// return `false`.
///
/// Any `Fn(&(dyn std::error::Error + 'static)) -> bool` closure is a classifier.
pub trait FailureClassifier: Send + Sync + 'static {
    fn should_exclude(&self, failure: &(dyn StdError + 'static)) -> bool;
}

impl<F> FailureClassifier for F
where
    F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
{
    fn should_exclude(&self, failure: &(dyn StdError + 'static)) -> bool {
        self(failure)
    }
}

/// The default classifier: excludes a node on connection-fatal failures.
///
/// The whole `source()` chain is inspected, and the following count as fatal:
/// * a [`tonic::Status`] with code `Unavailable` or `DeadlineExceeded`;
/// * an [`io::Error`] that refused, reset, aborted or never established the connection.
///
/// ```rust
/// use sentiero::{ConnectionFatal, FailureClassifier};
///
/// let unavailable = tonic::Status::unavailable("connection refused");
/// let not_found = tonic::Status::not_found("no such user");
///
/// assert!(ConnectionFatal.should_exclude(&unavailable));
/// assert!(!ConnectionFatal.should_exclude(&not_found));
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionFatal;

impl FailureClassifier for ConnectionFatal {
    fn should_exclude(&self, failure: &(dyn StdError + 'static)) -> bool {
        let mut current = Some(failure);
        while let Some(err) = current {
            if let Some(status) = err.downcast_ref::<tonic::Status>() {
                return matches!(
                    status.code(),
                    tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
                );
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                return matches!(
                    io.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::AddrNotAvailable
                );
            }
            current = err.source();
        }
        false
    }
}
