//! Error types for loop-test
//!
//! This module provides the errors returned when the harness or the event loop
//! is used incorrectly. Test failures live in [`crate::failure`].

use crate::event_loop::WatcherId;
use thiserror::Error;

/// Main error type for loop-test operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The watcher id does not belong to a live registration
    #[error("Invalid watcher identifier: {id}")]
    InvalidWatcher {
        /// Identifier that was looked up
        id: WatcherId,
    },

    /// A harness setting was given an unusable value
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Reason the value was rejected
        reason: String,
    },

    /// The loop was asked to run while it was already running
    #[error("Event loop is already running")]
    LoopRunning,

    /// A deferred was dropped before it was resolved or failed
    #[error("Deferred dropped without resolving its promise")]
    DeferredDropped,

    /// The promise of a deferred was requested twice
    #[error("Promise already taken from this deferred")]
    PromiseTaken,

    /// A callback failed while no error handler was installed
    #[error("{type_name} thrown from event loop callback: {message}")]
    Uncaught {
        /// Sanitized name of the raised type
        type_name: String,
        /// Message of the raised value
        message: String,
    },
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;
