//! Task handler trait and error types.
//!
//! A `TaskHandler` is the unit of work behind a background task. The scheduler
//! invokes it by reference after a successful claim and ignores whatever it
//! returns beyond success or failure.

use async_trait::async_trait;
use std::any::Any;
use thiserror::Error;

/// Errors that can occur while a handler runs.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Handler execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Filesystem error raised by the handler.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// The core trait for background task handlers.
///
/// Handlers take no arguments: whatever they need is captured when they are
/// constructed and registered. A handler is responsible for its own
/// diagnostic logging and for disabling its own task when it detects a
/// condition that needs an operator.
///
/// # Example
///
/// ```ignore
/// use warden::{TaskHandler, TaskError};
/// use async_trait::async_trait;
///
/// struct Heartbeat;
///
/// #[async_trait]
/// impl TaskHandler for Heartbeat {
///     fn name(&self) -> &str {
///         "heartbeat"
///     }
///
///     async fn execute(&self) -> Result<(), TaskError> {
///         tracing::info!("still alive");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns the handler reference this handler is registered under.
    fn name(&self) -> &str;

    /// Run the handler once.
    async fn execute(&self) -> Result<(), TaskError>;
}

/// An extension unit that must be loaded before some handlers can run.
///
/// Descriptors declare the extension by reference; the handler registry
/// loads it once, before the first handler that needs it.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Returns the extension reference.
    fn name(&self) -> &str;

    /// Prepare whatever the dependent handlers need.
    async fn load(&self) -> Result<(), TaskError>;
}

/// Text of a caught panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
