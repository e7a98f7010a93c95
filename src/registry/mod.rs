//! Handler resolution.
//!
//! Task descriptors name their handler (and optionally an extension unit) by
//! reference. The registry turns those references into live trait objects,
//! loading each extension at most once before the first handler that needs it.

use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::task::{Extension, TaskError, TaskHandler, panic_message};
use crate::storage::StoredTask;

/// Errors raised while resolving a descriptor to its handler.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No handler is registered under the reference.
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    /// The descriptor requires an extension nobody registered.
    #[error("unknown extension: {0}")]
    UnknownExtension(String),

    /// The extension was found but failed to load.
    #[error("extension {name} failed to load: {source}")]
    ExtensionFailed {
        name: String,
        #[source]
        source: TaskError,
    },
}

/// Registry of task handlers and extension units.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    extensions: HashMap<String, Arc<dyn Extension>>,
    loaded: Mutex<HashSet<String>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name.
    pub fn register_handler(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    /// Register an extension under its own name.
    pub fn register_extension(&mut self, extension: Arc<dyn Extension>) -> &mut Self {
        self.extensions.insert(extension.name().to_string(), extension);
        self
    }

    /// Builder-style variant of [`register_handler`](Self::register_handler).
    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register_handler(handler);
        self
    }

    /// Builder-style variant of [`register_extension`](Self::register_extension).
    pub fn with_extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.register_extension(extension);
        self
    }

    /// Whether a handler is registered under `reference`.
    pub fn contains_handler(&self, reference: &str) -> bool {
        self.handlers.contains_key(reference)
    }

    /// Whether an extension is registered under `reference`.
    pub fn contains_extension(&self, reference: &str) -> bool {
        self.extensions.contains_key(reference)
    }

    /// Registered handler references, sorted.
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a descriptor to its handler.
    ///
    /// Loads the declared extension first. A successful load is remembered;
    /// a failed or panicking one is attempted again on the next call.
    pub async fn resolve(&self, task: &StoredTask) -> Result<Arc<dyn TaskHandler>, ResolveError> {
        if let Some(reference) = &task.require {
            self.load_extension(reference).await?;
        }

        self.handlers
            .get(&task.handler)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownHandler(task.handler.clone()))
    }

    async fn load_extension(&self, reference: &str) -> Result<(), ResolveError> {
        let extension = self
            .extensions
            .get(reference)
            .ok_or_else(|| ResolveError::UnknownExtension(reference.to_string()))?;

        // Held across the load so two resolves never load the same unit twice.
        let mut loaded = self.loaded.lock().await;
        if loaded.contains(reference) {
            return Ok(());
        }

        let result = match AssertUnwindSafe(extension.load()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
        };
        result.map_err(|source| ResolveError::ExtensionFailed {
            name: reference.to_string(),
            source,
        })?;

        tracing::debug!(extension = reference, "extension loaded");
        loaded.insert(reference.to_string());
        Ok(())
    }
}
