//! Completion awaiter: blocks until an item's asynchronous work has finished

use std::sync::Arc;

use ml_loader_core::{Item, ItemStream, OpenContext, Result, Role, Stage, StageWrapper, Upstream};
use tracing::trace;

/// Stage that waits on each item's completion handle before yielding it
///
/// Items without a handle pass straight through. A failed handle turns the
/// item into an `AsyncOperationFailure` error.
#[derive(Debug, Clone)]
pub struct CompletionAwaiter {
    name: String,
}

impl CompletionAwaiter {
    /// Create an awaiter
    pub fn new() -> Self {
        Self {
            name: "completion_awaiter".to_string(),
        }
    }
}

impl Default for CompletionAwaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> Stage<T> for CompletionAwaiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::Awaiter
    }

    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>> {
        let input = upstream.open_single(ctx)?;
        Ok(Box::new(input.map(|item| {
            let item = item?;
            if let Some(handle) = item.completion() {
                if handle.is_pending() {
                    trace!("Waiting for pending operation");
                }
                handle.wait()?;
            }
            Ok(item)
        })))
    }
}

/// Inserts a [`CompletionAwaiter`] above each matched stage
#[derive(Debug, Clone, Copy, Default)]
pub struct AwaiterWrapper;

impl<T: Item> StageWrapper<T> for AwaiterWrapper {
    fn role(&self) -> Role {
        Role::Awaiter
    }

    fn wrap(&self, _target: &dyn Stage<T>) -> Result<Arc<dyn Stage<T>>> {
        Ok(Arc::new(CompletionAwaiter::new()))
    }
}
