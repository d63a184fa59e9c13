//! Sharding splitter: partitions items across worker contexts

use std::sync::Arc;

use ml_loader_core::{Item, ItemStream, OpenContext, Result, Role, Stage, StageWrapper, Upstream};
use tracing::trace;

/// Passes every item whose position is congruent to the worker id modulo the
/// number of workers
///
/// Outside of a worker context, or with a single worker, every item passes.
/// Positions count upstream items (errors included) from zero on each open.
#[derive(Debug, Clone)]
pub struct ShardingSplitter {
    name: String,
}

impl ShardingSplitter {
    /// Create a splitter
    pub fn new() -> Self {
        Self {
            name: "sharding_splitter".to_string(),
        }
    }
}

impl Default for ShardingSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> Stage<T> for ShardingSplitter {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::ShardingSplitter
    }

    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>> {
        let input = upstream.open_single(ctx)?;
        match ctx.worker() {
            Some(worker) if worker.num_workers > 1 => {
                trace!(
                    worker = worker.id,
                    num_workers = worker.num_workers,
                    "Sharding upstream items"
                );
                let (id, n) = (worker.id, worker.num_workers);
                Ok(Box::new(
                    input
                        .enumerate()
                        .filter(move |(position, _)| position % n == id)
                        .map(|(_, item)| item),
                ))
            }
            _ => Ok(input),
        }
    }
}

/// Inserts a [`ShardingSplitter`] above each matched stage
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardingWrapper;

impl<T: Item> StageWrapper<T> for ShardingWrapper {
    fn role(&self) -> Role {
        Role::ShardingSplitter
    }

    fn wrap(&self, _target: &dyn Stage<T>) -> Result<Arc<dyn Stage<T>>> {
        Ok(Arc::new(ShardingSplitter::new()))
    }
}
