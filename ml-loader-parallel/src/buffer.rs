//! Bounded look-ahead buffer

use std::collections::VecDeque;
use std::sync::Arc;

use ml_loader_core::{
    Error, Item, ItemStream, OpenContext, Result, Role, Stage, StageWrapper, Upstream,
};
use tracing::trace;

/// Stage that keeps up to `capacity` upstream items pulled ahead of the
/// consumer
///
/// While the queue is not full every pull is buffered; once full, each new
/// upstream item pushes out the oldest buffered one. At exhaustion the queue
/// drains in FIFO order. Items are never reordered.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    name: String,
    capacity: usize,
}

impl BoundedBuffer {
    /// Create a buffer holding at most `capacity` items
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "buffer capacity must be a positive integer".into(),
            ));
        }
        Ok(Self {
            name: "bounded_buffer".to_string(),
            capacity,
        })
    }

    /// Maximum number of buffered items
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Item> Stage<T> for BoundedBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::Buffer
    }

    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>> {
        let input = upstream.open_single(ctx)?;
        Ok(Box::new(BufferStream::new(input, self.capacity)))
    }
}

/// Iteration state of one pass through a [`BoundedBuffer`]
pub struct BufferStream<T> {
    input: Option<ItemStream<T>>,
    queue: VecDeque<T>,
    capacity: usize,
    pending_error: Option<Error>,
}

impl<T: Item> BufferStream<T> {
    /// Buffer `input` with the given capacity
    pub fn new(input: ItemStream<T>, capacity: usize) -> Self {
        Self {
            input: Some(input),
            queue: VecDeque::with_capacity(capacity),
            capacity,
            pending_error: None,
        }
    }

    /// Number of items currently held
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }
}

impl<T: Item> Iterator for BufferStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        // an upstream error waits until the items pulled before it are out
        if self.pending_error.is_some() {
            if let Some(item) = self.queue.pop_front() {
                return Some(Ok(item));
            }
            return self.pending_error.take().map(Err);
        }

        while let Some(input) = self.input.as_mut() {
            match input.next() {
                Some(Ok(item)) if self.queue.len() < self.capacity => {
                    self.queue.push_back(item);
                }
                Some(Ok(item)) => {
                    let out = self.queue.pop_front();
                    self.queue.push_back(item);
                    trace!(buffered = self.queue.len(), "Buffer rotated");
                    return out.map(Ok);
                }
                Some(Err(e)) => {
                    if let Some(item) = self.queue.pop_front() {
                        self.pending_error = Some(e);
                        return Some(Ok(item));
                    }
                    return Some(Err(e));
                }
                None => {
                    self.input = None;
                }
            }
        }

        self.queue.pop_front().map(Ok)
    }
}

/// Inserts a [`BoundedBuffer`] above each matched stage
#[derive(Debug, Clone, Copy)]
pub struct BufferWrapper {
    capacity: usize,
}

impl BufferWrapper {
    /// Create a wrapper inserting buffers of `capacity`
    pub fn new(capacity: usize) -> Result<Self> {
        BoundedBuffer::new(capacity)?;
        Ok(Self { capacity })
    }
}

impl<T: Item> StageWrapper<T> for BufferWrapper {
    fn role(&self) -> Role {
        Role::Buffer
    }

    fn wrap(&self, _target: &dyn Stage<T>) -> Result<Arc<dyn Stage<T>>> {
        Ok(Arc::new(BoundedBuffer::new(self.capacity)?))
    }
}
