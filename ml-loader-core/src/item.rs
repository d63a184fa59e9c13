//! Items flowing through a pipeline and their asynchronous completion handles

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// An item produced by a stage
///
/// Items are opaque to the engine. The only capability the engine asks for is
/// an optional completion handle: an item whose data is still being copied on
/// an alternate execution stream exposes the handle of that copy, and the
/// [`Awaiter`](crate::stage::Role::Awaiter) blocks on it before handing the
/// item to the consumer.
pub trait Item: Send + 'static {
    /// Handle of the in-flight operation this item depends on, if any
    fn completion(&self) -> Option<&CompletionHandle> {
        None
    }
}

macro_rules! impl_plain_item {
    ($($ty:ty),* $(,)?) => {
        $(impl Item for $ty {})*
    };
}

impl_plain_item!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, bool, String);

impl<T: Send + 'static> Item for Vec<T> {}

impl<T: Item> Item for Box<T> {
    fn completion(&self) -> Option<&CompletionHandle> {
        (**self).completion()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Complete,
    Failed(String),
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    settled: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: State) {
        let mut state = self.lock();
        if *state == State::Pending {
            *state = outcome;
            self.settled.notify_all();
        }
    }
}

/// Handle of an asynchronous operation that may still be running
///
/// Cloning the handle is cheap; every clone observes the same operation.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    shared: Arc<Shared>,
}

/// Producer side of a [`CompletionHandle`]
///
/// Dropping a completer without settling it fails the operation, so a handle
/// never stays pending after the code responsible for it is gone.
#[derive(Debug)]
pub struct Completer {
    shared: Arc<Shared>,
    settled: bool,
}

impl CompletionHandle {
    /// Create a pending handle together with the completer that settles it
    pub fn pending() -> (Completer, CompletionHandle) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending),
            settled: Condvar::new(),
        });
        let completer = Completer {
            shared: shared.clone(),
            settled: false,
        };
        (completer, CompletionHandle { shared })
    }

    /// Create a handle for an operation that already finished
    pub fn completed() -> Self {
        let (completer, handle) = Self::pending();
        completer.complete();
        handle
    }

    /// Whether the operation finished successfully
    pub fn is_complete(&self) -> bool {
        *self.shared.lock() == State::Complete
    }

    /// Whether the operation is still running
    pub fn is_pending(&self) -> bool {
        *self.shared.lock() == State::Pending
    }

    /// Block until the operation settles
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.lock();
        while *state == State::Pending {
            state = self
                .shared
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Self::outcome(&state)
    }

    /// Block until the operation settles or `timeout` elapses
    ///
    /// Returns `Ok(false)` if the operation is still pending at the deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while *state == State::Pending {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .shared
                .settled
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Self::outcome(&state).map(|()| true)
    }

    fn outcome(state: &State) -> Result<()> {
        match state {
            State::Complete => Ok(()),
            State::Failed(reason) => Err(Error::AsyncOperationFailure(reason.clone())),
            State::Pending => unreachable!("outcome requested for a pending operation"),
        }
    }
}

impl Completer {
    /// Mark the operation as finished
    pub fn complete(mut self) {
        self.settled = true;
        self.shared.settle(State::Complete);
    }

    /// Mark the operation as failed
    pub fn fail(mut self, reason: impl Into<String>) {
        self.settled = true;
        self.shared.settle(State::Failed(reason.into()));
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.settled {
            self.shared
                .settle(State::Failed("operation dropped before completion".into()));
        }
    }
}
