//! Blocking one-shot futures for bridging push and pull execution.
//!
//! Upstream buckets are pushed from network threads while the downstream
//! consumer pulls rows; `SharedFuture` is the hand-off point. It is a
//! cloneable one-shot cell: the first `complete`/`fail` wins, waiters block
//! on a `Condvar`, and `on_done` callbacks run outside the internal lock.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{HarrierError, HarrierResult};

type Callback<T> = Box<dyn FnOnce(&HarrierResult<T>) + Send>;

enum FutureState<T> {
    Pending { callbacks: Vec<Callback<T>> },
    Done(HarrierResult<T>),
}

struct FutureInner<T> {
    state: Mutex<FutureState<T>>,
    cond: Condvar,
}

/// A one-shot future that can be completed exactly once and observed from
/// any number of clones.
pub struct SharedFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFuture").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Default for SharedFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> SharedFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState::Pending { callbacks: Vec::new() }),
                cond: Condvar::new(),
            }),
        }
    }

    /// A future that is already resolved with `value`.
    pub fn completed(value: T) -> Self {
        let f = Self::new();
        f.complete(value);
        f
    }

    /// A future that is already resolved with `err`.
    pub fn failed(err: HarrierError) -> Self {
        let f = Self::new();
        f.fail(err);
        f
    }

    /// Resolve successfully. Returns `false` if the future was already
    /// resolved (the first signal wins).
    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Resolve exceptionally. Returns `false` if already resolved.
    pub fn fail(&self, err: HarrierError) -> bool {
        self.finish(Err(err))
    }

    fn finish(&self, result: HarrierResult<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            match &mut *state {
                FutureState::Done(_) => return false,
                FutureState::Pending { callbacks } => {
                    let callbacks = std::mem::take(callbacks);
                    *state = FutureState::Done(result.clone());
                    callbacks
                }
            }
        };
        self.inner.cond.notify_all();
        for cb in callbacks {
            cb(&result);
        }
        true
    }

    /// Block until resolved.
    pub fn wait(&self) -> HarrierResult<T> {
        let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let FutureState::Done(result) = &*state {
                return result.clone();
            }
            state = self.inner.cond.wait(state).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Block for at most `timeout`. Returns `None` if still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<HarrierResult<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let FutureState::Done(result) = &*state {
                return Some(result.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            state = guard;
        }
    }

    /// Run `f` when the future resolves. If already resolved, `f` runs
    /// immediately on the calling thread; otherwise it runs on the thread
    /// that resolves the future, after the internal lock is released.
    pub fn on_done(&self, f: impl FnOnce(&HarrierResult<T>) + Send + 'static) {
        let result = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            match &mut *state {
                FutureState::Pending { callbacks } => {
                    callbacks.push(Box::new(f));
                    return;
                }
                FutureState::Done(result) => result.clone(),
            }
        };
        f(&result);
    }

    pub fn is_done(&self) -> bool {
        matches!(
            &*self.inner.state.lock().unwrap_or_else(|p| p.into_inner()),
            FutureState::Done(_)
        )
    }

    /// The resolved result, if any, without blocking.
    pub fn peek(&self) -> Option<HarrierResult<T>> {
        match &*self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) {
            FutureState::Done(result) => Some(result.clone()),
            FutureState::Pending { .. } => None,
        }
    }
}

/// Cooperative cancellation handle shared between a batch iterator and the
/// component that owns its lifecycle. The first kill wins; iterators check
/// the switch on every `move_next`.
#[derive(Clone, Default)]
pub struct KillSwitch {
    cause: Arc<Mutex<Option<HarrierError>>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the terminal cause. Returns `false` if already killed.
    pub fn kill(&self, cause: HarrierError) -> bool {
        let mut guard = self.cause.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            return false;
        }
        *guard = Some(cause);
        true
    }

    pub fn cause(&self) -> Option<HarrierError> {
        self.cause.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_killed(&self) -> bool {
        self.cause.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    /// `Err(cause)` once killed, `Ok(())` otherwise.
    pub fn check(&self) -> HarrierResult<()> {
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}
