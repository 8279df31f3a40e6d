//! Single assignment channel
//!
//! A [`Promise`] is the write end and is consumed by [`Promise::set`], so a value can only ever be
//! written once. Any number of [`SharedFuture`]s may read the value, either by blocking in
//! [`SharedFuture::get`] or by awaiting the future from async code.
use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct ChannelState<T> {
    value: OnceLock<T>,
    /// Async waiters, also the lock the condvar below waits on
    wakers: Mutex<Vec<Waker>>,
    signal: Condvar,
}

impl<T> ChannelState<T> {
    fn new() -> Self {
        Self {
            value: OnceLock::new(),
            wakers: Mutex::new(Vec::new()),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Waker>> {
        // a poisoned waiter list is still a valid waiter list
        self.wakers.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Create a connected promise and future
pub fn promise<T>() -> (Promise<T>, SharedFuture<T>) {
    let promise = Promise::new();
    let future = promise.future();
    (promise, future)
}

/// Write end of a single assignment channel
pub struct Promise<T> {
    state: Option<Arc<ChannelState<T>>>,
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for Promise<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("fulfilled", &self.state.is_none())
            .finish()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Some(Arc::new(ChannelState::new())),
        }
    }

    /// Mint another reader of this promise
    pub fn future(&self) -> SharedFuture<T> {
        SharedFuture {
            state: self.state.clone(),
        }
    }

    /// Store the value and wake every reader
    pub fn set(mut self, value: T) {
        let state = match self.state.take() {
            Some(state) => state,
            None => unreachable!("Promise is only emptied by set"),
        };
        if state.value.set(value).is_err() {
            panic!("Promise was fulfilled twice");
        }
        let wakers = std::mem::take(&mut *state.lock());
        state.signal.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.as_ref() {
            if Arc::strong_count(state) > 1 {
                tracing::debug!("Promise dropped without a value, readers will never resolve");
            }
        }
    }
}

/// Read end of a single assignment channel
///
/// A default constructed future has no backing state, test [`SharedFuture::is_valid`] before
/// waiting on one.
pub struct SharedFuture<T> {
    state: Option<Arc<ChannelState<T>>>,
}

impl<T> Default for SharedFuture<T> {
    fn default() -> Self {
        Self { state: None }
    }
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Debug> Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.state.as_ref() {
            None => f.write_str("SharedFuture(<empty>)"),
            Some(state) => match state.value.get() {
                Some(value) => f.debug_tuple("SharedFuture").field(value).finish(),
                None => f.write_str("SharedFuture(<pending>)"),
            },
        }
    }
}

impl<T> SharedFuture<T> {
    /// An already resolved future
    pub fn ready(value: T) -> Self {
        let (promise, future) = promise();
        promise.set(value);
        future
    }

    /// Whether the future has backing state
    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.try_get().is_some()
    }

    /// Non blocking read
    pub fn try_get(&self) -> Option<&T> {
        self.state.as_ref().and_then(|state| state.value.get())
    }

    fn state(&self) -> &ChannelState<T> {
        match self.state.as_ref() {
            Some(state) => state,
            None => panic!("Waited on an empty SharedFuture"),
        }
    }

    /// Block the calling thread until the value is written
    ///
    /// # Panics
    /// Panics if the future is empty.
    pub fn get(&self) -> &T {
        let state = self.state();
        if let Some(value) = state.value.get() {
            return value;
        }
        let mut guard = state.lock();
        loop {
            if let Some(value) = state.value.get() {
                return value;
            }
            guard = state
                .signal
                .wait(guard)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Like [`Self::get`] but gives up after `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> Option<&T> {
        let state = self.state();
        let deadline = Instant::now() + timeout;
        let mut guard = state.lock();
        loop {
            if let Some(value) = state.value.get() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = state
                .signal
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poison| poison.into_inner())
                .0;
        }
    }

    /// Whether both futures read the same promise
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        match (a.state.as_ref(), b.state.as_ref()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T: Clone> std::future::Future for SharedFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = self.state();
        if let Some(value) = state.value.get() {
            return Poll::Ready(value.clone());
        }
        let mut wakers = state.lock();
        // checked again under the lock, set() takes the lock after writing
        if let Some(value) = state.value.get() {
            return Poll::Ready(value.clone());
        }
        if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
