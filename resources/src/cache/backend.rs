use super::{CacheShared, Deletion, FinalizeRequest, LoadRequest};
use crate::config::Dispatch;
use crate::handle::Handle;
use crate::mailbox::MailboxReceiver;
use crate::resource::ResourceId;
use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;

/// Designated thread half of a resource cache
///
/// The back-end is bound to the first thread that runs it (or to the one
/// [`Self::bind_to_current_thread`] is called on) and asserts it stays there. Every finalizer and
/// every destroyer of the cache runs inside [`Self::run`] or [`Self::shutdown`].
///
/// Dropping the back-end shuts the cache down.
pub struct ResourceCacheBackend<T: Send + Sync + 'static, P: Send + 'static> {
    shared: Arc<CacheShared<T, P>>,
    load_requests: MailboxReceiver<LoadRequest<T, P>>,
    finalize_requests: MailboxReceiver<FinalizeRequest<T>>,
    assume_ownership: MailboxReceiver<ResourceId>,
    deletions: MailboxReceiver<Deletion<T>>,
    /// Resources alive and owned by this cache, counted per id since a released id may be reused
    /// before its deletion arrives
    owned: HashMap<ResourceId, usize>,
    thread: Option<ThreadId>,
    shut_down: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send + Sync + 'static, P: Send + 'static> ResourceCacheBackend<T, P> {
    pub(super) fn new(
        shared: Arc<CacheShared<T, P>>,
        load_requests: MailboxReceiver<LoadRequest<T, P>>,
        finalize_requests: MailboxReceiver<FinalizeRequest<T>>,
        assume_ownership: MailboxReceiver<ResourceId>,
        deletions: MailboxReceiver<Deletion<T>>,
    ) -> Self {
        Self {
            shared,
            load_requests,
            finalize_requests,
            assume_ownership,
            deletions,
            owned: HashMap::new(),
            thread: None,
            shut_down: false,
            _not_sync: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Pin the back-end to the calling thread
    pub fn bind_to_current_thread(&mut self) {
        self.thread = Some(std::thread::current().id());
    }

    fn claim_thread(&mut self) {
        let current = std::thread::current().id();
        match self.thread {
            Some(thread) => assert_eq!(
                thread, current,
                "Resource cache back-end `{}` used off its designated thread",
                self.shared.config.name
            ),
            None => self.thread = Some(current),
        }
    }

    /// One pass with the configured dispatch
    pub fn run(&mut self) {
        self.run_with(self.shared.config.dispatch);
    }

    /// One pass: dispatch pending loads, finalize whatever finished loading, then destroy
    /// whatever was released
    ///
    /// # Panics
    /// Panics when called off the designated thread.
    pub fn run_with(&mut self, dispatch: Dispatch) {
        self.claim_thread();
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("Resource cache pass"), 0));
        self.pass(dispatch, self.shared.config.blocking_collect);
    }

    fn pass(&mut self, dispatch: Dispatch, blocking: bool) {
        self.dispatch_loads(dispatch, blocking);
        self.finalize_pending(blocking);
        self.reclaim(blocking);
    }

    fn dispatch_loads(&mut self, dispatch: Dispatch, blocking: bool) {
        self.load_requests.collect_with(blocking);
        while let Some(request) = self.load_requests.pop() {
            tracing::trace!(cache = %self.shared.config.name, path = ?request.path, id = %request.id, "Dispatching load");
            let guard = self.shared.tracker.begin();
            let shared = self.shared.clone();
            let task = move || {
                let _guard = guard;
                shared.execute_load(request);
            };
            match dispatch {
                Dispatch::Deferred => self.shared.runner.spawn(Box::new(task)),
                Dispatch::Immediate => task(),
            }
        }
    }

    fn finalize_pending(&mut self, blocking: bool) {
        self.finalize_requests.collect_with(blocking);
        while let Some(request) = self.finalize_requests.pop() {
            let FinalizeRequest {
                id,
                path,
                mut value,
                promise,
                finalizer,
            } = request;
            finalizer(&mut value);
            let handle = Handle::with_owner(id, path.clone(), value, self.shared.owner());
            self.own(id);
            self.shared.publish(id, path, &handle);
            tracing::trace!(cache = %self.shared.config.name, id = %id, "Finalized resource");
            promise.set(Ok(handle));
        }
    }

    fn reclaim(&mut self, blocking: bool) {
        self.deletions.collect_with(blocking);
        // ownership of a resource is always announced before it can be released, so collecting
        // it after the deletions covers every deletion collected
        self.assume_ownership.collect();
        while let Some(id) = self.assume_ownership.pop() {
            self.own(id);
        }
        while let Some(Deletion { id, value, .. }) = self.deletions.pop() {
            if !self.disown(id) {
                tracing::warn!(cache = %self.shared.config.name, id = %id, "Destroying a resource the cache did not own");
            }
            self.shared.reclaimer.destroy(id, value);
        }
    }

    fn own(&mut self, id: ResourceId) {
        *self.owned.entry(id).or_default() += 1;
    }

    fn disown(&mut self, id: ResourceId) -> bool {
        match self.owned.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.owned.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Stop the cache
    ///
    /// Empties the front-end, waits for outstanding loader tasks, runs one final pass with
    /// [`Dispatch::Immediate`] so every queued load resolves, and destroys everything already
    /// released. Resources still referenced afterwards are destroyed on whichever thread drops
    /// their last handle. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        self.claim_thread();
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        tracing::debug!(cache = %self.shared.config.name, "Shutting down resource cache");
        self.shared.close_front();

        let tracker = &self.shared.tracker;
        match self.shared.config.shutdown_timeout {
            Some(timeout) => {
                if !tracker.wait_idle_timeout(timeout) {
                    tracing::warn!(
                        cache = %self.shared.config.name,
                        outstanding = tracker.outstanding(),
                        "Timed out waiting for loader tasks"
                    );
                }
            }
            None => tracker.wait_idle(),
        }

        self.pass(Dispatch::Immediate, true);
        self.deletions.close();
        self.reclaim(true);
        if !self.owned.is_empty() {
            tracing::debug!(
                cache = %self.shared.config.name,
                remaining = self.owned_len(),
                "Resources outlive their cache"
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Resources created by this cache which are still alive, as far as the back-end knows
    pub fn owned_len(&self) -> usize {
        self.owned.values().sum()
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.shared.tracker.outstanding()
    }

    /// Whether the next pass has anything to do
    pub fn has_pending_work(&self) -> bool {
        self.load_requests.has_messages()
            || self.finalize_requests.has_messages()
            || self.assume_ownership.has_messages()
            || self.deletions.has_messages()
            || !self.load_requests.is_empty()
            || !self.finalize_requests.is_empty()
    }
}

impl<T: Send + Sync + 'static, P: Send + 'static> Drop for ResourceCacheBackend<T, P> {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        if self
            .thread
            .is_some_and(|thread| thread != std::thread::current().id())
        {
            tracing::warn!(cache = %self.shared.config.name, "Resource cache back-end dropped off its designated thread");
        }
        self.shutdown_inner();
    }
}
