//! Second, backend only representation of finished resources
//!
//! Some resources need a companion object built from them, kept in its own pool and torn down on
//! the designated thread independently of the front resource. Callers already hold a deduplicated
//! [`Handle`], so there is no path lookup here: a request names a handle, the constructor runs on
//! a worker, the finalizer runs on the designated thread, and the result is stored under the
//! handle's id.
use crate::channel::{promise, Promise, SharedFuture};
use crate::config::{Dispatch, TypedBackendConfig};
use crate::error::ResourceError;
use crate::handle::Handle;
use crate::mailbox::{mailbox, MailboxClosed, MailboxReceiver, MailboxSender};
use crate::resource::ResourceId;
use crate::task::{catch_panic, InlineRunner, TaskRunner, TaskTracker};
use derivative::Derivative;
use ember_containers::prelude::{IndexPool, Pool};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;

/// Builds the backend representation from a finished front resource, runs on a worker
pub type Constructor<F, B> = Arc<dyn Fn(&F) -> anyhow::Result<B> + Send + Sync>;
/// Resolves to the id the backend resource is stored under
pub type BackendResult = Result<ResourceId, ResourceError>;

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct ConstructRequest<F> {
    #[derivative(Debug = "ignore")]
    handle: Handle<F>,
    #[derivative(Debug = "ignore")]
    promise: Promise<BackendResult>,
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct Constructed<B> {
    id: ResourceId,
    #[derivative(Debug = "ignore")]
    result: anyhow::Result<B>,
}

/// Any thread half of a [`TypedResourceBackend`]
pub struct TypedBackendQueue<F, B> {
    requests: MailboxSender<ConstructRequest<F>>,
    deletions: MailboxSender<ResourceId>,
    _marker: PhantomData<fn() -> B>,
}

impl<F, B> Clone for TypedBackendQueue<F, B> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            deletions: self.deletions.clone(),
            _marker: PhantomData,
        }
    }
}

impl<F, B> TypedBackendQueue<F, B> {
    /// Request the backend representation of `handle`
    ///
    /// Resolves on a later [`TypedResourceBackend::run`]. Once the backend has shut down the
    /// future resolves right away with [`ResourceError::ShutDown`].
    pub fn request(&self, handle: Handle<F>) -> SharedFuture<BackendResult> {
        let (promise, future) = promise();
        if let Err(MailboxClosed(request)) = self.requests.enqueue(ConstructRequest { handle, promise }) {
            request.promise.set(Err(ResourceError::ShutDown));
        }
        future
    }

    /// Tear the backend representation of `id` down on the next run, or skip it if its
    /// construction is still running
    pub fn remove(&self, id: ResourceId) {
        if self.deletions.enqueue(id).is_err() {
            tracing::trace!(id = %id, "Removal after shutdown ignored");
        }
    }
}

/// Designated thread half, owns the pool of backend resources
pub struct TypedResourceBackend<F, B, S = IndexPool<ResourceId, B>>
where
    F: Send + Sync + 'static,
    B: Send + 'static,
    S: Pool<ResourceId, B>,
{
    config: TypedBackendConfig,
    constructor: Constructor<F, B>,
    finalizer: Option<Arc<dyn Fn(&mut B) + Send + Sync>>,
    destroyer: Option<Arc<dyn Fn(&mut B) + Send + Sync>>,
    runner: Arc<dyn TaskRunner>,
    tracker: TaskTracker,
    requests: MailboxReceiver<ConstructRequest<F>>,
    deletions: MailboxReceiver<ResourceId>,
    constructed: MailboxReceiver<Constructed<B>>,
    pool: S,
    /// Constructions running on workers, with everyone waiting on them
    in_flight: HashMap<ResourceId, Vec<Promise<BackendResult>>>,
    /// In flight constructions removed before they finished
    doomed: HashSet<ResourceId>,
    thread: Option<ThreadId>,
    shut_down: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl<F, B, S> TypedResourceBackend<F, B, S>
where
    F: Send + Sync + 'static,
    B: Send + 'static,
    S: Pool<ResourceId, B>,
{
    pub fn builder<C>(config: TypedBackendConfig, constructor: C) -> TypedBackendBuilder<F, B, S>
    where
        C: Fn(&F) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        TypedBackendBuilder {
            config,
            constructor: Arc::new(constructor),
            finalizer: None,
            destroyer: None,
            runner: None,
            _pool: PhantomData,
        }
    }

    pub fn bind_to_current_thread(&mut self) {
        self.thread = Some(std::thread::current().id());
    }

    fn claim_thread(&mut self) {
        let current = std::thread::current().id();
        match self.thread {
            Some(thread) => assert_eq!(
                thread, current,
                "Typed backend `{}` used off its designated thread",
                self.config.name
            ),
            None => self.thread = Some(current),
        }
    }

    pub fn run(&mut self) {
        self.run_with(self.config.dispatch);
    }

    /// One pass: removals first, so nothing removed gets finalized afterwards, then new
    /// construct requests, then finished constructions
    ///
    /// A removal wins over a request for the same id arriving before the same pass.
    pub fn run_with(&mut self, dispatch: Dispatch) {
        self.claim_thread();
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("Typed backend pass"), 0));
        self.pass(dispatch);
    }

    fn pass(&mut self, dispatch: Dispatch) {
        // requests first, any removal collected after them may refer to them
        self.requests.collect();
        let removed = self.process_deletions();
        self.dispatch_requests(dispatch, &removed);
        self.finish_constructed();
    }

    /// Returns every id removed in this pass
    fn process_deletions(&mut self) -> HashSet<ResourceId> {
        self.deletions.collect();
        let mut removed = HashSet::new();
        while let Some(id) = self.deletions.pop() {
            removed.insert(id);
            if let Some(value) = self.pool.remove(&id) {
                self.destroy(id, value);
            } else if self.in_flight.contains_key(&id) {
                self.doomed.insert(id);
            } else {
                tracing::trace!(backend = %self.config.name, id = %id, "Removal of backend resource which is not built");
            }
        }
        removed
    }

    fn dispatch_requests(&mut self, dispatch: Dispatch, removed: &HashSet<ResourceId>) {
        while let Some(ConstructRequest { handle, promise }) = self.requests.pop() {
            let id = handle.id();
            if removed.contains(&id) {
                tracing::trace!(backend = %self.config.name, id = %id, "Dropping request removed in the same pass");
                promise.set(Err(ResourceError::Removed(id)));
                continue;
            }
            if self.pool.contains(&id) {
                promise.set(Ok(id));
                continue;
            }
            if let Some(waiting) = self.in_flight.get_mut(&id) {
                // asked for again, it is wanted after all
                self.doomed.remove(&id);
                waiting.push(promise);
                continue;
            }
            self.in_flight.insert(id, vec![promise]);

            let guard = self.tracker.begin();
            let constructor = self.constructor.clone();
            let constructed = self.constructed.sender();
            let task = move || {
                let _guard = guard;
                let result = catch_panic(|| constructor(handle.as_ref()));
                drop(handle);
                if constructed.enqueue(Constructed { id, result }).is_err() {
                    tracing::error!(id = %id, "Constructed mailbox is closed");
                }
            };
            tracing::trace!(backend = %self.config.name, id = %id, "Dispatching construction");
            match dispatch {
                Dispatch::Deferred => self.runner.spawn(Box::new(task)),
                Dispatch::Immediate => task(),
            }
        }
    }

    fn finish_constructed(&mut self) {
        self.constructed.collect();
        while let Some(Constructed { id, result }) = self.constructed.pop() {
            let waiting = self.in_flight.remove(&id).unwrap_or_default();
            let outcome = match result {
                Ok(value) if self.doomed.remove(&id) => {
                    self.destroy(id, value);
                    Err(ResourceError::Removed(id))
                }
                Ok(mut value) => {
                    if let Some(finalizer) = self.finalizer.as_ref() {
                        finalizer(&mut value);
                    }
                    match self.pool.insert(id, value) {
                        Ok(()) => {
                            tracing::trace!(backend = %self.config.name, id = %id, "Backend resource ready");
                            Ok(id)
                        }
                        Err(e) => {
                            tracing::error!(backend = %self.config.name, id = %id, "Failed to store backend resource: {e}");
                            Err(ResourceError::ConstructFailed(id, Arc::new(e.into())))
                        }
                    }
                }
                Err(error) => {
                    self.doomed.remove(&id);
                    tracing::error!(backend = %self.config.name, id = %id, "Failed to construct backend resource: {error:#}");
                    Err(ResourceError::ConstructFailed(id, Arc::new(error)))
                }
            };
            for promise in waiting {
                promise.set(outcome.clone());
            }
        }
    }

    fn destroy(&self, id: ResourceId, mut value: B) {
        if let Some(destroyer) = self.destroyer.as_ref() {
            destroyer(&mut value);
        }
        tracing::trace!(backend = %self.config.name, id = %id, "Destroyed backend resource");
    }

    /// Refuse new requests, finish everything already requested and destroy every resident
    /// backend resource
    pub fn shutdown(&mut self) {
        self.claim_thread();
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        tracing::debug!(backend = %self.config.name, "Shutting down typed backend");
        self.requests.close();
        self.deletions.close();
        match self.config.shutdown_timeout {
            Some(timeout) => {
                if !self.tracker.wait_idle_timeout(timeout) {
                    tracing::warn!(
                        backend = %self.config.name,
                        outstanding = self.tracker.outstanding(),
                        "Timed out waiting for constructor tasks"
                    );
                }
            }
            None => self.tracker.wait_idle(),
        }
        self.pass(Dispatch::Immediate);
        for (id, value) in self.pool.drain_all() {
            self.destroy(id, value);
        }
    }

    pub fn get(&self, id: ResourceId) -> Option<&B> {
        self.pool.get(&id)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut B> {
        self.pool.get_mut(&id)
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.pool.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Underlying storage, for pool specific accessors such as stable slots
    pub fn pool(&self) -> &S {
        &self.pool
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.tracker.outstanding()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl<F, B, S> Drop for TypedResourceBackend<F, B, S>
where
    F: Send + Sync + 'static,
    B: Send + 'static,
    S: Pool<ResourceId, B>,
{
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Assembles a [`TypedResourceBackend`] and its [`TypedBackendQueue`]
pub struct TypedBackendBuilder<F, B, S> {
    config: TypedBackendConfig,
    constructor: Constructor<F, B>,
    finalizer: Option<Arc<dyn Fn(&mut B) + Send + Sync>>,
    destroyer: Option<Arc<dyn Fn(&mut B) + Send + Sync>>,
    runner: Option<Arc<dyn TaskRunner>>,
    _pool: PhantomData<fn() -> S>,
}

impl<F, B, S> TypedBackendBuilder<F, B, S>
where
    F: Send + Sync + 'static,
    B: Send + 'static,
    S: Pool<ResourceId, B>,
{
    pub fn finalizer(mut self, finalizer: impl Fn(&mut B) + Send + Sync + 'static) -> Self {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn destroyer(mut self, destroyer: impl Fn(&mut B) + Send + Sync + 'static) -> Self {
        self.destroyer = Some(Arc::new(destroyer));
        self
    }

    pub fn runner<R: TaskRunner + 'static>(mut self, runner: R) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    pub fn build(self) -> (TypedBackendQueue<F, B>, TypedResourceBackend<F, B, S>) {
        let (requests, request_receiver) = mailbox();
        let (deletions, deletion_receiver) = mailbox();
        let (_, constructed) = mailbox();
        let queue = TypedBackendQueue {
            requests,
            deletions,
            _marker: PhantomData,
        };
        let backend = TypedResourceBackend {
            config: self.config,
            constructor: self.constructor,
            finalizer: self.finalizer,
            destroyer: self.destroyer,
            runner: self.runner.unwrap_or_else(|| Arc::new(InlineRunner)),
            tracker: TaskTracker::new(),
            requests: request_receiver,
            deletions: deletion_receiver,
            constructed,
            pool: S::new(),
            in_flight: HashMap::new(),
            doomed: HashSet::new(),
            thread: None,
            shut_down: false,
            _not_sync: PhantomData,
        };
        (queue, backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, WorkerPool};
    use ember_containers::prelude::StableIndexPool;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Holds tasks until the test releases them
    #[derive(Default, Clone)]
    struct ManualRunner {
        tasks: Arc<Mutex<Vec<Task>>>,
    }

    impl ManualRunner {
        fn run_all(&self) {
            let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
            for task in tasks {
                task();
            }
        }
    }

    impl TaskRunner for ManualRunner {
        fn spawn(&self, task: Task) {
            self.tasks.lock().unwrap().push(task);
        }
    }

    fn doubled(value: &u32) -> anyhow::Result<u64> {
        Ok(*value as u64 * 2)
    }

    #[test]
    fn test_request_constructs_and_finalizes() {
        let (queue, mut backend) =
            TypedResourceBackend::<u32, u64>::builder(TypedBackendConfig::new("gpu"), doubled)
                .finalizer(|value: &mut u64| *value += 1)
                .build();
        let front = Handle::new(ResourceId(4), 10u32);
        let future = queue.request(front.clone());
        assert!(!future.is_ready());
        backend.run();
        assert_eq!(future.get().clone().unwrap(), ResourceId(4));
        assert_eq!(backend.get(ResourceId(4)), Some(&21));
        assert_eq!(backend.len(), 1);
        // the backend does not keep the front resource alive
        assert_eq!(front.ref_count(), 1);
    }

    #[test]
    fn test_duplicate_requests_construct_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let runner = ManualRunner::default();
        let (queue, mut backend) = TypedResourceBackend::<u32, u64>::builder(
            TypedBackendConfig::new("dedup"),
            move |value: &u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                doubled(value)
            },
        )
        .runner(runner.clone())
        .build();

        let front = Handle::new(ResourceId(1), 3u32);
        let a = queue.request(front.clone());
        backend.run();
        let b = queue.request(front.clone());
        backend.run();
        runner.run_all();
        backend.run();
        let c = queue.request(front);
        backend.run();

        for future in [a, b, c] {
            assert_eq!(future.get().clone().unwrap(), ResourceId(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_while_constructing_is_never_finalized() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let (f, d) = (finalized.clone(), destroyed.clone());
        let runner = ManualRunner::default();
        let (queue, mut backend) =
            TypedResourceBackend::<u32, u64>::builder(TypedBackendConfig::new("doomed"), doubled)
                .finalizer(move |_: &mut u64| {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .destroyer(move |_: &mut u64| {
                    d.fetch_add(1, Ordering::SeqCst);
                })
                .runner(runner.clone())
                .build();

        let future = queue.request(Handle::new(ResourceId(9), 1u32));
        backend.run();
        assert_eq!(backend.in_flight_len(), 1);
        queue.remove(ResourceId(9));
        runner.run_all();
        backend.run();

        assert!(matches!(future.get(), Err(ResourceError::Removed(ResourceId(9)))));
        assert!(!backend.contains(ResourceId(9)));
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_before_first_run_is_never_built() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let f = finalized.clone();
        let (queue, mut backend) =
            TypedResourceBackend::<u32, u64>::builder(TypedBackendConfig::new("early"), doubled)
                .finalizer(move |_: &mut u64| {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .build();

        let future = queue.request(Handle::new(ResourceId(1), 7u32));
        queue.remove(ResourceId(1));
        backend.run();

        assert!(matches!(future.get(), Err(ResourceError::Removed(ResourceId(1)))));
        assert!(!backend.contains(ResourceId(1)));
        assert_eq!(backend.in_flight_len(), 0);
        assert_eq!(finalized.load(Ordering::SeqCst), 0);

        // a later request builds it again
        let again = queue.request(Handle::new(ResourceId(1), 7u32));
        backend.run();
        assert_eq!(again.get().clone().unwrap(), ResourceId(1));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_destroys_resident() {
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let log = destroyed.clone();
        let (queue, mut backend) =
            TypedResourceBackend::<u32, u64>::builder(TypedBackendConfig::default(), doubled)
                .destroyer(move |value: &mut u64| log.lock().unwrap().push(*value))
                .build();
        let future = queue.request(Handle::new(ResourceId(2), 5u32));
        backend.run();
        assert!(future.get().is_ok());
        queue.remove(ResourceId(2));
        backend.run();
        assert!(backend.is_empty());
        assert_eq!(*destroyed.lock().unwrap(), vec![10]);
    }

    #[test]
    fn test_constructor_failure() {
        let (queue, mut backend) = TypedResourceBackend::<u32, u64>::builder(
            TypedBackendConfig::default(),
            |_: &u32| anyhow::bail!("no device"),
        )
        .build();
        let future = queue.request(Handle::new(ResourceId(3), 0u32));
        backend.run();
        assert!(matches!(
            future.get(),
            Err(ResourceError::ConstructFailed(ResourceId(3), _))
        ));
        assert_eq!(backend.in_flight_len(), 0);
    }

    #[test]
    fn test_panicking_constructor_can_be_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let (queue, mut backend) = TypedResourceBackend::<u32, u64>::builder(
            TypedBackendConfig::default(),
            move |value: &u32| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("driver lost");
                }
                doubled(value)
            },
        )
        .runner(WorkerPool::new("construct", 1).unwrap())
        .build();

        let front = Handle::new(ResourceId(6), 4u32);
        let failed = queue.request(front.clone());
        while failed.get_timeout(Duration::from_millis(5)).is_none() {
            backend.run();
        }
        assert!(matches!(
            failed.get(),
            Err(ResourceError::ConstructFailed(ResourceId(6), _))
        ));
        assert_eq!(backend.in_flight_len(), 0);

        let retried = queue.request(front);
        while retried.get_timeout(Duration::from_millis(5)).is_none() {
            backend.run();
        }
        assert_eq!(retried.get().clone().unwrap(), ResourceId(6));
        assert_eq!(backend.get(ResourceId(6)), Some(&8));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stable_pool_keeps_addresses() {
        let (queue, mut backend) = TypedResourceBackend::<
            u32,
            u64,
            StableIndexPool<ResourceId, u64>,
        >::builder(TypedBackendConfig::default(), doubled)
        .build();
        queue.request(Handle::new(ResourceId(1), 1u32));
        backend.run();
        let address = backend.get(ResourceId(1)).unwrap() as *const u64;
        let slot = backend.pool().slot_of(&ResourceId(1)).unwrap();
        for id in 2..200u64 {
            queue.request(Handle::new(ResourceId(id), id as u32));
        }
        backend.run();
        assert_eq!(backend.len(), 199);
        assert_eq!(backend.get(ResourceId(1)).unwrap() as *const u64, address);
        assert_eq!(backend.pool().get_by_slot(&slot).unwrap(), &2);
    }

    #[test]
    fn test_shutdown_destroys_everything() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        let (queue, mut backend) =
            TypedResourceBackend::<u32, u64>::builder(TypedBackendConfig::default(), doubled)
                .destroyer(move |_: &mut u64| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build();
        queue.request(Handle::new(ResourceId(1), 1u32));
        backend.run();
        let pending = queue.request(Handle::new(ResourceId(2), 2u32));
        backend.shutdown();

        assert_eq!(pending.get().clone().unwrap(), ResourceId(2));
        assert!(backend.is_empty());
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert!(matches!(
            queue.request(Handle::new(ResourceId(5), 5u32)).get(),
            Err(ResourceError::ShutDown)
        ));
    }
}
