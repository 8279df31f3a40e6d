//! Asynchronous, deduplicating resource cache
//!
//! A cache is split in two halves. [`ResourceCache`] is the front-end: cheap to clone, usable from
//! any thread, it answers lookups and turns load requests into [`ResourceFuture`]s. Its
//! [`ResourceCacheBackend`] lives on one designated thread and is pumped with
//! [`ResourceCacheBackend::run`]: it hands loader work to the [`TaskRunner`], runs finalizers and
//! destroyers, and is the only place resources are finalized or destroyed.
//!
//! The halves only talk through mailboxes. Every [`Handle`] handed out routes its value back to
//! the back-end once the last reference drops.
mod backend;
mod messages;

pub use backend::ResourceCacheBackend;
pub(crate) use messages::{CacheEvent, Deletion, FinalizeRequest, LoadRequest};

use crate::channel::{promise, SharedFuture};
use crate::config::CacheConfig;
use crate::error::ResourceError;
use crate::handle::{Handle, WeakHandle};
use crate::mailbox::{mailbox, MailboxClosed, MailboxReceiver, MailboxSender};
use crate::resource::{ResourceId, ResourceOwner};
use crate::task::{catch_panic, InlineRunner, TaskRunner, TaskTracker};
use ember_containers::prelude::IndexPool;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Produces a resource from a path, runs on a worker
pub type Loader<T, P> = Arc<dyn Fn(&Path, &P) -> anyhow::Result<T> + Send + Sync>;
/// Completes a resource on the designated thread before anyone can see it
pub type Finalizer<T> = Arc<dyn Fn(&mut T) + Send + Sync>;
/// Tears a resource down on the designated thread once its last handle is gone
pub type Destroyer<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

pub type LoadResult<T> = Result<Handle<T>, ResourceError>;
/// What [`ResourceCache::load`] and [`ResourceCache::add`] hand out
pub type ResourceFuture<T> = SharedFuture<LoadResult<T>>;

/// What the front-end currently knows about a path
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntryState {
    Unseen,
    Loading,
    Loaded,
}

/// Receives values of dead resources and routes them to the back-end
///
/// Once the back-end has shut down its deletion mailbox is closed, values are then destroyed on
/// whichever thread dropped the last handle.
struct Reclaimer<T> {
    cache: String,
    destroyer: Option<Destroyer<T>>,
    front: MailboxSender<ResourceId>,
    back: MailboxSender<Deletion<T>>,
}

impl<T> Reclaimer<T> {
    fn destroy(&self, id: ResourceId, mut value: T) {
        if let Some(destroyer) = self.destroyer.as_ref() {
            destroyer(&mut value);
        }
        tracing::trace!(cache = %self.cache, id = %id, "Destroyed resource");
    }
}

impl<T: Send> ResourceOwner<T> for Reclaimer<T> {
    fn on_destroyed(&self, id: ResourceId, path: Option<PathBuf>, value: T) {
        // closed once the cache is shut down, nothing left to forget then
        let _ = self.front.enqueue(id);
        if let Err(MailboxClosed(deletion)) = self.back.enqueue(Deletion { id, path, value }) {
            self.destroy(deletion.id, deletion.value);
        }
    }
}

struct LookupEntry<T> {
    path: Option<PathBuf>,
    resource: WeakHandle<T>,
}

/// Lookup maps, only touched behind the front-end lock
struct FrontState<T> {
    by_path: HashMap<PathBuf, ResourceId>,
    by_id: IndexPool<ResourceId, LookupEntry<T>>,
    in_flight: HashMap<PathBuf, ResourceFuture<T>>,
    /// Ids of scheduled loads and finalizing adds which have not completed yet
    pending_ids: HashSet<ResourceId>,
    events: MailboxReceiver<CacheEvent<T>>,
    deletions: MailboxReceiver<ResourceId>,
    closed: bool,
}

impl<T> FrontState<T> {
    /// Fold everything the back-end and dropped handles reported since the last call
    fn sync(&mut self) {
        if self.closed {
            return;
        }
        // a completion is always enqueued before the deletion of the same resource, collecting
        // deletions first guarantees the matching completion is seen in the same pass
        self.deletions.collect();
        self.events.collect();
        while let Some(event) = self.events.pop() {
            match event {
                CacheEvent::Completed { id, path, resource } => self.register(id, path, resource),
                CacheEvent::Failed { id, path } => {
                    self.pending_ids.remove(&id);
                    self.in_flight.remove(&path);
                }
            }
        }
        while let Some(id) = self.deletions.pop() {
            self.forget(id);
        }
    }

    fn register(&mut self, id: ResourceId, path: Option<PathBuf>, resource: WeakHandle<T>) {
        self.pending_ids.remove(&id);
        if let Some(path) = path.as_ref() {
            self.in_flight.remove(path);
            if let Some(previous) = self.by_path.insert(path.clone(), id) {
                if previous != id {
                    tracing::debug!(path = ?path, previous = %previous, id = %id, "Path now refers to a new resource");
                }
            }
        }
        self.by_id.remove(&id);
        // key was just removed
        let _ = self.by_id.insert(id, LookupEntry { path, resource });
    }

    fn forget(&mut self, id: ResourceId) {
        let Some(entry) = self.by_id.remove(&id) else {
            return;
        };
        if let Some(path) = entry.path {
            // the path may already point at a newer resource
            if self.by_path.get(&path) == Some(&id) {
                self.by_path.remove(&path);
            }
        }
    }

    /// Whether `id` belongs to a resource which is alive or still being made
    fn id_in_use(&self, id: ResourceId) -> bool {
        self.pending_ids.contains(&id) || self.by_id.contains(&id)
    }

    fn lookup(&self, id: ResourceId) -> Option<Handle<T>> {
        self.by_id.get(&id).and_then(|entry| entry.resource.upgrade())
    }

    fn loaded(&self, path: &Path) -> Option<Handle<T>> {
        self.by_path.get(path).and_then(|id| self.lookup(*id))
    }

    fn state(&self, path: &Path) -> EntryState {
        if self.loaded(path).is_some() {
            EntryState::Loaded
        } else if self.in_flight.contains_key(path) {
            EntryState::Loading
        } else {
            EntryState::Unseen
        }
    }
}

/// State shared by the front-end, the back-end and in flight worker tasks
struct CacheShared<T, P> {
    config: CacheConfig,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    loader: Option<Loader<T, P>>,
    finalizer: Option<Finalizer<T>>,
    runner: Arc<dyn TaskRunner>,
    tracker: TaskTracker,
    reclaimer: Arc<Reclaimer<T>>,
    front: Mutex<FrontState<T>>,
    load_requests: MailboxSender<LoadRequest<T, P>>,
    finalize_requests: MailboxSender<FinalizeRequest<T>>,
    events: MailboxSender<CacheEvent<T>>,
    assume_ownership: MailboxSender<ResourceId>,
}

impl<T: Send + Sync + 'static, P: Send + 'static> CacheShared<T, P> {
    fn lock_front(&self) -> MutexGuard<'_, FrontState<T>> {
        self.front
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Pick the id of a new resource
    ///
    /// Caller chosen ids push the counter past themselves so automatic ids never repeat them.
    fn claim_id(
        &self,
        front: &FrontState<T>,
        requested: Option<ResourceId>,
    ) -> Result<ResourceId, ResourceError> {
        match requested {
            None => Ok(ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed))),
            Some(id) if front.id_in_use(id) => Err(ResourceError::IdInUse(id)),
            Some(id) => {
                self.next_id
                    .fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
                Ok(id)
            }
        }
    }

    fn owner(&self) -> Arc<dyn ResourceOwner<T>> {
        self.reclaimer.clone()
    }

    /// Make a finished resource visible to the front-end
    fn publish(&self, id: ResourceId, path: Option<PathBuf>, handle: &Handle<T>) {
        let event = CacheEvent::Completed {
            id,
            path,
            resource: handle.downgrade(),
        };
        if self.events.enqueue(event).is_err() {
            tracing::error!(cache = %self.config.name, id = %id, "Front-end event mailbox is closed");
        }
    }

    /// Runs on a worker, or inline during an immediate pass
    fn execute_load(&self, request: LoadRequest<T, P>) {
        let LoadRequest {
            id,
            path,
            params,
            promise,
        } = request;
        let result = match self.loader.as_ref() {
            Some(loader) => catch_panic(|| loader(&path, &params)),
            None => Err(anyhow::anyhow!("Cache has no loader")),
        };
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(cache = %self.config.name, path = ?path, id = %id, "Failed to load resource: {error:#}");
                if self
                    .events
                    .enqueue(CacheEvent::Failed {
                        id,
                        path: path.clone(),
                    })
                    .is_err()
                {
                    tracing::error!(cache = %self.config.name, "Front-end event mailbox is closed");
                }
                promise.set(Err(ResourceError::load_failed(path, error)));
                return;
            }
        };
        tracing::trace!(cache = %self.config.name, path = ?path, id = %id, "Loaded resource");
        match self.finalizer.clone() {
            Some(finalizer) => {
                let request = FinalizeRequest {
                    id,
                    path: Some(path),
                    value,
                    promise,
                    finalizer,
                };
                if let Err(MailboxClosed(request)) = self.finalize_requests.enqueue(request) {
                    tracing::error!(cache = %self.config.name, id = %request.id, "Finalize mailbox is closed, dropping resource");
                }
            }
            None => {
                let handle = Handle::with_owner(id, Some(path.clone()), value, self.owner());
                self.publish(id, Some(path), &handle);
                if self.assume_ownership.enqueue(id).is_err() {
                    tracing::error!(cache = %self.config.name, id = %id, "Ownership mailbox is closed");
                }
                promise.set(Ok(handle));
            }
        }
    }

    /// Stop accepting work and empty the lookup maps
    fn close_front(&self) {
        let mut front = self.lock_front();
        self.shut_down.store(true, Ordering::Release);
        front.closed = true;
        let in_flight = std::mem::take(&mut front.in_flight);
        front.by_path.clear();
        front.by_id = IndexPool::default();
        front.deletions.close();
        drop(front);
        // may drop the last handles of unclaimed loads
        drop(in_flight);
    }
}

/// Front-end of a resource cache
///
/// Clones share the same cache. Obtained together with its back-end from
/// [`ResourceCacheBuilder::build`].
pub struct ResourceCache<T, P = ()> {
    shared: Arc<CacheShared<T, P>>,
}

impl<T, P> Clone for ResourceCache<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, P> Debug for ResourceCache<T, P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("name", &self.shared.config.name)
            .field("shut_down", &self.shared.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + Sync + 'static, P: Send + 'static> ResourceCache<T, P> {
    pub fn builder(config: CacheConfig) -> ResourceCacheBuilder<T, P> {
        ResourceCacheBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Reserve a fresh id, never handed out by this cache again
    pub fn next_id(&self) -> ResourceId {
        ResourceId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Request the resource behind `path`
    ///
    /// Returns a ready future on a cache hit, the future of the running load if the path is
    /// already being loaded, otherwise schedules a new load for the next back-end pass. After
    /// shutdown the returned future is empty.
    pub fn load(&self, path: impl AsRef<Path>, params: P) -> ResourceFuture<T> {
        self.load_inner(path.as_ref(), params, None)
    }

    /// [`Self::load`] with a caller chosen id, only used if a new load is scheduled
    pub fn load_with_id(
        &self,
        path: impl AsRef<Path>,
        params: P,
        id: ResourceId,
    ) -> ResourceFuture<T> {
        self.load_inner(path.as_ref(), params, Some(id))
    }

    fn load_inner(&self, path: &Path, params: P, id: Option<ResourceId>) -> ResourceFuture<T> {
        let mut front = self.shared.lock_front();
        if self.shared.is_shut_down() {
            tracing::debug!(cache = %self.name(), path = ?path, "Load requested after shutdown");
            return SharedFuture::default();
        }
        front.sync();
        if let Some(handle) = front.loaded(path) {
            tracing::trace!(cache = %self.name(), path = ?path, "Cache hit");
            return SharedFuture::ready(Ok(handle));
        }
        if let Some(future) = front.in_flight.get(path) {
            return future.clone();
        }
        if self.shared.loader.is_none() {
            let error = ResourceError::load_failed(
                path.to_path_buf(),
                anyhow::anyhow!("Cache has no loader"),
            );
            return SharedFuture::ready(Err(error));
        }

        let id = match self.shared.claim_id(&front, id) {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(cache = %self.name(), path = ?path, "Refusing load: {error}");
                return SharedFuture::ready(Err(error));
            }
        };
        let (promise, future) = promise();
        front.in_flight.insert(path.to_path_buf(), future.clone());
        front.pending_ids.insert(id);
        let request = LoadRequest {
            id,
            path: path.to_path_buf(),
            params,
            promise,
        };
        if let Err(MailboxClosed(request)) = self.shared.load_requests.enqueue(request) {
            front.in_flight.remove(&request.path);
            front.pending_ids.remove(&request.id);
            tracing::error!(cache = %self.name(), path = ?request.path, "Load mailbox is closed");
            return SharedFuture::default();
        }
        tracing::trace!(cache = %self.name(), path = ?path, id = %id, "Scheduled load");
        future
    }

    /// Hand an existing value to the cache
    ///
    /// Without a finalizer the value is wrapped, registered and returned right away. With one,
    /// the value is finalized on the next back-end pass and the future resolves then.
    pub fn add(
        &self,
        value: T,
        path: Option<PathBuf>,
        finalizer: Option<Finalizer<T>>,
    ) -> ResourceFuture<T> {
        self.add_inner(value, path, None, finalizer)
    }

    /// [`Self::add`] under a caller chosen id
    ///
    /// Resolves to [`ResourceError::IdInUse`] if a live or pending resource already has `id`, the
    /// value is dropped without running the destroyer then.
    pub fn add_with_id(
        &self,
        value: T,
        path: Option<PathBuf>,
        id: ResourceId,
        finalizer: Option<Finalizer<T>>,
    ) -> ResourceFuture<T> {
        self.add_inner(value, path, Some(id), finalizer)
    }

    fn add_inner(
        &self,
        value: T,
        path: Option<PathBuf>,
        id: Option<ResourceId>,
        finalizer: Option<Finalizer<T>>,
    ) -> ResourceFuture<T> {
        let mut front = self.shared.lock_front();
        if self.shared.is_shut_down() {
            tracing::debug!(cache = %self.name(), path = ?path, "Add requested after shutdown, value is dropped");
            return SharedFuture::default();
        }
        front.sync();
        let id = match self.shared.claim_id(&front, id) {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(cache = %self.name(), path = ?path, "Refusing add: {error}");
                return SharedFuture::ready(Err(error));
            }
        };

        let Some(finalizer) = finalizer else {
            let handle = Handle::with_owner(id, path.clone(), value, self.shared.owner());
            front.register(id, path, handle.downgrade());
            if self.shared.assume_ownership.enqueue(id).is_err() {
                tracing::error!(cache = %self.name(), id = %id, "Ownership mailbox is closed");
            }
            return SharedFuture::ready(Ok(handle));
        };

        let (promise, future) = promise();
        if let Some(path) = path.as_ref() {
            if front.state(path) == EntryState::Unseen {
                front.in_flight.insert(path.clone(), future.clone());
            }
        }
        front.pending_ids.insert(id);
        let request = FinalizeRequest {
            id,
            path,
            value,
            promise,
            finalizer,
        };
        if let Err(MailboxClosed(request)) = self.shared.finalize_requests.enqueue(request) {
            if let Some(path) = request.path.as_ref() {
                front.in_flight.remove(path);
            }
            front.pending_ids.remove(&id);
            tracing::error!(cache = %self.name(), id = %id, "Finalize mailbox is closed");
            return SharedFuture::default();
        }
        future
    }

    /// Loaded resource behind `path`, does not start a load
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Handle<T>> {
        let mut front = self.shared.lock_front();
        front.sync();
        front.loaded(path.as_ref())
    }

    pub fn get_by_id(&self, id: ResourceId) -> Option<Handle<T>> {
        let mut front = self.shared.lock_front();
        front.sync();
        front.lookup(id)
    }

    pub fn state(&self, path: impl AsRef<Path>) -> EntryState {
        let mut front = self.shared.lock_front();
        front.sync();
        front.state(path.as_ref())
    }

    /// Number of live resources the front-end can serve
    pub fn loaded_len(&self) -> usize {
        let mut front = self.shared.lock_front();
        front.sync();
        front
            .by_id
            .iter()
            .filter(|(entry, _)| entry.resource.is_alive())
            .count()
    }

    pub fn in_flight_len(&self) -> usize {
        let mut front = self.shared.lock_front();
        front.sync();
        front.in_flight.len()
    }
}

/// Assembles a [`ResourceCache`] and its [`ResourceCacheBackend`]
pub struct ResourceCacheBuilder<T, P = ()> {
    config: CacheConfig,
    loader: Option<Loader<T, P>>,
    finalizer: Option<Finalizer<T>>,
    destroyer: Option<Destroyer<T>>,
    runner: Option<Arc<dyn TaskRunner>>,
}

impl<T: Send + Sync + 'static, P: Send + 'static> ResourceCacheBuilder<T, P> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            loader: None,
            finalizer: None,
            destroyer: None,
            runner: None,
        }
    }

    pub fn loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&Path, &P) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn destroyer<F>(mut self, destroyer: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.destroyer = Some(Arc::new(destroyer));
        self
    }

    /// Where loader work runs, loads run inline during [`ResourceCacheBackend::run`] otherwise
    pub fn runner<R: TaskRunner + 'static>(mut self, runner: R) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    pub fn build(self) -> (ResourceCache<T, P>, ResourceCacheBackend<T, P>) {
        let (load_requests, load_receiver) = mailbox();
        let (finalize_requests, finalize_receiver) = mailbox();
        let (events, event_receiver) = mailbox();
        let (assume_ownership, assume_receiver) = mailbox();
        let (front_deletions, front_deletion_receiver) = mailbox();
        let (back_deletions, back_deletion_receiver) = mailbox();

        let reclaimer = Arc::new(Reclaimer {
            cache: self.config.name.clone(),
            destroyer: self.destroyer,
            front: front_deletions,
            back: back_deletions,
        });
        let shared = Arc::new(CacheShared {
            config: self.config,
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            loader: self.loader,
            finalizer: self.finalizer,
            runner: self.runner.unwrap_or_else(|| Arc::new(InlineRunner)),
            tracker: TaskTracker::new(),
            reclaimer,
            front: Mutex::new(FrontState {
                by_path: HashMap::new(),
                by_id: IndexPool::default(),
                in_flight: HashMap::new(),
                pending_ids: HashSet::new(),
                events: event_receiver,
                deletions: front_deletion_receiver,
                closed: false,
            }),
            load_requests,
            finalize_requests,
            events,
            assume_ownership,
        });
        tracing::debug!(cache = %shared.config.name, "Created resource cache");
        let backend = ResourceCacheBackend::new(
            shared.clone(),
            load_receiver,
            finalize_receiver,
            assume_receiver,
            back_deletion_receiver,
        );
        (ResourceCache { shared }, backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dispatch;
    use std::sync::atomic::AtomicUsize;

    fn counting_cache() -> (
        ResourceCache<String>,
        ResourceCacheBackend<String, ()>,
        Arc<AtomicUsize>,
    ) {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let (cache, backend) = ResourceCache::builder(CacheConfig::new("test"))
            .loader(move |path: &Path, _: &()| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(path.display().to_string())
            })
            .build();
        (cache, backend, loads)
    }

    #[test]
    fn test_load_resolves_after_run() {
        let (cache, mut backend, loads) = counting_cache();
        let future = cache.load("a.txt", ());
        assert!(future.is_valid());
        assert!(!future.is_ready());
        assert_eq!(cache.state("a.txt"), EntryState::Loading);

        backend.run();
        let handle = future.get().clone().unwrap();
        assert_eq!(*handle, "a.txt");
        assert_eq!(handle.path(), Some(Path::new("a.txt")));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state("a.txt"), EntryState::Loaded);
        assert_eq!(cache.in_flight_len(), 0);
    }

    #[test]
    fn test_in_flight_requests_share_a_future() {
        let (cache, mut backend, loads) = counting_cache();
        let a = cache.load("a.txt", ());
        let b = cache.load("a.txt", ());
        assert!(SharedFuture::ptr_eq(&a, &b));
        backend.run();
        let a = a.get().clone().unwrap();
        let b = b.get().clone().unwrap();
        assert!(Handle::ptr_eq(&a, &b));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_hit_is_ready() {
        let (cache, mut backend, loads) = counting_cache();
        let first = cache.load("a.txt", ());
        backend.run();
        let first = first.get().clone().unwrap();

        let hit = cache.load("a.txt", ());
        assert!(hit.is_ready());
        assert!(Handle::ptr_eq(&first, hit.get().as_ref().unwrap()));
        assert!(!backend.has_pending_work());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_after_release() {
        let (cache, mut backend, loads) = counting_cache();
        let handle = cache.load("a.txt", ());
        backend.run();
        let id = handle.get().as_ref().unwrap().id();
        drop(handle);
        // the front-end releases its copy of the finished future when it folds the completion
        assert_eq!(cache.state("a.txt"), EntryState::Unseen);
        backend.run();
        assert_eq!(backend.owned_len(), 0);
        assert!(cache.get_by_id(id).is_none());

        let again = cache.load("a.txt", ());
        backend.run();
        assert_ne!(again.get().as_ref().unwrap().id(), id);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_add_without_finalizer_is_immediate() {
        let (cache, _backend, _) = counting_cache();
        let future = cache.add_with_id(
            String::from("manual"),
            Some(PathBuf::from("manual.txt")),
            ResourceId(7),
            None,
        );
        let handle = future.try_get().unwrap().clone().unwrap();
        assert_eq!(handle.id(), ResourceId(7));
        assert!(Handle::ptr_eq(&cache.get("manual.txt").unwrap(), &handle));
        assert!(Handle::ptr_eq(&cache.get_by_id(ResourceId(7)).unwrap(), &handle));
    }

    #[test]
    fn test_add_with_finalizer_waits_for_run() {
        let (cache, mut backend, _) = counting_cache();
        let finalizer: Finalizer<String> = Arc::new(|value: &mut String| value.push_str("!"));
        let future = cache.add(String::from("hi"), Some(PathBuf::from("hi")), Some(finalizer));
        assert!(!future.is_ready());
        assert_eq!(cache.state("hi"), EntryState::Loading);
        backend.run();
        assert_eq!(**future.get().as_ref().unwrap(), "hi!");
        assert_eq!(cache.state("hi"), EntryState::Loaded);
    }

    #[test]
    fn test_failed_load_can_be_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let (cache, mut backend) = ResourceCache::<u32>::builder(CacheConfig::new("flaky"))
            .loader(move |_: &Path, _: &()| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("not yet");
                }
                Ok(3)
            })
            .build();

        let failed = cache.load("x", ());
        backend.run();
        assert!(matches!(
            failed.get(),
            Err(ResourceError::LoadFailed { .. })
        ));
        assert_eq!(cache.state("x"), EntryState::Unseen);

        let retried = cache.load("x", ());
        backend.run();
        assert_eq!(**retried.get().as_ref().unwrap(), 3);
    }

    #[test]
    fn test_panicking_loader_can_be_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let (cache, mut backend) = ResourceCache::<u32>::builder(CacheConfig::new("crashy"))
            .loader(move |_: &Path, _: &()| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("decoder crashed");
                }
                Ok(3)
            })
            .build();

        let failed = cache.load("x", ());
        backend.run();
        match failed.get() {
            Err(ResourceError::LoadFailed { error, .. }) => {
                assert!(error.to_string().contains("decoder crashed"))
            }
            other => panic!("expected a failed load, got {other:?}"),
        }
        assert_eq!(cache.state("x"), EntryState::Unseen);
        assert_eq!(cache.in_flight_len(), 0);

        let retried = cache.load("x", ());
        assert!(!retried.is_ready());
        backend.run();
        assert_eq!(**retried.get().as_ref().unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_caller_ids_push_automatic_ids_past_them() {
        let (cache, mut backend, _) = counting_cache();
        let q = cache
            .add_with_id(String::from("q"), Some(PathBuf::from("q")), ResourceId(1), None)
            .get()
            .clone()
            .unwrap();
        let r_future = cache.load("r", ());
        backend.run();
        let r = r_future.get().clone().unwrap();
        assert_eq!(q.id(), ResourceId(1));
        assert_eq!(r.id(), ResourceId(2));
        assert_eq!(cache.next_id(), ResourceId(3));

        drop(r);
        drop(r_future);
        backend.run();
        assert_eq!(*cache.get("q").unwrap(), "q");
        assert!(Handle::ptr_eq(&cache.get_by_id(ResourceId(1)).unwrap(), &q));
        assert!(Handle::ptr_eq(
            cache.load("q", ()).get().as_ref().unwrap(),
            &q
        ));
    }

    #[test]
    fn test_id_in_use_is_refused() {
        let (cache, mut backend, loads) = counting_cache();
        let pending = cache.load_with_id("a", (), ResourceId(5));
        let clash = cache.add_with_id(String::from("b"), None, ResourceId(5), None);
        assert!(matches!(
            clash.get(),
            Err(ResourceError::IdInUse(ResourceId(5)))
        ));

        backend.run();
        let a = pending.get().clone().unwrap();
        let again = cache.load_with_id("c", (), ResourceId(5));
        assert!(matches!(again.get(), Err(ResourceError::IdInUse(_))));
        assert_eq!(cache.state("c"), EntryState::Unseen);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(Handle::ptr_eq(&cache.get_by_id(ResourceId(5)).unwrap(), &a));

        // released ids are free again
        drop(a);
        drop(pending);
        let reused = cache.add_with_id(String::from("d"), None, ResourceId(5), None);
        assert_eq!(reused.get().as_ref().unwrap().id(), ResourceId(5));
        drop(reused);
        backend.run();
        assert_eq!(backend.owned_len(), 0);
    }

    #[test]
    fn test_missing_loader_fails_immediately() {
        let (cache, _backend) = ResourceCache::<u32>::builder(CacheConfig::default()).build();
        let future = cache.load("x", ());
        assert!(future.is_ready());
        assert!(future.get().is_err());
    }

    #[test]
    fn test_load_after_shutdown_is_empty() {
        let (cache, mut backend, _) = counting_cache();
        backend.shutdown();
        let future = cache.load("a.txt", ());
        assert!(!future.is_valid());
        assert!(cache.is_shut_down());
        assert!(!cache.add(String::new(), None, None).is_valid());
    }

    #[test]
    fn test_immediate_dispatch() {
        let (cache, mut backend, _) = counting_cache();
        let future = cache.load("b", ());
        backend.run_with(Dispatch::Immediate);
        assert!(future.is_ready());
        assert_eq!(backend.outstanding_tasks(), 0);
    }
}
