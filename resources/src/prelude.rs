pub use super::cache::{
    Destroyer, EntryState, Finalizer, LoadResult, Loader, ResourceCache, ResourceCacheBackend,
    ResourceCacheBuilder, ResourceFuture,
};
pub use super::channel::{promise, Promise, SharedFuture};
pub use super::config::{CacheConfig, Dispatch, TypedBackendConfig};
pub use super::error::ResourceError;
pub use super::handle::{Handle, WeakHandle};
pub use super::mailbox::{mailbox, MailboxClosed, MailboxReceiver, MailboxSender};
pub use super::registry::CacheRegistry;
pub use super::resource::{ResourceId, ResourceOwner, TypeTag};
pub use super::task::{
    InlineRunner, RayonRunner, Task, TaskGuard, TaskRunner, TaskTracker, TokioRunner, WorkerPool,
};
pub use super::typed_backend::{
    BackendResult, Constructor, TypedBackendBuilder, TypedBackendQueue, TypedResourceBackend,
};
pub use ember_containers::prelude::{IndexPool, Pool, PoolSlot, StableIndexPool};
