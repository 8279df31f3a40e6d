use std::any::type_name;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors surfaced by the resource cache
#[derive(thiserror::Error, Debug, Clone)]
pub enum ResourceError {
    #[error("Failed to load {path:?}: {error:#}")]
    LoadFailed {
        path: PathBuf,
        error: Arc<anyhow::Error>,
    },
    #[error("Failed to construct backend resource {0}: {1:#}")]
    ConstructFailed(crate::resource::ResourceId, Arc<anyhow::Error>),
    #[error("Resource id {0} is already in use")]
    IdInUse(crate::resource::ResourceId),
    #[error("Backend resource {0} was removed before it was ready")]
    Removed(crate::resource::ResourceId),
    #[error("No cache registered for resource type `{0}`")]
    UnregisteredType(&'static str),
    #[error("A cache for resource type `{0}` is already registered")]
    AlreadyRegistered(&'static str),
    #[error("Cache has been shut down")]
    ShutDown,
}

impl ResourceError {
    pub(crate) fn load_failed(path: PathBuf, error: anyhow::Error) -> Self {
        Self::LoadFailed {
            path,
            error: Arc::new(error),
        }
    }

    pub(crate) fn unregistered<T>() -> Self {
        Self::UnregisteredType(type_name::<T>())
    }
}
