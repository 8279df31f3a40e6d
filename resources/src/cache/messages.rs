use super::{Finalizer, LoadResult};
use crate::channel::Promise;
use crate::handle::WeakHandle;
use crate::resource::ResourceId;
use derivative::Derivative;
use std::path::PathBuf;

/// Front-end -> back-end, a path which needs loading
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct LoadRequest<T, P> {
    pub id: ResourceId,
    pub path: PathBuf,
    #[derivative(Debug = "ignore")]
    pub params: P,
    #[derivative(Debug = "ignore")]
    pub promise: Promise<LoadResult<T>>,
}

/// Worker or front-end -> back-end, a constructed value waiting for its designated thread pass
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct FinalizeRequest<T> {
    pub id: ResourceId,
    pub path: Option<PathBuf>,
    #[derivative(Debug = "ignore")]
    pub value: T,
    #[derivative(Debug = "ignore")]
    pub promise: Promise<LoadResult<T>>,
    #[derivative(Debug = "ignore")]
    pub finalizer: Finalizer<T>,
}

/// Back-end or worker -> front-end
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) enum CacheEvent<T> {
    /// Resource is finished and may be served from the lookup maps
    Completed {
        id: ResourceId,
        path: Option<PathBuf>,
        resource: WeakHandle<T>,
    },
    /// Loading failed, the path may be requested again
    Failed { id: ResourceId, path: PathBuf },
}

/// Resource -> back-end, the value of a resource whose last handle dropped
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct Deletion<T> {
    pub id: ResourceId,
    pub path: Option<PathBuf>,
    #[derivative(Debug = "ignore")]
    pub value: T,
}
