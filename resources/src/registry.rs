use crate::cache::{ResourceCache, ResourceFuture};
use crate::error::ResourceError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::{Any, TypeId, type_name};
use std::path::Path;

/// Front-ends of every cache, keyed by resource type
///
/// Built at startup and passed around by reference. Lookups of a type without a registered cache
/// fail immediately instead of handing out a future.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the front-end for resources of type `T` with load parameters `P`
    pub fn register<T, P>(&self, cache: ResourceCache<T, P>) -> Result<(), ResourceError>
    where
        T: Send + Sync + 'static,
        P: Send + 'static,
    {
        match self.caches.entry(TypeId::of::<ResourceCache<T, P>>()) {
            Entry::Occupied(_) => Err(ResourceError::AlreadyRegistered(type_name::<T>())),
            Entry::Vacant(entry) => {
                tracing::debug!(resource = type_name::<T>(), cache = %cache.name(), "Registered resource cache");
                entry.insert(Box::new(cache));
                Ok(())
            }
        }
    }

    pub fn contains<T: 'static, P: 'static>(&self) -> bool {
        self.caches
            .contains_key(&TypeId::of::<ResourceCache<T, P>>())
    }

    /// Front-end registered for `T`, cloned out of the registry
    pub fn get<T, P>(&self) -> Result<ResourceCache<T, P>, ResourceError>
    where
        T: Send + Sync + 'static,
        P: Send + 'static,
    {
        self.caches
            .get(&TypeId::of::<ResourceCache<T, P>>())
            .and_then(|cache| cache.downcast_ref::<ResourceCache<T, P>>().cloned())
            .ok_or_else(ResourceError::unregistered::<T>)
    }

    /// Load through the cache registered for `T`
    pub fn load<T, P>(
        &self,
        path: impl AsRef<Path>,
        params: P,
    ) -> Result<ResourceFuture<T>, ResourceError>
    where
        T: Send + Sync + 'static,
        P: Send + 'static,
    {
        Ok(self.get::<T, P>()?.load(path, params))
    }

    pub fn remove<T, P>(&self) -> Option<ResourceCache<T, P>>
    where
        T: Send + Sync + 'static,
        P: Send + 'static,
    {
        self.caches
            .remove(&TypeId::of::<ResourceCache<T, P>>())
            .and_then(|(_, cache)| cache.downcast::<ResourceCache<T, P>>().ok())
            .map(|cache| *cache)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}
