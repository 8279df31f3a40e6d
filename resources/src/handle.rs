use crate::resource::{Resource, ResourceId, ResourceOwner, TypeTag};
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Owning reference to a resource
///
/// Cloning adds a reference, moving does not touch the count, dropping the last handle destroys
/// the resource: either the value is dropped in place, or it is handed to the
/// [`ResourceOwner`] which manages it.
pub struct Handle<T> {
    inner: Arc<Resource<T>>,
}

impl<T: 'static> Handle<T> {
    /// Unmanaged handle, the value is dropped in place with the last handle
    pub fn new(id: ResourceId, value: T) -> Self {
        Self {
            inner: Arc::new(Resource::new(id, None, value, None)),
        }
    }

    /// Handle whose destruction is routed to `owner`
    pub fn with_owner(
        id: ResourceId,
        path: Option<PathBuf>,
        value: T,
        owner: Arc<dyn ResourceOwner<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Resource::new(id, path, value, Some(owner))),
        }
    }
}

impl<T> Handle<T> {
    pub fn id(&self) -> ResourceId {
        self.inner.id()
    }

    pub fn type_tag(&self) -> TypeTag {
        self.inner.type_tag()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path()
    }

    pub fn is_managed(&self) -> bool {
        self.inner.is_managed()
    }

    /// Address of the value, stable for the lifetime of the resource
    pub fn ptr(&self) -> *const T {
        self.inner.value() as *const T
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Number of live handles to this resource
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Mutable access, only while this is the sole reference
    pub fn get_mut(&mut self) -> Option<&mut T> {
        Arc::get_mut(&mut self.inner).map(|resource| resource.value_mut())
    }

    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle {
            id: self.id(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Take the value back out of an unmanaged, uniquely referenced handle
    ///
    /// Managed handles are returned as is, their value belongs to the owner.
    pub fn try_unwrap(self) -> Result<T, Self> {
        if self.is_managed() {
            return Err(self);
        }
        match Arc::try_unwrap(self.inner) {
            Ok(resource) => Ok(resource.into_value()),
            Err(inner) => Err(Self { inner }),
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.inner.value()
    }
}

impl<T> AsRef<T> for Handle<T> {
    fn as_ref(&self) -> &T {
        self.inner.value()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl<T: Debug> Debug for Handle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("resource", &*self.inner)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Non owning reference, does not keep the resource alive
pub struct WeakHandle<T> {
    id: ResourceId,
    inner: Weak<Resource<T>>,
}

impl<T> WeakHandle<T> {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Handle<T>> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingOwner {
        destroyed: Mutex<Vec<(ResourceId, Option<PathBuf>, u32)>>,
    }

    impl ResourceOwner<u32> for RecordingOwner {
        fn on_destroyed(&self, id: ResourceId, path: Option<PathBuf>, value: u32) {
            self.destroyed.lock().unwrap().push((id, path, value));
        }
    }

    #[test]
    fn test_ref_count_tracks_live_handles() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Handle::new(ResourceId(1), DropCounter(drops.clone()));
        assert_eq!(a.ref_count(), 1);

        let b = a.clone();
        let c = b.clone();
        assert_eq!(a.ref_count(), 3);

        // moves do not touch the count
        let moved = c;
        assert_eq!(moved.ref_count(), 3);

        drop(a);
        drop(b);
        assert_eq!(moved.ref_count(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(moved);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weak_handle_does_not_count() {
        let handle = Handle::new(ResourceId(2), 5u8);
        let weak = handle.downgrade();
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(weak.upgrade().map(|h| *h), Some(5));
        drop(handle);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_owner_receives_value_exactly_once() {
        let owner = Arc::new(RecordingOwner::default());
        let route = owner.clone() as Arc<dyn ResourceOwner<u32>>;
        let handle = Handle::with_owner(
            ResourceId(7),
            Some(PathBuf::from("a.tex")),
            11u32,
            route,
        );
        let clone = handle.clone();
        assert!(handle.is_managed());
        assert_eq!(handle.path(), Some(Path::new("a.tex")));
        drop(handle);
        assert!(owner.destroyed.lock().unwrap().is_empty());
        drop(clone);
        assert_eq!(
            *owner.destroyed.lock().unwrap(),
            vec![(ResourceId(7), Some(PathBuf::from("a.tex")), 11)]
        );
    }

    #[test]
    fn test_handle_keeps_owner_alive() {
        let owner = Arc::new(RecordingOwner::default());
        let route = owner.clone() as Arc<dyn ResourceOwner<u32>>;
        let handle = Handle::with_owner(ResourceId(3), None, 9u32, route);
        assert_eq!(Arc::strong_count(&owner), 2);
        drop(handle);
        assert_eq!(Arc::strong_count(&owner), 1);
        assert_eq!(owner.destroyed.lock().unwrap()[0].2, 9);
    }

    #[test]
    fn test_identity() {
        let a = Handle::new(ResourceId(1), String::from("x"));
        let b = a.clone();
        let c = Handle::new(ResourceId(1), String::from("x"));
        assert_eq!(a.ptr(), b.ptr());
        assert!(Handle::ptr_eq(&a, &b));
        assert_ne!(a, c);
        assert_eq!(a.type_tag(), TypeTag::of::<String>());
    }

    #[test]
    fn test_try_unwrap_and_get_mut() {
        let mut handle = Handle::new(ResourceId(4), vec![1]);
        handle.get_mut().unwrap().push(2);
        let clone = handle.clone();
        assert!(handle.get_mut().is_none());
        let handle = handle.try_unwrap().unwrap_err();
        drop(clone);
        assert_eq!(handle.try_unwrap().unwrap(), vec![1, 2]);

        let owner = Arc::new(RecordingOwner::default());
        let route = owner.clone() as Arc<dyn ResourceOwner<u32>>;
        let managed = Handle::with_owner(ResourceId(5), None, 1u32, route);
        let managed = managed.try_unwrap().unwrap_err();
        drop(managed);
        assert_eq!(owner.destroyed.lock().unwrap().len(), 1);
    }
}
