use crate::error::ContainerErrors;
use std::hash::Hash;

/// Keyed object storage shared by [`crate::index_pool::IndexPool`] and
/// [`crate::stable_index_pool::StableIndexPool`]
///
/// Callers which only need borrow-scoped access can stay generic over this trait and pick the
/// pointer stability they need at construction.
pub trait Pool<K: Copy + Eq + Hash, T> {
    fn new() -> Self;

    /// Insert an element under `key`, fails if the key is already present
    fn insert(&mut self, key: K, element: T) -> Result<(), ContainerErrors>;

    /// Remove the element stored under `key` and hand it back
    fn remove(&mut self, key: &K) -> Option<T>;

    fn get(&self, key: &K) -> Option<&T>;

    fn get_mut(&mut self, key: &K) -> Option<&mut T>;

    fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Number of live elements
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live element
    fn for_each<F: FnMut(&K, &T)>(&self, func: F);

    /// Take every live element out of the pool
    fn drain_all(&mut self) -> Vec<(K, T)>;
}
