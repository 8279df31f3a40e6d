use crate::error::ContainerErrors;
use crate::traits::Pool;
use std::collections::HashMap;
use std::hash::Hash;
use std::slice::{Iter, IterMut};

/// Densely packed pool keyed by an external id
///
/// Elements live in a single vector, removal swaps the last element into the hole. There are no
/// tombstones and removal is O(1), but elements move on removal, so references are only handed
/// out for the duration of a borrow.
#[derive(Debug)]
pub struct IndexPool<K, T> {
    pub(crate) data: Vec<(T, K)>,
    pub(crate) indices: HashMap<K, usize>,
}

impl<K, T> Default for IndexPool<K, T> {
    fn default() -> Self {
        Self {
            data: Default::default(),
            indices: Default::default(),
        }
    }
}

impl<K: Copy + Eq + Hash, T> IndexPool<K, T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            indices: HashMap::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, key: K, element: T) -> Result<(), ContainerErrors> {
        if self.indices.contains_key(&key) {
            return Err(ContainerErrors::DuplicateKey);
        }
        self.indices.insert(key, self.data.len());
        self.data.push((element, key));
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Option<T> {
        let index = self.indices.remove(key)?;
        let last_index = self.data.len() - 1;
        if index != last_index {
            // swap with the last and repoint whoever got moved into the hole
            self.data.swap(index, last_index);
            let moved_key = self.data[index].1;
            self.indices.insert(moved_key, index);
        }
        self.data.pop().map(|(element, _)| element)
    }

    pub fn get(&self, key: &K) -> Option<&T> {
        self.indices
            .get(key)
            .and_then(|index| self.data.get(*index))
            .map(|(element, _)| element)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut T> {
        match self.indices.get(key) {
            Some(index) => self.data.get_mut(*index).map(|(element, _)| element),
            None => None,
        }
    }

    /// Dense position of `key`. Only meaningful until the next mutation.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        self.indices.get(key).copied()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.indices.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, (T, K)> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, (T, K)> {
        self.data.iter_mut()
    }
}

impl<K: Copy + Eq + Hash, T> Pool<K, T> for IndexPool<K, T> {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: K, element: T) -> Result<(), ContainerErrors> {
        IndexPool::insert(self, key, element)
    }

    fn remove(&mut self, key: &K) -> Option<T> {
        IndexPool::remove(self, key)
    }

    fn get(&self, key: &K) -> Option<&T> {
        IndexPool::get(self, key)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut T> {
        IndexPool::get_mut(self, key)
    }

    fn contains(&self, key: &K) -> bool {
        IndexPool::contains(self, key)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn for_each<F: FnMut(&K, &T)>(&self, mut func: F) {
        for (element, key) in self.data.iter() {
            func(key, element);
        }
    }

    fn drain_all(&mut self) -> Vec<(K, T)> {
        self.indices.clear();
        self.data
            .drain(..)
            .map(|(element, key)| (key, element))
            .collect()
    }
}
