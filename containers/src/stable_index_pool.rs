use crate::error::ContainerErrors;
use crate::slot::PoolSlot;
use crate::traits::Pool;
use std::collections::HashMap;
use std::hash::Hash;

pub const DEFAULT_BLOCK_SIZE: usize = 64;

#[derive(Debug)]
struct Entry<K, T> {
    generation: u32,
    element: Option<(K, T)>,
}

/// Block allocated pool keyed by an external id
///
/// Storage grows one boxed block at a time and blocks are never reallocated, so an element never
/// moves while it is alive. Removal pushes the `(block, index)` pair onto a free list which is
/// reused by the next insert.
#[derive(Debug)]
pub struct StableIndexPool<K, T> {
    blocks: Vec<Box<[Entry<K, T>]>>,
    block_size: usize,
    free_list: Vec<(u32, u32)>,
    slots: HashMap<K, PoolSlot<T>>,
}

impl<K, T> Default for StableIndexPool<K, T> {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            free_list: Vec::new(),
            slots: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash, T> StableIndexPool<K, T> {
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "Block size must be non-zero");
        assert!(
            u32::try_from(block_size).is_ok(),
            "Block size must fit in a slot index"
        );
        Self {
            block_size,
            ..Default::default()
        }
    }

    fn grow(&mut self) -> Result<(), ContainerErrors> {
        let block_index =
            u32::try_from(self.blocks.len()).map_err(|_| ContainerErrors::CapacityExceeded)?;
        let block_size =
            u32::try_from(self.block_size).map_err(|_| ContainerErrors::CapacityExceeded)?;
        let block: Box<[Entry<K, T>]> = (0..self.block_size)
            .map(|_| Entry {
                generation: 0,
                element: None,
            })
            .collect();
        self.blocks.push(block);
        // reversed so slot 0 of the new block is handed out first
        self.free_list
            .extend((0..block_size).rev().map(|index| (block_index, index)));
        Ok(())
    }

    /// Insert and return the slot the element now lives in
    pub fn insert(&mut self, key: K, element: T) -> Result<PoolSlot<T>, ContainerErrors> {
        if self.slots.contains_key(&key) {
            return Err(ContainerErrors::DuplicateKey);
        }
        if self.free_list.is_empty() {
            self.grow()?;
        }
        let (block, index) = self
            .free_list
            .pop()
            .ok_or(ContainerErrors::NonexistentSlot)?;
        let entry = &mut self.blocks[block as usize][index as usize];
        entry.element = Some((key, element));
        let slot = PoolSlot::new(block, index, entry.generation);
        self.slots.insert(key, slot);
        Ok(slot)
    }

    pub fn remove(&mut self, key: &K) -> Option<T> {
        let slot = self.slots.remove(key)?;
        let entry = &mut self.blocks[slot.block() as usize][slot.index() as usize];
        entry.generation = entry.generation.wrapping_add(1);
        self.free_list.push((slot.block(), slot.index()));
        entry.element.take().map(|(_, element)| element)
    }

    pub fn slot_of(&self, key: &K) -> Option<PoolSlot<T>> {
        self.slots.get(key).copied()
    }

    pub fn get(&self, key: &K) -> Option<&T> {
        let slot = self.slots.get(key)?;
        self.get_by_slot(slot).ok()
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut T> {
        let slot = *self.slots.get(key)?;
        self.get_by_slot_mut(&slot).ok()
    }

    /// Resolve a previously handed out slot
    pub fn get_by_slot(&self, slot: &PoolSlot<T>) -> Result<&T, ContainerErrors> {
        let entry = self
            .blocks
            .get(slot.block() as usize)
            .and_then(|block| block.get(slot.index() as usize))
            .ok_or(ContainerErrors::NonexistentSlot)?;
        if entry.generation != slot.generation() {
            return Err(ContainerErrors::GenerationMismatch);
        }
        entry
            .element
            .as_ref()
            .map(|(_, element)| element)
            .ok_or(ContainerErrors::NonexistentSlot)
    }

    pub fn get_by_slot_mut(&mut self, slot: &PoolSlot<T>) -> Result<&mut T, ContainerErrors> {
        let entry = self
            .blocks
            .get_mut(slot.block() as usize)
            .and_then(|block| block.get_mut(slot.index() as usize))
            .ok_or(ContainerErrors::NonexistentSlot)?;
        if entry.generation != slot.generation() {
            return Err(ContainerErrors::GenerationMismatch);
        }
        entry
            .element
            .as_mut()
            .map(|(_, element)| element)
            .ok_or(ContainerErrors::NonexistentSlot)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total number of slots across all blocks, live or free
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
        self.blocks
            .iter()
            .flat_map(|block| block.iter())
            .filter_map(|entry| entry.element.as_ref().map(|(key, element)| (key, element)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut T)> {
        self.blocks
            .iter_mut()
            .flat_map(|block| block.iter_mut())
            .filter_map(|entry| entry.element.as_mut().map(|(key, element)| (&*key, element)))
    }
}

impl<K: Copy + Eq + Hash, T> Pool<K, T> for StableIndexPool<K, T> {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: K, element: T) -> Result<(), ContainerErrors> {
        StableIndexPool::insert(self, key, element).map(|_| ())
    }

    fn remove(&mut self, key: &K) -> Option<T> {
        StableIndexPool::remove(self, key)
    }

    fn get(&self, key: &K) -> Option<&T> {
        StableIndexPool::get(self, key)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut T> {
        StableIndexPool::get_mut(self, key)
    }

    fn contains(&self, key: &K) -> bool {
        StableIndexPool::contains(self, key)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn for_each<F: FnMut(&K, &T)>(&self, mut func: F) {
        for (key, element) in self.iter() {
            func(key, element);
        }
    }

    fn drain_all(&mut self) -> Vec<(K, T)> {
        let keys: Vec<K> = self.slots.keys().copied().collect();
        keys.into_iter()
            .filter_map(|key| self.remove(&key).map(|element| (key, element)))
            .collect()
    }
}
