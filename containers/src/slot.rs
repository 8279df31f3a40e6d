use derivative::Derivative;
use std::marker::PhantomData;

/// Location of an element inside a [`crate::stable_index_pool::StableIndexPool`].
///
/// A slot stays valid for as long as the element it was handed out for is alive. Once the
/// element is removed, the generation stored in the pool moves on and the slot stops resolving.
#[derive(Derivative)]
#[derivative(
    Debug(bound = ""),
    PartialEq(bound = ""),
    Eq(bound = ""),
    Hash(bound = "")
)]
pub struct PoolSlot<T> {
    block: u32,
    index: u32,
    generation: u32,
    #[derivative(Debug = "ignore", PartialEq = "ignore", Hash = "ignore")]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PoolSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PoolSlot<T> {}

impl<T> PoolSlot<T> {
    pub fn new(block: u32, index: u32, generation: u32) -> Self {
        Self {
            block,
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}
