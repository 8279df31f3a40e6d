use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum ContainerErrors {
    #[error("Expected a valid slot, got null")]
    NonexistentSlot,
    #[error("Slot generation does not match the stored generation")]
    GenerationMismatch,
    #[error("Key is already present in the pool")]
    DuplicateKey,
    #[error("Pool cannot address any more slots")]
    CapacityExceeded,
}
