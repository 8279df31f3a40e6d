pub use super::error::ContainerErrors;
pub use super::index_pool::IndexPool;
pub use super::slot::PoolSlot;
pub use super::stable_index_pool::{StableIndexPool, DEFAULT_BLOCK_SIZE};
pub use super::traits::*;
