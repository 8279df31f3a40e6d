pub mod error;
pub mod index_pool;
pub mod prelude;
pub mod slot;
pub mod stable_index_pool;
pub mod traits;
