//! Asynchronous resource cache and lifecycle management
//!
//! Resources are loaded at most once per path, constructed off the designated thread, finalized
//! and destroyed on it, and reference counted through [`handle::Handle`] in between. See
//! [`cache`] for the orchestration and [`typed_backend`] for companion backend objects.
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod handle;
pub mod mailbox;
pub mod prelude;
pub mod registry;
pub mod resource;
pub mod task;
pub mod typed_backend;
