use std::time::Duration;

/// How a back-end pass hands out loader and constructor work
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Hand tasks to the task runner
    #[default]
    Deferred,
    /// Run tasks inline on the designated thread, used for the final pass of a shutdown
    Immediate,
}

/// Construction parameters of a [`crate::cache::ResourceCache`]
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Shows up in log fields
    pub name: String,
    pub dispatch: Dispatch,
    /// Whether a back-end pass waits on contended mailbox locks or skips them until the next pass
    pub blocking_collect: bool,
    /// How long shutdown waits for outstanding tasks, `None` waits forever
    pub shutdown_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: String::from("resource_cache"),
            dispatch: Dispatch::Deferred,
            blocking_collect: true,
            shutdown_timeout: None,
        }
    }
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_blocking_collect(mut self, blocking_collect: bool) -> Self {
        self.blocking_collect = blocking_collect;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}

/// Construction parameters of a [`crate::typed_backend::TypedResourceBackend`]
#[derive(Debug, Clone)]
pub struct TypedBackendConfig {
    pub name: String,
    pub dispatch: Dispatch,
    pub shutdown_timeout: Option<Duration>,
}

impl Default for TypedBackendConfig {
    fn default() -> Self {
        Self {
            name: String::from("typed_backend"),
            dispatch: Dispatch::Deferred,
            shutdown_timeout: None,
        }
    }
}

impl TypedBackendConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}
