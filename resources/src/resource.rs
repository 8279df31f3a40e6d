use std::any::{type_name, TypeId};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opaque numeric identity of a resource
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourceId(pub u64);

impl From<u64> for ResourceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ResourceId> for u64 {
    fn from(value: ResourceId) -> Self {
        value.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Runtime type tag of a resource
#[derive(Debug, Copy, Clone)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Receives the value of a resource once its last handle is gone
///
/// Installed on a resource by whichever cache manages it. Every resource keeps its owner alive, so
/// the value always reaches the owner no matter which other cache parts are gone.
pub trait ResourceOwner<T>: Send + Sync {
    fn on_destroyed(&self, id: ResourceId, path: Option<PathBuf>, value: T);
}

/// Shared allocation behind every [`crate::handle::Handle`]
pub struct Resource<T> {
    id: ResourceId,
    type_tag: TypeTag,
    path: Option<PathBuf>,
    /// Only `None` after the value was moved out
    value: Option<T>,
    owner: Option<Arc<dyn ResourceOwner<T>>>,
}

impl<T: 'static> Resource<T> {
    pub(crate) fn new(
        id: ResourceId,
        path: Option<PathBuf>,
        value: T,
        owner: Option<Arc<dyn ResourceOwner<T>>>,
    ) -> Self {
        Self {
            id,
            type_tag: TypeTag::of::<T>(),
            path,
            value: Some(value),
            owner,
        }
    }
}

impl<T> Resource<T> {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether destruction is routed to an owner
    pub fn is_managed(&self) -> bool {
        self.owner.is_some()
    }

    pub fn value(&self) -> &T {
        match self.value.as_ref() {
            Some(value) => value,
            None => unreachable!("Resource value accessed after being moved out"),
        }
    }

    pub(crate) fn value_mut(&mut self) -> &mut T {
        match self.value.as_mut() {
            Some(value) => value,
            None => unreachable!("Resource value accessed after being moved out"),
        }
    }

    /// Move the value out without routing it to the owner
    pub(crate) fn into_value(mut self) -> T {
        self.owner = None;
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("Resource value moved out twice"),
        }
    }
}

impl<T: Debug> Debug for Resource<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("type", &self.type_tag.name())
            .field("path", &self.path)
            .field("value", &self.value)
            .field("managed", &self.is_managed())
            .finish()
    }
}

impl<T> Drop for Resource<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        match self.owner.take() {
            Some(owner) => owner.on_destroyed(self.id, self.path.take(), value),
            None => {
                tracing::trace!(id = %self.id, "Resource dropped without an owner");
                drop(value);
            }
        }
    }
}
