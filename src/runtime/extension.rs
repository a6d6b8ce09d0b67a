//! Host-provided extensions looked up by type

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Type-keyed set of shared host services
#[derive(Default, Clone)]
pub struct Extensions {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Add or replace the extension of type `T`
    pub fn insert<T: Any + Send + Sync>(&mut self, extension: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), extension);
    }

    /// Extension of type `T`, if present
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|extension| extension.downcast::<T>().ok())
    }

    /// Number of extensions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no extensions are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.entries.len()).finish()
    }
}
