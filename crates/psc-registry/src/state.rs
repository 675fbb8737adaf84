//! Shared state for the registry router.

use std::sync::Arc;

use crate::store::MemoryRegistry;

/// State handed to every handler.
#[derive(Clone)]
pub struct RegistryState {
    pub store: Arc<MemoryRegistry>,
}

impl RegistryState {
    pub fn new() -> Self {
        RegistryState {
            store: Arc::new(MemoryRegistry::new()),
        }
    }
}

impl Default for RegistryState {
    fn default() -> Self {
        Self::new()
    }
}
