//! Schema types for entry registration and lookup.

use serde::{Deserialize, Serialize};

use psc_core::RegistryId;

use crate::store::Entry;

/// Response after registering an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: RegistryId,
}

/// Acknowledgement for change and delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

/// Entries matching a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub entries: Vec<Entry>,
}
