//! In-memory entry store.
//!
//! [`MemoryRegistry`] is backed by `DashMap` so concurrent handler tasks can
//! read and write without a global lock. Ids start at 1 and are never reused.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use psc_core::RegistryId;

/// What a component registers about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    /// Application name the component belongs to.
    pub app: String,
    pub site: String,
    pub mach: String,
    /// Host the component runs on.
    pub node: String,
    pub port: u16,
    /// OS pid for agents; rank + 1 for application processes.
    pub pid: u32,
    /// Component kind, e.g. `Periscope HL Agent`.
    pub comp: String,
    pub tag: String,
}

/// A stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: RegistryId,
    #[serde(flatten)]
    pub data: EntryData,
}

/// Query filter; every field that is set must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RegistryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mach: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl EntryFilter {
    /// Filter for the processes of one application.
    pub fn application(app: &str) -> Self {
        EntryFilter {
            app: Some(app.to_string()),
            comp: Some(crate::COMP_APPLICATION.to_string()),
            tag: Some(crate::APPLICATION_TAG.to_string()),
            ..Default::default()
        }
    }

    /// Filter for the agent registered under `tag` for `app`.
    pub fn agent(app: &str, tag: &str) -> Self {
        EntryFilter {
            app: Some(app.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        fn eq<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
            want.as_ref().map_or(true, |w| w == have)
        }
        let d = &entry.data;
        eq(&self.id, &entry.id)
            && eq(&self.app, &d.app)
            && eq(&self.site, &d.site)
            && eq(&self.mach, &d.mach)
            && eq(&self.node, &d.node)
            && eq(&self.port, &d.port)
            && eq(&self.pid, &d.pid)
            && eq(&self.comp, &d.comp)
            && eq(&self.tag, &d.tag)
    }
}

/// Concurrent registry store.
pub struct MemoryRegistry {
    entries: DashMap<RegistryId, Entry>,
    next_id: AtomicU32,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry {
            entries: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Stores a new entry, returning its id.
    pub fn register(&self, data: EntryData) -> RegistryId {
        let id = RegistryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(id, Entry { id, data });
        id
    }

    /// Replaces the data of an existing entry. Returns `false` if unknown.
    pub fn change(&self, id: RegistryId, data: EntryData) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.data = data;
                true
            }
            None => false,
        }
    }

    /// Removes an entry. Returns `true` if it existed.
    pub fn delete(&self, id: RegistryId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// All matching entries, ordered by id.
    pub fn query(&self, filter: &EntryFilter) -> Vec<Entry> {
        let mut found: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|e| e.id);
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(app: &str, comp: &str, tag: &str) -> EntryData {
        EntryData {
            app: app.to_string(),
            comp: comp.to_string(),
            tag: tag.to_string(),
            node: "node01".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn ids_are_sequential_and_not_reused() {
        let reg = MemoryRegistry::new();
        let a = reg.register(data("app", "x", "t"));
        let b = reg.register(data("app", "x", "t"));
        assert_eq!((a, b), (RegistryId(1), RegistryId(2)));
        assert!(reg.delete(b));
        assert!(!reg.delete(b));
        assert_eq!(reg.register(data("app", "x", "t")), RegistryId(3));
    }

    #[test]
    fn query_matches_all_set_fields() {
        let reg = MemoryRegistry::new();
        reg.register(data("app", crate::COMP_APPLICATION, "none"));
        reg.register(data("app", crate::COMP_APPLICATION, "none"));
        reg.register(data("other", crate::COMP_APPLICATION, "none"));
        reg.register(data("app", crate::COMP_HL_AGENT, "fe[1]:0"));

        assert_eq!(reg.query(&EntryFilter::application("app")).len(), 2);
        let agent = reg.query(&EntryFilter::agent("app", "fe[1]:0"));
        assert_eq!(agent.len(), 1);
        assert_eq!(agent[0].id, RegistryId(4));
        assert_eq!(reg.query(&EntryFilter::default()).len(), 4);
    }

    #[test]
    fn change_replaces_data() {
        let reg = MemoryRegistry::new();
        let id = reg.register(data("app", crate::COMP_FRONTEND, "fe"));
        assert!(reg.change(id, data("app", crate::COMP_FRONTEND, "fe[1]")));
        assert!(!reg.change(RegistryId(99), data("app", "x", "y")));
        let found = reg.query(&EntryFilter {
            tag: Some("fe[1]".to_string()),
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
    }
}
