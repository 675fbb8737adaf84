//! Per-child bookkeeping and the agent's own identity.
//!
//! [`AgentInfo`] is what a parent knows about one of its children. It is
//! plain data: the connection handle lives next to it in the runtime, so
//! this type stays serializable and free of I/O.

use serde::{Deserialize, Serialize};

use crate::id::{RegistryId, Tag};

/// Readiness of a child as seen by its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    /// Known from topology or registry, no heartbeat yet.
    Initial,
    /// At least one heartbeat received.
    Started,
    /// The parent holds an outbound link to the child.
    Connected,
}

/// Outcome a child reported for the current search round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    ReqRestart,
    ReqExperiment,
    Finished,
    /// Nothing reported yet for this round.
    Undefined,
}

/// A parent's record of one child relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub tag: Tag,
    pub hostname: String,
    pub port: u16,
    pub status: ChildStatus,
    /// Shadow status used to re-synchronize after an application restart.
    pub status_reinit: ChildStatus,
    pub properties_sent: bool,
    pub appl_terminated: bool,
    pub calltree_sent: bool,
    pub search_status: SearchStatus,
}

impl AgentInfo {
    /// A child known only by tag, waiting for its first heartbeat.
    pub fn new(tag: Tag) -> Self {
        AgentInfo {
            tag,
            hostname: String::new(),
            port: 0,
            status: ChildStatus::Initial,
            status_reinit: ChildStatus::Initial,
            properties_sent: false,
            appl_terminated: false,
            calltree_sent: false,
            search_status: SearchStatus::Undefined,
        }
    }

    /// Whether the child has heartbeated at least once.
    pub fn is_started(&self) -> bool {
        matches!(self.status, ChildStatus::Started | ChildStatus::Connected)
    }

    /// Applies a heartbeat from this child.
    ///
    /// The first heartbeat moves `status` from `Initial` to `Started`; any
    /// later one marks the post-restart shadow status instead. Returns `true`
    /// when this was the first heartbeat.
    pub fn record_heartbeat(&mut self, hostname: &str, port: u16) -> bool {
        let first = self.status == ChildStatus::Initial;
        if first {
            self.status = ChildStatus::Started;
        } else {
            self.status_reinit = ChildStatus::Started;
        }
        self.hostname = hostname.to_string();
        self.port = port;
        self.properties_sent = false;
        first
    }

    /// Resets the per-round flags before a restart.
    pub fn prepare_restart(&mut self) {
        self.appl_terminated = false;
        self.search_status = SearchStatus::Undefined;
        self.status_reinit = ChildStatus::Initial;
    }
}

/// The identity of the agent running in this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub tag: Tag,
    pub hostname: String,
    pub port: u16,
    pub parent: Option<Tag>,
    /// Registry id; reassigned without contacting the registry in fast mode.
    pub registry_id: Option<RegistryId>,
    pub status: ChildStatus,
    pub search_status: SearchStatus,
}

impl AgentIdentity {
    pub fn new(tag: Tag, hostname: impl Into<String>, parent: Option<Tag>) -> Self {
        AgentIdentity {
            tag,
            hostname: hostname.into(),
            port: 0,
            parent,
            registry_id: None,
            status: ChildStatus::Initial,
            search_status: SearchStatus::Undefined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    #[test]
    fn first_heartbeat_starts_child() {
        let mut info = AgentInfo::new(tag("fe[1]:0"));
        assert!(!info.is_started());

        assert!(info.record_heartbeat("node01", 30001));
        assert_eq!(info.status, ChildStatus::Started);
        assert_eq!(info.status_reinit, ChildStatus::Initial);
        assert_eq!(info.hostname, "node01");
        assert_eq!(info.port, 30001);
        assert!(info.is_started());
    }

    #[test]
    fn later_heartbeat_only_marks_reinit() {
        let mut info = AgentInfo::new(tag("fe[1]:0"));
        info.record_heartbeat("node01", 30001);
        info.status = ChildStatus::Connected;
        info.properties_sent = true;

        info.prepare_restart();
        assert_eq!(info.status_reinit, ChildStatus::Initial);

        assert!(!info.record_heartbeat("node02", 30005));
        assert_eq!(info.status, ChildStatus::Connected);
        assert_eq!(info.status_reinit, ChildStatus::Started);
        assert_eq!(info.hostname, "node02");
        assert!(!info.properties_sent);
    }

    #[test]
    fn prepare_restart_clears_round_state() {
        let mut info = AgentInfo::new(tag("fe[1]:0"));
        info.appl_terminated = true;
        info.search_status = SearchStatus::ReqRestart;
        info.status_reinit = ChildStatus::Started;

        info.prepare_restart();
        assert!(!info.appl_terminated);
        assert_eq!(info.search_status, SearchStatus::Undefined);
        assert_eq!(info.status_reinit, ChildStatus::Initial);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SearchStatus::ReqExperiment).unwrap();
        assert_eq!(json, "\"req_experiment\"");
    }
}
