//! Strategy requests: the unit of work broadcast down the tree each round.
//!
//! The frontend keeps two queues. General-info descriptors come from the
//! command line (or a tuning plugin) and are materialized lazily into full
//! requests. A request is serialized exactly once, when it is dispatched,
//! and the resulting buffer is sent unchanged to every child.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Strategy name that selects plugin-driven tuning instead of analysis.
pub const TUNE_STRATEGY: &str = "tune";

/// Descriptor of what to run, before candidate properties or scenarios are chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyGeneralInfo {
    pub strategy_name: String,
    pub pedantic: bool,
    pub delay_phases: u32,
    pub delay_seconds: u32,
    pub analysis_duration: u32,
}

impl StrategyGeneralInfo {
    /// Whether the analysis agents must skip phases or seconds before measuring.
    pub fn has_delay(&self) -> bool {
        self.delay_phases > 0 || self.delay_seconds > 0
    }
}

/// One tuning scenario to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: u32,
    pub description: String,
}

/// The candidate set a request evaluates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "items", rename_all = "snake_case")]
pub enum StrategyConfiguration {
    /// Candidate property ids; empty means "everything the strategy knows".
    PropertyIds(Vec<u32>),
    Scenarios(Vec<Scenario>),
}

/// A fully materialized request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRequest {
    pub general: StrategyGeneralInfo,
    pub configuration: StrategyConfiguration,
    /// Summarize findings per (id, region) instead of clustering by similarity.
    #[serde(default)]
    pub gather: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_request: Option<Box<StrategyRequest>>,
}

impl StrategyRequest {
    /// An analysis request with an empty candidate property list.
    pub fn analysis(general: StrategyGeneralInfo) -> Self {
        StrategyRequest {
            general,
            configuration: StrategyConfiguration::PropertyIds(Vec::new()),
            gather: false,
            sub_request: None,
        }
    }

    /// Encodes the request into the buffer carried by `start`.
    pub fn serialize(&self) -> Result<SerializedStrategy, CoreError> {
        Ok(SerializedStrategy(serde_json::to_string(self)?))
    }
}

/// An encoded strategy request, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerializedStrategy(String);

impl SerializedStrategy {
    pub fn decode(&self) -> Result<StrategyRequest, CoreError> {
        Ok(serde_json::from_str(&self.0)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The frontend's two request queues.
#[derive(Debug, Default)]
pub struct StrategyQueues {
    general: VecDeque<StrategyGeneralInfo>,
    requests: VecDeque<StrategyRequest>,
}

impl StrategyQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_general_info(&mut self, info: StrategyGeneralInfo) {
        self.general.push_back(info);
    }

    pub fn push_request(&mut self, request: StrategyRequest) {
        self.requests.push_back(request);
    }

    /// Total number of rounds still queued.
    pub fn pending(&self) -> usize {
        self.general.len() + self.requests.len()
    }

    /// Pops and serializes the next request to dispatch.
    ///
    /// Materialized requests go first; otherwise the next general-info
    /// descriptor becomes an analysis request. `None` means the search is over.
    pub fn next_serialized(&mut self) -> Result<Option<SerializedStrategy>, CoreError> {
        let request = match self.requests.pop_front() {
            Some(request) => request,
            None => match self.general.pop_front() {
                Some(info) => StrategyRequest::analysis(info),
                None => return Ok(None),
            },
        };
        request.serialize().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> StrategyGeneralInfo {
        StrategyGeneralInfo {
            strategy_name: name.to_string(),
            pedantic: false,
            delay_phases: 0,
            delay_seconds: 0,
            analysis_duration: 1,
        }
    }

    #[test]
    fn empty_queues_end_the_search() {
        let mut queues = StrategyQueues::new();
        assert_eq!(queues.pending(), 0);
        assert!(queues.next_serialized().unwrap().is_none());
    }

    #[test]
    fn materialized_requests_take_precedence() {
        let mut queues = StrategyQueues::new();
        queues.push_general_info(info("mpi"));
        let mut scenario_req = StrategyRequest::analysis(info("scenarios"));
        scenario_req.configuration = StrategyConfiguration::Scenarios(vec![Scenario {
            id: 1,
            description: "threads=4".to_string(),
        }]);
        queues.push_request(scenario_req.clone());
        assert_eq!(queues.pending(), 2);

        let first = queues.next_serialized().unwrap().unwrap();
        assert_eq!(first.decode().unwrap(), scenario_req);

        let second = queues.next_serialized().unwrap().unwrap().decode().unwrap();
        assert_eq!(second.general.strategy_name, "mpi");
        assert_eq!(second.configuration, StrategyConfiguration::PropertyIds(vec![]));
        assert!(queues.next_serialized().unwrap().is_none());
    }

    #[test]
    fn delay_detection() {
        let mut general = info("mpi");
        assert!(!general.has_delay());
        general.delay_phases = 2;
        assert!(general.has_delay());
    }

    #[test]
    fn nested_sub_request_survives_encoding() {
        let mut outer = StrategyRequest::analysis(info("outer"));
        outer.sub_request = Some(Box::new(StrategyRequest::analysis(info("inner"))));
        outer.gather = true;
        let buf = outer.serialize().unwrap();
        assert!(!buf.is_empty());
        assert_eq!(buf.decode().unwrap(), outer);
    }

    #[test]
    fn garbage_buffer_fails_to_decode() {
        let buf: SerializedStrategy = serde_json::from_str("\"not json\"").unwrap();
        assert!(matches!(buf.decode(), Err(CoreError::Strategy(_))));
    }
}
