//! Reconciling the children's search outcomes into one decision.
//!
//! Priority is restart over experiment over finished. A child that has not
//! reported yet holds the whole decision back, whatever the others said.

use serde::{Deserialize, Serialize};

use crate::agent_info::SearchStatus;

/// What the parent does next with its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Relaunch the application (or shut down if that is no longer allowed).
    Restart,
    /// Run another experiment in the same application instance.
    Experiment,
    /// Dispatch the next strategy request, or finish.
    Finished,
}

impl Decision {
    /// The status an interior agent reports upward for this decision.
    pub fn as_search_status(self) -> SearchStatus {
        match self {
            Decision::Restart => SearchStatus::ReqRestart,
            Decision::Experiment => SearchStatus::ReqExperiment,
            Decision::Finished => SearchStatus::Finished,
        }
    }

    /// Escalates an in-place experiment to a restart when new regions must
    /// be instrumented first.
    pub fn escalate(self, reinstrumentation_pending: bool) -> Decision {
        match self {
            Decision::Experiment if reinstrumentation_pending => Decision::Restart,
            other => other,
        }
    }
}

/// Aggregates child statuses, or `None` while any child is still undecided.
///
/// An empty set of children aggregates to `Finished`.
pub fn aggregate<I>(statuses: I) -> Option<Decision>
where
    I: IntoIterator<Item = SearchStatus>,
{
    let mut decision = Decision::Finished;
    for status in statuses {
        match status {
            SearchStatus::Undefined => return None,
            SearchStatus::ReqRestart => decision = Decision::Restart,
            SearchStatus::ReqExperiment if decision == Decision::Finished => {
                decision = Decision::Experiment
            }
            SearchStatus::ReqExperiment | SearchStatus::Finished => {}
        }
    }
    Some(decision)
}
