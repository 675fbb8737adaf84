//! The three agent roles built on [`crate::agent::AgentBase`].

pub mod analysis;
pub mod frontend;
pub mod hlagent;

pub use analysis::{AnalysisAgent, AnalysisAgentConfig};
pub use frontend::{Frontend, RunReport};
pub use hlagent::{HlAgent, HlAgentConfig};

use crate::error::AgentError;

/// Logs a recoverable handler error and passes a fatal one on.
pub(crate) fn absorb(tag: &psc_core::Tag, result: Result<(), AgentError>) -> Result<(), AgentError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            tracing::warn!(%tag, error = %err, "handler failed, continuing");
            Ok(())
        }
    }
}
