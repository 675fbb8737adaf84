//! Agent runtime errors.
//!
//! [`AgentError::is_fatal`] splits the taxonomy in two. Fatal errors stop
//! the agent (or the frontend's run) and surface at the binary as a
//! non-zero exit. Recoverable errors concern a single child and are logged
//! by the caller, which carries on with the rest of the round.

use std::path::PathBuf;

use psc_core::{CoreError, Tag};
use psc_registry::RegistryError;

use crate::lifecycle::LifecycleError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Every candidate port was taken.
    #[error("no free listening port after {attempts} attempts starting at {first}")]
    PortsExhausted { first: u16, attempts: u32 },

    #[error("cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("parent agent {tag} not reachable before the deadline")]
    ParentUnreachable { tag: Tag },

    #[error("lost connection to parent {tag}: {reason}")]
    ParentSend { tag: Tag, reason: String },

    /// A single outbound connection attempt failed.
    #[error("cannot connect to child {tag}: {reason}")]
    ChildUnreachable { tag: Tag, reason: String },

    #[error("message to child {tag} not delivered: {reason}")]
    ChildSend { tag: Tag, reason: String },

    #[error("no child agent with tag {tag}")]
    UnknownChild { tag: Tag },

    /// A broadcast the run depends on reached none of the children.
    #[error("no child agent reachable for {message}")]
    HierarchyUnreachable { message: &'static str },

    /// A startup, reinit or termination barrier ran past its deadline.
    #[error("Timed out waiting for child agent(s) ({step})")]
    BarrierTimeout { step: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot load config file {path}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("cannot launch: {0}")]
    Launch(String),

    #[error("cannot write properties to {path}: {reason}")]
    Export { path: PathBuf, reason: String },

    #[error("analysis backend: {0}")]
    Backend(String),
}

impl AgentError {
    /// Whether this error must stop the agent.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AgentError::ChildUnreachable { .. }
                | AgentError::ChildSend { .. }
                | AgentError::UnknownChild { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_failures_are_recoverable() {
        let tag = Tag::parse("fe[1]:0").unwrap();
        assert!(!AgentError::ChildUnreachable {
            tag: tag.clone(),
            reason: "refused".into()
        }
        .is_fatal());
        assert!(!AgentError::UnknownChild { tag: tag.clone() }.is_fatal());
        assert!(AgentError::ParentUnreachable { tag }.is_fatal());
        assert!(AgentError::BarrierTimeout { step: "startup" }.is_fatal());
        assert!(AgentError::Registry(RegistryError::Timeout { op: "query" }).is_fatal());
    }

    #[test]
    fn barrier_timeout_message() {
        let err = AgentError::BarrierTimeout { step: "startup" };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for child agent(s) (startup)"
        );
    }
}
