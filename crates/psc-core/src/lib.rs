//! Data model and pure algorithms of the agent hierarchy.
//!
//! Nothing in this crate performs I/O. The agent runtime (`psc-agents`)
//! owns the network and the event loop and calls into these types to decide
//! what to do with each message.

pub mod agent_info;
pub mod barrier;
pub mod calltree;
pub mod cluster;
pub mod decision;
pub mod error;
pub mod id;
pub mod idmap;
pub mod property;
pub mod protocol;
pub mod strategy;
pub mod topology;

// Re-export commonly used types
pub use agent_info::{AgentIdentity, AgentInfo, ChildStatus, SearchStatus};
pub use barrier::HeartbeatTally;
pub use calltree::CallTreeNode;
pub use decision::{aggregate, Decision};
pub use error::CoreError;
pub use id::{RegistryId, Tag};
pub use idmap::IdMap;
pub use property::{ExecObj, Property};
pub use protocol::{InvalidTransition, ProtocolEvent, ProtocolMachine, ProtocolState};
pub use strategy::{SerializedStrategy, StrategyGeneralInfo, StrategyQueues, StrategyRequest};
pub use topology::{AgentDescriptor, AgentKind, ProcessEntry, Topology, TopologyParams};
