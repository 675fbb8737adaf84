//! Agent runtime of the hierarchy.
//!
//! One binary plays three roles: the [`roles::Frontend`] at the root, the
//! interior [`roles::HlAgent`]s and the leaf [`roles::AnalysisAgent`]s.
//! Every role is an [`agent::AgentBase`] driven by a single-task
//! [`reactor::Reactor`]; messages travel over the HTTP [`transport`].

pub mod agent;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod reactor;
pub mod roles;
pub mod starter;
pub mod timeout;
pub mod transport;

pub use agent::ParentLocator;
pub use backend::{AnalysisBackend, ExperimentOutcome, SimulatedBackend};
pub use config::{Environment, FileConfig, FrontendConfig, FrontendOptions, RegistryAddr};
pub use context::{AgentContext, Discovery, Timings};
pub use error::AgentError;
pub use roles::{AnalysisAgent, AnalysisAgentConfig, Frontend, HlAgent, HlAgentConfig, RunReport};
pub use starter::{ApplicationStarter, InProcessStarter, LaunchPlan, ProcessStarter};
pub use timeout::GlobalTimeout;
