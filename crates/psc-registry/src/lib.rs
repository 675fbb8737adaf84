//! Rendezvous registry for the agent hierarchy.
//!
//! Agents and application processes register an [`Entry`] describing where
//! they listen; parents query by tag and application name to find their
//! children and vice versa. The crate holds both sides: an in-memory store
//! served over HTTP ([`router::build_router`]) and the [`RegistryClient`]
//! every agent uses, with retries bounded by the caller's deadline.

pub mod client;
pub mod error;
pub mod handlers;
pub mod router;
pub mod schema;
pub mod state;
pub mod store;

pub use client::RegistryClient;
pub use error::{ApiError, RegistryError};
pub use store::{Entry, EntryData, EntryFilter, MemoryRegistry};

/// Component name of application processes.
pub const COMP_APPLICATION: &str = "MRIMONITOR";
/// Component name of the frontend.
pub const COMP_FRONTEND: &str = "PeriscopeFrontend";
/// Component name of interior agents.
pub const COMP_HL_AGENT: &str = "Periscope HL Agent";
/// Component name of leaf agents.
pub const COMP_ANALYSIS_AGENT: &str = "Periscope Analysis Agent";
/// Tag application processes register with.
pub const APPLICATION_TAG: &str = "none";

/// Serves the registry on an already-bound listener until the task is dropped.
pub async fn serve(listener: tokio::net::TcpListener, state: state::RegistryState) -> std::io::Result<()> {
    let app = router::build_router(state);
    axum::serve(listener, app).await
}
