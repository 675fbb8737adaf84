//! Per-agent context handed to every component.
//!
//! Holds what would otherwise be process-wide state: the discovery
//! strategy (and with it the registry client), the shared HTTP client for
//! peer links, the global timeout and the timer settings. Each agent owns
//! its context; in-process agents get their own clone.

use std::time::Duration;

use tokio::time::Instant;

use psc_registry::RegistryClient;

use crate::timeout::GlobalTimeout;

/// How agents find each other.
#[derive(Debug, Clone)]
pub enum Discovery {
    /// Rendezvous through the registry service.
    Registry(RegistryClient),
    /// Deterministic ids and endpoints; the registry is never contacted.
    Fast,
}

/// Timer and retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// Delay before the first barrier check.
    pub barrier_first: Duration,
    /// Interval between barrier checks.
    pub barrier_interval: Duration,
    /// Pause between attempts to reach the parent.
    pub connect_retry: Duration,
    /// How long `quit` waits for application entries to disappear.
    pub quit_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            barrier_first: Duration::from_secs(2),
            barrier_interval: Duration::from_secs(1),
            connect_retry: Duration::from_secs(1),
            quit_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentContext {
    pub app_name: String,
    /// Host name this agent advertises to its peers.
    pub hostname: String,
    pub site: String,
    pub machine: String,
    pub discovery: Discovery,
    pub timeout: GlobalTimeout,
    pub timings: Timings,
    pub http: reqwest::Client,
}

impl AgentContext {
    pub fn new(
        app_name: impl Into<String>,
        hostname: impl Into<String>,
        discovery: Discovery,
        timeout: GlobalTimeout,
    ) -> Self {
        AgentContext {
            app_name: app_name.into(),
            hostname: hostname.into(),
            site: String::new(),
            machine: String::new(),
            discovery,
            timeout,
            timings: Timings::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_site(mut self, site: impl Into<String>, machine: impl Into<String>) -> Self {
        self.site = site.into();
        self.machine = machine.into();
        self
    }

    pub fn registry(&self) -> Option<&RegistryClient> {
        match &self.discovery {
            Discovery::Registry(client) => Some(client),
            Discovery::Fast => None,
        }
    }

    pub fn is_fast(&self) -> bool {
        matches!(self.discovery, Discovery::Fast)
    }

    /// Deadline for any blocking wait started now.
    pub fn deadline(&self) -> Instant {
        self.timeout.deadline()
    }
}
