//! State and operations shared by every agent role.
//!
//! [`AgentBase`] owns the agent's endpoint, its reactor, the link to its
//! parent and the child map. Children are stored by value together with
//! their outbound link and protocol machine, so removing a child drops its
//! connection.

use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use psc_core::{
    aggregate, AgentIdentity, AgentInfo, ChildStatus, Decision, ProtocolEvent, ProtocolMachine,
    ProtocolState, RegistryId, Tag,
};
use psc_registry::{EntryData, EntryFilter};

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::reactor::Reactor;
use crate::transport::{HeartbeatKind, Inbound, Message, PeerLink};

/// Where to find the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentLocator {
    /// The frontend has no parent.
    None,
    /// Look the parent up in the registry by tag.
    Registry,
    /// Fixed endpoint handed over by the starter (fast mode).
    Static { host: String, port: u16 },
}

/// A parent's view of one child: bookkeeping, connection and protocol state.
#[derive(Debug)]
pub struct ChildAgent {
    pub info: AgentInfo,
    link: Option<PeerLink>,
    pub protocol: ProtocolMachine,
    /// A `check` went out and its `propertiessent` has not come back.
    pub check_pending: bool,
}

impl ChildAgent {
    pub fn new(info: AgentInfo) -> Self {
        ChildAgent {
            info,
            link: None,
            protocol: ProtocolMachine::new(),
            check_pending: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Applies a heartbeat, dropping the link if the child moved.
    pub fn record_heartbeat(&mut self, hostname: &str, port: u16) -> bool {
        if self.info.hostname != hostname || self.info.port != port {
            self.link = None;
            if self.info.status == ChildStatus::Connected {
                self.info.status = ChildStatus::Started;
            }
        }
        self.info.record_heartbeat(hostname, port)
    }
}

pub struct AgentBase {
    pub ctx: AgentContext,
    pub identity: AgentIdentity,
    pub children: IndexMap<Tag, ChildAgent>,
    pub reactor: Reactor,
    parent: ParentLocator,
    parent_link: Option<PeerLink>,
    server: JoinHandle<()>,
}

impl AgentBase {
    /// Wraps an opened endpoint. The identity takes the endpoint's port.
    pub fn new(
        ctx: AgentContext,
        mut identity: AgentIdentity,
        inbound: Inbound,
        parent: ParentLocator,
    ) -> Self {
        identity.port = inbound.port;
        AgentBase {
            ctx,
            identity,
            children: IndexMap::new(),
            reactor: Reactor::new(inbound.inbox),
            parent,
            parent_link: None,
            server: inbound.server,
        }
    }

    pub fn tag(&self) -> &Tag {
        &self.identity.tag
    }

    pub fn port(&self) -> u16 {
        self.identity.port
    }

    fn entry_data(&self, comp: &str) -> EntryData {
        EntryData {
            app: self.ctx.app_name.clone(),
            site: self.ctx.site.clone(),
            mach: self.ctx.machine.clone(),
            node: self.ctx.hostname.clone(),
            port: self.identity.port,
            pid: std::process::id(),
            comp: comp.to_string(),
            tag: self.identity.tag.to_string(),
        }
    }

    /// Registers this agent under its current tag. No-op in fast mode.
    pub async fn register_self(&mut self, comp: &str) -> Result<Option<RegistryId>, AgentError> {
        let Some(registry) = self.ctx.registry() else {
            return Ok(None);
        };
        let id = registry
            .register(&self.entry_data(comp), self.ctx.deadline())
            .await?;
        tracing::debug!(tag = %self.identity.tag, %id, "registered");
        self.identity.registry_id = Some(id);
        Ok(Some(id))
    }

    /// Renames this agent and updates its registry entry.
    pub async fn retag(&mut self, tag: Tag, comp: &str) -> Result<(), AgentError> {
        self.identity.tag = tag;
        if let (Some(registry), Some(id)) = (self.ctx.registry(), self.identity.registry_id) {
            registry
                .change(id, &self.entry_data(comp), self.ctx.deadline())
                .await?;
        }
        Ok(())
    }

    /// Removes this agent's registry entry; failures are only logged.
    pub async fn deregister(&mut self) {
        let (Some(registry), Some(id)) = (self.ctx.registry(), self.identity.registry_id.take())
        else {
            return;
        };
        if let Err(err) = registry.try_delete(id).await {
            tracing::warn!(tag = %self.identity.tag, error = %err, "could not remove registry entry");
        }
    }

    /// Connects to the parent, retrying until the global deadline.
    ///
    /// A no-op once connected. Failure is fatal.
    pub async fn connect_to_parent(&mut self) -> Result<(), AgentError> {
        if self.parent_link.is_some() {
            return Ok(());
        }
        let Some(parent_tag) = self.identity.parent.clone() else {
            return Err(AgentError::Config("agent has no parent".into()));
        };
        let deadline = self.ctx.deadline();

        let (host, port) = match &self.parent {
            ParentLocator::Static { host, port } => (host.clone(), *port),
            ParentLocator::Registry => {
                let registry = self
                    .ctx
                    .registry()
                    .ok_or_else(|| AgentError::Config("registry lookup without a registry".into()))?;
                let filter = EntryFilter::agent(&self.ctx.app_name, parent_tag.as_str());
                let found = registry.query_nonempty(&filter, deadline).await?;
                let entry = found
                    .into_iter()
                    .next()
                    .ok_or_else(|| AgentError::ParentUnreachable {
                        tag: parent_tag.clone(),
                    })?;
                (entry.data.node, entry.data.port)
            }
            ParentLocator::None => return Err(AgentError::Config("agent has no parent".into())),
        };

        let link = PeerLink::new(self.ctx.http.clone(), &host, port);
        loop {
            match link.probe().await {
                Ok(()) => break,
                Err(err) => {
                    if Instant::now() + self.ctx.timings.connect_retry > deadline {
                        tracing::error!(parent = %parent_tag, error = %err, "giving up on parent");
                        return Err(AgentError::ParentUnreachable { tag: parent_tag });
                    }
                    tracing::debug!(parent = %parent_tag, error = %err, "parent not up yet");
                    tokio::time::sleep(self.ctx.timings.connect_retry).await;
                }
            }
        }
        tracing::info!(tag = %self.identity.tag, parent = %parent_tag, url = link.base_url(), "connected to parent");
        self.parent_link = Some(link);
        Ok(())
    }

    /// Adds a child unless one with the same tag is already known.
    pub fn add_child(&mut self, info: AgentInfo) -> &mut ChildAgent {
        self.children
            .entry(info.tag.clone())
            .or_insert_with(|| ChildAgent::new(info))
    }

    pub fn remove_child(&mut self, tag: &Tag) -> Option<ChildAgent> {
        self.children.shift_remove(tag)
    }

    pub fn child(&self, tag: &Tag) -> Option<&ChildAgent> {
        self.children.get(tag)
    }

    pub fn child_mut(&mut self, tag: &Tag) -> Result<&mut ChildAgent, AgentError> {
        self.children
            .get_mut(tag)
            .ok_or_else(|| AgentError::UnknownChild { tag: tag.clone() })
    }

    pub fn child_infos(&self) -> impl Iterator<Item = &AgentInfo> {
        self.children.values().map(|c| &c.info)
    }

    pub fn child_tags(&self) -> Vec<Tag> {
        self.children.keys().cloned().collect()
    }

    /// Opens the outbound link to a child. Tries once.
    pub async fn connect_to_child(&mut self, tag: &Tag) -> Result<(), AgentError> {
        let http = self.ctx.http.clone();
        let child = self.child_mut(tag)?;
        if child.link.is_some() {
            return Ok(());
        }
        if child.info.hostname.is_empty() || child.info.port == 0 {
            return Err(AgentError::ChildUnreachable {
                tag: tag.clone(),
                reason: "endpoint not known yet".into(),
            });
        }
        let link = PeerLink::new(http, &child.info.hostname, child.info.port);
        link.probe()
            .await
            .map_err(|err| AgentError::ChildUnreachable {
                tag: tag.clone(),
                reason: err.to_string(),
            })?;
        child.link = Some(link);
        child.info.status = ChildStatus::Connected;
        Ok(())
    }

    pub async fn send_to_parent(&mut self, message: Message) -> Result<(), AgentError> {
        self.connect_to_parent().await?;
        let parent_tag = self
            .identity
            .parent
            .clone()
            .ok_or_else(|| AgentError::Config("agent has no parent".into()))?;
        let Some(link) = &self.parent_link else {
            return Err(AgentError::ParentUnreachable { tag: parent_tag });
        };
        tracing::trace!(to = %parent_tag, message = message.name(), "send");
        match link.send(&self.identity.tag, &message).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AgentError::ParentSend {
                tag: parent_tag,
                reason: "inbox closed".into(),
            }),
            Err(err) => Err(AgentError::ParentSend {
                tag: parent_tag,
                reason: err.to_string(),
            }),
        }
    }

    pub async fn send_to_child(&mut self, tag: &Tag, message: &Message) -> Result<(), AgentError> {
        self.connect_to_child(tag).await?;
        let from = self.identity.tag.clone();
        let child = self.child_mut(tag)?;
        let Some(link) = &child.link else {
            return Err(AgentError::ChildUnreachable {
                tag: tag.clone(),
                reason: "not connected".into(),
            });
        };
        tracing::trace!(to = %tag, message = message.name(), "send");
        match link.send(&from, message).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AgentError::ChildSend {
                tag: tag.clone(),
                reason: "inbox closed".into(),
            }),
            Err(err) => {
                // force a reconnect next time
                child.link = None;
                Err(AgentError::ChildSend {
                    tag: tag.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Sends `message` to every child; returns how many got it.
    pub async fn broadcast(&mut self, message: &Message) -> usize {
        let mut delivered = 0;
        for tag in self.child_tags() {
            match self.send_to_child(&tag, message).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(child = %tag, message = message.name(), error = %err, "child not reached")
                }
            }
        }
        delivered
    }

    /// Heartbeat describing this agent.
    pub fn heartbeat(&self, kind: HeartbeatKind, num_procs: u32) -> Message {
        Message::Heartbeat {
            hostname: self.ctx.hostname.clone(),
            port: self.identity.port,
            tag: self.identity.tag.clone(),
            heartbeat: kind,
            num_procs,
        }
    }

    /// Feeds an event to a child's protocol machine, logging violations.
    pub fn protocol_event(&mut self, tag: &Tag, event: ProtocolEvent) {
        let Some(child) = self.children.get_mut(tag) else {
            tracing::warn!(child = %tag, %event, "protocol event for unknown child");
            return;
        };
        if let Err(err) = child.protocol.fire(event) {
            tracing::warn!(
                child = %tag,
                state = %err.state,
                event = %err.event,
                "protocol violation"
            );
        }
    }

    /// Moves every child that is waiting for a decision on.
    pub fn decide_continuation(&mut self) {
        let deciding: Vec<Tag> = self
            .children
            .iter()
            .filter(|(_, c)| c.protocol.state() == ProtocolState::DecidingContinuation)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in deciding {
            self.protocol_event(&tag, ProtocolEvent::DecideContinuation);
        }
    }

    /// Aggregated search outcome of the children, or `None` while undecided.
    pub fn search_decision(&self) -> Option<Decision> {
        aggregate(self.children.values().map(|c| c.info.search_status))
    }
}

impl Drop for AgentBase {
    fn drop(&mut self) {
        self.server.abort();
    }
}
