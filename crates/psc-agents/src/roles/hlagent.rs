//! Interior agent: relays requests down, aggregates answers up.
//!
//! Search outcomes are reconciled with the same priority rule the frontend
//! uses. Properties are buffered until every child has sent its batch, then
//! clustered (or gathered) and forwarded in one go.

use psc_core::barrier::{all_properties_sent, all_reinit_started, all_started, all_terminated};
use psc_core::{
    cluster, AgentIdentity, AgentInfo, Decision, Property, ProtocolEvent, SearchStatus,
    SerializedStrategy, Tag,
};
use psc_registry::COMP_HL_AGENT;

use crate::agent::{AgentBase, ParentLocator};
use crate::context::AgentContext;
use crate::error::AgentError;
use crate::reactor::{Event, TimerAction};
use crate::roles::absorb;
use crate::transport::{HeartbeatKind, Inbound, Message};

#[derive(Debug, Clone)]
pub struct HlAgentConfig {
    pub tag: Tag,
    pub parent: Tag,
    pub port: u16,
    pub parent_locator: ParentLocator,
    pub children: Vec<Tag>,
    /// Forward properties as they arrive instead of clustering them.
    pub dontcluster: bool,
}

pub struct HlAgent {
    base: AgentBase,
    nocluster: bool,
    gather: bool,
    pending: Vec<Property>,
    hot_regions: Vec<Property>,
}

impl HlAgent {
    pub async fn open(ctx: AgentContext, config: HlAgentConfig) -> Result<Self, AgentError> {
        let inbound = Inbound::open(config.port).await?;
        Ok(Self::with_inbound(ctx, config, inbound))
    }

    pub fn with_inbound(ctx: AgentContext, config: HlAgentConfig, inbound: Inbound) -> Self {
        let identity = AgentIdentity::new(config.tag, ctx.hostname.clone(), Some(config.parent));
        let mut base = AgentBase::new(ctx, identity, inbound, config.parent_locator);
        for tag in config.children {
            base.add_child(AgentInfo::new(tag));
        }
        HlAgent {
            base,
            nocluster: config.dontcluster,
            gather: false,
            pending: Vec::new(),
            hot_regions: Vec::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.base.port()
    }

    pub async fn run(mut self) -> Result<(), AgentError> {
        self.base.register_self(COMP_HL_AGENT).await?;
        self.base.connect_to_parent().await?;

        if self.base.ctx.is_fast() {
            // children are counted by the frontend; announce right away
            self.announce().await?;
        } else {
            let timings = self.base.ctx.timings.clone();
            self.base.reactor.set_timer(
                TimerAction::Startup,
                timings.barrier_first,
                timings.barrier_interval,
            );
        }
        tracing::info!(tag = %self.base.tag(), children = self.base.children.len(), "HL agent up");

        let result = self.event_loop().await;
        self.base.deregister().await;
        result
    }

    async fn announce(&mut self) -> Result<(), AgentError> {
        let heartbeat = self.base.heartbeat(HeartbeatKind::Own, 0);
        self.base.send_to_parent(heartbeat).await
    }

    async fn event_loop(&mut self) -> Result<(), AgentError> {
        while let Some(event) = self.base.reactor.next_event().await {
            let result = match event {
                Event::Message(envelope) => self.handle(envelope.from, envelope.message).await,
                Event::Timer(action) => self.handle_step(action).await,
                Event::Operator(_) => Ok(()),
            };
            absorb(self.base.tag(), result)?;
        }
        Ok(())
    }

    async fn handle_step(&mut self, action: TimerAction) -> Result<(), AgentError> {
        let done = match action {
            TimerAction::Startup => all_started(self.base.child_infos()),
            TimerAction::StartupReinit => all_reinit_started(self.base.child_infos()),
            TimerAction::ApplicationTermination => return Ok(()),
        };
        if done {
            self.base.reactor.cancel_timer();
            tracing::debug!(tag = %self.base.tag(), step = action.label(), "children ready");
            return self.announce().await;
        }
        if self.base.ctx.timeout.timed_out() {
            tracing::error!(tag = %self.base.tag(), step = action.label(), "Timed out waiting for child agent(s)");
            self.base.reactor.cancel_timer();
            return Err(AgentError::BarrierTimeout {
                step: action.label(),
            });
        }
        Ok(())
    }

    async fn handle(&mut self, from: Option<Tag>, message: Message) -> Result<(), AgentError> {
        match message {
            Message::Heartbeat {
                hostname,
                port,
                tag,
                heartbeat,
                num_procs,
            } => {
                self.on_heartbeat(hostname, port, tag, heartbeat, num_procs)
                    .await
            }
            Message::SearchFinished { tag } => self.on_search_status(tag, SearchStatus::Finished).await,
            Message::ReqExperiment { tag } => {
                self.on_search_status(tag, SearchStatus::ReqExperiment).await
            }
            Message::NeedRestart { tag } => self.on_search_status(tag, SearchStatus::ReqRestart).await,
            Message::FoundProp { property } => self.on_found_property(from, property).await,
            Message::PropertiesSent { tag } => self.on_properties_sent(tag).await,
            Message::Terminated { tag } => self.on_terminated(tag).await,
            Message::CallTree { node } => self.base.send_to_parent(Message::CallTree { node }).await,
            Message::CallTreeSent { tag } => self.on_call_tree_sent(tag).await,

            Message::Start { strategy } => self.on_start(strategy).await,
            Message::StartExperiment => {
                self.base.broadcast(&Message::StartExperiment).await;
                Ok(())
            }
            Message::Check => {
                for child in self.base.children.values_mut() {
                    child.info.properties_sent = false;
                }
                self.base.broadcast(&Message::Check).await;
                Ok(())
            }
            Message::Reinit { map } => {
                for child in self.base.children.values_mut() {
                    child.info.prepare_restart();
                }
                self.base.broadcast(&Message::Reinit { map }).await;
                let timings = self.base.ctx.timings.clone();
                self.base.reactor.set_timer(
                    TimerAction::StartupReinit,
                    timings.barrier_first,
                    timings.barrier_interval,
                );
                Ok(())
            }
            Message::Terminate => {
                for child in self.base.children.values_mut() {
                    child.info.appl_terminated = false;
                }
                self.base.broadcast(&Message::Terminate).await;
                Ok(())
            }
            Message::SerializeCallTree => {
                for child in self.base.children.values_mut() {
                    child.info.calltree_sent = false;
                }
                self.base.broadcast(&Message::SerializeCallTree).await;
                Ok(())
            }
            Message::Quit => {
                self.base.broadcast(&Message::Quit).await;
                self.base.reactor.stop();
                Ok(())
            }
        }
    }

    async fn on_heartbeat(
        &mut self,
        hostname: String,
        port: u16,
        tag: Tag,
        kind: HeartbeatKind,
        num_procs: u32,
    ) -> Result<(), AgentError> {
        let fast = self.base.ctx.is_fast();
        match kind {
            HeartbeatKind::Own => {
                if fast && self.base.child(&tag).is_none() {
                    self.base.add_child(AgentInfo::new(tag.clone()));
                }
                let first = self.base.child_mut(&tag)?.record_heartbeat(&hostname, port);
                tracing::debug!(child = %tag, %hostname, port, first, "heartbeat");
                self.base.protocol_event(&tag, ProtocolEvent::Heartbeat);
            }
            HeartbeatKind::Forwarded => {
                if !fast {
                    tracing::warn!(origin = %tag, "forwarded heartbeat outside fast mode");
                    return Ok(());
                }
            }
            HeartbeatKind::Dismiss => {
                self.base.remove_child(&tag);
                tracing::info!(child = %tag, "child dismissed itself");
            }
        }

        if fast {
            let relay = match kind {
                HeartbeatKind::Dismiss => HeartbeatKind::Dismiss,
                _ => HeartbeatKind::Forwarded,
            };
            self.base
                .send_to_parent(Message::Heartbeat {
                    hostname,
                    port,
                    tag,
                    heartbeat: relay,
                    num_procs,
                })
                .await?;
        }

        if kind == HeartbeatKind::Dismiss && self.base.children.is_empty() {
            let dismiss = self.base.heartbeat(HeartbeatKind::Dismiss, 0);
            self.base.send_to_parent(dismiss).await?;
            self.base.reactor.stop();
        }
        Ok(())
    }

    async fn on_start(&mut self, strategy: SerializedStrategy) -> Result<(), AgentError> {
        let request = strategy.decode()?;
        self.gather = request.gather;
        tracing::debug!(tag = %self.base.tag(), strategy = %request.general.strategy_name, gather = self.gather, "start");
        self.base.broadcast(&Message::Start { strategy }).await;
        Ok(())
    }

    async fn on_search_status(&mut self, tag: Tag, status: SearchStatus) -> Result<(), AgentError> {
        self.base.child_mut(&tag)?.info.search_status = status;
        let event = match status {
            SearchStatus::ReqRestart => ProtocolEvent::NeedRestart,
            SearchStatus::ReqExperiment => ProtocolEvent::ExperimentRequested,
            _ => ProtocolEvent::SearchFinished,
        };
        self.base.protocol_event(&tag, event);
        self.forward_request().await
    }

    /// Reports the subtree's outcome once every child has decided.
    async fn forward_request(&mut self) -> Result<(), AgentError> {
        self.base.decide_continuation();
        let Some(decision) = self.base.search_decision() else {
            return Ok(());
        };
        let tag = self.base.tag().clone();
        let report = match decision {
            Decision::Restart => Message::NeedRestart { tag },
            Decision::Experiment => Message::ReqExperiment { tag },
            Decision::Finished => Message::SearchFinished { tag },
        };
        tracing::debug!(tag = %self.base.tag(), ?decision, "subtree decided");
        self.base.send_to_parent(report).await?;
        for child in self.base.children.values_mut() {
            child.info.search_status = SearchStatus::Undefined;
        }
        Ok(())
    }

    async fn on_found_property(
        &mut self,
        from: Option<Tag>,
        property: Property,
    ) -> Result<(), AgentError> {
        if let Some(tag) = &from {
            self.base.protocol_event(tag, ProtocolEvent::FoundProperty);
        }
        if self.nocluster {
            return self.base.send_to_parent(Message::FoundProp { property }).await;
        }
        if property.is_hot_region() {
            self.hot_regions.push(property);
        } else {
            self.pending.push(property);
        }
        Ok(())
    }

    async fn on_properties_sent(&mut self, tag: Tag) -> Result<(), AgentError> {
        self.base.child_mut(&tag)?.info.properties_sent = true;
        self.base.protocol_event(&tag, ProtocolEvent::PropertiesSent);
        if !all_properties_sent(self.base.child_infos()) {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.pending);
        let received = batch.len();
        let merged = if self.gather {
            cluster::gather(batch)
        } else {
            cluster::cluster(batch)
        };
        tracing::debug!(tag = %self.base.tag(), received, forwarded = merged.len(), "properties aggregated");

        let hot = std::mem::take(&mut self.hot_regions);
        for property in merged.into_iter().chain(hot) {
            self.base.send_to_parent(Message::FoundProp { property }).await?;
        }
        let own = self.base.tag().clone();
        self.base
            .send_to_parent(Message::PropertiesSent { tag: own })
            .await?;
        self.base.decide_continuation();
        Ok(())
    }

    async fn on_terminated(&mut self, tag: Tag) -> Result<(), AgentError> {
        self.base.child_mut(&tag)?.info.appl_terminated = true;
        self.base.protocol_event(&tag, ProtocolEvent::Terminated);
        if all_terminated(self.base.child_infos()) {
            let own = self.base.tag().clone();
            self.base.send_to_parent(Message::Terminated { tag: own }).await?;
        }
        Ok(())
    }

    async fn on_call_tree_sent(&mut self, tag: Tag) -> Result<(), AgentError> {
        self.base.child_mut(&tag)?.info.calltree_sent = true;
        if self.base.child_infos().all(|c| c.calltree_sent) {
            let own = self.base.tag().clone();
            self.base.send_to_parent(Message::CallTreeSent { tag: own }).await?;
        }
        Ok(())
    }
}
