//! Leaf agent: owns a chunk of application processes and runs experiments
//! on them through an [`AnalysisBackend`].

use psc_core::{AgentIdentity, IdMap, RegistryId, SerializedStrategy, Tag};
use psc_registry::COMP_ANALYSIS_AGENT;

use crate::agent::{AgentBase, ParentLocator};
use crate::backend::{AnalysisBackend, ExperimentOutcome};
use crate::context::AgentContext;
use crate::error::AgentError;
use crate::reactor::Event;
use crate::roles::absorb;
use crate::transport::{HeartbeatKind, Inbound, Message};

/// Launch parameters of an analysis agent.
#[derive(Debug, Clone)]
pub struct AnalysisAgentConfig {
    pub tag: Tag,
    pub parent: Tag,
    pub port: u16,
    pub parent_locator: ParentLocator,
    /// Owned application processes.
    pub processes: Vec<RegistryId>,
}

pub struct AnalysisAgent<B> {
    base: AgentBase,
    backend: B,
    processes: Vec<RegistryId>,
    /// The current strategy asked to skip phases before measuring.
    delay_requested: bool,
}

impl<B: AnalysisBackend> AnalysisAgent<B> {
    pub async fn open(
        ctx: AgentContext,
        config: AnalysisAgentConfig,
        backend: B,
    ) -> Result<Self, AgentError> {
        let inbound = Inbound::open(config.port).await?;
        Ok(Self::with_inbound(ctx, config, backend, inbound))
    }

    /// Builds the agent around an endpoint that is already serving.
    pub fn with_inbound(
        ctx: AgentContext,
        config: AnalysisAgentConfig,
        backend: B,
        inbound: Inbound,
    ) -> Self {
        let identity = AgentIdentity::new(config.tag, ctx.hostname.clone(), Some(config.parent));
        AnalysisAgent {
            base: AgentBase::new(ctx, identity, inbound, config.parent_locator),
            backend,
            processes: config.processes,
            delay_requested: false,
        }
    }

    pub fn port(&self) -> u16 {
        self.base.port()
    }

    /// Registers, announces itself to the parent and serves until `quit`.
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.base.register_self(COMP_ANALYSIS_AGENT).await?;
        self.base.connect_to_parent().await?;
        self.announce().await?;
        tracing::info!(tag = %self.base.tag(), processes = self.processes.len(), "analysis agent up");

        let result = self.event_loop().await;
        self.base.deregister().await;
        result
    }

    async fn announce(&mut self) -> Result<(), AgentError> {
        let heartbeat = self
            .base
            .heartbeat(HeartbeatKind::Own, self.processes.len() as u32);
        self.base.send_to_parent(heartbeat).await
    }

    async fn event_loop(&mut self) -> Result<(), AgentError> {
        while let Some(event) = self.base.reactor.next_event().await {
            let Event::Message(envelope) = event else {
                continue;
            };
            let result = self.handle(envelope.message).await;
            absorb(self.base.tag(), result)?;
        }
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<(), AgentError> {
        match message {
            Message::Start { strategy } => self.on_start(strategy).await,
            Message::StartExperiment => self.on_start_experiment().await,
            Message::Check => self.on_check().await,
            Message::Terminate => {
                self.backend.finish_application(&self.base.ctx).await?;
                let tag = self.base.tag().clone();
                self.base.send_to_parent(Message::Terminated { tag }).await
            }
            Message::Quit => {
                if let Err(err) = self.backend.finish_application(&self.base.ctx).await {
                    tracing::warn!(tag = %self.base.tag(), error = %err, "application did not finish cleanly");
                }
                self.base.reactor.stop();
                Ok(())
            }
            Message::Reinit { map } => self.on_reinit(&map).await,
            Message::SerializeCallTree => self.on_serialize_call_tree().await,
            other => {
                tracing::warn!(tag = %self.base.tag(), message = other.name(), "unexpected message");
                Ok(())
            }
        }
    }

    async fn on_start(&mut self, strategy: SerializedStrategy) -> Result<(), AgentError> {
        let request = strategy.decode()?;
        tracing::debug!(
            tag = %self.base.tag(),
            strategy = %request.general.strategy_name,
            duration = request.general.analysis_duration,
            delay_phases = request.general.delay_phases,
            "start"
        );
        self.backend.configure(&request);
        self.delay_requested = request.general.has_delay();

        let tag = self.base.tag().clone();
        if self.backend.needs_restart() {
            // a delay that cannot be met ends the search instead
            let reply = if self.delay_requested {
                Message::SearchFinished { tag }
            } else {
                Message::NeedRestart { tag }
            };
            return self.base.send_to_parent(reply).await;
        }
        self.experiment().await
    }

    async fn on_start_experiment(&mut self) -> Result<(), AgentError> {
        if self.backend.needs_restart() {
            let tag = self.base.tag().clone();
            return self.base.send_to_parent(Message::NeedRestart { tag }).await;
        }
        self.experiment().await
    }

    async fn experiment(&mut self) -> Result<(), AgentError> {
        let outcome = self.backend.run_experiment().await?;
        let tag = self.base.tag().clone();
        let report = match outcome {
            ExperimentOutcome::Finished => Message::SearchFinished { tag },
            ExperimentOutcome::AnotherExperiment => Message::ReqExperiment { tag },
            ExperimentOutcome::Restart => Message::NeedRestart { tag },
        };
        self.base.send_to_parent(report).await
    }

    async fn on_check(&mut self) -> Result<(), AgentError> {
        let props = self.backend.take_properties();
        tracing::debug!(tag = %self.base.tag(), count = props.len(), "sending properties");
        for property in props {
            self.base
                .send_to_parent(Message::FoundProp { property })
                .await?;
        }
        let tag = self.base.tag().clone();
        self.base.send_to_parent(Message::PropertiesSent { tag }).await
    }

    async fn on_reinit(&mut self, map: &IdMap) -> Result<(), AgentError> {
        self.backend.remap(map).await?;
        for id in &mut self.processes {
            if let Some(new_id) = map.remap(*id) {
                *id = new_id;
            }
        }
        tracing::info!(tag = %self.base.tag(), processes = ?self.processes, "reattached to relaunched processes");
        self.announce().await
    }

    async fn on_serialize_call_tree(&mut self) -> Result<(), AgentError> {
        let nodes = self.backend.call_tree();
        for node in nodes {
            self.base.send_to_parent(Message::CallTree { node }).await?;
        }
        let tag = self.base.tag().clone();
        self.base.send_to_parent(Message::CallTreeSent { tag }).await
    }
}
