//! Root of the hierarchy.
//!
//! The frontend launches the application and the agent tree, waits for the
//! tree to report in, then drives the search round by round: dispatch a
//! strategy request, collect the subtree's decision, pull the properties,
//! and either start the next request, run another experiment, or restart
//! the application. Everything runs on the reactor task; timers poll the
//! barriers and operator commands arrive as events next to messages.

use std::path::PathBuf;

use indexmap::IndexSet;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use psc_core::barrier::{all_properties_sent, all_reinit_started, all_started, all_terminated};
use psc_core::{
    AgentIdentity, AgentInfo, CallTreeNode, Decision, HeartbeatTally, IdMap, Property,
    ProtocolEvent, RegistryId, SearchStatus, StrategyQueues, Tag, Topology, TopologyParams,
};
use psc_registry::{EntryFilter, RegistryClient, COMP_FRONTEND};

use crate::agent::{AgentBase, ParentLocator};
use crate::config::FrontendConfig;
use crate::context::{AgentContext, Discovery, Timings};
use crate::error::AgentError;
use crate::export::{self, ExperimentInfo};
use crate::lifecycle::{LifecycleEvent, LifecycleMachine};
use crate::reactor::{Event, TimerAction};
use crate::roles::absorb;
use crate::starter::{fast_processes, ApplicationStarter, LaunchPlan};
use crate::timeout::GlobalTimeout;
use crate::transport::{HeartbeatKind, Inbound, Message};

const OPERATOR_HELP: &str = "\
commands:
  start       dispatch the next strategy request
  check       ask the agents for their properties
  properties  print the properties found so far
  graph       print the agent hierarchy
  calltree    collect the application call tree
  quit        end the run
  help        this text";

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Strategy requests dispatched.
    pub rounds: u32,
    /// Application restarts.
    pub restarts: u32,
    /// Properties received, including ones not exported.
    pub properties: usize,
    /// Properties written to the properties file.
    pub exported: usize,
    pub propfile: PathBuf,
}

pub struct Frontend<S> {
    base: AgentBase,
    config: FrontendConfig,
    lifecycle: LifecycleMachine,
    starter: S,
    plan: LaunchPlan,
    run_id: Uuid,
    queues: StrategyQueues,
    topology: Option<Topology>,
    idmap: Option<IdMap>,
    tally: HeartbeatTally,
    properties: Vec<Property>,
    call_tree: Vec<CallTreeNode>,
    required_regions: IndexSet<String>,
    bad_regions: IndexSet<String>,
    runs: u32,
    rounds: u32,
    exported: usize,
    ready: bool,
    quitting: bool,
}

impl<S: ApplicationStarter> Frontend<S> {
    /// Walks the initialization sequence up to `InitializationComplete`.
    pub async fn initialize(
        config: FrontendConfig,
        timings: Timings,
        starter: S,
    ) -> Result<Self, AgentError> {
        let mut lifecycle = LifecycleMachine::new();
        lifecycle.fire(LifecycleEvent::InitDataStructures)?;
        let run_id = Uuid::new_v4();

        lifecycle.fire(LifecycleEvent::ParseParameters)?;
        tracing::debug!(%run_id, app = %config.app_name, strategy = %config.strategy, "parameters parsed");

        lifecycle.fire(LifecycleEvent::SetupDebug)?;
        tracing::debug!(level = config.debug, "debug level set");

        lifecycle.fire(LifecycleEvent::SelectHierarchySetupMode)?;
        let discovery = match &config.registry {
            Some(addr) => {
                tracing::info!(registry = %addr, "hierarchy set up through the registry");
                Discovery::Registry(
                    RegistryClient::new(&addr.host, addr.port)
                        .with_retry_interval(timings.connect_retry),
                )
            }
            None => {
                tracing::info!("fast mode, registry disabled");
                Discovery::Fast
            }
        };

        lifecycle.fire(LifecycleEvent::SetupNetwork)?;
        let inbound = Inbound::open(config.port).await?;
        tracing::info!(port = inbound.port, "frontend listening");

        lifecycle.fire(LifecycleEvent::SetupApplicationData)?;
        lifecycle.fire(LifecycleEvent::SetupPhases)?;
        if config.instrumented {
            tracing::debug!(phase = ?config.phase, "phase region");
        }
        lifecycle.fire(LifecycleEvent::SetupProcesses)?;
        lifecycle.fire(LifecycleEvent::SetupThreads)?;
        tracing::debug!(
            processes = config.mpinumprocs,
            threads = config.ompnumthreads,
            "application size"
        );

        lifecycle.fire(LifecycleEvent::SetupTimeouts)?;
        let timeout = GlobalTimeout::new(config.timeout, config.timeout_delta);
        let ctx = AgentContext::new(&config.app_name, &config.hostname, discovery, timeout)
            .with_timings(timings)
            .with_site(&config.site, &config.machine);

        lifecycle.fire(LifecycleEvent::SetupAgents)?;
        tracing::debug!(max_fan = config.max_fan, max_cluster = config.max_cluster, "agent tree shape");

        lifecycle.fire(LifecycleEvent::SetupOutputfile)?;
        tracing::debug!(propfile = %config.propfile.display(), "properties file");

        lifecycle.fire(LifecycleEvent::ConnectToRegistry)?;
        let identity = AgentIdentity::new(
            Tag::parse(Tag::UNREGISTERED_FRONTEND)?,
            config.hostname.clone(),
            None,
        );
        let mut base = AgentBase::new(ctx, identity, inbound, ParentLocator::None);
        let id = match base.register_self(COMP_FRONTEND).await? {
            Some(id) => id,
            None => RegistryId(1),
        };
        base.identity.registry_id = Some(id);
        base.retag(Tag::frontend(id), COMP_FRONTEND).await?;
        tracing::info!(tag = %base.tag(), "frontend registered");

        lifecycle.fire(LifecycleEvent::SelectStarter)?;
        let plan = LaunchPlan::from_config(&config, base.port());

        let mut queues = StrategyQueues::new();
        for _ in 0..config.iterations {
            if config.gather {
                queues.push_request(config.summary_request());
            } else {
                queues.push_general_info(config.general_info());
            }
        }

        Ok(Frontend {
            tally: HeartbeatTally::new(config.mpinumprocs),
            base,
            config,
            lifecycle,
            starter,
            plan,
            run_id,
            queues,
            topology: None,
            idmap: None,
            properties: Vec::new(),
            call_tree: Vec::new(),
            required_regions: IndexSet::new(),
            bad_regions: IndexSet::new(),
            runs: 0,
            rounds: 0,
            exported: 0,
            ready: false,
            quitting: false,
        })
    }

    /// Feeds operator command lines into the event loop.
    pub fn with_operator(mut self, commands: mpsc::UnboundedReceiver<String>) -> Self {
        self.base.reactor.attach_operator(commands);
        self
    }

    pub fn port(&self) -> u16 {
        self.base.port()
    }

    pub fn tag(&self) -> &Tag {
        self.base.tag()
    }

    /// Runs the whole analysis and tears everything down.
    pub async fn run(mut self) -> Result<RunReport, AgentError> {
        self.lifecycle.fire(LifecycleEvent::StartRun)?;
        let outcome = self.run_analysis().await;
        if let Err(err) = &outcome {
            tracing::error!(error = %err, "analysis aborted");
            if !self.quitting {
                self.base.broadcast(&Message::Quit).await;
            }
        }

        self.lifecycle.fire(LifecycleEvent::Finalize)?;
        self.base.deregister().await;
        self.starter.shutdown().await;
        outcome?;

        Ok(RunReport {
            run_id: self.run_id,
            rounds: self.rounds,
            restarts: self.runs,
            properties: self.properties.len(),
            exported: self.exported,
            propfile: self.config.propfile.clone(),
        })
    }

    async fn run_analysis(&mut self) -> Result<(), AgentError> {
        self.bring_up().await?;
        let timings = self.base.ctx.timings.clone();
        self.base
            .reactor
            .set_timer(TimerAction::Startup, timings.barrier_first, timings.barrier_interval);
        self.event_loop().await
    }

    /// Launches the application and the agents.
    ///
    /// In fast mode the process list is known up front, so the agents go
    /// first; otherwise the tree is shaped by what the application
    /// registered.
    async fn bring_up(&mut self) -> Result<(), AgentError> {
        let processes = if self.base.ctx.is_fast() {
            fast_processes(self.config.mpinumprocs, &self.config.hostname)
        } else {
            self.starter
                .run_application(&self.base.ctx, &self.plan)
                .await?
        };

        let params = TopologyParams {
            max_cluster: self.config.max_cluster,
            max_fan: self.config.max_fan,
            force_localhost: self.config.force_localhost,
            frontend_tag: self.base.tag().clone(),
            frontend_host: self.config.hostname.clone(),
            agent_baseport: self.config.agent_baseport,
        };
        let topology = Topology::compute(&processes, &params)?;
        tracing::info!(
            agents = topology.agent_count(),
            levels = topology.levels().len(),
            "agent hierarchy computed"
        );
        tracing::debug!("\n{}", topology.render());

        if !self.base.ctx.is_fast() {
            self.base.add_child(AgentInfo::new(topology.root().tag.clone()));
        }
        self.starter
            .run_agents(&self.base.ctx, &self.plan, &topology)
            .await?;

        if self.base.ctx.is_fast() {
            let launched = self
                .starter
                .run_application(&self.base.ctx, &self.plan)
                .await?;
            if launched.len() != processes.len() {
                tracing::warn!(
                    expected = processes.len(),
                    launched = launched.len(),
                    "application size differs from the agent tree"
                );
            }
        }

        self.idmap = Some(IdMap::initial(processes.iter().map(|p| p.id).collect()));
        self.topology = Some(topology);
        Ok(())
    }

    async fn event_loop(&mut self) -> Result<(), AgentError> {
        while let Some(event) = self.base.reactor.next_event().await {
            let result = match event {
                Event::Message(envelope) => self.handle(envelope.from, envelope.message).await,
                Event::Timer(action) => self.handle_step(action).await,
                Event::Operator(line) => self.handle_command(line.trim()).await,
            };
            absorb(self.base.tag(), result)?;
        }
        Ok(())
    }

    async fn handle_step(&mut self, action: TimerAction) -> Result<(), AgentError> {
        let done = match action {
            // fast mode releases on the heartbeat tally instead
            TimerAction::Startup => !self.base.ctx.is_fast() && all_started(self.base.child_infos()),
            TimerAction::StartupReinit => all_reinit_started(self.base.child_infos()),
            TimerAction::ApplicationTermination => {
                all_terminated(self.base.child_infos()) && self.application_gone().await
            }
        };

        if done {
            self.base.reactor.cancel_timer();
            return match action {
                TimerAction::Startup => self.hierarchy_ready().await,
                TimerAction::StartupReinit => self.resume_after_restart().await,
                TimerAction::ApplicationTermination => self.relaunch().await,
            };
        }

        if self.base.ctx.timeout.timed_out() {
            tracing::error!(step = action.label(), "Timed out waiting for child agent(s)");
            self.base.reactor.cancel_timer();
            self.quit().await?;
            return Err(AgentError::BarrierTimeout {
                step: action.label(),
            });
        }
        tracing::trace!(step = action.label(), "barrier not reached yet");
        Ok(())
    }

    /// Whether the application's processes have left the registry.
    async fn application_gone(&self) -> bool {
        let Some(registry) = self.base.ctx.registry() else {
            return true;
        };
        match registry
            .try_query(&EntryFilter::application(&self.config.app_name))
            .await
        {
            Ok(entries) => entries.is_empty(),
            Err(err) => {
                tracing::warn!(error = %err, "cannot check application entries");
                false
            }
        }
    }

    async fn hierarchy_ready(&mut self) -> Result<(), AgentError> {
        self.base.reactor.cancel_timer();
        self.ready = true;
        tracing::info!(children = self.base.children.len(), "agent hierarchy ready");
        if self.config.manual {
            self.prompt();
            return Ok(());
        }
        self.start().await
    }

    fn prompt(&self) {
        tracing::info!("waiting for an operator command (type help for a list)");
    }

    /// Dispatches the next strategy request, or quits when none is left.
    async fn start(&mut self) -> Result<(), AgentError> {
        let Some(strategy) = self.queues.next_serialized()? else {
            tracing::info!(rounds = self.rounds, "no strategy requests left");
            return self.quit().await;
        };
        self.rounds += 1;
        for child in self.base.children.values_mut() {
            child.info.search_status = SearchStatus::Undefined;
        }
        tracing::info!(round = self.rounds, remaining = self.queues.pending(), "starting strategy request");
        let delivered = self.base.broadcast(&Message::Start { strategy }).await;
        if delivered == 0 {
            return Err(AgentError::HierarchyUnreachable { message: "start" });
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
            Message::FoundProp { property } => {
                self.on_found_property(from, property);
                Ok(())
            }
            Message::PropertiesSent { tag } => {
                let child = self.base.child_mut(&tag)?;
                child.info.properties_sent = true;
                child.check_pending = false;
                self.base.protocol_event(&tag, ProtocolEvent::PropertiesSent);
                self.decide().await
            }
            Message::Terminated { tag } => {
                self.base.child_mut(&tag)?.info.appl_terminated = true;
                self.base.protocol_event(&tag, ProtocolEvent::Terminated);
                tracing::debug!(child = %tag, "application part terminated");
                Ok(())
            }
            Message::CallTree { node } => {
                self.call_tree.push(node);
                Ok(())
            }
            Message::CallTreeSent { tag } => {
                self.base.child_mut(&tag)?.info.calltree_sent = true;
                if self.base.child_infos().all(|c| c.calltree_sent) {
                    tracing::info!(nodes = self.call_tree.len(), "call tree collected");
                    println!("{}", render_call_tree(&self.call_tree));
                }
                Ok(())
            }
            other => {
                tracing::warn!(message = other.name(), from = ?from, "unexpected message at the frontend");
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
        if !self.base.ctx.is_fast() {
            let first = self.base.child_mut(&tag)?.record_heartbeat(&hostname, port);
            tracing::debug!(child = %tag, %hostname, port, first, "heartbeat");
            self.base.protocol_event(&tag, ProtocolEvent::Heartbeat);
            return Ok(());
        }

        let released = match kind {
            HeartbeatKind::Own => {
                if self.base.child(&tag).is_none() {
                    self.base.add_child(AgentInfo::new(tag.clone()));
                }
                let first = self.base.child_mut(&tag)?.record_heartbeat(&hostname, port);
                tracing::debug!(child = %tag, %hostname, port, first, "heartbeat");
                self.base.protocol_event(&tag, ProtocolEvent::Heartbeat);
                self.tally.record(&tag, num_procs)
            }
            HeartbeatKind::Forwarded => self.tally.record(&tag, num_procs),
            HeartbeatKind::Dismiss => {
                self.tally.forget(&tag);
                self.base.remove_child(&tag);
                tracing::info!(agent = %tag, "agent dismissed itself");
                if self.base.children.is_empty() {
                    tracing::warn!("no agents left, ending the run");
                    return self.quit().await;
                }
                false
            }
        };
        tracing::trace!(total = self.tally.total(), expected = self.tally.expected(), "processes announced");

        if released {
            return self.hierarchy_ready().await;
        }
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
        self.decide().await
    }

    fn on_found_property(&mut self, from: Option<Tag>, property: Property) {
        if let Some(tag) = &from {
            self.base.protocol_event(tag, ProtocolEvent::FoundProperty);
        }
        if property.is_required_regions() {
            self.required_regions.extend(property.regions());
        } else if property.is_high_overhead() {
            self.bad_regions.extend(property.regions());
        }
        self.properties.push(property);
    }

    /// Some region asked for by the analysis is not yet instrumented and
    /// is not known to be too costly to instrument.
    fn reinstrumentation_pending(&self) -> bool {
        self.required_regions
            .iter()
            .any(|r| !self.bad_regions.contains(r))
    }

    /// Acts on the children's reports once all of them are in.
    async fn decide(&mut self) -> Result<(), AgentError> {
        self.base.decide_continuation();
        let Some(decision) = self.base.search_decision() else {
            return Ok(());
        };
        if !all_properties_sent(self.base.child_infos()) {
            return self.check().await;
        }
        for child in self.base.children.values_mut() {
            child.info.properties_sent = false;
            child.check_pending = false;
        }

        let decision = decision.escalate(self.reinstrumentation_pending());
        tracing::info!(round = self.rounds, ?decision, properties = self.properties.len(), "round decided");
        match decision {
            Decision::Finished => {
                if self.config.manual {
                    for child in self.base.children.values_mut() {
                        child.info.search_status = SearchStatus::Undefined;
                    }
                    self.prompt();
                    return Ok(());
                }
                self.start().await
            }
            Decision::Experiment => {
                for child in self.base.children.values_mut() {
                    child.info.search_status = SearchStatus::Undefined;
                }
                let delivered = self.base.broadcast(&Message::StartExperiment).await;
                if delivered == 0 {
                    return Err(AgentError::HierarchyUnreachable {
                        message: "startexperiment",
                    });
                }
                Ok(())
            }
            Decision::Restart => self.restart().await,
        }
    }

    /// Asks children that still owe properties to send them.
    async fn check(&mut self) -> Result<(), AgentError> {
        let owing: Vec<Tag> = self
            .base
            .children
            .iter()
            .filter(|(_, c)| !c.info.properties_sent && !c.check_pending)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in owing {
            match self.base.send_to_child(&tag, &Message::Check).await {
                Ok(()) => self.base.child_mut(&tag)?.check_pending = true,
                Err(err) => tracing::warn!(child = %tag, error = %err, "check not delivered"),
            }
        }
        Ok(())
    }

    /// Terminates the application ahead of a relaunch.
    async fn restart(&mut self) -> Result<(), AgentError> {
        if self.runs + 1 >= self.config.max_runs {
            tracing::warn!(runs = self.runs, "restart limit reached, shutting down");
            return self.quit().await;
        }
        self.base.ctx.timeout.increment();
        self.runs += 1;
        tracing::info!(
            run = self.runs,
            budget_secs = self.base.ctx.timeout.budget().as_secs(),
            "restarting the application"
        );
        for child in self.base.children.values_mut() {
            child.info.appl_terminated = false;
        }
        let delivered = self.base.broadcast(&Message::Terminate).await;
        if delivered == 0 {
            return Err(AgentError::HierarchyUnreachable { message: "terminate" });
        }
        let timings = self.base.ctx.timings.clone();
        self.base.reactor.set_timer(
            TimerAction::ApplicationTermination,
            timings.barrier_first,
            timings.barrier_interval,
        );
        Ok(())
    }

    /// Starts the application again and re-attaches the tree to it.
    async fn relaunch(&mut self) -> Result<(), AgentError> {
        let regions: Vec<String> = std::mem::take(&mut self.required_regions)
            .into_iter()
            .filter(|r| !self.bad_regions.contains(r))
            .collect();
        let previous = self
            .idmap
            .clone()
            .ok_or_else(|| AgentError::Config("relaunch before the first launch".into()))?;
        let map = self
            .starter
            .rerun_application(&self.base.ctx, &self.plan, &previous, &regions)
            .await?;
        tracing::info!(processes = map.len(), "application relaunched");

        for child in self.base.children.values_mut() {
            child.info.prepare_restart();
        }
        let delivered = self.base.broadcast(&Message::Reinit { map: map.clone() }).await;
        self.idmap = Some(map);
        if delivered == 0 {
            return Err(AgentError::HierarchyUnreachable { message: "reinit" });
        }
        let timings = self.base.ctx.timings.clone();
        self.base.reactor.set_timer(
            TimerAction::StartupReinit,
            timings.barrier_first,
            timings.barrier_interval,
        );
        Ok(())
    }

    async fn resume_after_restart(&mut self) -> Result<(), AgentError> {
        tracing::info!("agents re-attached, continuing the search");
        for child in self.base.children.values_mut() {
            child.info.search_status = SearchStatus::Undefined;
            child.info.properties_sent = false;
        }
        let delivered = self.base.broadcast(&Message::StartExperiment).await;
        if delivered == 0 {
            return Err(AgentError::HierarchyUnreachable {
                message: "startexperiment",
            });
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: &str) -> Result<(), AgentError> {
        match command {
            "" => Ok(()),
            "start" if !self.ready => {
                tracing::warn!("agent hierarchy not ready yet");
                Ok(())
            }
            "start" => self.start().await,
            "quit" => self.quit().await,
            "check" => self.check().await,
            "properties" => {
                println!("{}", export::summary_table(&self.properties, self.config.nrprops));
                Ok(())
            }
            "graph" => {
                match &self.topology {
                    Some(topology) => println!("{}", topology.render()),
                    None => println!("no agent hierarchy yet"),
                }
                Ok(())
            }
            "calltree" => {
                self.call_tree.clear();
                for child in self.base.children.values_mut() {
                    child.info.calltree_sent = false;
                }
                self.base.broadcast(&Message::SerializeCallTree).await;
                Ok(())
            }
            "help" => {
                println!("{OPERATOR_HELP}");
                Ok(())
            }
            other => {
                tracing::warn!(command = other, "unknown command, type help for a list");
                Ok(())
            }
        }
    }

    /// Ends the run: exports, stops the agents and leaves the event loop.
    ///
    /// Runs at most once; later calls are no-ops.
    async fn quit(&mut self) -> Result<(), AgentError> {
        if self.quitting {
            return Ok(());
        }
        self.quitting = true;
        self.base.reactor.cancel_timer();

        let info = ExperimentInfo {
            run_id: self.run_id,
            app_name: self.config.app_name.clone(),
            processes: self.config.mpinumprocs,
            threads: self.config.ompnumthreads,
            directory: std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
        };
        let exported = export::write_properties(&self.config.propfile, &info, &self.properties);
        println!("{}", export::summary_table(&self.properties, self.config.nrprops));

        self.base.broadcast(&Message::Quit).await;
        self.wait_for_application_exit().await;
        self.base.reactor.stop();

        self.exported = exported?;
        Ok(())
    }

    /// Gives the application processes time to leave the registry, then
    /// removes whatever is left.
    async fn wait_for_application_exit(&self) {
        let Some(registry) = self.base.ctx.registry() else {
            return;
        };
        let filter = EntryFilter::application(&self.config.app_name);
        let timings = &self.base.ctx.timings;
        let deadline = Instant::now() + timings.quit_grace;
        loop {
            let entries = match registry.try_query(&filter).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot check application entries");
                    return;
                }
            };
            if entries.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(leftover = entries.len(), "application entries still registered, removing them");
                for entry in entries {
                    if let Err(err) = registry.try_delete(entry.id).await {
                        tracing::warn!(id = %entry.id, error = %err, "cannot remove entry");
                    }
                }
                return;
            }
            tokio::time::sleep(timings.connect_retry).await;
        }
    }
}

/// Indented text view of collected call-tree nodes, per process.
fn render_call_tree(nodes: &[CallTreeNode]) -> String {
    fn walk(nodes: &[CallTreeNode], node: &CallTreeNode, depth: usize, out: &mut Vec<String>) {
        out.push(format!(
            "{}{} ({}:{})",
            "  ".repeat(depth + 1),
            node.region,
            node.file,
            node.line
        ));
        for child in nodes
            .iter()
            .filter(|n| n.process == node.process && n.parent == Some(node.id))
        {
            walk(nodes, child, depth + 1, out);
        }
    }

    let mut processes: Vec<u32> = nodes.iter().map(|n| n.process).collect();
    processes.sort_unstable();
    processes.dedup();

    let mut out = Vec::new();
    for process in processes {
        out.push(format!("process {process}"));
        for root in nodes
            .iter()
            .filter(|n| n.process == process && n.parent.is_none())
        {
            walk(nodes, root, 0, &mut out);
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, parent: Option<u32>, region: &str, process: u32) -> CallTreeNode {
        CallTreeNode {
            id,
            parent,
            region: region.into(),
            file: "a.c".into(),
            line: id,
            process,
        }
    }

    #[test]
    fn call_tree_is_rendered_per_process() {
        let nodes = vec![
            node(0, None, "main", 1),
            node(1, Some(0), "solve", 1),
            node(0, None, "main", 0),
        ];
        let text = render_call_tree(&nodes);
        assert_eq!(
            text,
            "process 0\n  main (a.c:0)\nprocess 1\n  main (a.c:0)\n    solve (a.c:1)"
        );
    }
}
