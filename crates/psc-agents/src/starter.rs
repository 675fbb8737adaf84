//! Launching the application and the agent tree.
//!
//! [`ApplicationStarter`] is the frontend's only way to create processes.
//! [`ProcessStarter`] spawns real OS processes: the target application and
//! one `psc aagent`/`psc hlagent` per topology node, locally or over ssh.
//! [`InProcessStarter`] runs the agents as tasks of the current runtime on
//! top of [`SimulatedBackend`], which is how fast-mode demos and the
//! end-to-end tests drive the whole protocol inside one process.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use psc_core::{AgentDescriptor, AgentKind, IdMap, ProcessEntry, RegistryId, Tag, Topology};
use psc_registry::{Entry, EntryData, EntryFilter, APPLICATION_TAG, COMP_APPLICATION};

use crate::agent::ParentLocator;
use crate::backend::{AnalysisBackend, SimulatedBackend};
use crate::config::{FrontendConfig, RegistryAddr, ENV_APPNAME, ENV_REGISTRY};
use crate::context::AgentContext;
use crate::error::AgentError;
use crate::roles::{AnalysisAgent, AnalysisAgentConfig, HlAgent, HlAgentConfig};
use crate::transport::Inbound;

/// How long `shutdown` waits for an agent before killing it.
const AGENT_EXIT_GRACE: Duration = Duration::from_secs(10);

/// Environment variable listing regions to instrument on a relaunch.
pub const ENV_INSTRUMENT_REGIONS: &str = "PSC_INSTRUMENT_REGIONS";

/// Everything a starter needs to know about the run.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub app_name: String,
    pub app_run: Option<String>,
    pub mpinumprocs: u32,
    pub ompnumthreads: u32,
    pub phase: Option<String>,
    pub frontend_host: String,
    pub frontend_port: u16,
    /// `None` in fast mode.
    pub registry: Option<RegistryAddr>,
    pub force_localhost: bool,
    pub dontcluster: bool,
    pub timeout: Duration,
    pub debug: u8,
    pub appl_baseport: Option<u16>,
}

impl LaunchPlan {
    pub fn from_config(config: &FrontendConfig, frontend_port: u16) -> Self {
        LaunchPlan {
            app_name: config.app_name.clone(),
            app_run: config.app_run.clone(),
            mpinumprocs: config.mpinumprocs,
            ompnumthreads: config.ompnumthreads,
            phase: config.phase.clone(),
            frontend_host: config.hostname.clone(),
            frontend_port,
            registry: config.registry.clone(),
            force_localhost: config.force_localhost,
            dontcluster: config.dontcluster,
            timeout: config.timeout,
            debug: config.debug,
            appl_baseport: config.appl_baseport,
        }
    }

    pub fn is_fast(&self) -> bool {
        self.registry.is_none()
    }
}

pub trait ApplicationStarter: Send {
    /// Launches the application; returns its processes in rank order.
    fn run_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> impl Future<Output = Result<Vec<ProcessEntry>, AgentError>> + Send;

    /// Relaunches the terminated application with `regions` instrumented
    /// and returns the map from the previous process ids to the new ones.
    fn rerun_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
        previous: &IdMap,
        regions: &[String],
    ) -> impl Future<Output = Result<IdMap, AgentError>> + Send;

    /// Starts one agent per topology node.
    fn run_agents(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
        topology: &Topology,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// Waits for launched agents to exit, killing stragglers.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// Process list used in fast mode: rank `r` has id `r`, all on `host`.
pub fn fast_processes(count: u32, host: &str) -> Vec<ProcessEntry> {
    (0..count)
        .map(|rank| ProcessEntry {
            id: RegistryId(rank),
            host: host.to_string(),
        })
        .collect()
}

/// Orders registered application entries by rank (`pid - 1`).
///
/// Fails unless every rank below `count` is present.
pub fn application_processes(entries: &[Entry], count: u32) -> Result<Vec<ProcessEntry>, AgentError> {
    let ranked = entries.iter().filter_map(|e| {
        let rank = e.data.pid.checked_sub(1)? as usize;
        Some((rank, e))
    });
    let mut by_rank: HashMap<usize, &Entry> = HashMap::new();
    for (rank, entry) in ranked {
        by_rank.insert(rank, entry);
    }
    let ids = IdMap::collect_ranks(by_rank.iter().map(|(r, e)| (*r, e.id)), count as usize)?;
    Ok(ids
        .into_iter()
        .enumerate()
        .map(|(rank, id)| ProcessEntry {
            id,
            host: by_rank
                .get(&rank)
                .map(|e| e.data.node.clone())
                .unwrap_or_default(),
        })
        .collect())
}

/// Polls the registry until `count` processes of the application are in.
async fn wait_for_application(
    ctx: &AgentContext,
    plan: &LaunchPlan,
    mut launched: Option<&mut Child>,
) -> Result<Vec<ProcessEntry>, AgentError> {
    let registry = ctx
        .registry()
        .ok_or_else(|| AgentError::Config("registry lookup in fast mode".into()))?;
    let filter = EntryFilter::application(&plan.app_name);
    let deadline = ctx.deadline();
    loop {
        let entries = registry.query(&filter, deadline).await?;
        if entries.len() >= plan.mpinumprocs as usize {
            return application_processes(&entries, plan.mpinumprocs);
        }
        if let Some(child) = launched.as_deref_mut() {
            if let Some(status) = child.try_wait().map_err(|e| AgentError::Launch(e.to_string()))? {
                if !status.success() {
                    return Err(AgentError::Launch(format!(
                        "application exited with {status} before registering"
                    )));
                }
            }
        }
        if Instant::now() + ctx.timings.connect_retry > deadline {
            return Err(AgentError::Launch(format!(
                "only {} of {} application processes registered",
                entries.len(),
                plan.mpinumprocs
            )));
        }
        tracing::debug!(
            registered = entries.len(),
            expected = plan.mpinumprocs,
            "waiting for application processes"
        );
        tokio::time::sleep(ctx.timings.connect_retry).await;
    }
}

fn parent_locator(
    plan: &LaunchPlan,
    desc: &AgentDescriptor,
    ports: &HashMap<Tag, (String, u16)>,
) -> ParentLocator {
    if !plan.is_fast() {
        return ParentLocator::Registry;
    }
    match ports.get(&desc.parent) {
        Some((host, port)) => ParentLocator::Static {
            host: host.clone(),
            port: *port,
        },
        None => ParentLocator::Static {
            host: plan.frontend_host.clone(),
            port: plan.frontend_port,
        },
    }
}

/// Factory for the backend of each in-process analysis agent.
pub type BackendFactory<B> = Arc<dyn Fn(&AgentDescriptor, &LaunchPlan) -> B + Send + Sync>;

/// Runs agents as tasks of the current runtime.
pub struct InProcessStarter<B = SimulatedBackend> {
    backends: BackendFactory<B>,
    agents: Vec<(Tag, JoinHandle<Result<(), AgentError>>)>,
    launches: u32,
}

impl InProcessStarter {
    pub fn new() -> Self {
        Self::with_backends(|desc: &AgentDescriptor, plan: &LaunchPlan| {
            let backend = SimulatedBackend::new(desc.appl_ids.clone(), plan.ompnumthreads);
            match &plan.phase {
                Some(phase) => backend.with_phase(phase.clone()),
                None => backend,
            }
        })
    }
}

impl<B: AnalysisBackend + 'static> InProcessStarter<B> {
    pub fn with_backends<F>(backends: F) -> Self
    where
        F: Fn(&AgentDescriptor, &LaunchPlan) -> B + Send + Sync + 'static,
    {
        InProcessStarter {
            backends: Arc::new(backends),
            agents: Vec::new(),
            launches: 0,
        }
    }

    /// Registers simulated application processes, as an instrumented
    /// application would on startup.
    async fn register_processes(
        &self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> Result<Vec<ProcessEntry>, AgentError> {
        let Some(registry) = ctx.registry() else {
            return Ok(fast_processes(plan.mpinumprocs, &plan.frontend_host));
        };
        for rank in 0..plan.mpinumprocs {
            let data = EntryData {
                app: plan.app_name.clone(),
                node: plan.frontend_host.clone(),
                pid: rank + 1,
                comp: COMP_APPLICATION.to_string(),
                tag: APPLICATION_TAG.to_string(),
                ..Default::default()
            };
            registry.register(&data, ctx.deadline()).await?;
        }
        wait_for_application(ctx, plan, None).await
    }

    async fn join_agents(&mut self) -> Vec<(Tag, Result<(), AgentError>)> {
        let mut results = Vec::new();
        for (tag, mut handle) in self.agents.drain(..) {
            let outcome = match tokio::time::timeout(AGENT_EXIT_GRACE, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(AgentError::Launch(format!("agent task failed: {join}"))),
                Err(_) => {
                    handle.abort();
                    Err(AgentError::Launch("agent did not exit".into()))
                }
            };
            results.push((tag, outcome));
        }
        results
    }
}

impl Default for InProcessStarter {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: AnalysisBackend + 'static> ApplicationStarter for InProcessStarter<B> {
    async fn run_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> Result<Vec<ProcessEntry>, AgentError> {
        self.launches += 1;
        self.register_processes(ctx, plan).await
    }

    async fn rerun_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
        previous: &IdMap,
        regions: &[String],
    ) -> Result<IdMap, AgentError> {
        self.launches += 1;
        tracing::info!(launch = self.launches, ?regions, "relaunching simulated application");
        let processes = self.register_processes(ctx, plan).await?;
        Ok(previous.successor(processes.into_iter().map(|p| p.id).collect())?)
    }

    async fn run_agents(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
        topology: &Topology,
    ) -> Result<(), AgentError> {
        // bind everything first so fast-mode children know their parent's port
        let mut inbound = Vec::new();
        let mut ports = HashMap::new();
        for desc in topology.agents() {
            let endpoint = Inbound::open(0).await?;
            ports.insert(desc.tag.clone(), (ctx.hostname.clone(), endpoint.port));
            inbound.push((desc.clone(), endpoint));
        }

        for (desc, endpoint) in inbound {
            let agent_ctx = ctx.clone();
            let parent_locator = parent_locator(plan, &desc, &ports);
            let tag = desc.tag.clone();
            let handle = match desc.kind {
                AgentKind::Analysis => {
                    let backend = (self.backends)(&desc, plan);
                    let config = AnalysisAgentConfig {
                        tag: desc.tag,
                        parent: desc.parent,
                        port: endpoint.port,
                        parent_locator,
                        processes: desc.appl_ids,
                    };
                    let agent = AnalysisAgent::with_inbound(agent_ctx, config, backend, endpoint);
                    tokio::spawn(agent.run())
                }
                AgentKind::HighLevel => {
                    let config = HlAgentConfig {
                        tag: desc.tag,
                        parent: desc.parent,
                        port: endpoint.port,
                        parent_locator,
                        children: desc.children,
                        dontcluster: plan.dontcluster,
                    };
                    let agent = HlAgent::with_inbound(agent_ctx, config, endpoint);
                    tokio::spawn(agent.run())
                }
            };
            self.agents.push((tag, handle));
        }
        tracing::info!(agents = self.agents.len(), "in-process agents started");
        Ok(())
    }

    async fn shutdown(&mut self) {
        for (tag, result) in self.join_agents().await {
            match result {
                Ok(()) => tracing::debug!(%tag, "agent finished"),
                Err(err) => tracing::warn!(%tag, error = %err, "agent ended with an error"),
            }
        }
    }
}

/// Spawns the application and agents as OS processes.
pub struct ProcessStarter {
    program: PathBuf,
    application: Option<Child>,
    agents: Vec<(Tag, Child)>,
}

impl ProcessStarter {
    /// `program` is the `psc` binary used to launch agents.
    pub fn new(program: PathBuf) -> Self {
        ProcessStarter {
            program,
            application: None,
            agents: Vec::new(),
        }
    }

    pub fn current_exe() -> Result<Self, AgentError> {
        let program = std::env::current_exe().map_err(|e| AgentError::Launch(e.to_string()))?;
        Ok(Self::new(program))
    }

    fn spawn_application(&mut self, plan: &LaunchPlan, regions: &[String]) -> Result<(), AgentError> {
        let Some(command) = &plan.app_run else {
            tracing::info!(app = %plan.app_name, "no --apprun given, expecting the application to be started externally");
            return Ok(());
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env(ENV_APPNAME, &plan.app_name)
            .env("OMP_NUM_THREADS", plan.ompnumthreads.to_string())
            .stdin(Stdio::null());
        if let Some(registry) = &plan.registry {
            cmd.env(ENV_REGISTRY, registry.to_string());
        }
        if let Some(base) = plan.appl_baseport {
            cmd.env("PSC_APPL_BASEPORT", base.to_string());
        }
        if !regions.is_empty() {
            cmd.env(ENV_INSTRUMENT_REGIONS, regions.join(","));
        }
        let child = cmd
            .spawn()
            .map_err(|e| AgentError::Launch(format!("{command}: {e}")))?;
        tracing::info!(%command, pid = ?child.id(), "application launched");
        self.application = Some(child);
        Ok(())
    }

    async fn reap_application(&mut self) {
        if let Some(mut child) = self.application.take() {
            match tokio::time::timeout(AGENT_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "application exited"),
                Ok(Err(err)) => tracing::warn!(error = %err, "cannot wait for application"),
                Err(_) => {
                    tracing::warn!("application still running, killing it");
                    if let Err(err) = child.kill().await {
                        tracing::warn!(error = %err, "cannot kill application");
                    }
                }
            }
        }
    }

    async fn processes(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> Result<Vec<ProcessEntry>, AgentError> {
        if plan.is_fast() {
            return Ok(fast_processes(plan.mpinumprocs, &plan.frontend_host));
        }
        wait_for_application(ctx, plan, self.application.as_mut()).await
    }
}

/// Command line of one agent, without the program name.
pub fn agent_arguments(
    desc: &AgentDescriptor,
    plan: &LaunchPlan,
    parent_host: &str,
    parent_port: u16,
) -> Vec<String> {
    let mut args = vec![
        match desc.kind {
            AgentKind::Analysis => "aagent".to_string(),
            AgentKind::HighLevel => "hlagent".to_string(),
        },
        "--tag".to_string(),
        desc.tag.to_string(),
        "--parent".to_string(),
        desc.parent.to_string(),
        "--port".to_string(),
        desc.port.to_string(),
        "--hostname".to_string(),
        desc.host.clone(),
        "--appname".to_string(),
        plan.app_name.clone(),
        "--timeout".to_string(),
        plan.timeout.as_secs().to_string(),
        "--debug".to_string(),
        plan.debug.to_string(),
    ];
    match desc.kind {
        AgentKind::Analysis => {
            args.push("--id".to_string());
            args.push(desc.appl_id_list());
            args.push("--ompnumthreads".to_string());
            args.push(plan.ompnumthreads.to_string());
            if let Some(phase) = &plan.phase {
                args.push("--phase".to_string());
                args.push(phase.clone());
            }
        }
        AgentKind::HighLevel => {
            args.push("--child".to_string());
            args.push(desc.children_list());
            if plan.dontcluster {
                args.push("--dontcluster".to_string());
            }
        }
    }
    match &plan.registry {
        Some(registry) => {
            args.push("--registry".to_string());
            args.push(registry.to_string());
        }
        None => {
            args.push("--parent-host".to_string());
            args.push(parent_host.to_string());
            args.push("--parent-port".to_string());
            args.push(parent_port.to_string());
        }
    }
    args
}

impl ApplicationStarter for ProcessStarter {
    async fn run_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> Result<Vec<ProcessEntry>, AgentError> {
        self.spawn_application(plan, &[])?;
        self.processes(ctx, plan).await
    }

    async fn rerun_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
        previous: &IdMap,
        regions: &[String],
    ) -> Result<IdMap, AgentError> {
        self.reap_application().await;
        self.spawn_application(plan, regions)?;
        let processes = self.processes(ctx, plan).await?;
        Ok(previous.successor(processes.into_iter().map(|p| p.id).collect())?)
    }

    async fn run_agents(
        &mut self,
        _ctx: &AgentContext,
        plan: &LaunchPlan,
        topology: &Topology,
    ) -> Result<(), AgentError> {
        let endpoints: HashMap<Tag, (String, u16)> = topology
            .agents()
            .map(|d| (d.tag.clone(), (d.host.clone(), d.port)))
            .collect();

        for desc in topology.agents() {
            let (parent_host, parent_port) = endpoints
                .get(&desc.parent)
                .cloned()
                .unwrap_or_else(|| (plan.frontend_host.clone(), plan.frontend_port));
            let args = agent_arguments(desc, plan, &parent_host, parent_port);

            let local = plan.force_localhost || desc.host == plan.frontend_host;
            let mut cmd = if local {
                let mut cmd = Command::new(&self.program);
                cmd.args(&args);
                cmd
            } else {
                let mut cmd = Command::new("ssh");
                cmd.arg(&desc.host).arg(&self.program).args(&args);
                cmd
            };
            cmd.stdin(Stdio::null()).kill_on_drop(true);
            let child = cmd
                .spawn()
                .map_err(|e| AgentError::Launch(format!("agent {}: {e}", desc.tag)))?;
            tracing::debug!(tag = %desc.tag, host = %desc.host, local, "agent launched");
            self.agents.push((desc.tag.clone(), child));
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        for (tag, mut child) in self.agents.drain(..) {
            match tokio::time::timeout(AGENT_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => tracing::warn!(%tag, %status, "agent exited with failure"),
                Ok(Err(err)) => tracing::warn!(%tag, error = %err, "cannot wait for agent"),
                Err(_) => {
                    tracing::warn!(%tag, "agent did not exit, killing it");
                    if let Err(err) = child.kill().await {
                        tracing::warn!(%tag, error = %err, "cannot kill agent");
                    }
                }
            }
        }
        self.reap_application().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use psc_core::TopologyParams;

    fn plan(registry: Option<RegistryAddr>) -> LaunchPlan {
        LaunchPlan {
            app_name: "app".into(),
            app_run: None,
            mpinumprocs: 8,
            ompnumthreads: 2,
            phase: Some("mainRegion".into()),
            frontend_host: "fe-host".into(),
            frontend_port: 30000,
            registry,
            force_localhost: false,
            dontcluster: false,
            timeout: Duration::from_secs(600),
            debug: 1,
            appl_baseport: None,
        }
    }

    fn entry(id: u32, pid: u32, node: &str) -> Entry {
        Entry {
            id: RegistryId(id),
            data: EntryData {
                pid,
                node: node.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn application_entries_are_ordered_by_rank() {
        let entries = vec![entry(12, 2, "b"), entry(11, 1, "a"), entry(13, 3, "b")];
        let procs = application_processes(&entries, 3).unwrap();
        let ids: Vec<u32> = procs.iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![11, 12, 13]);
        assert_eq!(procs[0].host, "a");

        let missing = vec![entry(11, 1, "a"), entry(13, 3, "b")];
        assert!(application_processes(&missing, 3).is_err());
    }

    #[test]
    fn agent_command_lines() {
        let params = TopologyParams {
            max_cluster: 4,
            max_fan: 4,
            force_localhost: false,
            frontend_tag: Tag::parse("fe[1]").unwrap(),
            frontend_host: "fe-host".into(),
            agent_baseport: 50002,
        };
        let topology = Topology::compute(&fast_processes(8, "n1"), &params).unwrap();
        let leaf = &topology.leaves()[0];
        let root = topology.root();

        let fast = plan(None);
        let args = agent_arguments(leaf, &fast, "fe-host", 30003);
        assert_eq!(args[0], "aagent");
        assert!(args.windows(2).any(|w| w[0] == "--port" && w[1] == "50002"));
        assert!(args.windows(2).any(|w| w[0] == "--id" && w[1] == "0,1,2,3"));
        assert!(args.windows(2).any(|w| w[0] == "--parent-port" && w[1] == "30003"));
        assert!(args.windows(2).any(|w| w[0] == "--phase" && w[1] == "mainRegion"));

        let registry = plan(Some(RegistryAddr {
            host: "reg".into(),
            port: 50001,
        }));
        let args = agent_arguments(root, &registry, "fe-host", 30000);
        assert_eq!(args[0], "hlagent");
        assert!(args.windows(2).any(|w| w[0] == "--registry" && w[1] == "reg:50001"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--child" && w[1] == root.children_list()));
        assert!(!args.iter().any(|a| a == "--parent-host"));
    }
}
