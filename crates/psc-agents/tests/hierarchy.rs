//! End-to-end runs of a frontend driving in-process HL and analysis agents.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use psc_agents::config::{Environment, FileConfig, FrontendConfig, FrontendOptions, ENV_AGENT_BASEPORT};
use psc_agents::starter::{ApplicationStarter, InProcessStarter, LaunchPlan};
use psc_agents::transport::{HeartbeatKind, Message, PeerLink};
use psc_agents::{
    AgentContext, AgentError, AnalysisBackend, ExperimentOutcome, Frontend, SimulatedBackend,
    Timings,
};
use psc_core::property::{REGIONS_KEY, REQUIRED_REGIONS};
use psc_core::{
    AgentDescriptor, CallTreeNode, IdMap, ProcessEntry, Property, StrategyRequest, Topology,
};
use psc_registry::state::RegistryState;

fn timings() -> Timings {
    Timings {
        barrier_first: Duration::from_millis(50),
        barrier_interval: Duration::from_millis(50),
        connect_retry: Duration::from_millis(50),
        quit_grace: Duration::from_secs(2),
    }
}

fn options(dir: &Path, procs: u32) -> FrontendOptions {
    FrontendOptions {
        appname: Some("lulesh".into()),
        mpinumprocs: Some(procs),
        phase: Some("mainRegion".into()),
        hostname: Some("127.0.0.1".into()),
        port: Some(0),
        maxfan: Some(2),
        maxcluster: Some(2),
        timeout: Some(30),
        propfile: Some(dir.join("properties.psc")),
        fastmode: true,
        ..Default::default()
    }
}

fn resolve(opts: &FrontendOptions) -> FrontendConfig {
    FrontendConfig::resolve(opts, &Environment::default(), &FileConfig::default()).unwrap()
}

async fn spawn_registry() -> (u16, RegistryState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = RegistryState::new();
    tokio::spawn(psc_registry::serve(listener, state.clone()));
    (port, state)
}

fn count_property_elements(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .unwrap()
        .matches("<property ")
        .count()
}

#[tokio::test]
async fn fast_mode_single_round() {
    let dir = tempfile::tempdir().unwrap();
    let config = resolve(&options(dir.path(), 8));
    let propfile = config.propfile.clone();

    let frontend = Frontend::initialize(config, timings(), InProcessStarter::new())
        .await
        .unwrap();
    assert_eq!(frontend.tag().as_str(), "fe[1]");

    let report = frontend.run().await.unwrap();
    assert_eq!(report.rounds, 1);
    assert_eq!(report.restarts, 0);
    assert!(report.properties >= 1);
    // neighbouring processes report mergeable findings, so clustering shrinks the set
    assert!(report.properties < 8);
    assert_eq!(report.exported, count_property_elements(&propfile));
}

#[tokio::test]
async fn iterations_dispatch_one_request_each() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path(), 3);
    opts.iterations = Some(2);

    let frontend = Frontend::initialize(resolve(&opts), timings(), InProcessStarter::new())
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.rounds, 2);
    assert_eq!(report.restarts, 0);
}

#[tokio::test]
async fn single_process_needs_no_hl_agent() {
    let dir = tempfile::tempdir().unwrap();
    let frontend = Frontend::initialize(resolve(&options(dir.path(), 1)), timings(), InProcessStarter::new())
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.rounds, 1);
    assert_eq!(report.exported, 1);
}

#[tokio::test]
async fn restart_request_relaunches_the_application() {
    let dir = tempfile::tempdir().unwrap();
    let starter = InProcessStarter::with_backends(
        |desc: &AgentDescriptor, plan: &LaunchPlan| {
            SimulatedBackend::new(desc.appl_ids.clone(), plan.ompnumthreads)
                .with_script([ExperimentOutcome::Restart])
        },
    );

    let frontend = Frontend::initialize(resolve(&options(dir.path(), 4)), timings(), starter)
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.restarts, 1);
    assert_eq!(report.rounds, 1);
}

#[tokio::test]
async fn required_regions_escalate_an_experiment_to_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let starter = InProcessStarter::with_backends(
        |desc: &AgentDescriptor, plan: &LaunchPlan| {
            let mut required = Property::new("9000", REQUIRED_REGIONS, "main");
            required
                .extra_info
                .insert(REGIONS_KEY.to_string(), "solver\nhalo_exchange".to_string());
            SimulatedBackend::new(desc.appl_ids.clone(), plan.ompnumthreads)
                .with_script([ExperimentOutcome::AnotherExperiment])
                .with_findings([required])
        },
    );

    let frontend = Frontend::initialize(resolve(&options(dir.path(), 2)), timings(), starter)
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.restarts, 1);
}

#[tokio::test]
async fn registry_mode_round_cleans_up_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (port, state) = spawn_registry().await;
    let mut opts = options(dir.path(), 4);
    opts.fastmode = false;
    opts.registry = Some(format!("127.0.0.1:{port}"));

    let frontend = Frontend::initialize(resolve(&opts), timings(), InProcessStarter::new())
        .await
        .unwrap();
    assert_eq!(frontend.tag().as_str(), "fe[1]");

    let report = frontend.run().await.unwrap();
    assert_eq!(report.rounds, 1);
    assert!(report.exported >= 1);
    assert!(state.store.is_empty());
}

#[tokio::test]
async fn registry_mode_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (port, state) = spawn_registry().await;
    let mut opts = options(dir.path(), 2);
    opts.fastmode = false;
    opts.registry = Some(format!("127.0.0.1:{port}"));

    let starter = InProcessStarter::with_backends(
        |desc: &AgentDescriptor, plan: &LaunchPlan| {
            SimulatedBackend::new(desc.appl_ids.clone(), plan.ompnumthreads)
                .with_script([ExperimentOutcome::Restart])
        },
    );
    let frontend = Frontend::initialize(resolve(&opts), timings(), starter)
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.restarts, 1);
    assert!(state.store.is_empty());
}

/// Launches nothing, so no agent ever reports in.
struct SilentStarter;

impl ApplicationStarter for SilentStarter {
    async fn run_application(
        &mut self,
        _ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> Result<Vec<ProcessEntry>, AgentError> {
        Ok(psc_agents::starter::fast_processes(plan.mpinumprocs, &plan.frontend_host))
    }

    async fn rerun_application(
        &mut self,
        _ctx: &AgentContext,
        _plan: &LaunchPlan,
        previous: &IdMap,
        _regions: &[String],
    ) -> Result<IdMap, AgentError> {
        Ok(previous.clone())
    }

    async fn run_agents(
        &mut self,
        _ctx: &AgentContext,
        _plan: &LaunchPlan,
        _topology: &Topology,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

#[tokio::test]
async fn startup_barrier_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path(), 2);
    opts.timeout = Some(1);

    let frontend = Frontend::initialize(resolve(&opts), timings(), SilentStarter)
        .await
        .unwrap();
    let err = frontend.run().await.unwrap_err();
    assert!(matches!(err, AgentError::BarrierTimeout { step: "startup" }));
    assert_eq!(err.to_string(), "Timed out waiting for child agent(s) (startup)");
}

#[tokio::test]
async fn manual_mode_waits_for_the_operator() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path(), 2);
    opts.manual = true;

    let (tx, rx) = mpsc::unbounded_channel();
    let frontend = Frontend::initialize(resolve(&opts), timings(), InProcessStarter::new())
        .await
        .unwrap()
        .with_operator(rx);

    tokio::spawn(async move {
        tx.send("help".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send("start".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send("properties".to_string()).unwrap();
        tx.send("quit".to_string()).unwrap();
    });

    let report = frontend.run().await.unwrap();
    assert_eq!(report.rounds, 1);
    assert!(report.exported >= 1);
}

#[tokio::test]
async fn gather_mode_summarizes_per_property_and_region() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path(), 4);
    opts.gather = true;
    let config = resolve(&opts);
    let propfile = config.propfile.clone();

    // the two leaves report the same finding with severities far apart
    let starter = InProcessStarter::with_backends(|desc: &AgentDescriptor, plan: &LaunchPlan| {
        let first = desc.appl_ids[0].0;
        let mut halo = Property::new("2002", "Late sender in halo exchange", "halo_exchange");
        halo.severity = if first == 0 { 2.0 } else { 20.0 };
        halo.confidence = 1.0;
        halo.process = first;
        SimulatedBackend::new(desc.appl_ids.clone(), plan.ompnumthreads).with_findings([halo])
    });

    let frontend = Frontend::initialize(config, timings(), starter)
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.rounds, 1);
    // one summary for the per-process finding, one for the halo finding
    assert_eq!(report.properties, 2);

    let xml = std::fs::read_to_string(&propfile).unwrap();
    assert_eq!(xml.matches("<property cluster=\"true\"").count(), 2);
    // 4 processes behind the first summary, 2 leaves behind the second
    assert_eq!(xml.matches("<execObj ").count(), 6);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Configured,
    Experiment,
    Reattached,
}

type Journal = Arc<Mutex<Vec<(u32, Step, Instant)>>>;

/// Simulated measurements that record what each leaf did, and when.
struct JournalBackend {
    inner: SimulatedBackend,
    leaf: u32,
    reattach_delay: Duration,
    journal: Journal,
}

impl JournalBackend {
    fn factory(
        journal: &Journal,
        slow_leaf: Option<(u32, Duration)>,
    ) -> impl Fn(&AgentDescriptor, &LaunchPlan) -> JournalBackend + Send + Sync + 'static {
        let journal = journal.clone();
        move |desc: &AgentDescriptor, plan: &LaunchPlan| {
            let leaf = desc.appl_ids[0].0;
            let reattach_delay = match slow_leaf {
                Some((slow, delay)) if slow == leaf => delay,
                _ => Duration::ZERO,
            };
            let script = if slow_leaf.is_some() {
                vec![ExperimentOutcome::Restart]
            } else {
                Vec::new()
            };
            JournalBackend {
                inner: SimulatedBackend::new(desc.appl_ids.clone(), plan.ompnumthreads)
                    .with_script(script),
                leaf,
                reattach_delay,
                journal: journal.clone(),
            }
        }
    }

    fn note(&self, step: Step) {
        self.journal
            .lock()
            .unwrap()
            .push((self.leaf, step, Instant::now()));
    }
}

impl AnalysisBackend for JournalBackend {
    fn configure(&mut self, request: &StrategyRequest) {
        self.note(Step::Configured);
        self.inner.configure(request);
    }

    fn needs_restart(&self) -> bool {
        self.inner.needs_restart()
    }

    async fn run_experiment(&mut self) -> Result<ExperimentOutcome, AgentError> {
        self.note(Step::Experiment);
        self.inner.run_experiment().await
    }

    fn take_properties(&mut self) -> Vec<Property> {
        self.inner.take_properties()
    }

    async fn remap(&mut self, map: &IdMap) -> Result<(), AgentError> {
        tokio::time::sleep(self.reattach_delay).await;
        self.inner.remap(map).await?;
        self.note(Step::Reattached);
        Ok(())
    }

    fn call_tree(&self) -> Vec<CallTreeNode> {
        self.inner.call_tree()
    }

    async fn finish_application(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        self.inner.finish_application(ctx).await
    }
}

fn entries(journal: &Journal, leaf: u32, step: Step) -> Vec<Instant> {
    journal
        .lock()
        .unwrap()
        .iter()
        .filter(|(l, s, _)| *l == leaf && *s == step)
        .map(|(_, _, at)| *at)
        .collect()
}

#[tokio::test]
async fn experiments_resume_only_after_every_leaf_reattached() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path(), 2);
    opts.maxcluster = Some(1);

    let journal = Journal::default();
    let slow_leaf = 1;
    let starter = InProcessStarter::with_backends(JournalBackend::factory(
        &journal,
        Some((slow_leaf, Duration::from_millis(600))),
    ));

    let frontend = Frontend::initialize(resolve(&opts), timings(), starter)
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.restarts, 1);

    let fast_reattached = entries(&journal, 0, Step::Reattached);
    let slow_reattached = entries(&journal, slow_leaf, Step::Reattached);
    assert_eq!((fast_reattached.len(), slow_reattached.len()), (1, 1));
    assert!(fast_reattached[0] < slow_reattached[0]);

    // the ready leaf sits idle until the slow one has announced itself again
    let fast_experiments = entries(&journal, 0, Step::Experiment);
    assert_eq!(fast_experiments.len(), 2);
    assert!(fast_experiments[1] > slow_reattached[0]);
}

/// Replays a leaf's announcement to the frontend before the real agents start.
struct EchoingStarter {
    inner: InProcessStarter<JournalBackend>,
    agent_ports: Arc<Mutex<Vec<u16>>>,
}

impl ApplicationStarter for EchoingStarter {
    async fn run_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> Result<Vec<ProcessEntry>, AgentError> {
        self.inner.run_application(ctx, plan).await
    }

    async fn rerun_application(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
        previous: &IdMap,
        regions: &[String],
    ) -> Result<IdMap, AgentError> {
        self.inner.rerun_application(ctx, plan, previous, regions).await
    }

    async fn run_agents(
        &mut self,
        ctx: &AgentContext,
        plan: &LaunchPlan,
        topology: &Topology,
    ) -> Result<(), AgentError> {
        *self.agent_ports.lock().unwrap() = topology.agents().map(|a| a.port).collect();
        let leaf = &topology.leaves()[0];
        let announce = Message::Heartbeat {
            hostname: leaf.host.clone(),
            port: leaf.port,
            tag: leaf.tag.clone(),
            heartbeat: HeartbeatKind::Forwarded,
            num_procs: leaf.appl_ids.len() as u32,
        };
        let link = PeerLink::new(reqwest::Client::new(), &plan.frontend_host, plan.frontend_port);
        for _ in 0..2 {
            let accepted = link
                .send(&topology.root().tag, &announce)
                .await
                .map_err(|e| AgentError::Launch(e.to_string()))?;
            assert!(accepted);
        }
        self.inner.run_agents(ctx, plan, topology).await
    }

    async fn shutdown(&mut self) {
        self.inner.shutdown().await;
    }
}

#[tokio::test]
async fn repeated_announcement_releases_startup_once() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 4);
    let env = Environment::from_pairs([(ENV_AGENT_BASEPORT, "45000")]);
    let config = FrontendConfig::resolve(&opts, &env, &FileConfig::default()).unwrap();

    let journal = Journal::default();
    let agent_ports = Arc::new(Mutex::new(Vec::new()));
    let starter = EchoingStarter {
        inner: InProcessStarter::with_backends(JournalBackend::factory(&journal, None)),
        agent_ports: agent_ports.clone(),
    };

    let frontend = Frontend::initialize(config, timings(), starter)
        .await
        .unwrap();
    let report = frontend.run().await.unwrap();
    assert_eq!(report.rounds, 1);
    // two leaves and their parent, numbered from the agent base port
    assert_eq!(*agent_ports.lock().unwrap(), vec![45000, 45001, 45002]);

    // each leaf saw exactly one start
    assert_eq!(entries(&journal, 0, Step::Configured).len(), 1);
    assert_eq!(entries(&journal, 2, Step::Configured).len(), 1);
}

/// Announces the root agent, which leaves again right away.
struct VanishingStarter;

impl ApplicationStarter for VanishingStarter {
    async fn run_application(
        &mut self,
        _ctx: &AgentContext,
        plan: &LaunchPlan,
    ) -> Result<Vec<ProcessEntry>, AgentError> {
        Ok(psc_agents::starter::fast_processes(plan.mpinumprocs, &plan.frontend_host))
    }

    async fn rerun_application(
        &mut self,
        _ctx: &AgentContext,
        _plan: &LaunchPlan,
        previous: &IdMap,
        _regions: &[String],
    ) -> Result<IdMap, AgentError> {
        Ok(previous.clone())
    }

    async fn run_agents(
        &mut self,
        _ctx: &AgentContext,
        plan: &LaunchPlan,
        topology: &Topology,
    ) -> Result<(), AgentError> {
        let root = topology.root();
        let link = PeerLink::new(reqwest::Client::new(), &plan.frontend_host, plan.frontend_port);
        for heartbeat in [HeartbeatKind::Own, HeartbeatKind::Dismiss] {
            let message = Message::Heartbeat {
                hostname: root.host.clone(),
                port: root.port,
                tag: root.tag.clone(),
                heartbeat,
                num_procs: 0,
            };
            link.send(&root.tag, &message)
                .await
                .map_err(|e| AgentError::Launch(e.to_string()))?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

#[tokio::test]
async fn frontend_stops_when_its_last_agent_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let frontend = Frontend::initialize(resolve(&options(dir.path(), 2)), timings(), VanishingStarter)
        .await
        .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), frontend.run())
        .await
        .expect("frontend kept waiting for a dismissed agent")
        .unwrap();
    assert_eq!(report.rounds, 0);
    assert_eq!(report.exported, 0);
}
