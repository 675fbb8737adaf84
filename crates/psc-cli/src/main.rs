//! The `psc` binary.
//!
//! One executable for every process of the hierarchy: the `frontend` an
//! operator starts, the `hlagent` and `aagent` processes the frontend
//! launches, and the `registry` service they meet at.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::Level;

use psc_agents::config::{debug_level, DEFAULT_REGISTRY_PORT, DEFAULT_TIMEOUT_DELTA, ENV_REGISTRY};
use psc_agents::{
    AgentContext, AgentError, AnalysisAgent, AnalysisAgentConfig, ApplicationStarter, Discovery,
    Environment, FileConfig, Frontend, FrontendConfig, FrontendOptions, GlobalTimeout, HlAgent,
    HlAgentConfig, InProcessStarter, ParentLocator, ProcessStarter, RegistryAddr,
    SimulatedBackend, Timings,
};
use psc_core::{RegistryId, Tag};
use psc_registry::state::RegistryState;
use psc_registry::RegistryClient;

/// Distributed performance analysis through a tree of agents.
#[derive(Parser)]
#[command(name = "psc", about = "Hierarchical performance analysis agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an analysis run.
    Frontend(FrontendArgs),
    /// Run an interior agent (launched by the frontend).
    Hlagent(HlAgentArgs),
    /// Run a leaf agent (launched by the frontend).
    Aagent(AnalysisAgentArgs),
    /// Serve the registry.
    Registry {
        #[arg(long, default_value_t = DEFAULT_REGISTRY_PORT)]
        port: u16,

        #[arg(long)]
        debug: Option<u8>,
    },
}

#[derive(Args)]
struct FrontendArgs {
    /// Application name used to find its processes in the registry.
    #[arg(long)]
    appname: Option<String>,

    /// Shell command that starts the application.
    #[arg(long)]
    apprun: Option<String>,

    #[arg(long)]
    mpinumprocs: Option<u32>,

    #[arg(long)]
    ompnumthreads: Option<u32>,

    #[arg(long)]
    strategy: Option<String>,

    /// Phase region the analysis measures.
    #[arg(long)]
    phase: Option<String>,

    #[arg(long)]
    uninstrumented: bool,

    /// Run every agent on this host.
    #[arg(long)]
    force_localhost: bool,

    #[arg(long)]
    debug: Option<u8>,

    /// Registry as host:port.
    #[arg(long)]
    registry: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    maxfan: Option<usize>,

    #[arg(long)]
    maxcluster: Option<usize>,

    /// Global timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Phases to skip before measuring.
    #[arg(long)]
    delay: Option<u32>,

    #[arg(long)]
    duration: Option<u32>,

    #[arg(long)]
    propfile: Option<PathBuf>,

    /// Properties shown in the summary.
    #[arg(long)]
    nrprops: Option<usize>,

    #[arg(long)]
    pedantic: bool,

    #[arg(long)]
    iterations: Option<u32>,

    /// Wait for operator commands on stdin between rounds.
    #[arg(long)]
    manual: bool,

    #[arg(long)]
    dontcluster: bool,

    /// Summarize findings per property and region instead of clustering.
    #[arg(long)]
    gather: bool,

    /// Skip the registry; agents find each other by fixed endpoints.
    #[arg(long)]
    fastmode: bool,

    #[arg(long)]
    hostname: Option<String>,

    /// Run the agents inside this process on simulated measurements.
    #[arg(long)]
    simulate: bool,
}

/// Options every launched agent takes.
#[derive(Args)]
struct AgentArgs {
    #[arg(long)]
    tag: Tag,

    #[arg(long)]
    parent: Tag,

    #[arg(long, default_value_t = 0)]
    port: u16,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    appname: Option<String>,

    /// Global timeout in seconds.
    #[arg(long, default_value_t = 18000)]
    timeout: u64,

    #[arg(long)]
    debug: Option<u8>,

    /// Registry as host:port.
    #[arg(long, conflicts_with = "parent_host")]
    registry: Option<String>,

    /// Parent endpoint in fast mode.
    #[arg(long, requires = "parent_port")]
    parent_host: Option<String>,

    #[arg(long, requires = "parent_host")]
    parent_port: Option<u16>,
}

#[derive(Args)]
struct HlAgentArgs {
    #[command(flatten)]
    agent: AgentArgs,

    #[arg(long, value_delimiter = ',')]
    child: Vec<Tag>,

    #[arg(long)]
    dontcluster: bool,
}

#[derive(Args)]
struct AnalysisAgentArgs {
    #[command(flatten)]
    agent: AgentArgs,

    /// Registry ids of the owned application processes.
    #[arg(long, value_delimiter = ',')]
    id: Vec<u32>,

    #[arg(long, default_value_t = 1)]
    ompnumthreads: u32,

    #[arg(long)]
    phase: Option<String>,
}

impl Commands {
    fn debug(&self) -> Option<u8> {
        match self {
            Commands::Frontend(args) => args.debug,
            Commands::Hlagent(args) => args.agent.debug,
            Commands::Aagent(args) => args.agent.debug,
            Commands::Registry { debug, .. } => *debug,
        }
    }
}

impl From<&FrontendArgs> for FrontendOptions {
    fn from(args: &FrontendArgs) -> Self {
        FrontendOptions {
            appname: args.appname.clone(),
            apprun: args.apprun.clone(),
            mpinumprocs: args.mpinumprocs,
            ompnumthreads: args.ompnumthreads,
            strategy: args.strategy.clone(),
            phase: args.phase.clone(),
            uninstrumented: args.uninstrumented,
            force_localhost: args.force_localhost,
            debug: args.debug,
            registry: args.registry.clone(),
            port: args.port,
            maxfan: args.maxfan,
            maxcluster: args.maxcluster,
            timeout: args.timeout,
            delay: args.delay,
            duration: args.duration,
            propfile: args.propfile.clone(),
            nrprops: args.nrprops,
            pedantic: args.pedantic,
            iterations: args.iterations,
            manual: args.manual,
            dontcluster: args.dontcluster,
            gather: args.gather,
            fastmode: args.fastmode,
            hostname: args.hostname.clone(),
        }
    }
}

fn init_tracing(level: u8) {
    let max = match level {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(max)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let env = Environment::from_process();
    init_tracing(debug_level(cli.command.debug(), &env));

    let result = match cli.command {
        Commands::Frontend(args) => run_frontend(args, &env).await,
        Commands::Hlagent(args) => run_hlagent(args, &env).await,
        Commands::Aagent(args) => run_aagent(args, &env).await,
        Commands::Registry { port, .. } => run_registry(port).await,
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "fatal");
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

/// Operator commands: stdin lines in manual mode, and `quit` on Ctrl-C.
fn operator_commands(manual: bool) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    let interrupt = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, quitting");
            if interrupt.send("quit".to_string()).is_err() {
                tracing::debug!("frontend already stopped");
            }
        }
    });

    if manual {
        tokio::spawn(forward_lines(BufReader::new(tokio::io::stdin()), tx));
    }
    rx
}

/// Sends each input line to the frontend, then `quit` at end of input.
///
/// Returns as soon as the frontend stops listening.
async fn forward_lines<R>(input: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            return;
        }
    }
    if tx.send("quit".to_string()).is_err() {
        tracing::debug!("frontend already stopped");
    }
}

async fn run_frontend(args: FrontendArgs, env: &Environment) -> Result<(), AgentError> {
    let file = FileConfig::discover(env)?;
    let config = FrontendConfig::resolve(&FrontendOptions::from(&args), env, &file)?;
    let commands = operator_commands(config.manual);

    if args.simulate {
        drive(config, InProcessStarter::new(), commands).await
    } else {
        drive(config, ProcessStarter::current_exe()?, commands).await
    }
}

async fn drive<S: ApplicationStarter>(
    config: FrontendConfig,
    starter: S,
    commands: mpsc::UnboundedReceiver<String>,
) -> Result<(), AgentError> {
    let frontend = Frontend::initialize(config, Timings::default(), starter)
        .await?
        .with_operator(commands);
    let report = frontend.run().await?;
    println!(
        "run {}: {} round(s), {} restart(s), {} of {} properties written to {}",
        report.run_id,
        report.rounds,
        report.restarts,
        report.exported,
        report.properties,
        report.propfile.display()
    );
    Ok(())
}

/// Context and parent locator of a launched agent.
fn agent_setup(
    args: &AgentArgs,
    env: &Environment,
) -> Result<(AgentContext, ParentLocator), AgentError> {
    let file = FileConfig::discover(env)?;
    let hostname = args.hostname.clone().unwrap_or_else(|| env.hostname());
    let app_name = args
        .appname
        .clone()
        .or_else(|| env.get(psc_agents::config::ENV_APPNAME).map(str::to_string))
        .ok_or_else(|| AgentError::Config("--appname is required".into()))?;

    let (discovery, locator) = match (&args.parent_host, args.parent_port) {
        (Some(host), Some(port)) => (
            Discovery::Fast,
            ParentLocator::Static {
                host: host.clone(),
                port,
            },
        ),
        _ => {
            let addr = match args.registry.as_deref().or_else(|| env.get(ENV_REGISTRY)) {
                Some(raw) => RegistryAddr::parse(raw)?,
                None => RegistryAddr {
                    host: file
                        .regservice_host_init
                        .clone()
                        .unwrap_or_else(|| "localhost".to_string()),
                    port: file.regservice_port_init.unwrap_or(DEFAULT_REGISTRY_PORT),
                },
            };
            (
                Discovery::Registry(RegistryClient::new(&addr.host, addr.port)),
                ParentLocator::Registry,
            )
        }
    };

    let timeout = GlobalTimeout::new(Duration::from_secs(args.timeout), DEFAULT_TIMEOUT_DELTA);
    let ctx = AgentContext::new(app_name, hostname, discovery, timeout).with_site(
        file.site.unwrap_or_default(),
        file.machine.unwrap_or_default(),
    );
    Ok((ctx, locator))
}

async fn run_hlagent(args: HlAgentArgs, env: &Environment) -> Result<(), AgentError> {
    let (ctx, parent_locator) = agent_setup(&args.agent, env)?;
    let config = HlAgentConfig {
        tag: args.agent.tag,
        parent: args.agent.parent,
        port: args.agent.port,
        parent_locator,
        children: args.child,
        dontcluster: args.dontcluster,
    };
    HlAgent::open(ctx, config).await?.run().await
}

async fn run_aagent(args: AnalysisAgentArgs, env: &Environment) -> Result<(), AgentError> {
    let (ctx, parent_locator) = agent_setup(&args.agent, env)?;
    let processes: Vec<RegistryId> = args.id.into_iter().map(RegistryId).collect();
    let mut backend = SimulatedBackend::new(processes.clone(), args.ompnumthreads);
    if let Some(phase) = args.phase {
        backend = backend.with_phase(phase);
    }
    let config = AnalysisAgentConfig {
        tag: args.agent.tag,
        parent: args.agent.parent,
        port: args.agent.port,
        parent_locator,
        processes,
    };
    AnalysisAgent::open(ctx, config, backend).await?.run().await
}

async fn run_registry(port: u16) -> Result<(), AgentError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| AgentError::Bind { port, source })?;
    tracing::info!(port, "registry listening");
    psc_registry::serve(listener, RegistryState::new())
        .await
        .map_err(|source| AgentError::Bind { port, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdin_lines_end_with_quit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(&b"help\nstart\n"[..], tx).await;
        assert_eq!(rx.recv().await.as_deref(), Some("help"));
        assert_eq!(rx.recv().await.as_deref(), Some("start"));
        assert_eq!(rx.recv().await.as_deref(), Some("quit"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn closed_frontend_stops_the_reader() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        // endless empty lines
        let input = BufReader::new(tokio::io::repeat(b'\n'));
        tokio::time::timeout(Duration::from_secs(1), forward_lines(input, tx))
            .await
            .unwrap();
    }
}
