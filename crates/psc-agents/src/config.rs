//! Layered configuration.
//!
//! Values come from, in decreasing precedence: command-line options
//! ([`FrontendOptions`]), environment variables ([`Environment`]), the TOML
//! config file ([`FileConfig`]) and built-in defaults. The environment is
//! passed in as a snapshot so resolution stays a pure function.
//!
//! Recognised environment variables:
//! - `PSC_REGISTRY`: registry address as `host:port`
//! - `PSC_AGENT_BASEPORT`: base port for agents
//! - `PSC_APPNAME`: application name
//! - `PERISCOPE_INFO`: debug level when `--debug` is absent
//! - `PSC_CONFIG`: config file path (default `$HOME/.periscope.toml`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use psc_core::{StrategyGeneralInfo, StrategyRequest};

use crate::error::AgentError;

pub const DEFAULT_FRONTEND_PORT: u16 = 30000;
pub const DEFAULT_REGISTRY_PORT: u16 = 50001;
pub const DEFAULT_AGENT_BASEPORT: u16 = 50002;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(18000);
pub const DEFAULT_TIMEOUT_DELTA: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_FAN: usize = 4;
pub const DEFAULT_MAX_CLUSTER: usize = 4;
pub const DEFAULT_NRPROPS: usize = 50;
pub const DEFAULT_DURATION: u32 = 1;
pub const DEFAULT_STRATEGY: &str = "default";
/// Upper bound on application launches in one run.
pub const MAX_RESTART_RUNS: u32 = 40;

pub const ENV_REGISTRY: &str = "PSC_REGISTRY";
pub const ENV_AGENT_BASEPORT: &str = "PSC_AGENT_BASEPORT";
pub const ENV_APPNAME: &str = "PSC_APPNAME";
pub const ENV_DEBUG: &str = "PERISCOPE_INFO";
pub const ENV_CONFIG: &str = "PSC_CONFIG";

/// Snapshot of the environment variables the runtime reads.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn from_process() -> Self {
        Environment {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Environment {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, AgentError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| AgentError::Config(format!("{key}={raw} is not a valid value"))),
        }
    }

    /// Host name to advertise to peers.
    pub fn hostname(&self) -> String {
        self.get("HOSTNAME")
            .map(str::to_string)
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Config file location: `$PSC_CONFIG`, else `$HOME/.periscope.toml`.
    pub fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.get(ENV_CONFIG) {
            return Some(PathBuf::from(path));
        }
        self.get("HOME")
            .map(|home| Path::new(home).join(".periscope.toml"))
    }
}

/// Contents of the config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub machine: Option<String>,
    pub site: Option<String>,
    pub regservice_host_init: Option<String>,
    pub regservice_port_init: Option<u16>,
    pub agent_baseport: Option<u16>,
    pub appl_baseport: Option<u16>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text).map_err(|e| AgentError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Loads the file named by the environment. A missing default file is
    /// not an error; a missing `$PSC_CONFIG` file is.
    pub fn discover(env: &Environment) -> Result<Self, AgentError> {
        let explicit = env.get(ENV_CONFIG).is_some();
        match env.config_path() {
            Some(path) if explicit || path.exists() => Self::load(&path),
            _ => Ok(FileConfig::default()),
        }
    }
}

/// Registry address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAddr {
    pub host: String,
    pub port: u16,
}

impl RegistryAddr {
    /// Parses `host:port`; a bare host gets the default registry port.
    pub fn parse(raw: &str) -> Result<Self, AgentError> {
        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AgentError::Config(format!("bad registry port in {raw:?}")))?;
                (host, port)
            }
            None => (raw, DEFAULT_REGISTRY_PORT),
        };
        if host.is_empty() {
            return Err(AgentError::Config(format!("bad registry address {raw:?}")));
        }
        if port == 0 {
            return Err(AgentError::Config("registry port must be positive".into()));
        }
        Ok(RegistryAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for RegistryAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Debug level from `--debug`, else `PERISCOPE_INFO`, else 0.
pub fn debug_level(cli: Option<u8>, env: &Environment) -> u8 {
    cli.or_else(|| env.get(ENV_DEBUG).and_then(|v| v.parse().ok()))
        .unwrap_or(0)
}

/// Frontend options as given on the command line; unset means "not given".
#[derive(Debug, Clone, Default)]
pub struct FrontendOptions {
    pub appname: Option<String>,
    pub apprun: Option<String>,
    pub mpinumprocs: Option<u32>,
    pub ompnumthreads: Option<u32>,
    pub strategy: Option<String>,
    pub phase: Option<String>,
    pub uninstrumented: bool,
    pub force_localhost: bool,
    pub debug: Option<u8>,
    pub registry: Option<String>,
    pub port: Option<u16>,
    pub maxfan: Option<usize>,
    pub maxcluster: Option<usize>,
    pub timeout: Option<u64>,
    pub delay: Option<u32>,
    pub duration: Option<u32>,
    pub propfile: Option<PathBuf>,
    pub nrprops: Option<usize>,
    pub pedantic: bool,
    pub iterations: Option<u32>,
    pub manual: bool,
    pub dontcluster: bool,
    pub gather: bool,
    pub fastmode: bool,
    pub hostname: Option<String>,
}

/// Fully resolved frontend configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendConfig {
    pub app_name: String,
    pub app_run: Option<String>,
    pub mpinumprocs: u32,
    pub ompnumthreads: u32,
    pub strategy: String,
    pub phase: Option<String>,
    pub instrumented: bool,
    pub force_localhost: bool,
    pub debug: u8,
    /// `None` selects fast mode.
    pub registry: Option<RegistryAddr>,
    pub hostname: String,
    pub port: u16,
    pub agent_baseport: u16,
    /// Base port handed to the application's monitoring library.
    pub appl_baseport: Option<u16>,
    pub max_fan: usize,
    pub max_cluster: usize,
    pub timeout: Duration,
    pub timeout_delta: Duration,
    pub delay: u32,
    pub duration: u32,
    pub propfile: PathBuf,
    pub nrprops: usize,
    pub pedantic: bool,
    pub iterations: u32,
    pub manual: bool,
    pub dontcluster: bool,
    /// Dispatch whole-application summaries instead of clustered searches.
    pub gather: bool,
    pub machine: String,
    pub site: String,
    pub max_runs: u32,
}

impl FrontendConfig {
    /// Applies the precedence rules and validates the result.
    pub fn resolve(
        opts: &FrontendOptions,
        env: &Environment,
        file: &FileConfig,
    ) -> Result<Self, AgentError> {
        let pid = std::process::id();

        let instrumented = !opts.uninstrumented;
        if instrumented && opts.phase.is_none() {
            return Err(AgentError::Config(
                "--phase is required unless --uninstrumented is given".into(),
            ));
        }

        let mpinumprocs = opts.mpinumprocs.unwrap_or(1);
        if mpinumprocs < 1 {
            return Err(AgentError::Config("--mpinumprocs must be at least 1".into()));
        }
        let max_fan = opts.maxfan.unwrap_or(DEFAULT_MAX_FAN);
        if max_fan < 1 {
            return Err(AgentError::Config("--maxfan must be at least 1".into()));
        }
        let max_cluster = opts.maxcluster.unwrap_or(DEFAULT_MAX_CLUSTER);
        if max_cluster < 1 {
            return Err(AgentError::Config("--maxcluster must be at least 1".into()));
        }

        let registry = if opts.fastmode {
            None
        } else {
            let addr = match opts.registry.as_deref().or_else(|| env.get(ENV_REGISTRY)) {
                Some(raw) => RegistryAddr::parse(raw)?,
                None => {
                    let port = file.regservice_port_init.unwrap_or(DEFAULT_REGISTRY_PORT);
                    if port == 0 {
                        return Err(AgentError::Config("registry port must be positive".into()));
                    }
                    RegistryAddr {
                        host: file
                            .regservice_host_init
                            .clone()
                            .unwrap_or_else(|| "localhost".to_string()),
                        port,
                    }
                }
            };
            Some(addr)
        };

        let agent_baseport = match env.parse::<u16>(ENV_AGENT_BASEPORT)? {
            Some(port) => port,
            None => file.agent_baseport.unwrap_or(DEFAULT_AGENT_BASEPORT),
        };

        let app_name = opts
            .appname
            .clone()
            .or_else(|| env.get(ENV_APPNAME).map(str::to_string))
            .unwrap_or_else(|| format!("appl{pid}"));

        let strategy = opts
            .strategy
            .clone()
            .unwrap_or_else(|| DEFAULT_STRATEGY.to_string());
        let propfile = opts
            .propfile
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("properties_{strategy}_{pid}.psc")));

        Ok(FrontendConfig {
            app_name,
            app_run: opts.apprun.clone(),
            mpinumprocs,
            ompnumthreads: opts.ompnumthreads.unwrap_or(1).max(1),
            strategy,
            phase: opts.phase.clone(),
            instrumented,
            force_localhost: opts.force_localhost,
            debug: debug_level(opts.debug, env),
            registry,
            hostname: opts.hostname.clone().unwrap_or_else(|| env.hostname()),
            port: opts.port.unwrap_or(DEFAULT_FRONTEND_PORT),
            agent_baseport,
            appl_baseport: file.appl_baseport,
            max_fan,
            max_cluster,
            timeout: opts
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
            timeout_delta: DEFAULT_TIMEOUT_DELTA,
            delay: opts.delay.unwrap_or(0),
            duration: opts.duration.unwrap_or(DEFAULT_DURATION),
            propfile,
            nrprops: opts.nrprops.unwrap_or(DEFAULT_NRPROPS),
            pedantic: opts.pedantic,
            iterations: opts.iterations.unwrap_or(1).max(1),
            manual: opts.manual,
            dontcluster: opts.dontcluster,
            gather: opts.gather,
            machine: file.machine.clone().unwrap_or_default(),
            site: file.site.clone().unwrap_or_default(),
            max_runs: MAX_RESTART_RUNS,
        })
    }

    pub fn is_fast(&self) -> bool {
        self.registry.is_none()
    }

    /// The descriptor queued once per iteration.
    pub fn general_info(&self) -> StrategyGeneralInfo {
        StrategyGeneralInfo {
            strategy_name: self.strategy.clone(),
            pedantic: self.pedantic,
            delay_phases: self.delay,
            delay_seconds: 0,
            analysis_duration: self.duration,
        }
    }

    /// The materialized request queued once per iteration with `--gather`.
    pub fn summary_request(&self) -> StrategyRequest {
        StrategyRequest {
            gather: true,
            ..StrategyRequest::analysis(self.general_info())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> FrontendOptions {
        FrontendOptions {
            phase: Some("mainRegion".into()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply() {
        let cfg = FrontendConfig::resolve(&opts(), &Environment::default(), &FileConfig::default())
            .unwrap();
        let pid = std::process::id();
        assert_eq!(cfg.port, 30000);
        assert_eq!(cfg.timeout, Duration::from_secs(18000));
        assert_eq!(cfg.timeout_delta, Duration::from_secs(20));
        assert_eq!((cfg.max_fan, cfg.max_cluster), (4, 4));
        assert_eq!((cfg.mpinumprocs, cfg.ompnumthreads, cfg.duration), (1, 1, 1));
        assert_eq!(cfg.nrprops, 50);
        assert_eq!(cfg.app_name, format!("appl{pid}"));
        assert_eq!(
            cfg.propfile,
            PathBuf::from(format!("properties_default_{pid}.psc"))
        );
        assert_eq!(
            cfg.registry,
            Some(RegistryAddr {
                host: "localhost".into(),
                port: 50001
            })
        );
        assert_eq!(cfg.agent_baseport, 50002);
        assert_eq!(cfg.max_runs, 40);
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let env = Environment::from_pairs([
            (ENV_REGISTRY, "envhost:7000"),
            (ENV_APPNAME, "fromenv"),
            (ENV_AGENT_BASEPORT, "41000"),
        ]);
        let file = FileConfig::parse(
            r#"
            machine = "cluster"
            site = "lrz"
            regservice_host_init = "filehost"
            regservice_port_init = 6000
            agent_baseport = 42000
            "#,
        )
        .unwrap();

        let cfg = FrontendConfig::resolve(&opts(), &env, &file).unwrap();
        assert_eq!(cfg.registry.as_ref().unwrap().to_string(), "envhost:7000");
        assert_eq!(cfg.app_name, "fromenv");
        assert_eq!(cfg.agent_baseport, 41000);
        assert_eq!(cfg.machine, "cluster");

        let mut cli = opts();
        cli.registry = Some("clihost:8000".into());
        cli.appname = Some("fromcli".into());
        let cfg = FrontendConfig::resolve(&cli, &env, &file).unwrap();
        assert_eq!(cfg.registry.as_ref().unwrap().to_string(), "clihost:8000");
        assert_eq!(cfg.app_name, "fromcli");

        let cfg = FrontendConfig::resolve(&opts(), &Environment::default(), &file).unwrap();
        assert_eq!(cfg.registry.as_ref().unwrap().to_string(), "filehost:6000");
        assert_eq!(cfg.agent_baseport, 42000);
    }

    #[test]
    fn missing_phase_is_fatal_unless_uninstrumented() {
        let err = FrontendConfig::resolve(
            &FrontendOptions::default(),
            &Environment::default(),
            &FileConfig::default(),
        )
        .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("--phase"));

        let uninstrumented = FrontendOptions {
            uninstrumented: true,
            ..Default::default()
        };
        let cfg = FrontendConfig::resolve(
            &uninstrumented,
            &Environment::default(),
            &FileConfig::default(),
        )
        .unwrap();
        assert!(!cfg.instrumented);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let env = Environment::default();
        let file = FileConfig::default();
        for bad in [
            FrontendOptions { mpinumprocs: Some(0), ..opts() },
            FrontendOptions { maxfan: Some(0), ..opts() },
            FrontendOptions { maxcluster: Some(0), ..opts() },
            FrontendOptions { registry: Some("host:0".into()), ..opts() },
            FrontendOptions { registry: Some("host:notaport".into()), ..opts() },
        ] {
            assert!(FrontendConfig::resolve(&bad, &env, &file).is_err(), "{bad:?}");
        }
        let env = Environment::from_pairs([(ENV_AGENT_BASEPORT, "x")]);
        assert!(FrontendConfig::resolve(&opts(), &env, &file).is_err());
    }

    #[test]
    fn fast_mode_has_no_registry_and_strategy_names_propfile() {
        let cli = FrontendOptions {
            fastmode: true,
            strategy: Some("mpi".into()),
            ..opts()
        };
        let cfg = FrontendConfig::resolve(&cli, &Environment::default(), &FileConfig::default())
            .unwrap();
        assert!(cfg.is_fast());
        assert!(cfg
            .propfile
            .to_string_lossy()
            .starts_with("properties_mpi_"));
    }

    #[test]
    fn gather_builds_a_summary_request() {
        let cli = FrontendOptions {
            gather: true,
            duration: Some(3),
            ..opts()
        };
        let cfg = FrontendConfig::resolve(&cli, &Environment::default(), &FileConfig::default())
            .unwrap();
        assert!(cfg.gather);
        let request = cfg.summary_request();
        assert!(request.gather);
        assert_eq!(request.general, cfg.general_info());
        assert_eq!(request.general.analysis_duration, 3);
    }

    #[test]
    fn debug_level_falls_back_to_env() {
        let env = Environment::from_pairs([(ENV_DEBUG, "2")]);
        assert_eq!(debug_level(None, &env), 2);
        assert_eq!(debug_level(Some(1), &env), 1);
        assert_eq!(debug_level(None, &Environment::default()), 0);
    }

    #[test]
    fn config_file_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("psc.toml");
        std::fs::write(&path, "site = \"here\"\n").unwrap();

        let env = Environment::from_pairs([(ENV_CONFIG, path.to_string_lossy().to_string())]);
        assert_eq!(FileConfig::discover(&env).unwrap().site.as_deref(), Some("here"));

        let env = Environment::from_pairs([("HOME", dir.path().to_string_lossy().to_string())]);
        assert_eq!(FileConfig::discover(&env).unwrap(), FileConfig::default());

        let env = Environment::from_pairs([(ENV_CONFIG, "/nonexistent/psc.toml")]);
        assert!(FileConfig::discover(&env).is_err());
    }
}
