//! Measurement side of an analysis agent.
//!
//! The agent protocol only needs to start experiments, collect findings and
//! stop the monitored processes; [`AnalysisBackend`] is that seam.
//! [`SimulatedBackend`] stands in for real instrumentation: it is
//! deterministic and can be scripted to ask for more experiments or for a
//! restart, which is what the end-to-end tests drive.

use std::collections::VecDeque;
use std::future::Future;

use psc_core::{CallTreeNode, IdMap, Property, RegistryId, StrategyRequest};

use crate::context::AgentContext;
use crate::error::AgentError;

/// What the local search wants after an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentOutcome {
    Finished,
    AnotherExperiment,
    Restart,
}

pub trait AnalysisBackend: Send {
    /// Installs the strategy for the coming experiments.
    fn configure(&mut self, request: &StrategyRequest);

    /// Whether the monitored processes have run to completion, so no
    /// further experiment is possible without relaunching them.
    fn needs_restart(&self) -> bool;

    fn run_experiment(
        &mut self,
    ) -> impl Future<Output = Result<ExperimentOutcome, AgentError>> + Send;

    /// Drains the findings of the experiments run so far.
    fn take_properties(&mut self) -> Vec<Property>;

    /// Re-attaches to the processes of a relaunched application.
    fn remap(&mut self, map: &IdMap) -> impl Future<Output = Result<(), AgentError>> + Send;

    fn call_tree(&self) -> Vec<CallTreeNode>;

    /// Lets the monitored processes run to completion.
    fn finish_application(
        &mut self,
        ctx: &AgentContext,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;
}

/// Deterministic stand-in for instrumentation.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    processes: Vec<RegistryId>,
    threads: u32,
    phase: String,
    strategy: Option<String>,
    script: VecDeque<ExperimentOutcome>,
    extra: Vec<Property>,
    found: Vec<Property>,
    experiments: u32,
    finished: bool,
}

impl SimulatedBackend {
    pub fn new(processes: Vec<RegistryId>, threads: u32) -> Self {
        SimulatedBackend {
            processes,
            threads: threads.max(1),
            phase: "main".to_string(),
            strategy: None,
            script: VecDeque::new(),
            extra: Vec::new(),
            found: Vec::new(),
            experiments: 0,
            finished: false,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    /// Outcomes returned by successive experiments; `Finished` once exhausted.
    pub fn with_script(mut self, outcomes: impl IntoIterator<Item = ExperimentOutcome>) -> Self {
        self.script = outcomes.into_iter().collect();
        self
    }

    /// Findings reported once, by the first experiment.
    pub fn with_findings(mut self, props: impl IntoIterator<Item = Property>) -> Self {
        self.extra = props.into_iter().collect();
        self
    }

    pub fn processes(&self) -> &[RegistryId] {
        &self.processes
    }

    pub fn experiments(&self) -> u32 {
        self.experiments
    }

    fn finding(&self, slot: usize, process: RegistryId) -> Property {
        let name = match self.strategy.as_deref() {
            Some(strategy) => format!("Wait time in {} measured by {}", self.phase, strategy),
            None => format!("Wait time in {}", self.phase),
        };
        let mut prop = Property::new("1001", name, self.phase.clone());
        prop.file_name = "application.c".to_string();
        prop.start_line = 42;
        prop.region_type = "USER_REGION".to_string();
        prop.configuration = format!("{}x{}", self.processes.len(), self.threads);
        // neighbouring processes land within the merge thresholds
        prop.severity = 10.0 + (slot % 2) as f64 * 0.5;
        prop.confidence = 1.0;
        prop.process = process.0;
        prop.thread = 0;
        prop
    }
}

impl AnalysisBackend for SimulatedBackend {
    fn configure(&mut self, request: &StrategyRequest) {
        self.strategy = Some(request.general.strategy_name.clone());
    }

    fn needs_restart(&self) -> bool {
        self.finished
    }

    async fn run_experiment(&mut self) -> Result<ExperimentOutcome, AgentError> {
        if self.finished {
            return Err(AgentError::Backend(
                "experiment requested after the application finished".into(),
            ));
        }
        self.experiments += 1;
        let batch: Vec<Property> = self
            .processes
            .iter()
            .enumerate()
            .map(|(slot, id)| self.finding(slot, *id))
            .collect();
        self.found.extend(batch);
        self.found.append(&mut self.extra);
        Ok(self.script.pop_front().unwrap_or(ExperimentOutcome::Finished))
    }

    fn take_properties(&mut self) -> Vec<Property> {
        std::mem::take(&mut self.found)
    }

    async fn remap(&mut self, map: &IdMap) -> Result<(), AgentError> {
        for id in &mut self.processes {
            if let Some(new_id) = map.remap(*id) {
                *id = new_id;
            }
        }
        self.finished = false;
        Ok(())
    }

    fn call_tree(&self) -> Vec<CallTreeNode> {
        let mut nodes = Vec::new();
        for (slot, process) in self.processes.iter().enumerate() {
            let base = slot as u32 * 2;
            nodes.push(CallTreeNode {
                id: base,
                parent: None,
                region: "main".to_string(),
                file: "application.c".to_string(),
                line: 1,
                process: process.0,
            });
            nodes.push(CallTreeNode {
                id: base + 1,
                parent: Some(base),
                region: self.phase.clone(),
                file: "application.c".to_string(),
                line: 42,
                process: process.0,
            });
        }
        nodes
    }

    /// In registry mode the simulated processes deregister on exit, the way
    /// real ones drop out of the registry when they end.
    async fn finish_application(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(registry) = ctx.registry() {
            for id in &self.processes {
                registry.delete(*id, ctx.deadline()).await?;
            }
        }
        Ok(())
    }
}
