// src/pipeline/mod.rs
//! Dependency-ordered stage runner.
//!
//! Stages declare their dependencies statically; [`Pipeline::new`] validates the
//! graph and fixes a topological order (declaration order breaks ties). A run
//! executes stages one at a time and stops at the first failure.

pub mod command;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::StageConfig;
pub use command::CommandStage;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_histogram!(
            "pipeline_stage_duration_ms",
            "Wall time of successful stages in milliseconds."
        );
        describe_counter!("pipeline_stage_failures_total", "Stages that failed a run.");
    });
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSuccess {
    pub detail: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("exited with status {code}")]
    Exit { code: i32 },

    #[error("terminated by signal")]
    Killed,

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("duplicate stage `{0}`")]
    DuplicateStage(String),

    #[error("stage `{stage}` depends on unknown stage `{dependency}`")]
    UnknownDependency { stage: String, dependency: String },

    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    #[error("dependency cycle among stages: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("stage `{stage}` failed: {source}")]
    StageFailed { stage: String, source: StageError },
}

impl PipelineError {
    /// Name of the stage that aborted the run, if a stage did.
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            PipelineError::StageFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// One opaque unit of work. Success or failure is all the runner looks at.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    fn depends_on(&self) -> &[String];
    async fn execute(&self) -> Result<StageSuccess, StageError>;
}

#[derive(Debug, Clone)]
pub struct StageRun {
    pub name: String,
    pub duration: Duration,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub stages: Vec<StageRun>,
}

impl PipelineReport {
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    order: Vec<usize>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("order", &self.order())
            .finish()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self, PipelineError> {
        let order = topo_order(&stages)?;
        Ok(Self { stages, order })
    }

    /// Command stages from config; `@self` resolves to `self_exe`.
    pub fn from_config(
        configs: &[StageConfig],
        self_exe: &Path,
        config_path: Option<&Path>,
        lake_root: Option<&Path>,
    ) -> Result<Self, PipelineError> {
        let stages = configs
            .iter()
            .map(|c| {
                Box::new(CommandStage::from_config(c, self_exe, config_path, lake_root))
                    as Box<dyn Stage>
            })
            .collect();
        Self::new(stages)
    }

    /// Stage names in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.stages[i].name()).collect()
    }

    pub fn stage(&self, name: &str) -> Option<&dyn Stage> {
        self.stages
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    /// Keep only `targets` and everything they transitively depend on.
    pub fn only(self, targets: &[String]) -> Result<Self, PipelineError> {
        let index: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name(), i))
            .collect();

        let mut keep = HashSet::new();
        let mut stack = Vec::new();
        for t in targets {
            let i = *index
                .get(t.as_str())
                .ok_or_else(|| PipelineError::UnknownStage(t.clone()))?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if keep.insert(i) {
                for dep in self.stages[i].depends_on() {
                    // Validated in `new`.
                    if let Some(&d) = index.get(dep.as_str()) {
                        stack.push(d);
                    }
                }
            }
        }
        drop(index);

        let stages = self
            .stages
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, s)| s)
            .collect();
        Self::new(stages)
    }

    /// Run every stage in order; the first failure aborts the rest.
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        ensure_metrics_described();
        let mut report = PipelineReport::default();
        let mut completed: HashSet<&str> = HashSet::new();

        for &i in &self.order {
            let stage = self.stages[i].as_ref();
            let name = stage.name();
            debug_assert!(stage
                .depends_on()
                .iter()
                .all(|d| completed.contains(d.as_str())));

            tracing::info!(stage = name, "running stage");
            let t0 = Instant::now();
            match stage.execute().await {
                Ok(success) => {
                    let duration = t0.elapsed();
                    histogram!("pipeline_stage_duration_ms", "stage" => name.to_string())
                        .record(duration.as_secs_f64() * 1_000.0);
                    tracing::info!(stage = name, ms = duration.as_millis() as u64, "stage succeeded");
                    completed.insert(name);
                    report.stages.push(StageRun {
                        name: name.to_string(),
                        duration,
                        detail: success.detail,
                    });
                }
                Err(e) => {
                    counter!("pipeline_stage_failures_total", "stage" => name.to_string())
                        .increment(1);
                    tracing::error!(stage = name, error = %e, "stage failed, aborting pipeline");
                    return Err(PipelineError::StageFailed {
                        stage: name.to_string(),
                        source: e,
                    });
                }
            }
        }

        Ok(report)
    }
}

/// Kahn's algorithm; among ready stages the earliest declared goes first.
fn topo_order(stages: &[Box<dyn Stage>]) -> Result<Vec<usize>, PipelineError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(stages.len());
    for (i, s) in stages.iter().enumerate() {
        if index.insert(s.name(), i).is_some() {
            return Err(PipelineError::DuplicateStage(s.name().to_string()));
        }
    }

    let mut indegree = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, s) in stages.iter().enumerate() {
        for dep in s.depends_on() {
            let d = *index
                .get(dep.as_str())
                .ok_or_else(|| PipelineError::UnknownDependency {
                    stage: s.name().to_string(),
                    dependency: dep.clone(),
                })?;
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() < stages.len() {
        let stuck = (0..stages.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| stages[i].name().to_string())
            .collect();
        return Err(PipelineError::Cycle(stuck));
    }
    Ok(order)
}
