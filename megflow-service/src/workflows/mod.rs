// Built-in Workflows
// Anatomy and source reconstruction graphs assembled from the descriptor

pub mod anatomy;
pub mod source;

use crate::artifacts::ArtifactWriter;
use crate::config::{ConfigError, PipelineConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::execution::{
    DependencyGraph, ExecutorConfig, GraphInstance, IterationAxis, IterationExpander,
};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Axis every built-in workflow iterates over
pub const SUBJECT_AXIS: &str = "subject_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    /// T1 reconstruction and BEM surfaces
    Anatomy,
    /// Event concatenation, inverse solution and morphing
    Source,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 2] = [WorkflowKind::Anatomy, WorkflowKind::Source];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Anatomy => "anatomy",
            WorkflowKind::Source => "source",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anatomy" | "anat" | "smri" => Ok(WorkflowKind::Anatomy),
            "source" | "inverse" | "src" => Ok(WorkflowKind::Source),
            other => Err(ConfigError::invalid_value(
                "workflow",
                format!("unknown workflow '{}'", other),
            )
            .with_suggestion("use 'anatomy' or 'source'")),
        }
    }
}

/// A workflow graph bound to a descriptor, ready to expand and run
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    pub kind: WorkflowKind,
    pub graph: Arc<DependencyGraph>,
    pub axes: Vec<IterationAxis>,
    /// Root of the per-node working directories
    pub work_root: PathBuf,
    /// Root of the published artifact tree
    pub publish_root: PathBuf,
    pub jobs: usize,
    config: Arc<PipelineConfig>,
}

impl WorkflowPlan {
    /// Build the graph for a workflow; configuration and graph errors surface here
    pub fn build(kind: WorkflowKind, config: &Arc<PipelineConfig>) -> ServiceResult<Self> {
        let (graph, work_root) = match kind {
            WorkflowKind::Anatomy => anatomy::build(config)?,
            WorkflowKind::Source => source::build(config)?,
        };
        graph.validate()?;

        tracing::debug!(
            workflow = %graph.name(),
            units = graph.len(),
            work_root = %work_root.display(),
            "workflow graph built"
        );

        Ok(Self {
            kind,
            graph: Arc::new(graph),
            axes: vec![IterationAxis::new(SUBJECT_AXIS, config.subjects())],
            work_root,
            publish_root: config.output_root(),
            jobs: config.jobs,
            config: Arc::clone(config),
        })
    }

    pub fn name(&self) -> &str {
        self.graph.name()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// One graph instance per subject
    pub fn instantiate(&self) -> ServiceResult<Vec<GraphInstance>> {
        Ok(IterationExpander::expand(&self.axes, Arc::clone(&self.graph))?)
    }

    /// Executor settings derived from the descriptor
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_parallel: self.jobs,
            work_root: self.work_root.clone(),
            retention: self.config.retention,
        }
    }

    /// External programs the workflow invokes, without duplicates
    pub fn programs(&self) -> Vec<String> {
        let mut programs = match self.kind {
            WorkflowKind::Anatomy => anatomy::programs(&self.config),
            WorkflowKind::Source => source::programs(&self.config),
        };
        let mut seen = std::collections::HashSet::new();
        programs.retain(|program| seen.insert(program.clone()));
        programs
    }

    /// Writer for published outputs and the run report
    pub fn publisher(&self) -> ArtifactWriter {
        ArtifactWriter::new(&self.publish_root)
    }

    /// Create the directories the workflow writes into
    pub async fn prepare(&self) -> ServiceResult<()> {
        let mut dirs = vec![self.work_root.clone()];
        if self.kind == WorkflowKind::Anatomy {
            dirs.push(self.config.paths.subjects_dir.clone());
        }
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| ServiceError::Io { path: dir.clone(), source })?;
        }
        Ok(())
    }
}
