// CLI Commands
// Shared descriptor loading for the subcommands

pub mod graph;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;
use std::sync::Arc;

use megflow_service::{ConfigLoader, PipelineConfig, WorkflowKind, WorkflowPlan};

/// Exit status for descriptor and graph errors, raised before dispatch
pub const EXIT_STRUCTURAL: i32 = 2;

/// Report an error detected before dispatch and exit
pub fn structural_failure(message: &str) -> ! {
    output::error(message);
    std::process::exit(EXIT_STRUCTURAL);
}

pub fn load_config(path: &Path) -> Arc<PipelineConfig> {
    match ConfigLoader::load(path) {
        Ok(config) => Arc::new(config),
        Err(e) => structural_failure(&e.to_string()),
    }
}

pub fn build_plan(kind: WorkflowKind, config: &Arc<PipelineConfig>) -> WorkflowPlan {
    match WorkflowPlan::build(kind, config) {
        Ok(plan) => plan,
        Err(e) => structural_failure(&format!("{} workflow: {}", kind, e)),
    }
}
