use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use megflow_service::WorkflowKind;

/// Print a workflow graph
#[derive(Args, Debug)]
pub struct GraphArgs {
    /// Workflow to render (anatomy or source)
    pub workflow: WorkflowKind,

    /// Path to the pipeline descriptor (YAML or JSON)
    pub config: PathBuf,

    /// Write the DOT text to a file instead of stdout
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// List the units that can run in parallel instead of DOT
    #[arg(long)]
    pub levels: bool,
}

pub fn execute(args: GraphArgs) -> Result<()> {
    let config = super::load_config(&args.config);
    let plan = super::build_plan(args.workflow, &config);

    if args.levels {
        let levels = match plan.graph.parallel_levels() {
            Ok(levels) => levels,
            Err(e) => super::structural_failure(&e.to_string()),
        };
        output::section(&format!("Workflow: {}", plan.name()));
        for (index, level) in levels.iter().enumerate() {
            let units: Vec<&str> = level.iter().map(|unit| unit.id()).collect();
            println!("  {}: {}", index + 1, units.join(", "));
        }
        return Ok(());
    }

    let dot = plan.graph.to_dot();
    match &args.output {
        Some(path) => {
            std::fs::write(path, &dot)?;
            output::passed(&format!("Wrote {}", path.display()));
        }
        None => print!("{}", dot),
    }

    Ok(())
}
