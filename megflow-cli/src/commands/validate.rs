use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use megflow_service::utils::find_program;
use megflow_service::{WorkflowKind, WorkflowPlan};

/// Validate a pipeline descriptor
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline descriptor (YAML or JSON)
    pub config: PathBuf,

    /// Only check one workflow (default: all)
    #[arg(long, short = 'w', value_name = "WORKFLOW")]
    pub workflow: Option<WorkflowKind>,

    /// Skip looking up external programs on PATH
    #[arg(long)]
    pub no_programs: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::phase("Validating", &format!("{}", args.config.display()));

    // Step 1: Parse and check the descriptor
    let config = super::load_config(&args.config);
    output::passed("Descriptor valid");

    let subjects = config.subjects();
    if subjects.is_empty() {
        output::warning("No subjects left to process");
    } else {
        output::passed(&format!(
            "{} subject(s): {}",
            subjects.len(),
            subjects.join(", ")
        ));
    }
    if !config.exclude_subjects.is_empty() {
        output::detail(&format!("    excluded: {}", config.exclude_subjects.join(", ")));
    }

    // Step 2: Build each workflow graph
    let kinds = match args.workflow {
        Some(kind) => vec![kind],
        None => WorkflowKind::ALL.to_vec(),
    };

    let mut structural_errors = 0;
    let mut missing_programs = 0;
    for kind in kinds {
        eprintln!();
        output::section(&format!("{} workflow", kind));

        let plan = match WorkflowPlan::build(kind, &config) {
            Ok(plan) => plan,
            Err(e) => {
                output::rejected(&e.to_string());
                structural_errors += 1;
                continue;
            }
        };
        output::passed(&format!(
            "Graph '{}' valid ({} units, {} edges)",
            plan.name(),
            plan.graph.len(),
            plan.graph.edges().len()
        ));

        match plan.instantiate() {
            Ok(instances) => output::passed(&format!("{} graph instance(s)", instances.len())),
            Err(e) => {
                output::rejected(&e.to_string());
                structural_errors += 1;
                continue;
            }
        }

        // Step 3: Preflight the external programs
        if args.no_programs {
            continue;
        }
        for program in plan.programs() {
            match find_program(&program) {
                Some(path) => output::passed(&format!("{} ({})", program, path.display())),
                None => {
                    output::rejected(&format!("{} not found on PATH", program));
                    missing_programs += 1;
                }
            }
        }
    }

    eprintln!();
    if structural_errors > 0 {
        output::error(&format!("{} workflow(s) failed validation", structural_errors));
        std::process::exit(super::EXIT_STRUCTURAL);
    }
    if missing_programs > 0 {
        output::error(&format!("{} external program(s) missing", missing_programs));
        std::process::exit(1);
    }

    output::passed("Descriptor is valid");
    Ok(())
}
