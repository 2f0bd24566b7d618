// megflow CLI
// Runs, validates and inspects multi-subject neuroimaging workflows

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::graph::GraphArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

/// Orchestrate anatomy and source reconstruction pipelines over many subjects
#[derive(Parser, Debug)]
#[command(name = "megflow", version, about)]
struct Cli {
    /// Log debug diagnostics (overridden by RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow for every configured subject
    Run(RunArgs),

    /// Check a descriptor and the programs its workflows need
    Validate(ValidateArgs),

    /// Print a workflow graph in Graphviz DOT
    Graph(GraphArgs),
}

/// Execution events are printed by `run`; their tracing mirror stays quiet unless verbose
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug"
    } else {
        "info,megflow_service::execution=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Graph(args) => commands::graph::execute(args),
    }
}
