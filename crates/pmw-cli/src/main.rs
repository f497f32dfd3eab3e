mod cmd;
mod output;
mod root;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, finding::FindingSubcommand, outline::OutlineSubcommand,
    phase::PhaseSubcommand, plan::PlanSubcommand, skill::SkillSubcommand,
    status::StatusSubcommand, task::TaskSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pmw",
    about = "Plan/task workflow engine: drive plans from request to finalize",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .plan/ or .git/)
    #[arg(long, global = true, env = "PMW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .plan/ in the current project
    Init {
        /// Project name (default: directory name)
        #[arg(long)]
        name: Option<String>,
        /// Register a domain (repeatable or comma-separated)
        #[arg(long = "domain", value_delimiter = ',')]
        domains: Vec<String>,
    },

    /// Create, inspect and manage plans
    Plan {
        #[command(subcommand)]
        subcommand: PlanSubcommand,
    },

    /// Read or manually advance plan status
    Status {
        #[command(subcommand)]
        subcommand: StatusSubcommand,
    },

    /// Run phase handlers
    Phase {
        #[command(subcommand)]
        subcommand: PhaseSubcommand,
    },

    /// Inspect the solution outline
    Outline {
        #[command(subcommand)]
        subcommand: OutlineSubcommand,
    },

    /// Plan, inspect and execute tasks
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Record the outcome of a finalize step (commit, push, create-pr, ...)
    FinalizeStep {
        plan_id: String,
        step: String,
        /// done, skipped or failed
        #[arg(long, default_value = "done")]
        outcome: String,
        #[arg(long)]
        detail: Option<String>,
    },

    /// Add, query, resolve and triage findings
    Finding {
        #[command(subcommand)]
        subcommand: FindingSubcommand,
    },

    /// Resolve workflow skills, task skills and verification commands
    Skill {
        #[command(subcommand)]
        subcommand: SkillSubcommand,
    },

    /// Show or validate .plan/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// `plan create`, `phase run`, ... taken from the parsed subcommand path.
fn operation_name(matches: &ArgMatches) -> String {
    let mut parts = Vec::new();
    let mut current = matches;
    while let Some((name, sub)) = current.subcommand() {
        parts.push(name.to_string());
        current = sub;
    }
    parts.join(" ")
}

fn main() {
    let matches = Cli::command().get_matches();
    let operation = operation_name(&matches);
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let default_level = match &cli.command {
        Commands::Phase {
            subcommand: PhaseSubcommand::Run { .. },
        } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { name, domains } => cmd::init::run(&root, name.as_deref(), &domains, cli.json),
        Commands::Plan { subcommand } => cmd::plan::run(&root, subcommand, cli.json),
        Commands::Status { subcommand } => cmd::status::run(&root, subcommand, cli.json),
        Commands::Phase { subcommand } => cmd::phase::run(&root, subcommand, cli.json),
        Commands::Outline { subcommand } => cmd::outline::run(&root, subcommand, cli.json),
        Commands::Task { subcommand } => cmd::task::run(&root, subcommand, cli.json),
        Commands::FinalizeStep {
            plan_id,
            step,
            outcome,
            detail,
        } => cmd::finalize_step::run(&root, &plan_id, &step, &outcome, detail, cli.json),
        Commands::Finding { subcommand } => cmd::finding::run(&root, subcommand, cli.json),
        Commands::Skill { subcommand } => cmd::skill::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        if e.downcast_ref::<output::Reported>().is_none() {
            output::print_error(&operation, &e, cli.json);
        }
        std::process::exit(1);
    }
}
