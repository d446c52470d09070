mod cmd;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "followupd",
    about = "Daily lead follow-up engine: scheduler, job worker and queue tools",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the YAML config file (missing file means defaults)
    #[arg(long, global = true, env = "FOLLOWUP_CONFIG", default_value = "followup.yaml")]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker, the daily trigger and the HTTP monitor until Ctrl-C
    Serve,

    /// Process follow-ups for every tenant now and print the report
    RunOnce,

    /// Put a follow-up run on the queue, due immediately
    Enqueue,

    /// List queued jobs
    Jobs {
        /// Only jobs in this state (waiting, active, completed, failed)
        #[arg(long)]
        state: Option<String>,
    },

    /// Validate the config file
    Check,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve | Commands::RunOnce => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Serve => cmd::serve::run(&cli.config),
        Commands::RunOnce => cmd::run_once::run(&cli.config, cli.json),
        Commands::Enqueue => cmd::enqueue::run(&cli.config, cli.json),
        Commands::Jobs { state } => cmd::jobs::run(&cli.config, state.as_deref(), cli.json),
        Commands::Check => cmd::check::run(&cli.config, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
