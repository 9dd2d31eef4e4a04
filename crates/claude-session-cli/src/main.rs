mod cmd;
mod config;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, run::RunArgs, scenario::ScenarioSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "claude-session",
    about = "Drive Claude CLI sessions with tool-permission mediation, or replay scripted scenarios",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: .claude-session.yaml in the working directory)
    #[arg(
        long,
        global = true,
        env = "CLAUDE_SESSION_CONFIG",
        default_value = config::DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log session progress to stderr
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session and print its transcript
    Run(RunArgs),

    /// Manage scripted scenarios and prompt routing
    Scenario {
        #[command(subcommand)]
        subcommand: ScenarioSubcommand,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    // stdout carries the transcript; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => cmd::run::run(&cli.config, args, cli.json, cli.verbose),
        Commands::Scenario { subcommand } => cmd::scenario::run(&cli.config, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
