//! Command-line front end for the run engine.
//!
//! `agentrun run` executes one goal synchronously with the collaborators
//! configured in `agentrun.toml`; `trace` and `sources` read the artifacts of
//! finished runs.

use std::path::{Path, PathBuf};

use agentrun::agents::command::collaborators_from_config;
use agentrun::coordinator::Coordinator;
use agentrun::core::types::{TaskStatus, Verbosity};
use agentrun::exit_codes;
use agentrun::io::artifacts::{RunPaths, load_sources};
use agentrun::io::config::{RunnerConfig, load_config, write_config};
use agentrun::io::trace::{TraceSink, validate_run_id};
use agentrun::logging;
use agentrun::queue::TaskConfig;
use agentrun::status::SourcesView;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "agentrun", version, about = "Goal-driven agent run engine")]
struct Cli {
    /// Path to the engine config.
    #[arg(long, global = true, default_value = "agentrun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Plan and execute one goal, then print its result.
    Run {
        query: String,
        /// Restrict the run to these agent kinds (repeatable).
        #[arg(long = "agent")]
        agents: Vec<String>,
        #[arg(long, value_enum)]
        verbosity: Option<VerbosityArg>,
    },
    /// Print trace events of a run after a cursor.
    Trace {
        run_id: String,
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long, default_value_t = 200)]
        limit: usize,
    },
    /// Print the aggregated sources of a run.
    Sources { run_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum VerbosityArg {
    Minimal,
    Standard,
    Full,
}

impl From<VerbosityArg> for Verbosity {
    fn from(value: VerbosityArg) -> Self {
        match value {
            VerbosityArg::Minimal => Verbosity::Minimal,
            VerbosityArg::Standard => Verbosity::Standard,
            VerbosityArg::Full => Verbosity::Full,
        }
    }
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            query,
            agents,
            verbosity,
        } => cmd_run(&cli.config, query, agents, verbosity),
        Command::Trace {
            run_id,
            since,
            limit,
        } => cmd_trace(&cli.config, &run_id, since, limit),
        Command::Sources { run_id } => cmd_sources(&cli.config, &run_id),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &RunnerConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    config_path: &Path,
    query: String,
    agents: Vec<String>,
    verbosity: Option<VerbosityArg>,
) -> Result<i32> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let config = load_config(config_path)?;
    let collaborators = collaborators_from_config(&config.commands)?;
    let coordinator = Coordinator::new(config, collaborators)?;
    let handle = coordinator.handle();

    let mut task = TaskConfig::default();
    if !agents.is_empty() {
        task.allowed_agents = Some(agents);
    }
    task.trace.verbosity = verbosity.map(Verbosity::from);
    let uid = handle.submit(query, task);

    coordinator
        .run_once()?
        .context("submitted task was not picked up")?;
    let result = handle.result(&uid)?;
    print_json(&result)?;
    Ok(match result.status {
        TaskStatus::Done => exit_codes::OK,
        _ => exit_codes::FAILED,
    })
}

fn cmd_trace(config_path: &Path, run_id: &str, since: u64, limit: usize) -> Result<i32> {
    validate_run_id(run_id)?;
    let config = load_config(config_path)?;
    let page = TraceSink::new(&config.runs_dir).read(run_id, since, limit)?;
    print_json(&page)?;
    Ok(exit_codes::OK)
}

fn cmd_sources(config_path: &Path, run_id: &str) -> Result<i32> {
    validate_run_id(run_id)?;
    let config = load_config(config_path)?;
    let paths = RunPaths::new(&config.runs_dir, run_id);
    let view = load_sources(&paths)?.unwrap_or_else(|| SourcesView::empty(run_id));
    print_json(&view)?;
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
