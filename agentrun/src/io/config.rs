//! Engine configuration stored in `agentrun.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::Verbosity;
use crate::core::verify::{MAX_ATTEMPTS, RetryPolicy};

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values in
/// the `Default` impls below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory holding one sub-directory per run (`<runs_dir>/<run_id>/`).
    pub runs_dir: PathBuf,

    /// Optional prefix for generated run ids (`<prefix>-<uuid>`).
    pub run_id_prefix: Option<String>,

    /// Fallback wake-up interval of the coordinator while idle or paused.
    pub idle_poll_ms: u64,

    /// Re-plans allowed per run after a step fails.
    pub max_replans: u32,

    pub retry: RetryConfig,
    pub trace: TraceConfig,
    pub sources: SourcesConfig,
    pub queue: QueueConfig,
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per step (1..=6).
    pub max_attempts: u32,
    /// Minimum quality gain for an attempt to count as an improvement.
    pub min_improvement: f64,
    /// Consecutive non-improving attempts before giving up on a step.
    pub max_stale_attempts: u32,
    /// Size of the output sample used for comparison and judging.
    pub sample_chars: usize,
    /// Sampled outputs at or above this similarity are treated as identical.
    pub similarity_ceiling: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceConfig {
    pub verbosity: Verbosity,
    /// Truncate string fields beyond this many chars. Unset disables truncation.
    pub max_field_chars: Option<usize>,
    /// Write `plan.json` and `plan.md`.
    pub save_plan: bool,
    /// Write `answer.md`.
    pub save_answer: bool,
    /// Write `sources.json` and `sources.md`.
    pub save_sources: bool,
}

/// Per-task trace overrides. `max_field_chars = 0` disables truncation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceOverrides {
    pub verbosity: Option<Verbosity>,
    pub max_field_chars: Option<usize>,
    pub save_plan: Option<bool>,
    pub save_answer: Option<bool>,
    pub save_sources: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourcesConfig {
    /// Ask the configured scorer to enrich recorded sources.
    pub enrich: bool,
    pub max_quotes: usize,
    pub max_screenshots: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Finished tasks kept for result polling before the oldest are pruned.
    pub max_finished_tasks: usize,
}

/// External commands backing the collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    /// Default per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Working directory for commands (defaults to the current directory).
    pub workdir: Option<PathBuf>,
    pub planner: Option<CommandSpec>,
    pub judge: Option<CommandSpec>,
    pub scorer: Option<CommandSpec>,
    /// Agent command per agent kind (e.g. `web`, `files`, `code`).
    pub agents: BTreeMap<String, CommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides `commands.timeout_secs` for this command.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
            run_id_prefix: None,
            idle_poll_ms: 500,
            max_replans: 1,
            retry: RetryConfig::default(),
            trace: TraceConfig::default(),
            sources: SourcesConfig::default(),
            queue: QueueConfig::default(),
            commands: CommandsConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            min_improvement: policy.min_improvement,
            max_stale_attempts: policy.max_stale_attempts,
            sample_chars: policy.sample_chars,
            similarity_ceiling: policy.similarity_ceiling,
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Standard,
            max_field_chars: None,
            save_plan: true,
            save_answer: true,
            save_sources: true,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            enrich: true,
            max_quotes: 120,
            max_screenshots: 50,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_finished_tasks: 500,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            workdir: None,
            planner: None,
            judge: None,
            scorer: None,
            agents: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            min_improvement: self.min_improvement,
            max_stale_attempts: self.max_stale_attempts,
            sample_chars: self.sample_chars,
            similarity_ceiling: self.similarity_ceiling,
        }
    }
}

impl TraceConfig {
    /// Apply per-task overrides on top of the engine defaults.
    pub fn with_overrides(&self, overrides: &TraceOverrides) -> TraceConfig {
        let max_field_chars = match overrides.max_field_chars {
            Some(0) => None,
            Some(limit) => Some(limit),
            None => self.max_field_chars,
        };
        TraceConfig {
            verbosity: overrides.verbosity.unwrap_or(self.verbosity),
            max_field_chars,
            save_plan: overrides.save_plan.unwrap_or(self.save_plan),
            save_answer: overrides.save_answer.unwrap_or(self.save_answer),
            save_sources: overrides.save_sources.unwrap_or(self.save_sources),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runs_dir.as_os_str().is_empty() {
            return Err(anyhow!("runs_dir must not be empty"));
        }
        if let Some(prefix) = &self.run_id_prefix
            && (prefix.is_empty() || !prefix.chars().all(is_id_char))
        {
            return Err(anyhow!(
                "run_id_prefix must be non-empty and use only [A-Za-z0-9_-]"
            ));
        }
        if self.idle_poll_ms == 0 {
            return Err(anyhow!("idle_poll_ms must be > 0"));
        }
        if self.retry.max_attempts == 0 || self.retry.max_attempts > MAX_ATTEMPTS {
            return Err(anyhow!("retry.max_attempts must be between 1 and {MAX_ATTEMPTS}"));
        }
        if self.retry.max_stale_attempts == 0 {
            return Err(anyhow!("retry.max_stale_attempts must be > 0"));
        }
        if !self.retry.min_improvement.is_finite() || self.retry.min_improvement < 0.0 {
            return Err(anyhow!("retry.min_improvement must be >= 0"));
        }
        if !(self.retry.similarity_ceiling > 0.0 && self.retry.similarity_ceiling <= 1.0) {
            return Err(anyhow!("retry.similarity_ceiling must be in (0, 1]"));
        }
        if self.retry.sample_chars < 64 {
            return Err(anyhow!("retry.sample_chars must be >= 64"));
        }
        if self.trace.max_field_chars == Some(0) {
            return Err(anyhow!(
                "trace.max_field_chars must be > 0 (leave it unset to disable truncation)"
            ));
        }
        if self.queue.max_finished_tasks == 0 {
            return Err(anyhow!(
                "queue.max_finished_tasks must be > 0 so finished results stay pollable"
            ));
        }
        if self.commands.timeout_secs == 0 {
            return Err(anyhow!("commands.timeout_secs must be > 0"));
        }
        if self.commands.output_limit_bytes == 0 {
            return Err(anyhow!("commands.output_limit_bytes must be > 0"));
        }
        let named = [
            ("commands.planner", self.commands.planner.as_ref()),
            ("commands.judge", self.commands.judge.as_ref()),
            ("commands.scorer", self.commands.scorer.as_ref()),
        ];
        for (name, spec) in named {
            if let Some(spec) = spec {
                spec.validate(name)?;
            }
        }
        for (kind, spec) in &self.commands.agents {
            spec.validate(&format!("commands.agents.{kind}"))?;
        }
        Ok(())
    }
}

impl CommandSpec {
    fn validate(&self, name: &str) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow!("{name}.program must not be empty"));
        }
        if self.timeout_secs == Some(0) {
            return Err(anyhow!("{name}.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Characters allowed in run ids and their prefixes.
pub fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::artifacts::write_atomic(path, &buf)
}
