//! Executor abstraction for external collaborator commands.
//!
//! The [`Executor`] trait decouples collaborator adapters from process
//! spawning. A collaborator receives one JSON request on stdin and prints one
//! JSON response on stdout; [`execute_and_load_json`] validates that response
//! against an embedded JSON Schema before deserializing it. Tests use fake
//! executors that return canned stdout without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::config::{CommandSpec, CommandsConfig};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Stderr characters quoted in error messages.
const STDERR_EXCERPT_CHARS: usize = 400;

/// Parameters for one collaborator invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the child; inherits ours when `None`.
    pub workdir: Option<PathBuf>,
    /// Request body written to stdin.
    pub input: String,
    /// Where to write the combined stdout/stderr log, if anywhere.
    pub log_path: Option<PathBuf>,
    pub timeout: Duration,
    /// Per-stream capture limit.
    pub output_limit_bytes: usize,
}

impl ExecRequest {
    /// Build a request for `spec` using the shared command settings.
    pub fn for_command(spec: &CommandSpec, commands: &CommandsConfig, input: String) -> Self {
        Self {
            program: spec.program.clone(),
            args: spec.args.clone(),
            workdir: commands.workdir.clone(),
            input,
            log_path: None,
            timeout: Duration::from_secs(spec.timeout_secs.unwrap_or(commands.timeout_secs)),
            output_limit_bytes: commands.output_limit_bytes,
        }
    }

    pub fn with_log_path(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }
}

/// Abstraction over collaborator execution backends.
pub trait Executor: Send + Sync {
    /// Run the command and return its stdout.
    fn exec(&self, request: &ExecRequest) -> Result<String>;
}

/// Executor that spawns the configured program.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(program = %request.program, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<String> {
        info!("starting collaborator command");

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(workdir) = &request.workdir {
            cmd.current_dir(workdir);
        }

        let output = run_command_with_timeout(
            cmd,
            Some(request.input.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {}", request.program))?;

        if let Some(log_path) = &request.log_path {
            write_command_log(log_path, &request.program, &output)?;
        }

        if output.timed_out {
            warn!("collaborator command timed out");
            return Err(anyhow!(
                "{} timed out after {:?}",
                request.program,
                request.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "collaborator command failed");
            return Err(anyhow!(
                "{} failed with status {:?}: {}",
                request.program,
                output.status.code(),
                output.stderr_excerpt(STDERR_EXCERPT_CHARS)
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "{} response exceeded {} bytes",
                request.program,
                request.output_limit_bytes
            ));
        }

        debug!(stdout_bytes = output.stdout.len(), "collaborator command completed");
        Ok(output.stdout_text())
    }
}

/// Run the command and load its response as `T`, validated against `schema`.
#[instrument(skip_all, fields(program = %request.program))]
pub fn execute_and_load_json<E, T>(executor: &E, request: &ExecRequest, schema: &str) -> Result<T>
where
    E: Executor + ?Sized,
    T: DeserializeOwned,
{
    let stdout = executor.exec(request)?;
    let value = parse_response(&stdout)
        .with_context(|| format!("parse {} response", request.program))?;
    validate_response(&value, schema)
        .with_context(|| format!("validate {} response", request.program))?;
    serde_json::from_value(value).with_context(|| format!("deserialize {} response", request.program))
}

/// Parse stdout as JSON, falling back to its last non-empty line so commands
/// may print progress before the response.
fn parse_response(stdout: &str) -> Result<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        bail!("empty response");
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(err) => {
            let last = trimmed
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or_default();
            serde_json::from_str(last)
                .map_err(|_| anyhow::Error::new(err).context("response is not JSON"))
        }
    }
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
fn validate_response(instance: &Value, schema: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema).context("parse json schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

fn write_command_log(path: &Path, program: &str, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create command log dir {}", parent.display()))?;
    }
    fs::write(path, output.render_log(program))
        .with_context(|| format!("write command log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const SCHEMA: &str = r#"{
        "type": "object",
        "required": ["answer"],
        "properties": { "answer": { "type": "string" } }
    }"#;

    #[derive(Debug, Deserialize)]
    struct Answer {
        answer: String,
    }

    struct FakeExecutor {
        stdout: String,
    }

    impl Executor for FakeExecutor {
        fn exec(&self, _request: &ExecRequest) -> Result<String> {
            Ok(self.stdout.clone())
        }
    }

    fn request() -> ExecRequest {
        ExecRequest {
            program: "fake".to_string(),
            args: Vec::new(),
            workdir: None,
            input: "{}".to_string(),
            log_path: None,
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1000,
        }
    }

    /// Verifies a schema-valid response is deserialized.
    #[test]
    fn loads_valid_response() {
        let fake = FakeExecutor {
            stdout: "{\"answer\": \"42\"}\n".to_string(),
        };
        let answer: Answer = execute_and_load_json(&fake, &request(), SCHEMA).expect("load");
        assert_eq!(answer.answer, "42");
    }

    /// Verifies progress lines before the JSON response are tolerated.
    #[test]
    fn uses_last_line_when_stdout_has_noise() {
        let fake = FakeExecutor {
            stdout: "thinking...\n{\"answer\": \"ok\"}\n".to_string(),
        };
        let answer: Answer = execute_and_load_json(&fake, &request(), SCHEMA).expect("load");
        assert_eq!(answer.answer, "ok");
    }

    /// Verifies schema violations are reported instead of deserialized.
    #[test]
    fn rejects_schema_violation() {
        let fake = FakeExecutor {
            stdout: "{\"answer\": 7}".to_string(),
        };
        let err = execute_and_load_json::<_, Answer>(&fake, &request(), SCHEMA).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn rejects_empty_stdout() {
        let fake = FakeExecutor {
            stdout: "  \n".to_string(),
        };
        let err = execute_and_load_json::<_, Answer>(&fake, &request(), SCHEMA).unwrap_err();
        assert!(format!("{err:#}").contains("empty response"));
    }

    #[cfg(unix)]
    #[test]
    fn command_executor_reports_failure_with_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request();
        req.program = "sh".to_string();
        req.args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        req.log_path = Some(temp.path().join("logs").join("fake.log"));

        let err = CommandExecutor.exec(&req).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Some(3)"), "{message}");
        assert!(message.contains("boom"), "{message}");
        let log = fs::read_to_string(temp.path().join("logs").join("fake.log")).expect("log");
        assert!(log.contains("=== stderr ===\nboom"));
    }

    #[cfg(unix)]
    #[test]
    fn command_executor_echoes_stdin() {
        let mut req = request();
        req.program = "cat".to_string();
        req.input = "{\"answer\": \"echo\"}".to_string();
        let answer: Answer = execute_and_load_json(&CommandExecutor, &req, SCHEMA).expect("load");
        assert_eq!(answer.answer, "echo");
    }
}
