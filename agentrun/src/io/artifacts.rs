//! Per-run artifact layout under `<runs_dir>/<run_id>/`.
//!
//! Snapshots are rewritten atomically (temp file + rename) so readers never
//! observe a half-written file. The trace log is the only append-only file and
//! is owned by [`crate::io::trace`].

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::plan::Plan;
use crate::core::sources::SourcesView;
use crate::io::trace::validate_run_id;

/// Extensions listed and served by [`list_run_files`] and [`read_run_file`].
const READABLE_EXTENSIONS: [&str; 5] = ["jsonl", "json", "md", "txt", "log"];

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub trace_path: PathBuf,
    pub plan_json_path: PathBuf,
    pub plan_md_path: PathBuf,
    pub answer_path: PathBuf,
    pub sources_json_path: PathBuf,
    pub sources_md_path: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        let dir = runs_dir.join(run_id);
        Self {
            trace_path: dir.join("trace.jsonl"),
            plan_json_path: dir.join("plan.json"),
            plan_md_path: dir.join("plan.md"),
            answer_path: dir.join("answer.md"),
            sources_json_path: dir.join("sources.json"),
            sources_md_path: dir.join("sources.md"),
            dir,
        }
    }
}

/// Write `plan.json` and `plan.md`.
pub fn write_plan(paths: &RunPaths, plan: &Plan) -> Result<()> {
    debug!(path = %paths.plan_json_path.display(), steps = plan.steps().len(), "writing plan snapshot");
    write_json_atomic(&paths.plan_json_path, plan)?;
    write_atomic(&paths.plan_md_path, &render_plan_markdown(plan))
}

/// Write the final answer as Markdown.
pub fn write_answer(paths: &RunPaths, goal: &str, answer: &str) -> Result<()> {
    let body = format!("# {}\n\n{}\n", goal.trim(), answer.trim_end());
    write_atomic(&paths.answer_path, &body)
}

/// Write `sources.json` and `sources.md`.
pub fn write_sources(paths: &RunPaths, view: &SourcesView) -> Result<()> {
    write_json_atomic(&paths.sources_json_path, view)?;
    write_atomic(&paths.sources_md_path, &render_sources_markdown(view))
}

/// Read a persisted `sources.json`, if the run wrote one.
pub fn load_sources(paths: &RunPaths) -> Result<Option<SourcesView>> {
    if !paths.sources_json_path.exists() {
        return Ok(None);
    }
    read_json(&paths.sources_json_path).map(Some)
}

/// A run directory under `runs_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEntry {
    pub run_id: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFile {
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Text content of one run file, cut at the requested size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFileText {
    pub run_id: String,
    pub file: String,
    pub truncated: bool,
    pub content: String,
}

/// Run directories sorted by id, keeping the last `limit`.
pub fn list_runs(runs_dir: &Path, limit: usize) -> Result<Vec<RunEntry>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir).with_context(|| format!("list {}", runs_dir.display()))? {
        let entry = entry.with_context(|| format!("list {}", runs_dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() && validate_run_id(&name).is_ok() {
            runs.push(RunEntry {
                output_dir: entry.path().display().to_string(),
                run_id: name,
            });
        }
    }
    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    let skip = runs.len().saturating_sub(limit);
    Ok(runs.split_off(skip))
}

/// Readable files directly inside a run directory, sorted by name.
///
/// Returns `None` when the run directory does not exist.
pub fn list_run_files(runs_dir: &Path, run_id: &str) -> Result<Option<Vec<RunFile>>> {
    validate_run_id(run_id)?;
    let dir = RunPaths::new(runs_dir, run_id).dir;
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if !metadata.is_file() || !is_readable_name(&name) {
            continue;
        }
        files.push(RunFile {
            name,
            size_bytes: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Some(files))
}

/// Read up to `max_bytes` of a run file as text.
///
/// `file` must be a plain file name inside the run directory. Returns `None`
/// when the file does not exist.
pub fn read_run_file(
    runs_dir: &Path,
    run_id: &str,
    file: &str,
    max_bytes: usize,
) -> Result<Option<RunFileText>> {
    validate_run_id(run_id)?;
    validate_run_file_name(file)?;
    let path = RunPaths::new(runs_dir, run_id).dir.join(file);
    if !path.is_file() {
        return Ok(None);
    }
    let handle = File::open(&path).with_context(|| format!("open {}", path.display()))?;
    let mut raw = Vec::new();
    handle
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut raw)
        .with_context(|| format!("read {}", path.display()))?;
    let truncated = raw.len() > max_bytes;
    raw.truncate(max_bytes);
    Ok(Some(RunFileText {
        run_id: run_id.to_string(),
        file: file.to_string(),
        truncated,
        content: String::from_utf8_lossy(&raw).into_owned(),
    }))
}

/// A run file name must be a bare file name with a readable extension.
pub fn validate_run_file_name(file: &str) -> Result<()> {
    if file.is_empty() || file.contains(['/', '\\']) || file.contains("..") {
        return Err(anyhow!("invalid run file name {file:?}"));
    }
    if !is_readable_name(file) {
        return Err(anyhow!("run file {file:?} is not a readable type"));
    }
    Ok(())
}

fn is_readable_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| READABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn render_plan_markdown(plan: &Plan) -> String {
    let mut out = format!("# Plan\n\nGoal: {}\n\n", plan.goal.trim());
    for step in plan.steps() {
        let marker = if step.idx == plan.current_idx() && !plan.is_exhausted() {
            "->"
        } else {
            "  "
        };
        out.push_str(&format!(
            "{marker} {}. [{}] {} ({}): {}\n",
            step.idx + 1,
            step.status,
            step.id,
            step.agent_kind,
            step.title.trim()
        ));
    }
    out
}

fn render_sources_markdown(view: &SourcesView) -> String {
    let mut out = format!("# Sources for {}\n", view.run_id);
    for source in &view.sources {
        let title = if source.title.is_empty() {
            source.normalized_url.as_str()
        } else {
            source.title.as_str()
        };
        out.push_str(&format!("\n## {title}\n\n- url: {}\n", source.url));
        if let Some(score) = source.relevancy_score {
            out.push_str(&format!("- relevancy: {score:.2}\n"));
        }
        if let Some(matched) = &source.matched {
            out.push_str(&format!("- match: {matched}\n"));
        }
        if let Some(how) = &source.how_helps {
            out.push_str(&format!("- how it helps: {how}\n"));
        }
        out.push_str(&format!(
            "- visits: {} (steps: {})\n",
            source.visits,
            source.seen_in_steps.join(", ")
        ));
        for quote in &source.evidence_quotes {
            out.push_str(&format!("> {quote}\n"));
        }
    }
    out
}

pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
