//! The serialized run loop and the thread-safe handle around it.
//!
//! Exactly one run is live at a time. Its [`RunContext`] is a local value of
//! the loop; every other thread sees the run only through the published
//! [`StatusView`], the trace log and the source store.
//!
//! Pause, cancel (new-run), shutdown and amendments are only observed at step
//! boundaries. A collaborator call in flight always runs to completion.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agents::{Collaborators, PlanRequest, ReplanRequest};
use crate::core::plan::{Plan, PlanStep, StepDraft};
use crate::core::sources::{MergeLimits, SourcesView};
use crate::core::types::{RunOutcome, StepStatus, TaskStatus};
use crate::dispatch::{Dispatcher, PRIOR_RESULT_CHARS, StepScope};
use crate::error::RunError;
use crate::io::artifacts::{
    RunEntry, RunFile, RunFileText, RunPaths, list_run_files, list_runs, read_run_file,
    write_answer, write_plan,
};
use crate::io::config::{RunnerConfig, TraceConfig};
use crate::io::prompt::{FailedStep, PriorResult};
use crate::io::sources_store::{ImportSummary, SourceAggregator};
use crate::io::trace::{CaptureSettings, TraceFields, TracePage, TraceSink};
use crate::queue::{ResultView, Task, TaskConfig, TaskPatch, TaskQueue, TaskResult};
use crate::status::StatusView;

const CANCELLED: &str = "cancelled";
const SHUTDOWN: &str = "shutdown";

/// User text waiting to be spliced into the live plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Amendment {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Amendments accepted for the live run but not yet applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingAmendments {
    pub run_id: Option<String>,
    pub amendments: Vec<Amendment>,
}

/// Mutable state of the one live run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub uid: String,
    pub output_dir: PathBuf,
    pub paths: RunPaths,
    pub trace_config: TraceConfig,
    pub task_config: TaskConfig,
    pub plan: Plan,
    /// Epoch captured at start; a newer epoch cancels the run.
    pub epoch: u64,
    pub replans_used: u32,
    pub paused: bool,
    pub status_text: String,
}

/// How a dequeued task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub uid: String,
    pub run_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

enum RunEnd {
    Finished {
        outcome: RunOutcome,
        result: TaskResult,
    },
    Cancelled(&'static str),
}

enum Boundary {
    Continue,
    Exhausted,
    Cancelled(&'static str),
}

#[derive(Default)]
struct Mailbox {
    active_run: Option<String>,
    pending: Vec<Amendment>,
}

#[derive(Default)]
struct Control {
    pause_requested: bool,
    /// The loop is blocked at a boundary waiting for resume.
    parked: bool,
    epoch: u64,
    shutdown: bool,
    /// Bumped on every wake-up request so the idle wait never misses one.
    wake_seq: u64,
    session_id: u64,
}

/// Nested locks are always taken control first, then status or mailbox.
struct Shared {
    config: RunnerConfig,
    queue: TaskQueue,
    trace: TraceSink,
    sources: SourceAggregator,
    control: Mutex<Control>,
    wake: Condvar,
    mailbox: Mutex<Mailbox>,
    status: Mutex<StatusView>,
}

impl Shared {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, StatusView> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, update: impl FnOnce(&mut Control)) {
        let mut control = self.lock_control();
        update(&mut control);
        control.wake_seq += 1;
        self.wake.notify_all();
    }

    /// Update the published status unless the run's epoch went stale.
    fn publish(&self, epoch: u64, update: impl FnOnce(&mut StatusView)) {
        let control = self.lock_control();
        self.publish_with(&control, epoch, update);
    }

    /// Same as [`Shared::publish`] for callers already holding the control lock.
    fn publish_with(&self, control: &Control, epoch: u64, update: impl FnOnce(&mut StatusView)) {
        if control.epoch != epoch {
            return;
        }
        update(&mut self.lock_status());
    }

    fn open_mailbox(&self, run_id: &str) {
        let mut mailbox = self.lock_mailbox();
        mailbox.active_run = Some(run_id.to_string());
        mailbox.pending.clear();
    }

    fn drain_mailbox(&self, run_id: &str) -> Vec<Amendment> {
        let mut mailbox = self.lock_mailbox();
        if mailbox.active_run.as_deref() != Some(run_id) {
            return Vec::new();
        }
        std::mem::take(&mut mailbox.pending)
    }

    /// Close the mailbox only if nothing is waiting in it.
    fn close_mailbox_if_empty(&self, run_id: &str) -> bool {
        let mut mailbox = self.lock_mailbox();
        if !mailbox.pending.is_empty() && mailbox.active_run.as_deref() == Some(run_id) {
            return false;
        }
        if mailbox.active_run.as_deref() == Some(run_id) {
            mailbox.active_run = None;
        }
        true
    }

    fn close_mailbox(&self, run_id: &str) {
        let mut mailbox = self.lock_mailbox();
        if mailbox.active_run.as_deref() == Some(run_id) {
            mailbox.active_run = None;
            mailbox.pending.clear();
        }
    }

    fn current_run_id(&self) -> Option<String> {
        self.lock_status().run_id.clone()
    }
}

/// Cloneable, thread-safe entry point for transports and tests.
#[derive(Clone)]
pub struct RunnerHandle {
    shared: Arc<Shared>,
}

impl RunnerHandle {
    /// Enqueue a goal; returns its uid without waiting for execution.
    pub fn submit(&self, query: impl Into<String>, config: TaskConfig) -> String {
        let uid = self.shared.queue.submit(query, config);
        self.shared.notify(|_| {});
        uid
    }

    pub fn list(&self) -> Vec<Task> {
        self.shared.queue.list()
    }

    pub fn queued(&self) -> Vec<Task> {
        self.shared.queue.queued()
    }

    pub fn task(&self, uid: &str) -> Result<Task, RunError> {
        self.shared.queue.get(uid)
    }

    pub fn update(&self, uid: &str, patch: TaskPatch) -> Result<Task, RunError> {
        self.shared.queue.update(uid, patch)
    }

    pub fn delete(&self, uid: &str) -> Result<(), RunError> {
        self.shared.queue.delete(uid)
    }

    pub fn result(&self, uid: &str) -> Result<ResultView, RunError> {
        self.shared.queue.result(uid)
    }

    pub fn status(&self) -> StatusView {
        let mut view = {
            let control = self.shared.lock_control();
            let mut view = self.shared.lock_status().clone();
            view.paused = control.parked || (control.pause_requested && !view.is_generating);
            view.session_id = control.session_id;
            view
        };
        view.queue_length = self.shared.queue.queue_length();
        view
    }

    /// Trace events after `since_id` for `run_id`, or for the current run.
    pub fn activity(&self, run_id: Option<&str>, since_id: u64, limit: usize) -> Result<TracePage> {
        match run_id.map(str::to_string).or_else(|| self.shared.current_run_id()) {
            Some(run_id) => self.shared.trace.read(&run_id, since_id, limit),
            None => Ok(TracePage::empty(since_id)),
        }
    }

    /// Sources for `run_id`, or for the current run.
    pub fn sources(&self, run_id: Option<&str>) -> Result<SourcesView> {
        match run_id.map(str::to_string).or_else(|| self.shared.current_run_id()) {
            Some(run_id) => self.shared.sources.snapshot(&run_id),
            None => Ok(SourcesView::empty("")),
        }
    }

    /// Queue text for the live run; it is applied at the next step boundary.
    pub fn amend(&self, text: impl Into<String>) -> Result<(), RunError> {
        let mut mailbox = self.shared.lock_mailbox();
        if mailbox.active_run.is_none() {
            return Err(RunError::NoActiveRun);
        }
        mailbox.pending.push(Amendment {
            text: text.into(),
            received_at: Utc::now(),
        });
        debug!(pending = mailbox.pending.len(), "amendment queued");
        Ok(())
    }

    pub fn pause(&self) {
        info!("pause requested");
        self.shared.notify(|control| control.pause_requested = true);
    }

    pub fn resume(&self) {
        info!("resume requested");
        self.shared.notify(|control| control.pause_requested = false);
    }

    /// Cancel the live run at its next boundary and reset the read
    /// projections. Queued tasks and files on disk are kept; the cancelled
    /// run keeps writing its own trace and sources until it stops.
    pub fn new_run(&self) -> u64 {
        let session_id = {
            let mut control = self.shared.lock_control();
            control.epoch += 1;
            control.pause_requested = false;
            control.session_id += 1;
            control.wake_seq += 1;
            *self.shared.lock_status() = StatusView {
                session_id: control.session_id,
                ..StatusView::default()
            };
            let mut mailbox = self.shared.lock_mailbox();
            mailbox.active_run = None;
            mailbox.pending.clear();
            self.shared.wake.notify_all();
            control.session_id
        };
        info!(session_id, "new run requested");
        session_id
    }

    /// Amendments waiting for the live run's next boundary.
    pub fn pending_amendments(&self) -> PendingAmendments {
        let mailbox = self.shared.lock_mailbox();
        PendingAmendments {
            run_id: mailbox.active_run.clone(),
            amendments: mailbox.pending.clone(),
        }
    }

    /// Merge an exported source list into a run's sources.
    pub fn import_sources(&self, run_id: &str, view: &SourcesView) -> Result<ImportSummary> {
        self.shared.sources.import(run_id, view)
    }

    /// The last `limit` run directories, sorted by run id.
    pub fn runs(&self, limit: usize) -> Result<Vec<RunEntry>> {
        list_runs(&self.shared.config.runs_dir, limit)
    }

    /// Readable files of a run, or `None` for an unknown run.
    pub fn run_files(&self, run_id: &str) -> Result<Option<Vec<RunFile>>> {
        list_run_files(&self.shared.config.runs_dir, run_id)
    }

    pub fn run_file_text(
        &self,
        run_id: &str,
        file: &str,
        max_bytes: usize,
    ) -> Result<Option<RunFileText>> {
        read_run_file(&self.shared.config.runs_dir, run_id, file, max_bytes)
    }

    /// Stop `run_forever` at its next wait or boundary.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shared.notify(|control| control.shutdown = true);
    }
}

/// Owner of the run loop.
pub struct Coordinator {
    shared: Arc<Shared>,
    collaborators: Collaborators,
}

impl Coordinator {
    pub fn new(config: RunnerConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let limits = MergeLimits {
            max_quotes: config.sources.max_quotes,
            max_screenshots: config.sources.max_screenshots,
        };
        let shared = Shared {
            queue: TaskQueue::new(config.queue.max_finished_tasks),
            trace: TraceSink::new(&config.runs_dir),
            sources: SourceAggregator::new(&config.runs_dir, limits),
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            mailbox: Mutex::new(Mailbox::default()),
            status: Mutex::new(StatusView::default()),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
            collaborators,
        })
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run cycles until shutdown, sleeping while idle or paused.
    pub fn run_forever(&self) {
        info!("run loop started");
        let idle = Duration::from_millis(self.shared.config.idle_poll_ms);
        loop {
            let seen = {
                let control = self.shared.lock_control();
                if control.shutdown {
                    break;
                }
                control.wake_seq
            };
            match self.run_once() {
                Ok(Some(report)) => {
                    debug!(uid = %report.uid, status = %report.status, "run cycle finished");
                    continue;
                }
                Ok(None) => {}
                Err(err) => error!(err = %format!("{err:#}"), "run cycle failed"),
            }
            let control = self.shared.lock_control();
            if control.shutdown {
                break;
            }
            if control.wake_seq == seen {
                let (_control, _timeout) = self
                    .shared
                    .wake
                    .wait_timeout(control, idle)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        info!("run loop stopped");
    }

    /// Run the next queued task to completion.
    ///
    /// Returns `None` without touching the queue when paused, shut down or
    /// idle. Failures inside the run end the task, not the loop.
    #[instrument(skip_all)]
    pub fn run_once(&self) -> Result<Option<RunReport>> {
        let shared = &self.shared;
        {
            let control = shared.lock_control();
            if control.pause_requested || control.shutdown {
                return Ok(None);
            }
        }
        let Some(task) = shared.queue.dequeue_next() else {
            return Ok(None);
        };

        let run_id = new_run_id(shared.config.run_id_prefix.as_deref());
        shared.queue.attach_run(&task.uid, &run_id)?;
        let trace_config = shared.config.trace.with_overrides(&task.config.trace);
        let paths = RunPaths::new(&shared.config.runs_dir, &run_id);
        // Epoch and mailbox under one control lock: a new-run lands either
        // before both or after both.
        let epoch = {
            let control = shared.lock_control();
            shared.open_mailbox(&run_id);
            control.epoch
        };
        info!(uid = %task.uid, run_id = %run_id, "run started");

        shared.sources.begin_run(&run_id, trace_config.save_sources);
        shared.publish(epoch, |status| {
            *status = StatusView {
                is_generating: true,
                run_id: Some(run_id.clone()),
                output_dir: Some(paths.dir.display().to_string()),
                plan_goal: Some(task.query.clone()),
                agent_type: Some("planner".to_string()),
                current_status: "planning".to_string(),
                session_id: status.session_id,
                ..StatusView::default()
            };
        });

        let end = self.run_task(&task, &run_id, paths, trace_config, epoch);
        shared.close_mailbox(&run_id);

        let (outcome, result, event_kind) = match end {
            Ok(RunEnd::Finished { outcome, result }) => {
                let kind = match outcome {
                    RunOutcome::Done => "run_finished",
                    RunOutcome::Failed => "run_failed",
                };
                (outcome, result, kind)
            }
            Ok(RunEnd::Cancelled(reason)) => {
                let result = TaskResult {
                    error: Some(reason.to_string()),
                    ..TaskResult::default()
                };
                (RunOutcome::Failed, result, "run_cancelled")
            }
            Err(err) => {
                let fatal = RunError::fatal(&run_id, &err);
                error!(uid = %task.uid, run_id = %run_id, err = %fatal, "run failed");
                let result = TaskResult {
                    error: Some(fatal.to_string()),
                    ..TaskResult::default()
                };
                (RunOutcome::Failed, result, "run_failed")
            }
        };

        let status = outcome.task_status();
        let fields = TraceFields::new()
            .with("uid", &task.uid)
            .with("status", status)
            .with("error", &result.error)
            .with("agent_name", &result.agent_name);
        if let Err(err) = shared.trace.append(&run_id, event_kind, fields) {
            warn!(run_id = %run_id, err = %format!("{err:#}"), "failed to trace run end");
        }
        shared.trace.close_run(&run_id);
        shared.sources.finish_run(&run_id);

        let error = result.error.clone();
        shared.queue.complete(&task.uid, outcome, result)?;
        shared.publish(epoch, |view| {
            view.is_generating = false;
            view.plan_current_step = None;
            view.agent_type = None;
            view.agent_name = None;
            view.current_status = status.to_string();
        });
        info!(uid = %task.uid, run_id = %run_id, status = %status, "run ended");

        Ok(Some(RunReport {
            uid: task.uid,
            run_id,
            status,
            error,
        }))
    }

    #[instrument(skip_all, fields(uid = %task.uid, run_id = %run_id))]
    fn run_task(
        &self,
        task: &Task,
        run_id: &str,
        paths: RunPaths,
        trace_config: TraceConfig,
        epoch: u64,
    ) -> Result<RunEnd> {
        let shared = &self.shared;
        shared.trace.open_run(
            run_id,
            CaptureSettings {
                verbosity: trace_config.verbosity,
                max_field_chars: trace_config.max_field_chars,
            },
        )?;
        shared.trace.append(
            run_id,
            "run_started",
            TraceFields::new()
                .with("uid", &task.uid)
                .with("query", &task.query)
                .with("verbosity", trace_config.verbosity)
                .with("output_dir", paths.dir.display().to_string()),
        )?;

        let agent_kinds = self.allowed_kinds(&task.config);
        let drafts = self
            .collaborators
            .planner()
            .plan(&PlanRequest {
                run_id: run_id.to_string(),
                goal: task.query.clone(),
                agent_kinds,
                provider: task.config.provider.clone(),
            })
            .context("plan goal")?;
        let plan = Plan::new(task.query.clone(), drafts).context("planner returned no steps")?;

        let mut ctx = RunContext {
            run_id: run_id.to_string(),
            uid: task.uid.clone(),
            output_dir: paths.dir.clone(),
            paths,
            trace_config,
            task_config: task.config.clone(),
            plan,
            epoch,
            replans_used: 0,
            paused: false,
            status_text: "running".to_string(),
        };
        shared.trace.append(
            run_id,
            "plan_created",
            TraceFields::new()
                .with("goal", &ctx.plan.goal)
                .with("steps", step_summaries(ctx.plan.steps())),
        )?;
        self.checkpoint(&ctx, None)?;

        let dispatcher = Dispatcher::new(
            &self.collaborators,
            &shared.trace,
            &shared.sources,
            shared.config.retry.policy(),
            shared.config.sources.enrich,
        );

        loop {
            match self.boundary(&mut ctx)? {
                Boundary::Continue => {}
                Boundary::Exhausted => break,
                Boundary::Cancelled(reason) => {
                    info!(reason, "run cancelled at step boundary");
                    return Ok(RunEnd::Cancelled(reason));
                }
            }

            let step = ctx.plan.start_current()?.clone();
            shared.trace.append(
                run_id,
                "plan_step",
                TraceFields::new()
                    .with("step_id", &step.id)
                    .with("step_idx", step.idx)
                    .with("title", &step.title)
                    .with("agent_kind", &step.agent_kind)
                    .with("origin", step.origin)
                    .with("status", step.status),
            )?;
            ctx.status_text = format!("running {}", step.id);
            self.checkpoint(&ctx, Some(&step.agent_kind))?;

            let scope = StepScope {
                run_id,
                output_dir: &ctx.output_dir,
                task: &ctx.task_config,
            };
            let outcome = dispatcher.run_step(scope, &ctx.plan)?;
            let finished = ctx
                .plan
                .finish_current(outcome.status, outcome.result.clone())?
                .clone();
            shared.trace.append(
                run_id,
                "plan_step",
                TraceFields::new()
                    .with("step_id", &finished.id)
                    .with("step_idx", finished.idx)
                    .with("status", finished.status)
                    .with("attempts", outcome.result.attempts)
                    .with("confidence", outcome.result.confidence)
                    .with("reason", &outcome.result.reason),
            )?;
            self.checkpoint(&ctx, None)?;

            if outcome.status == StepStatus::Failed {
                let reason = outcome.result.reason.clone();
                if !self.replan(&mut ctx, &finished, &reason)? {
                    info!(step_id = %finished.id, "step failure ends the run");
                    return Ok(RunEnd::Finished {
                        outcome: RunOutcome::Failed,
                        result: final_result(&ctx.plan, Some(reason)),
                    });
                }
            }
        }

        let outcome = ctx.plan.outcome().unwrap_or(RunOutcome::Failed);
        let error = match outcome {
            RunOutcome::Done => None,
            RunOutcome::Failed => Some("plan ended without a completed final step".to_string()),
        };
        let result = final_result(&ctx.plan, error);
        if outcome == RunOutcome::Done
            && ctx.trace_config.save_answer
            && let Some(answer) = &result.answer
        {
            write_answer(&ctx.paths, &ctx.plan.goal, answer)?;
        }
        Ok(RunEnd::Finished { outcome, result })
    }

    /// The step boundary: apply amendments, then honour cancel, shutdown and
    /// pause, then decide whether the plan is finished.
    fn boundary(&self, ctx: &mut RunContext) -> Result<Boundary> {
        loop {
            let amendments = self.shared.drain_mailbox(&ctx.run_id);
            if !amendments.is_empty() {
                self.apply_amendments(ctx, &amendments)?;
            }

            let pause = {
                let control = self.shared.lock_control();
                if control.epoch != ctx.epoch {
                    return Ok(Boundary::Cancelled(CANCELLED));
                }
                if control.shutdown {
                    return Ok(Boundary::Cancelled(SHUTDOWN));
                }
                control.pause_requested
            };
            if pause {
                if let Some(reason) = self.park(ctx)? {
                    return Ok(Boundary::Cancelled(reason));
                }
                continue;
            }

            if !ctx.plan.is_exhausted() {
                return Ok(Boundary::Continue);
            }
            if self.shared.close_mailbox_if_empty(&ctx.run_id) {
                return Ok(Boundary::Exhausted);
            }
        }
    }

    /// Block until resume. Returns the cancel reason if the run must stop.
    fn park(&self, ctx: &mut RunContext) -> Result<Option<&'static str>> {
        let shared = &self.shared;
        shared.trace.append(
            &ctx.run_id,
            "run_paused",
            TraceFields::new().with("next_step", ctx.plan.current().map(|s| s.id.clone())),
        )?;
        ctx.paused = true;
        ctx.status_text = "paused".to_string();
        info!(run_id = %ctx.run_id, "run paused at step boundary");

        let reason = {
            let mut control = shared.lock_control();
            control.parked = true;
            shared.publish_with(&control, ctx.epoch, |view| {
                view.current_status = "paused".to_string();
                view.agent_type = None;
                view.agent_name = None;
            });
            while control.pause_requested && control.epoch == ctx.epoch && !control.shutdown {
                control = shared
                    .wake
                    .wait(control)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            control.parked = false;
            if control.epoch != ctx.epoch {
                Some(CANCELLED)
            } else if control.shutdown {
                Some(SHUTDOWN)
            } else {
                None
            }
        };
        ctx.paused = false;
        if reason.is_some() {
            return Ok(reason);
        }

        shared.trace.append(&ctx.run_id, "run_resumed", TraceFields::new())?;
        ctx.status_text = "running".to_string();
        self.checkpoint(ctx, None)?;
        info!(run_id = %ctx.run_id, "run resumed");
        Ok(None)
    }

    fn apply_amendments(&self, ctx: &mut RunContext, amendments: &[Amendment]) -> Result<()> {
        let texts: Vec<String> = amendments.iter().map(|a| a.text.clone()).collect();
        let positions = ctx.plan.insert_amendments(&texts);
        let step_ids: Vec<&str> = positions
            .iter()
            .filter_map(|&idx| ctx.plan.steps().get(idx))
            .map(|step| step.id.as_str())
            .collect();
        let received_at: Vec<DateTime<Utc>> = amendments.iter().map(|a| a.received_at).collect();
        self.shared.trace.append(
            &ctx.run_id,
            "amendment_applied",
            TraceFields::new()
                .with("texts", &texts)
                .with("step_ids", &step_ids)
                .with("positions", &positions)
                .with("received_at", received_at),
        )?;
        info!(run_id = %ctx.run_id, count = texts.len(), "amendments applied");
        self.checkpoint(ctx, None)
    }

    /// Ask the planner for a new tail after `failed`. Returns whether the run
    /// can go on.
    fn replan(&self, ctx: &mut RunContext, failed: &PlanStep, reason: &str) -> Result<bool> {
        if ctx.replans_used >= self.shared.config.max_replans {
            return Ok(false);
        }
        ctx.replans_used += 1;
        ctx.status_text = "replanning".to_string();
        self.shared.publish(ctx.epoch, |view| {
            view.current_status = ctx.status_text.clone();
            view.agent_type = Some("planner".to_string());
            view.agent_name = None;
        });

        let remaining: Vec<StepDraft> = ctx
            .plan
            .steps()
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .map(|step| StepDraft::new(step.title.clone(), step.agent_kind.clone()))
            .collect();
        let request = ReplanRequest {
            run_id: ctx.run_id.clone(),
            goal: ctx.plan.goal.clone(),
            agent_kinds: self.allowed_kinds(&ctx.task_config),
            completed: ctx
                .plan
                .completed()
                .map(|step| PriorResult::from_step(step, PRIOR_RESULT_CHARS))
                .collect(),
            failed: FailedStep {
                id: failed.id.clone(),
                title: failed.title.clone(),
                reason: reason.to_string(),
            },
            remaining,
            provider: ctx.task_config.provider.clone(),
        };
        let drafts = self
            .collaborators
            .planner()
            .replan(&request)
            .with_context(|| format!("replan after {}", failed.id))?;

        let added = drafts.len();
        let removed = if drafts.is_empty() {
            0
        } else {
            ctx.plan.replace_pending_tail(drafts)
        };
        self.shared.trace.append(
            &ctx.run_id,
            "plan_replanned",
            TraceFields::new()
                .with("failed_step", &failed.id)
                .with("added", added)
                .with("removed", removed)
                .with("recovered", added > 0)
                .with("steps", step_summaries(ctx.plan.steps())),
        )?;
        info!(run_id = %ctx.run_id, added, removed, "plan replanned");
        ctx.status_text = "running".to_string();
        self.checkpoint(ctx, None)?;
        Ok(added > 0)
    }

    /// Persist the plan when configured and publish progress.
    fn checkpoint(&self, ctx: &RunContext, agent_kind: Option<&str>) -> Result<()> {
        if ctx.trace_config.save_plan {
            write_plan(&ctx.paths, &ctx.plan)?;
        }
        self.shared.publish(ctx.epoch, |view| {
            view.set_plan(&ctx.plan);
            view.current_status = ctx.status_text.clone();
            view.agent_type = agent_kind.map(|_| "executor".to_string());
            view.agent_name = agent_kind.map(str::to_string);
        });
        Ok(())
    }

    fn allowed_kinds(&self, config: &TaskConfig) -> Vec<String> {
        self.collaborators
            .agent_kinds()
            .into_iter()
            .filter(|kind| config.allows_agent(kind))
            .collect()
    }
}

fn new_run_id(prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}-{}", Uuid::new_v4()),
        None => Uuid::new_v4().to_string(),
    }
}

/// Answer, reasoning and agent of the last completed step.
fn final_result(plan: &Plan, error: Option<String>) -> TaskResult {
    let last = plan.last_completed();
    let result = last.and_then(|step| step.result.as_ref());
    TaskResult {
        answer: result.map(|r| r.output.clone()),
        reasoning: result.map(|r| r.reason.clone()).filter(|r| !r.is_empty()),
        agent_name: last.map(|step| step.agent_kind.clone()),
        error,
    }
}

fn step_summaries(steps: &[PlanStep]) -> Vec<serde_json::Value> {
    steps
        .iter()
        .map(|step| {
            serde_json::json!({
                "id": step.id,
                "idx": step.idx,
                "title": step.title,
                "agent_kind": step.agent_kind,
                "status": step.status,
                "origin": step.origin,
            })
        })
        .collect()
}
