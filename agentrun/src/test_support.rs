//! Scripted collaborators and config helpers for tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use anyhow::{Result, anyhow};

use crate::agents::{
    Judge, PlanRequest, PlanSource, ReplanRequest, StepAgent, StepOutput, StepRequest,
    VerifyRequest,
};
use crate::core::plan::StepDraft;
use crate::core::verify::Verdict;
use crate::io::config::RunnerConfig;

/// Config rooted in `dir` with a short idle poll.
pub fn test_config(dir: &Path) -> RunnerConfig {
    RunnerConfig {
        runs_dir: dir.join("runs"),
        idle_poll_ms: 10,
        ..RunnerConfig::default()
    }
}

pub fn accept(rationale: &str) -> Verdict {
    Verdict {
        is_done: true,
        confidence: 0.9,
        missing: Vec::new(),
        rationale: rationale.to_string(),
    }
}

pub fn reject(confidence: f64, missing: &[&str]) -> Verdict {
    Verdict {
        is_done: false,
        confidence,
        missing: missing.iter().map(|m| m.to_string()).collect(),
        rationale: "not done yet".to_string(),
    }
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Agent that replays queued responses, then falls back to a fixed output.
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    script: Arc<Mutex<VecDeque<Result<StepOutput, String>>>>,
    fallback: Arc<Mutex<Option<StepOutput>>>,
    calls: Arc<Mutex<Vec<StepRequest>>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent answering every call with `output`.
    pub fn always(output: &str) -> Self {
        let agent = Self::new();
        *locked(&agent.fallback) = Some(StepOutput::ok(output));
        agent
    }

    pub fn then(self, output: StepOutput) -> Self {
        locked(&self.script).push_back(Ok(output));
        self
    }

    /// Queue an `Err` from the agent itself.
    pub fn then_error(self, message: &str) -> Self {
        locked(&self.script).push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<StepRequest> {
        locked(&self.calls).clone()
    }
}

impl StepAgent for ScriptedAgent {
    fn execute(&self, request: &StepRequest) -> Result<StepOutput> {
        locked(&self.calls).push(request.clone());
        if let Some(next) = locked(&self.script).pop_front() {
            return next.map_err(|message| anyhow!(message));
        }
        locked(&self.fallback)
            .clone()
            .ok_or_else(|| anyhow!("agent script exhausted"))
    }
}

/// Blocks callers until opened. Counts arrivals so tests can wait for them.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Default)]
struct GateState {
    open: bool,
    arrived: usize,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (state, cvar) = &*self.state;
        locked(state).open = true;
        cvar.notify_all();
    }

    /// Block until `count` callers have reached the gate.
    pub fn wait_arrivals(&self, count: usize) {
        let (state, cvar) = &*self.state;
        let mut guard = locked(state);
        while guard.arrived < count {
            guard = cvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn pass(&self) {
        let (state, cvar) = &*self.state;
        let mut guard = locked(state);
        guard.arrived += 1;
        cvar.notify_all();
        while !guard.open {
            guard = cvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Agent that waits at a [`Gate`] before delegating.
#[derive(Clone)]
pub struct GatedAgent {
    gate: Gate,
    inner: ScriptedAgent,
}

impl GatedAgent {
    pub fn new(gate: Gate, inner: ScriptedAgent) -> Self {
        Self { gate, inner }
    }
}

impl StepAgent for GatedAgent {
    fn execute(&self, request: &StepRequest) -> Result<StepOutput> {
        self.gate.pass();
        self.inner.execute(request)
    }
}

/// Planner returning a fixed plan and scripted replans.
#[derive(Clone, Default)]
pub struct StaticPlanner {
    steps: Vec<StepDraft>,
    replans: Arc<Mutex<VecDeque<Vec<StepDraft>>>>,
    replan_calls: Arc<Mutex<Vec<ReplanRequest>>>,
}

impl StaticPlanner {
    pub fn new(steps: &[(&str, &str)]) -> Self {
        Self {
            steps: drafts(steps),
            ..Self::default()
        }
    }

    pub fn with_replan(self, steps: &[(&str, &str)]) -> Self {
        locked(&self.replans).push_back(drafts(steps));
        self
    }

    pub fn replan_calls(&self) -> Vec<ReplanRequest> {
        locked(&self.replan_calls).clone()
    }
}

impl PlanSource for StaticPlanner {
    fn plan(&self, _request: &PlanRequest) -> Result<Vec<StepDraft>> {
        Ok(self.steps.clone())
    }

    fn replan(&self, request: &ReplanRequest) -> Result<Vec<StepDraft>> {
        locked(&self.replan_calls).push(request.clone());
        Ok(locked(&self.replans).pop_front().unwrap_or_default())
    }
}

/// Planner whose every call fails.
pub struct FailingPlanner;

impl PlanSource for FailingPlanner {
    fn plan(&self, _request: &PlanRequest) -> Result<Vec<StepDraft>> {
        Err(anyhow!("planner backend unavailable"))
    }

    fn replan(&self, _request: &ReplanRequest) -> Result<Vec<StepDraft>> {
        Err(anyhow!("planner backend unavailable"))
    }
}

/// Judge replaying queued verdicts, then accepting everything.
#[derive(Clone, Default)]
pub struct ScriptedJudge {
    verdicts: Arc<Mutex<VecDeque<Result<Verdict, String>>>>,
    calls: Arc<Mutex<Vec<VerifyRequest>>>,
}

impl ScriptedJudge {
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn then(self, verdict: Verdict) -> Self {
        locked(&self.verdicts).push_back(Ok(verdict));
        self
    }

    /// Queue an `Err` from the judge backend.
    pub fn then_error(self, message: &str) -> Self {
        locked(&self.verdicts).push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<VerifyRequest> {
        locked(&self.calls).clone()
    }
}

impl Judge for ScriptedJudge {
    fn judge(&self, request: &VerifyRequest) -> Result<Verdict> {
        locked(&self.calls).push(request.clone());
        match locked(&self.verdicts).pop_front() {
            Some(next) => next.map_err(|message| anyhow!(message)),
            None => Ok(accept("looks complete")),
        }
    }
}

fn drafts(steps: &[(&str, &str)]) -> Vec<StepDraft> {
    steps
        .iter()
        .map(|(title, kind)| StepDraft::new(*title, *kind))
        .collect()
}
