//! Plan state machine for a single run.
//!
//! A [`Plan`] holds the ordered steps for a goal and a cursor pointing at the
//! first step that has not reached a terminal status. The cursor only moves
//! forward, and only when the step under it finishes. Amendments and re-plans
//! splice steps into the not-yet-started tail; steps that already ran are never
//! moved, removed or rewritten.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{RunOutcome, StepStatus};

/// Agent kind used for amendment steps when the plan offers no hint.
const FALLBACK_AGENT_KIND: &str = "general";

/// Planner output for one step, before it enters a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDraft {
    pub title: String,
    pub agent_kind: String,
}

impl StepDraft {
    pub fn new(title: impl Into<String>, agent_kind: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            agent_kind: agent_kind.into(),
        }
    }
}

/// Where a step came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOrigin {
    Planner,
    Amendment,
    Replan,
}

/// Result attached to a step once it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Output of the attempt kept for this step.
    pub output: String,
    /// Whether the kept attempt's tool execution succeeded.
    pub success: bool,
    /// Number of attempts spent on the step.
    pub attempts: u32,
    /// Judge confidence for the kept attempt (0 when never judged).
    pub confidence: f64,
    /// Human-readable reason for the final status.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Position in the plan; renumbered after splices.
    pub idx: usize,
    /// Stable identifier, never reused within a plan.
    pub id: String,
    pub title: String,
    pub agent_kind: String,
    pub status: StepStatus,
    pub origin: StepOrigin,
    pub result: Option<StepResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,
    #[error("plan has no remaining steps")]
    Exhausted,
    #[error("step {id} is {status}, expected {expected}")]
    UnexpectedStatus {
        id: String,
        status: StepStatus,
        expected: StepStatus,
    },
    #[error("{0} is not a terminal step status")]
    NotTerminal(StepStatus),
}

/// Ordered steps for one goal plus the execution cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    steps: Vec<PlanStep>,
    current: usize,
    next_seq: u32,
}

impl Plan {
    /// Build a plan with every step `pending` and the cursor on the first one.
    pub fn new(goal: impl Into<String>, drafts: Vec<StepDraft>) -> Result<Self, PlanError> {
        if drafts.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut plan = Self {
            goal: goal.into(),
            steps: Vec::with_capacity(drafts.len()),
            current: 0,
            next_seq: 1,
        };
        for draft in drafts {
            let step = plan.new_step(draft, StepOrigin::Planner);
            plan.steps.push(step);
        }
        plan.renumber();
        Ok(plan)
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Index of the first step without a terminal status.
    pub fn current_idx(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> Option<&PlanStep> {
        self.steps.get(self.current)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.steps.len()
    }

    /// Move the current step from `pending` to `running`.
    pub fn start_current(&mut self) -> Result<&PlanStep, PlanError> {
        let step = self
            .steps
            .get_mut(self.current)
            .ok_or(PlanError::Exhausted)?;
        if step.status != StepStatus::Pending {
            return Err(PlanError::UnexpectedStatus {
                id: step.id.clone(),
                status: step.status,
                expected: StepStatus::Pending,
            });
        }
        step.status = StepStatus::Running;
        Ok(&*step)
    }

    /// Record a terminal status for the running step and advance the cursor.
    pub fn finish_current(
        &mut self,
        status: StepStatus,
        result: StepResult,
    ) -> Result<&PlanStep, PlanError> {
        if !status.is_terminal() {
            return Err(PlanError::NotTerminal(status));
        }
        let idx = self.current;
        let step = self.steps.get_mut(idx).ok_or(PlanError::Exhausted)?;
        if step.status != StepStatus::Running {
            return Err(PlanError::UnexpectedStatus {
                id: step.id.clone(),
                status: step.status,
                expected: StepStatus::Running,
            });
        }
        step.status = status;
        step.result = Some(result);
        self.current += 1;
        Ok(&self.steps[idx])
    }

    /// Splice amendment steps after the current step and before the first
    /// step that has not started. Returns the positions of the new steps.
    ///
    /// Amendments keep their submission order and untouched steps keep theirs.
    pub fn insert_amendments(&mut self, texts: &[String]) -> Vec<usize> {
        let mut at = self.insertion_point();
        let agent_kind = self
            .steps
            .get(at)
            .or_else(|| self.steps.last())
            .map_or_else(|| FALLBACK_AGENT_KIND.to_string(), |s| s.agent_kind.clone());

        let mut positions = Vec::with_capacity(texts.len());
        for text in texts {
            let draft = StepDraft::new(text.trim(), agent_kind.clone());
            let step = self.new_step(draft, StepOrigin::Amendment);
            self.steps.insert(at, step);
            positions.push(at);
            at += 1;
        }
        self.renumber();
        positions
    }

    /// Replace every not-yet-started step with `drafts`.
    ///
    /// Steps that are running or finished stay where they are, results
    /// included. Returns how many pending steps were dropped.
    pub fn replace_pending_tail(&mut self, drafts: Vec<StepDraft>) -> usize {
        let split = self.current.min(self.steps.len());
        let tail = self.steps.split_off(split);
        let removed = tail
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .count();
        self.steps.extend(
            tail.into_iter()
                .filter(|step| step.status != StepStatus::Pending),
        );
        for draft in drafts {
            let step = self.new_step(draft, StepOrigin::Replan);
            self.steps.push(step);
        }
        self.renumber();
        removed
    }

    /// Final outcome once every step is terminal.
    ///
    /// A plan is done when its last step completed; any other fully terminal
    /// plan failed.
    pub fn outcome(&self) -> Option<RunOutcome> {
        if self.steps.iter().any(|step| !step.status.is_terminal()) {
            return None;
        }
        match self.steps.last() {
            Some(step) if step.status == StepStatus::Completed => Some(RunOutcome::Done),
            _ => Some(RunOutcome::Failed),
        }
    }

    pub fn last_completed(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .rev()
            .find(|step| step.status == StepStatus::Completed)
    }

    /// Completed steps in plan order, used as context for later steps.
    pub fn completed(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
    }

    fn insertion_point(&self) -> usize {
        let mut at = self.current;
        while let Some(step) = self.steps.get(at) {
            if step.status == StepStatus::Pending {
                break;
            }
            at += 1;
        }
        at
    }

    fn new_step(&mut self, draft: StepDraft, origin: StepOrigin) -> PlanStep {
        let id = format!("step-{}", self.next_seq);
        self.next_seq += 1;
        PlanStep {
            idx: 0,
            id,
            title: draft.title,
            agent_kind: draft.agent_kind,
            status: StepStatus::Pending,
            origin,
            result: None,
        }
    }

    fn renumber(&mut self) {
        for (idx, step) in self.steps.iter_mut().enumerate() {
            step.idx = idx;
        }
    }
}
