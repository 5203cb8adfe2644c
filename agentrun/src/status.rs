//! Read-only projections served to pollers.
//!
//! The coordinator publishes a [`StatusView`] snapshot at every state change;
//! readers never touch the live run.

use serde::{Deserialize, Serialize};

use crate::core::plan::{Plan, PlanStep};
use crate::core::types::StepStatus;

pub use crate::core::sources::SourcesView;
pub use crate::io::trace::TracePage as ActivityPage;
pub use crate::queue::ResultView;

/// Compact plan entry for status polling; step outputs stay in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStepView {
    pub idx: usize,
    pub id: String,
    pub title: String,
    pub agent_kind: String,
    pub status: StepStatus,
}

impl From<&PlanStep> for PlanStepView {
    fn from(step: &PlanStep) -> Self {
        Self {
            idx: step.idx,
            id: step.id.clone(),
            title: step.title.clone(),
            agent_kind: step.agent_kind.clone(),
            status: step.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub is_generating: bool,
    pub paused: bool,
    pub queue_length: usize,
    pub run_id: Option<String>,
    pub output_dir: Option<String>,
    pub plan_goal: Option<String>,
    pub plan: Vec<PlanStepView>,
    /// Index of the step being worked on; `None` before planning and after
    /// the last step.
    pub plan_current_step: Option<usize>,
    /// Role of the collaborator currently called (`planner` or `executor`).
    pub agent_type: Option<String>,
    /// Agent kind serving the current step.
    pub agent_name: Option<String>,
    pub current_status: String,
    /// Bumped by every new-run so pollers can drop stale cursors.
    pub session_id: u64,
}

impl Default for StatusView {
    fn default() -> Self {
        Self {
            is_generating: false,
            paused: false,
            queue_length: 0,
            run_id: None,
            output_dir: None,
            plan_goal: None,
            plan: Vec::new(),
            plan_current_step: None,
            agent_type: None,
            agent_name: None,
            current_status: "idle".to_string(),
            session_id: 0,
        }
    }
}

impl StatusView {
    pub(crate) fn set_plan(&mut self, plan: &Plan) {
        self.plan_goal = Some(plan.goal.clone());
        self.plan = plan.steps().iter().map(PlanStepView::from).collect();
        self.plan_current_step = (!plan.is_exhausted()).then(|| plan.current_idx());
    }
}
