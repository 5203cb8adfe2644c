//! FIFO task queue shared by the run loop and the handle.
//!
//! One mutex guards both edits and the `queued → running` flip, so a task is
//! either still editable or already claimed by the coordinator, never both.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::types::{RunOutcome, TaskStatus};
use crate::error::RunError;
use crate::io::config::TraceOverrides;

/// Per-task settings supplied at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Opaque provider name handed to agents.
    pub provider: Option<String>,
    /// Agent kinds this task may use; `None` allows every registered kind.
    pub allowed_agents: Option<Vec<String>>,
    /// Opaque tool allow-list handed to agents.
    pub allowed_tools: Option<Vec<String>>,
    pub trace: TraceOverrides,
}

impl TaskConfig {
    pub fn allows_agent(&self, kind: &str) -> bool {
        self.allowed_agents
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|a| a == kind))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub uid: String,
    pub query: String,
    pub config: TaskConfig,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
    #[serde(skip)]
    result: Option<TaskResult>,
}

/// Edit of a queued task; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPatch {
    pub query: Option<String>,
    pub config: Option<TaskConfig>,
}

/// What a finished run produced for its task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub answer: Option<String>,
    pub reasoning: Option<String>,
    pub agent_name: Option<String>,
    pub error: Option<String>,
}

/// Poll response for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultView {
    pub uid: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    /// Uids in submission order.
    order: Vec<String>,
    tasks: HashMap<String, Task>,
}

impl QueueState {
    fn get_mut(&mut self, uid: &str) -> Result<&mut Task, RunError> {
        self.tasks
            .get_mut(uid)
            .ok_or_else(|| RunError::TaskNotFound(uid.to_string()))
    }

    fn editable(&mut self, uid: &str) -> Result<&mut Task, RunError> {
        let task = self.get_mut(uid)?;
        if task.status != TaskStatus::Queued {
            return Err(RunError::InvalidState {
                uid: uid.to_string(),
                status: task.status,
            });
        }
        Ok(task)
    }

    fn in_order(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|uid| self.tasks.get(uid))
    }

    /// Drop the oldest finished tasks beyond `keep`.
    fn prune_finished(&mut self, keep: usize) {
        let finished: Vec<String> = self
            .in_order()
            .filter(|task| task.status.is_terminal())
            .map(|task| task.uid.clone())
            .collect();
        if finished.len() <= keep {
            return;
        }
        let drop_count = finished.len() - keep;
        for uid in &finished[..drop_count] {
            self.tasks.remove(uid);
        }
        self.order.retain(|uid| self.tasks.contains_key(uid));
        debug!(pruned = drop_count, "pruned finished tasks");
    }
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    max_finished: usize,
}

impl TaskQueue {
    pub fn new(max_finished: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a goal and return its uid.
    pub fn submit(&self, query: impl Into<String>, config: TaskConfig) -> String {
        let uid = Uuid::new_v4().to_string();
        let task = Task {
            uid: uid.clone(),
            query: query.into(),
            config,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            run_id: None,
            result: None,
        };
        let mut state = self.lock();
        state.order.push(uid.clone());
        state.tasks.insert(uid.clone(), task);
        debug!(uid = %uid, total = state.order.len(), "task submitted");
        uid
    }

    /// Every retained task in submission order.
    pub fn list(&self) -> Vec<Task> {
        self.lock().in_order().cloned().collect()
    }

    /// Tasks still waiting, in the order they will run.
    pub fn queued(&self) -> Vec<Task> {
        self.lock()
            .in_order()
            .filter(|task| task.status == TaskStatus::Queued)
            .cloned()
            .collect()
    }

    pub fn queue_length(&self) -> usize {
        self.lock()
            .in_order()
            .filter(|task| task.status == TaskStatus::Queued)
            .count()
    }

    pub fn get(&self, uid: &str) -> Result<Task, RunError> {
        self.lock()
            .tasks
            .get(uid)
            .cloned()
            .ok_or_else(|| RunError::TaskNotFound(uid.to_string()))
    }

    pub fn update(&self, uid: &str, patch: TaskPatch) -> Result<Task, RunError> {
        let mut state = self.lock();
        let task = state.editable(uid)?;
        if let Some(query) = patch.query {
            task.query = query;
        }
        if let Some(config) = patch.config {
            task.config = config;
        }
        debug!(uid, "task updated");
        Ok(task.clone())
    }

    pub fn delete(&self, uid: &str) -> Result<(), RunError> {
        let mut state = self.lock();
        state.editable(uid)?;
        state.tasks.remove(uid);
        state.order.retain(|queued| queued != uid);
        debug!(uid, "task deleted");
        Ok(())
    }

    /// Claim the oldest queued task, flipping it to `running`.
    pub fn dequeue_next(&self) -> Option<Task> {
        let mut state = self.lock();
        let uid = state
            .in_order()
            .find(|task| task.status == TaskStatus::Queued)
            .map(|task| task.uid.clone())?;
        let task = state.tasks.get_mut(&uid)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Some(task.clone())
    }

    /// Record the run id serving a running task.
    pub fn attach_run(&self, uid: &str, run_id: &str) -> Result<(), RunError> {
        let mut state = self.lock();
        let task = state.get_mut(uid)?;
        task.run_id = Some(run_id.to_string());
        Ok(())
    }

    /// Move a running task to its terminal status and store the result.
    pub fn complete(
        &self,
        uid: &str,
        outcome: RunOutcome,
        result: TaskResult,
    ) -> Result<(), RunError> {
        let mut state = self.lock();
        let task = state.get_mut(uid)?;
        let next = outcome.task_status();
        if !task.status.can_become(next) {
            return Err(RunError::InvalidState {
                uid: uid.to_string(),
                status: task.status,
            });
        }
        task.status = next;
        task.finished_at = Some(Utc::now());
        task.result = Some(result);
        info!(uid, status = %next, "task finished");
        state.prune_finished(self.max_finished);
        Ok(())
    }

    pub fn result(&self, uid: &str) -> Result<ResultView, RunError> {
        let state = self.lock();
        let task = state
            .tasks
            .get(uid)
            .ok_or_else(|| RunError::TaskNotFound(uid.to_string()))?;
        let result = task.result.clone().unwrap_or_default();
        Ok(ResultView {
            uid: task.uid.clone(),
            status: task.status,
            answer: result.answer,
            reasoning: result.reasoning,
            agent_name: result.agent_name,
            run_id: task.run_id.clone(),
            error: result.error,
        })
    }
}
