//! Collaborator seams: planning, step execution, judging and source scoring.
//!
//! Every collaborator is synchronous and may block for as long as the backend
//! needs; the run loop never preempts a call. Timeouts belong to the
//! implementations (see [`command`]).

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::plan::StepDraft;
use crate::core::sources::Enrichment;
use crate::core::verify::{RetryFeedback, Verdict};
use crate::io::prompt::{FailedStep, PreviousAttempt, PriorResult};

pub mod command;

/// One attempt at one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRequest {
    pub run_id: String,
    pub goal: String,
    pub step_id: String,
    pub title: String,
    pub agent_kind: String,
    pub attempt: u32,
    /// Rendered instruction block; logged verbatim as the tool input.
    pub task: String,
    pub prior_results: Vec<PriorResult>,
    pub feedback: Option<RetryFeedback>,
    pub provider: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    /// Run directory agents may write artifacts into.
    pub output_dir: PathBuf,
}

/// Page an agent looked at while working on a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageVisit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub screenshot: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub output: String,
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub pages: Vec<PageVisit>,
}

impl StepOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub run_id: String,
    pub goal: String,
    pub agent_kinds: Vec<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplanRequest {
    pub run_id: String,
    pub goal: String,
    pub agent_kinds: Vec<String>,
    pub completed: Vec<PriorResult>,
    pub failed: FailedStep,
    /// Pending steps the new drafts will replace.
    pub remaining: Vec<StepDraft>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest {
    pub run_id: String,
    pub goal: String,
    pub step_id: String,
    pub title: String,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Sampled output of the attempt under review.
    pub output: String,
    pub previous: Vec<PreviousAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest {
    pub run_id: String,
    pub goal: String,
    pub step_id: String,
    pub url: String,
    pub title: String,
    pub text: String,
}

/// Executes steps of one agent kind.
pub trait StepAgent: Send + Sync {
    /// `Ok` with `success = false` is a tool failure the verifier may retry;
    /// `Err` means the backend itself is unreachable.
    fn execute(&self, request: &StepRequest) -> Result<StepOutput>;
}

/// Decomposes goals into steps.
pub trait PlanSource: Send + Sync {
    fn plan(&self, request: &PlanRequest) -> Result<Vec<StepDraft>>;

    /// Replacement steps after a failure; an empty list means no recovery.
    fn replan(&self, request: &ReplanRequest) -> Result<Vec<StepDraft>>;
}

pub trait Judge: Send + Sync {
    fn judge(&self, request: &VerifyRequest) -> Result<Verdict>;
}

pub trait SourceScorer: Send + Sync {
    fn score(&self, request: &ScoreRequest) -> Result<Enrichment>;
}

/// The full set of collaborators a coordinator runs with.
pub struct Collaborators {
    agents: BTreeMap<String, Box<dyn StepAgent>>,
    planner: Box<dyn PlanSource>,
    judge: Box<dyn Judge>,
    scorer: Option<Box<dyn SourceScorer>>,
}

impl Collaborators {
    pub fn new(planner: impl PlanSource + 'static, judge: impl Judge + 'static) -> Self {
        Self {
            agents: BTreeMap::new(),
            planner: Box::new(planner),
            judge: Box::new(judge),
            scorer: None,
        }
    }

    pub fn with_agent(mut self, kind: impl Into<String>, agent: impl StepAgent + 'static) -> Self {
        self.agents.insert(kind.into(), Box::new(agent));
        self
    }

    pub fn with_scorer(mut self, scorer: impl SourceScorer + 'static) -> Self {
        self.scorer = Some(Box::new(scorer));
        self
    }

    pub fn agent(&self, kind: &str) -> Option<&dyn StepAgent> {
        self.agents.get(kind).map(|agent| agent.as_ref())
    }

    /// Registered agent kinds, sorted.
    pub fn agent_kinds(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn planner(&self) -> &dyn PlanSource {
        self.planner.as_ref()
    }

    pub fn judge(&self) -> &dyn Judge {
        self.judge.as_ref()
    }

    pub fn scorer(&self) -> Option<&dyn SourceScorer> {
        self.scorer.as_deref()
    }
}
