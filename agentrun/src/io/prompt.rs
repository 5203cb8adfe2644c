//! Prompt rendering for step inputs and collaborator requests.
//!
//! Templates live in `prompts/*.md` and are compiled once. Rendered text is
//! tidied so optional sections never leave runs of blank lines behind.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::plan::{PlanStep, StepDraft};
use crate::core::verify::{RetryFeedback, sample_output};

const STEP_TEMPLATE: &str = include_str!("prompts/step.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const REPLAN_TEMPLATE: &str = include_str!("prompts/replan.md");
const VERIFY_TEMPLATE: &str = include_str!("prompts/verify.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("step", STEP_TEMPLATE)
        .expect("step template should be valid");
    env.add_template("plan", PLAN_TEMPLATE)
        .expect("plan template should be valid");
    env.add_template("replan", REPLAN_TEMPLATE)
        .expect("replan template should be valid");
    env.add_template("verify", VERIFY_TEMPLATE)
        .expect("verify template should be valid");
    env
});

/// Output of an earlier step, sampled to a bounded size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorResult {
    pub id: String,
    pub title: String,
    pub output: String,
}

impl PriorResult {
    pub fn from_step(step: &PlanStep, max_chars: usize) -> Self {
        let output = step
            .result
            .as_ref()
            .map(|result| sample_output(result.output.trim(), max_chars))
            .unwrap_or_default();
        Self {
            id: step.id.clone(),
            title: step.title.clone(),
            output,
        }
    }
}

/// Inputs for the literal instruction block handed to an agent.
#[derive(Debug, Clone)]
pub struct StepPrompt<'a> {
    pub goal: &'a str,
    pub step: &'a PlanStep,
    pub total_steps: usize,
    pub prior: &'a [PriorResult],
    pub feedback: Option<&'a RetryFeedback>,
}

#[derive(Debug, Clone, Serialize)]
struct StepContext<'a> {
    id: &'a str,
    number: usize,
    total: usize,
    title: &'a str,
    agent_kind: &'a str,
}

/// The step that triggered a re-plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedStep {
    pub id: String,
    pub title: String,
    pub reason: String,
}

/// Judge input for one attempt.
#[derive(Debug, Clone)]
pub struct VerifyPrompt<'a> {
    pub goal: &'a str,
    pub step_id: &'a str,
    pub title: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Already sampled output of the attempt.
    pub output: &'a str,
    pub previous: &'a [PreviousAttempt],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviousAttempt {
    pub attempt: u32,
    pub output: String,
}

pub fn render_step(prompt: &StepPrompt<'_>) -> Result<String> {
    let step = StepContext {
        id: &prompt.step.id,
        number: prompt.step.idx + 1,
        total: prompt.total_steps,
        title: prompt.step.title.trim(),
        agent_kind: &prompt.step.agent_kind,
    };
    let rendered = ENGINE.get_template("step")?.render(context! {
        goal => prompt.goal.trim(),
        step => step,
        prior => prompt.prior,
        feedback => prompt.feedback,
    })?;
    Ok(tidy(&rendered))
}

pub fn render_plan(goal: &str, agent_kinds: &[String]) -> Result<String> {
    let rendered = ENGINE.get_template("plan")?.render(context! {
        goal => goal.trim(),
        agent_kinds => agent_kinds,
    })?;
    Ok(tidy(&rendered))
}

pub fn render_replan(
    goal: &str,
    agent_kinds: &[String],
    completed: &[PriorResult],
    failed: &FailedStep,
    remaining: &[StepDraft],
) -> Result<String> {
    let rendered = ENGINE.get_template("replan")?.render(context! {
        goal => goal.trim(),
        agent_kinds => agent_kinds,
        completed => completed,
        failed => failed,
        remaining => remaining,
    })?;
    Ok(tidy(&rendered))
}

pub fn render_verify(prompt: &VerifyPrompt<'_>) -> Result<String> {
    let rendered = ENGINE.get_template("verify")?.render(context! {
        goal => prompt.goal.trim(),
        step_id => prompt.step_id,
        title => prompt.title.trim(),
        attempt => prompt.attempt,
        max_attempts => prompt.max_attempts,
        output => prompt.output,
        previous => prompt.previous,
    })?;
    Ok(tidy(&rendered))
}

/// Trim the ends and collapse runs of blank lines into one.
fn tidy(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len());
    let mut blank_run = 0;
    for line in rendered.trim().lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out
}
