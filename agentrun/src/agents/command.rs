//! Collaborators backed by external commands.
//!
//! Each call writes one JSON request to the command's stdin: the request
//! fields plus `kind` and a rendered `prompt`. The command prints one JSON
//! response, which is schema-checked before use.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::agents::{
    Collaborators, Judge, PlanRequest, PlanSource, ReplanRequest, ScoreRequest, SourceScorer,
    StepAgent, StepOutput, StepRequest, VerifyRequest,
};
use crate::core::plan::StepDraft;
use crate::core::sources::Enrichment;
use crate::core::verify::Verdict;
use crate::io::config::{CommandSpec, CommandsConfig};
use crate::io::executor::{CommandExecutor, ExecRequest, Executor, execute_and_load_json};
use crate::io::prompt::{VerifyPrompt, render_plan, render_replan, render_verify};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan_output.schema.json");
const STEP_SCHEMA: &str = include_str!("../../schemas/step_output.schema.json");
const VERDICT_SCHEMA: &str = include_str!("../../schemas/verdict.schema.json");
const ENRICHMENT_SCHEMA: &str = include_str!("../../schemas/enrichment.schema.json");

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    kind: &'static str,
    prompt: &'a str,
    #[serde(flatten)]
    request: &'a T,
}

#[derive(Deserialize)]
struct PlanResponse {
    steps: Vec<StepDraft>,
}

/// A configured command plus the executor that runs it.
#[derive(Clone)]
struct CommandRunner {
    spec: CommandSpec,
    commands: CommandsConfig,
    executor: Arc<dyn Executor>,
}

impl CommandRunner {
    fn call<Req, T>(
        &self,
        kind: &'static str,
        prompt: &str,
        request: &Req,
        schema: &str,
        log_path: Option<PathBuf>,
    ) -> Result<T>
    where
        Req: Serialize,
        T: DeserializeOwned,
    {
        let input = serde_json::to_string(&Envelope {
            kind,
            prompt,
            request,
        })?;
        let mut exec = ExecRequest::for_command(&self.spec, &self.commands, input);
        if let Some(path) = log_path {
            exec = exec.with_log_path(path);
        }
        execute_and_load_json(self.executor.as_ref(), &exec, schema)
    }
}

pub struct CommandAgent {
    kind: String,
    runner: CommandRunner,
}

impl StepAgent for CommandAgent {
    #[instrument(skip_all, fields(agent = %self.kind, step_id = %request.step_id, attempt = request.attempt))]
    fn execute(&self, request: &StepRequest) -> Result<StepOutput> {
        let log_path = request
            .output_dir
            .join("logs")
            .join(format!("{}-attempt-{}.log", request.step_id, request.attempt));
        let output: StepOutput = self.runner.call(
            "step",
            &request.task,
            request,
            STEP_SCHEMA,
            Some(log_path),
        )?;
        debug!(success = output.success, pages = output.pages.len(), "agent responded");
        Ok(output)
    }
}

pub struct CommandPlanner {
    runner: CommandRunner,
}

impl PlanSource for CommandPlanner {
    #[instrument(skip_all, fields(run_id = %request.run_id))]
    fn plan(&self, request: &PlanRequest) -> Result<Vec<StepDraft>> {
        let prompt = render_plan(&request.goal, &request.agent_kinds)?;
        let response: PlanResponse = self
            .runner
            .call("plan", &prompt, request, PLAN_SCHEMA, None)?;
        Ok(response.steps)
    }

    #[instrument(skip_all, fields(run_id = %request.run_id, failed = %request.failed.id))]
    fn replan(&self, request: &ReplanRequest) -> Result<Vec<StepDraft>> {
        let prompt = render_replan(
            &request.goal,
            &request.agent_kinds,
            &request.completed,
            &request.failed,
            &request.remaining,
        )?;
        let response: PlanResponse = self
            .runner
            .call("replan", &prompt, request, PLAN_SCHEMA, None)?;
        Ok(response.steps)
    }
}

pub struct CommandJudge {
    runner: CommandRunner,
}

impl Judge for CommandJudge {
    #[instrument(skip_all, fields(step_id = %request.step_id, attempt = request.attempt))]
    fn judge(&self, request: &VerifyRequest) -> Result<Verdict> {
        let prompt = render_verify(&VerifyPrompt {
            goal: &request.goal,
            step_id: &request.step_id,
            title: &request.title,
            attempt: request.attempt,
            max_attempts: request.max_attempts,
            output: &request.output,
            previous: &request.previous,
        })?;
        self.runner
            .call("verify", &prompt, request, VERDICT_SCHEMA, None)
    }
}

pub struct CommandScorer {
    runner: CommandRunner,
}

impl SourceScorer for CommandScorer {
    #[instrument(skip_all, fields(url = %request.url))]
    fn score(&self, request: &ScoreRequest) -> Result<Enrichment> {
        self.runner
            .call("score", &request.text, request, ENRICHMENT_SCHEMA, None)
    }
}

/// Build command-backed collaborators from `[commands]`.
pub fn collaborators_from_config(commands: &CommandsConfig) -> Result<Collaborators> {
    collaborators_with_executor(commands, Arc::new(CommandExecutor))
}

pub fn collaborators_with_executor(
    commands: &CommandsConfig,
    executor: Arc<dyn Executor>,
) -> Result<Collaborators> {
    let runner = |spec: &CommandSpec| CommandRunner {
        spec: spec.clone(),
        commands: commands.clone(),
        executor: Arc::clone(&executor),
    };
    let planner = commands
        .planner
        .as_ref()
        .ok_or_else(|| anyhow!("commands.planner is not configured"))?;
    let judge = commands
        .judge
        .as_ref()
        .ok_or_else(|| anyhow!("commands.judge is not configured"))?;
    if commands.agents.is_empty() {
        return Err(anyhow!("no [commands.agents.<kind>] configured"));
    }

    let mut collaborators = Collaborators::new(
        CommandPlanner {
            runner: runner(planner),
        },
        CommandJudge {
            runner: runner(judge),
        },
    );
    for (kind, spec) in &commands.agents {
        collaborators = collaborators.with_agent(
            kind.clone(),
            CommandAgent {
                kind: kind.clone(),
                runner: runner(spec),
            },
        );
    }
    if let Some(scorer) = &commands.scorer {
        collaborators = collaborators.with_scorer(CommandScorer {
            runner: runner(scorer),
        });
    }
    Ok(collaborators)
}
