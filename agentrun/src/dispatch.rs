//! Step dispatch: render the step input, call the agent, judge the output and
//! retry until the verifier accepts or gives up.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agents::{
    Collaborators, PageVisit, ScoreRequest, StepAgent, StepOutput, StepRequest, VerifyRequest,
};
use crate::core::plan::{Plan, PlanStep, StepResult};
use crate::core::sources::{Enrichment, SourceVisit, extract_urls};
use crate::core::types::{Detail, StepStatus};
use crate::core::verify::{
    Decision, RetryFeedback, RetryPolicy, RetryTracker, Verdict, sample_output,
};
use crate::error::RunError;
use crate::io::prompt::{PreviousAttempt, PriorResult, StepPrompt, render_step};
use crate::io::sources_store::SourceAggregator;
use crate::io::trace::{TraceFields, TraceSink};
use crate::queue::TaskConfig;

/// Characters of each earlier step's output carried into later step inputs.
pub(crate) const PRIOR_RESULT_CHARS: usize = 4000;
/// Characters of each rejected attempt shown to the judge.
const PREVIOUS_ATTEMPT_CHARS: usize = 2000;

/// Run-level inputs shared by every step.
#[derive(Debug, Clone, Copy)]
pub struct StepScope<'a> {
    pub run_id: &'a str,
    pub output_dir: &'a Path,
    pub task: &'a TaskConfig,
}

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRun {
    pub status: StepStatus,
    pub result: StepResult,
    /// Why the step failed, when it did.
    pub failure: Option<RunError>,
}

pub struct Dispatcher<'a> {
    collaborators: &'a Collaborators,
    trace: &'a TraceSink,
    sources: &'a SourceAggregator,
    policy: RetryPolicy,
    enrich: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        collaborators: &'a Collaborators,
        trace: &'a TraceSink,
        sources: &'a SourceAggregator,
        policy: RetryPolicy,
        enrich: bool,
    ) -> Self {
        Self {
            collaborators,
            trace,
            sources,
            policy,
            enrich,
        }
    }

    /// Drive the plan's running step to a terminal status.
    ///
    /// `Err` is reserved for judge, prompt and trace failures.
    #[instrument(skip_all, fields(run_id = scope.run_id))]
    pub fn run_step(&self, scope: StepScope<'_>, plan: &Plan) -> Result<StepRun> {
        let step = plan.current().context("no current step to dispatch")?;
        let prior: Vec<PriorResult> = plan
            .completed()
            .map(|done| PriorResult::from_step(done, PRIOR_RESULT_CHARS))
            .collect();
        let total_steps = plan.steps().len();

        let agent = match self.resolve_agent(scope, step) {
            Ok(agent) => agent,
            Err(failure) => {
                let input = self.render_input(plan, step, total_steps, &prior, None)?;
                let nothing = StepOutput::failed("");
                self.log_execution(scope, step, 1, &input, &nothing, Some(&failure))?;
                warn!(step_id = %step.id, error = %failure, "step cannot be dispatched");
                return Ok(StepRun {
                    status: StepStatus::Failed,
                    result: StepResult {
                        output: String::new(),
                        success: false,
                        attempts: 1,
                        confidence: 0.0,
                        reason: failure.to_string(),
                    },
                    failure: Some(failure),
                });
            }
        };

        let mut tracker = RetryTracker::new(self.policy.clone());
        loop {
            let attempt = tracker.next_attempt();
            let feedback = tracker.feedback();
            let input = self.render_input(plan, step, total_steps, &prior, feedback.as_ref())?;
            let request = StepRequest {
                run_id: scope.run_id.to_string(),
                goal: plan.goal.clone(),
                step_id: step.id.clone(),
                title: step.title.clone(),
                agent_kind: step.agent_kind.clone(),
                attempt,
                task: input,
                prior_results: prior.clone(),
                feedback,
                provider: scope.task.provider.clone(),
                allowed_tools: scope.task.allowed_tools.clone(),
                output_dir: scope.output_dir.to_path_buf(),
            };
            let output = self.execute(scope, step, agent, &request)?;

            let verdict = if output.success {
                Some(self.verify(scope, &plan.goal, step, attempt, &output.output, &tracker)?)
            } else {
                None
            };
            let decision = tracker.record(output.output, output.success, verdict);
            self.log_verdict(scope, step, &tracker, decision)?;

            match decision {
                Decision::Accept => {
                    let accepted = tracker.last().context("accepted attempt missing")?;
                    info!(step_id = %step.id, attempt, "step accepted");
                    return Ok(StepRun {
                        status: StepStatus::Completed,
                        result: StepResult {
                            output: accepted.output.clone(),
                            success: true,
                            attempts: attempt,
                            confidence: accepted.confidence(),
                            reason: accepted
                                .verdict
                                .as_ref()
                                .map(|v| v.rationale.clone())
                                .unwrap_or_default(),
                        },
                        failure: None,
                    });
                }
                Decision::Retry => {
                    debug!(step_id = %step.id, attempt, "retrying step");
                }
                Decision::Stop(reason) => {
                    let best = tracker.best().context("no attempt recorded")?;
                    let failure = RunError::VerificationExhausted {
                        step_id: step.id.clone(),
                        attempts: attempt,
                        reason: reason.as_str().to_string(),
                    };
                    warn!(
                        step_id = %step.id,
                        attempts = attempt,
                        reason = reason.as_str(),
                        "step failed verification"
                    );
                    return Ok(StepRun {
                        status: StepStatus::Failed,
                        result: StepResult {
                            output: best.output.clone(),
                            success: best.success,
                            attempts: attempt,
                            confidence: best.confidence(),
                            reason: failure.to_string(),
                        },
                        failure: Some(failure),
                    });
                }
            }
        }
    }

    fn resolve_agent(
        &self,
        scope: StepScope<'_>,
        step: &PlanStep,
    ) -> Result<&'a dyn StepAgent, RunError> {
        if !scope.task.allows_agent(&step.agent_kind) {
            return Err(RunError::ToolFailure {
                step_id: step.id.clone(),
                message: format!("agent kind {:?} is not allowed for this task", step.agent_kind),
            });
        }
        self.collaborators
            .agent(&step.agent_kind)
            .ok_or_else(|| RunError::ToolFailure {
                step_id: step.id.clone(),
                message: format!("no agent registered for kind {:?}", step.agent_kind),
            })
    }

    fn render_input(
        &self,
        plan: &Plan,
        step: &PlanStep,
        total_steps: usize,
        prior: &[PriorResult],
        feedback: Option<&RetryFeedback>,
    ) -> Result<String> {
        render_step(&StepPrompt {
            goal: &plan.goal,
            step,
            total_steps,
            prior,
            feedback,
        })
        .context("render step input")
    }

    /// One agent call, logged as `tool_executed` whatever the outcome.
    ///
    /// An agent `Err` is a failed attempt like any other, so the retry
    /// policy decides what happens next.
    fn execute(
        &self,
        scope: StepScope<'_>,
        step: &PlanStep,
        agent: &dyn StepAgent,
        request: &StepRequest,
    ) -> Result<StepOutput> {
        let attempt = request.attempt;
        let output = match agent.execute(request) {
            Ok(output) => output,
            Err(err) => {
                let failure = RunError::ToolFailure {
                    step_id: step.id.clone(),
                    message: format!("{err:#}"),
                };
                warn!(step_id = %step.id, attempt, error = %failure, "agent call failed");
                let failed = StepOutput::failed("");
                self.log_execution(scope, step, attempt, &request.task, &failed, Some(&failure))?;
                return Ok(failed);
            }
        };

        self.log_execution(scope, step, attempt, &request.task, &output, None)?;
        self.record_sources(scope, &request.goal, step, &output);
        Ok(output)
    }

    fn verify(
        &self,
        scope: StepScope<'_>,
        goal: &str,
        step: &PlanStep,
        attempt: u32,
        output: &str,
        tracker: &RetryTracker,
    ) -> Result<Verdict> {
        let previous = tracker
            .attempts()
            .iter()
            .map(|prev| PreviousAttempt {
                attempt: prev.number,
                output: sample_output(&prev.output, PREVIOUS_ATTEMPT_CHARS),
            })
            .collect();
        let request = VerifyRequest {
            run_id: scope.run_id.to_string(),
            goal: goal.to_string(),
            step_id: step.id.clone(),
            title: step.title.clone(),
            attempt,
            max_attempts: tracker.policy().max_attempts,
            output: tracker.sample(output),
            previous,
        };
        self.collaborators
            .judge()
            .judge(&request)
            .with_context(|| format!("judge {} attempt {attempt}", step.id))
    }

    fn log_execution(
        &self,
        scope: StepScope<'_>,
        step: &PlanStep,
        attempt: u32,
        input: &str,
        output: &StepOutput,
        failure: Option<&RunError>,
    ) -> Result<u64> {
        let mut fields = execution_fields(step, attempt, input, output);
        if let Some(failure) = failure {
            fields = fields.with("error", failure.to_string());
        } else if !output.success {
            let failure = RunError::ToolFailure {
                step_id: step.id.clone(),
                message: "agent reported failure".to_string(),
            };
            fields = fields.with("error", failure.to_string());
        }
        self.trace.append(scope.run_id, "tool_executed", fields)
    }

    fn log_verdict(
        &self,
        scope: StepScope<'_>,
        step: &PlanStep,
        tracker: &RetryTracker,
        decision: Decision,
    ) -> Result<u64> {
        let attempt = tracker.last().context("verdict without attempt")?;
        let decision = match decision {
            Decision::Accept => "accept".to_string(),
            Decision::Retry => "retry".to_string(),
            Decision::Stop(reason) => format!("stop:{}", reason.as_str()),
        };
        let mut fields = TraceFields::new()
            .with("step_id", &step.id)
            .with("attempt", attempt.number)
            .with("success", attempt.success)
            .with("quality", attempt.quality)
            .with("improved", attempt.improved)
            .with("decision", decision);
        match &attempt.verdict {
            Some(verdict) => {
                fields = fields
                    .with("is_done", verdict.is_done)
                    .with("confidence", verdict.confidence)
                    .with("missing", &verdict.missing)
                    .with("rationale", &verdict.rationale);
            }
            None => {
                fields = fields.with("is_done", false).with("judged", false);
            }
        }
        self.trace.append(scope.run_id, "plan_step_verdict", fields)
    }

    /// Record pages and URLs from an attempt. Failures here never fail the step.
    fn record_sources(&self, scope: StepScope<'_>, goal: &str, step: &PlanStep, output: &StepOutput) {
        let mut visits: Vec<SourceVisit> = output
            .pages
            .iter()
            .map(|page| page_visit(page, step))
            .collect();
        if output.success {
            for url in extract_urls(&output.output) {
                if !visits.iter().any(|visit| visit.url == url) {
                    visits.push(SourceVisit {
                        url,
                        step_id: Some(step.id.clone()),
                        agent: Some(step.agent_kind.clone()),
                        ..SourceVisit::default()
                    });
                }
            }
        }

        for visit in visits {
            let enrichment = self.enrich_visit(scope, goal, step, &visit);
            match self.sources.record(scope.run_id, &visit, enrichment.as_ref()) {
                Ok(Some(source)) => {
                    let appended = self.trace.append(
                        scope.run_id,
                        "source_recorded",
                        TraceFields::new()
                            .with("step_id", &step.id)
                            .with("url", &source.normalized_url)
                            .with("visits", source.visits)
                            .with("relevancy_score", source.relevancy_score),
                    );
                    if let Err(err) = appended {
                        warn!(err = %format!("{err:#}"), "failed to trace recorded source");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(url = %visit.url, err = %format!("{err:#}"), "failed to record source");
                }
            }
        }
    }

    fn enrich_visit(
        &self,
        scope: StepScope<'_>,
        goal: &str,
        step: &PlanStep,
        visit: &SourceVisit,
    ) -> Option<Enrichment> {
        if !self.enrich || visit.text.trim().is_empty() {
            return None;
        }
        let scorer = self.collaborators.scorer()?;
        let request = ScoreRequest {
            run_id: scope.run_id.to_string(),
            goal: goal.to_string(),
            step_id: step.id.clone(),
            url: visit.url.clone(),
            title: visit.title.clone(),
            text: visit.text.clone(),
        };
        match scorer.score(&request) {
            Ok(enrichment) => Some(enrichment),
            Err(err) => {
                warn!(url = %visit.url, err = %format!("{err:#}"), "source enrichment failed");
                None
            }
        }
    }
}

fn page_visit(page: &PageVisit, step: &PlanStep) -> SourceVisit {
    SourceVisit {
        url: page.url.clone(),
        title: page.title.clone(),
        text: page.text.clone(),
        score: page.score,
        step_id: Some(step.id.clone()),
        agent: Some(step.agent_kind.clone()),
        screenshot: page.screenshot.clone(),
    }
}

fn execution_fields(step: &PlanStep, attempt: u32, input: &str, output: &StepOutput) -> TraceFields {
    let pages: Vec<_> = output
        .pages
        .iter()
        .map(|page| json!({"url": page.url, "title": page.title}))
        .collect();
    let screenshots: Vec<&str> = output
        .pages
        .iter()
        .filter_map(|page| page.screenshot.as_deref())
        .collect();
    let page_text: Vec<_> = output
        .pages
        .iter()
        .map(|page| json!({"url": page.url, "text": page.text}))
        .collect();

    TraceFields::new()
        .with("step_id", &step.id)
        .with("step_idx", step.idx)
        .with("agent", &step.agent_kind)
        .with("attempt", attempt)
        .with("input", input)
        .with("output", &output.output)
        .with("success", output.success)
        .with("artifacts", &output.artifacts)
        .with("pages", pages)
        .detail(Detail::Screenshots, "screenshots", screenshots)
        .detail(Detail::PageText, "page_text", page_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::StepDraft;
    use crate::core::sources::MergeLimits;
    use crate::core::verify::StopReason;
    use crate::test_support::{ScriptedAgent, ScriptedJudge, StaticPlanner, accept, reject};

    const RUN: &str = "run-1";

    struct Fixture {
        _temp: tempfile::TempDir,
        trace: TraceSink,
        sources: SourceAggregator,
        output_dir: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let runs_dir = temp.path().join("runs");
            let sources = SourceAggregator::new(
                &runs_dir,
                MergeLimits {
                    max_quotes: 10,
                    max_screenshots: 10,
                },
            );
            sources.begin_run(RUN, false);
            Self {
                trace: TraceSink::new(&runs_dir),
                output_dir: runs_dir.join(RUN),
                sources,
                _temp: temp,
            }
        }

        fn run(&self, collaborators: &Collaborators, task: &TaskConfig, plan: &Plan) -> StepRun {
            let dispatcher = Dispatcher::new(
                collaborators,
                &self.trace,
                &self.sources,
                RetryPolicy::default(),
                false,
            );
            let scope = StepScope {
                run_id: RUN,
                output_dir: &self.output_dir,
                task,
            };
            dispatcher.run_step(scope, plan).expect("run step")
        }

        fn kinds(&self) -> Vec<String> {
            self.trace
                .read(RUN, 0, 500)
                .expect("read trace")
                .events
                .into_iter()
                .map(|event| event.event_kind)
                .collect()
        }
    }

    fn started_plan() -> Plan {
        let mut plan = Plan::new(
            "find cafes",
            vec![StepDraft::new("search listings", "web")],
        )
        .expect("plan");
        plan.start_current().expect("start");
        plan
    }

    fn collaborators(agent: ScriptedAgent, judge: ScriptedJudge) -> Collaborators {
        Collaborators::new(StaticPlanner::new(&[]), judge).with_agent("web", agent)
    }

    /// Verifies an accepted first attempt completes the step with the judge's rationale.
    #[test]
    fn accepted_attempt_completes_step() {
        let fixture = Fixture::new();
        let agent = ScriptedAgent::always("three cafes found");
        let judge = ScriptedJudge::accept_all().then(accept("covers the goal"));

        let run = fixture.run(
            &collaborators(agent.clone(), judge.clone()),
            &TaskConfig::default(),
            &started_plan(),
        );

        assert_eq!(run.status, StepStatus::Completed);
        assert_eq!(run.result.output, "three cafes found");
        assert_eq!(run.result.attempts, 1);
        assert_eq!(run.result.reason, "covers the goal");
        assert!(run.failure.is_none());
        assert_eq!(agent.calls().len(), 1);
        assert_eq!(fixture.kinds(), vec!["tool_executed", "plan_step_verdict"]);
    }

    /// Verifies a rejected attempt is retried with the judge's feedback.
    #[test]
    fn rejection_feeds_next_attempt() {
        let fixture = Fixture::new();
        let agent = ScriptedAgent::new()
            .then(StepOutput::ok("one cafe"))
            .then(StepOutput::ok("three cafes with addresses and opening hours"));
        let judge = ScriptedJudge::accept_all().then(reject(0.4, &["addresses"]));

        let run = fixture.run(
            &collaborators(agent.clone(), judge.clone()),
            &TaskConfig::default(),
            &started_plan(),
        );

        assert_eq!(run.status, StepStatus::Completed);
        assert_eq!(run.result.attempts, 2);
        let calls = agent.calls();
        assert!(calls[0].feedback.is_none());
        let feedback = calls[1].feedback.as_ref().expect("feedback");
        assert_eq!(feedback.attempt, 1);
        assert_eq!(feedback.missing, vec!["addresses"]);
        assert!(calls[1].task.contains("addresses"));
        assert_eq!(judge.calls()[1].previous.len(), 1);
    }

    /// Verifies tool failures skip the judge and count as attempts.
    #[test]
    fn tool_failure_skips_judge() {
        let fixture = Fixture::new();
        let agent = ScriptedAgent::new()
            .then(StepOutput::failed("browser crashed"))
            .then(StepOutput::ok("recovered"));
        let judge = ScriptedJudge::accept_all();

        let run = fixture.run(
            &collaborators(agent, judge.clone()),
            &TaskConfig::default(),
            &started_plan(),
        );

        assert_eq!(run.status, StepStatus::Completed);
        assert_eq!(run.result.attempts, 2);
        assert_eq!(judge.calls().len(), 1);
        let page = fixture.trace.read(RUN, 0, 100).expect("trace");
        let first = &page.events[0];
        assert_eq!(first.event_kind, "tool_executed");
        assert_eq!(first.fields["success"], false);
        assert!(first.fields["error"].as_str().expect("error").contains("tool failure"));
    }

    /// Verifies identical rejected outputs stop the step as not improving.
    #[test]
    fn stale_attempts_stop_early() {
        let fixture = Fixture::new();
        let agent = ScriptedAgent::always("same answer every time");
        let judge = ScriptedJudge::accept_all()
            .then(reject(0.3, &["details"]))
            .then(reject(0.3, &["details"]))
            .then(reject(0.3, &["details"]));

        let run = fixture.run(
            &collaborators(agent.clone(), judge),
            &TaskConfig::default(),
            &started_plan(),
        );

        assert_eq!(run.status, StepStatus::Failed);
        assert_eq!(run.result.attempts, 3);
        assert_eq!(agent.calls().len(), 3);
        assert!(matches!(
            run.failure,
            Some(RunError::VerificationExhausted { attempts: 3, .. })
        ));
        assert!(run.result.reason.contains(StopReason::NotImproving.as_str()));
    }

    /// Verifies a step whose agent kind is not allowed fails without calling anyone.
    #[test]
    fn disallowed_agent_fails_immediately() {
        let fixture = Fixture::new();
        let agent = ScriptedAgent::always("never");
        let judge = ScriptedJudge::accept_all();
        let task = TaskConfig {
            allowed_agents: Some(vec!["code".to_string()]),
            ..TaskConfig::default()
        };

        let run = fixture.run(&collaborators(agent.clone(), judge.clone()), &task, &started_plan());

        assert_eq!(run.status, StepStatus::Failed);
        assert_eq!(run.result.attempts, 1);
        assert!(matches!(run.failure, Some(RunError::ToolFailure { .. })));
        assert!(agent.calls().is_empty());
        assert!(judge.calls().is_empty());
        assert_eq!(fixture.kinds(), vec!["tool_executed"]);
    }

    /// Verifies an agent error is a failed attempt that gets retried.
    #[test]
    fn agent_error_is_retried() {
        let fixture = Fixture::new();
        let agent = ScriptedAgent::always("menu found").then_error("backend down");
        let judge = ScriptedJudge::accept_all();

        let run = fixture.run(
            &collaborators(agent.clone(), judge.clone()),
            &TaskConfig::default(),
            &started_plan(),
        );

        assert_eq!(run.status, StepStatus::Completed);
        assert_eq!(run.result.output, "menu found");
        assert_eq!(run.result.attempts, 2);
        assert_eq!(agent.calls().len(), 2);
        assert_eq!(judge.calls().len(), 1);
        let events = fixture.trace.read(RUN, 0, 500).expect("read trace").events;
        let first = events
            .iter()
            .find(|event| event.event_kind == "tool_executed")
            .expect("first execution");
        assert_eq!(first.fields["success"], false);
        let error = first.fields["error"].as_str().expect("error text");
        assert!(error.contains("tool failure: backend down"));
    }

    /// Verifies visited pages and URLs in the output land in the run's sources.
    #[test]
    fn pages_and_output_urls_become_sources() {
        let fixture = Fixture::new();
        let mut output = StepOutput::ok("see https://example.com/menu?ref=1 for prices");
        output.pages.push(PageVisit {
            url: "https://Example.com/cafes#top".to_string(),
            title: "Cafes".to_string(),
            text: "list of cafes".to_string(),
            ..PageVisit::default()
        });
        let agent = ScriptedAgent::new().then(output);

        fixture.run(
            &collaborators(agent, ScriptedJudge::accept_all()),
            &TaskConfig::default(),
            &started_plan(),
        );

        let view = fixture.sources.snapshot(RUN).expect("snapshot");
        let mut urls: Vec<&str> = view
            .sources
            .iter()
            .map(|source| source.normalized_url.as_str())
            .collect();
        urls.sort_unstable();
        assert_eq!(urls, vec!["https://example.com/cafes", "https://example.com/menu"]);
        assert_eq!(
            fixture
                .kinds()
                .iter()
                .filter(|kind| *kind == "source_recorded")
                .count(),
            2
        );
    }
}
