//! End-to-end runs driven through `Coordinator::run_once` with scripted
//! collaborators.

use std::fs;
use std::path::Path;

use agentrun::agents::{Collaborators, StepOutput};
use agentrun::coordinator::Coordinator;
use agentrun::core::plan::Plan;
use agentrun::core::types::{StepStatus, TaskStatus};
use agentrun::error::RunError;
use agentrun::io::artifacts::RunPaths;
use agentrun::io::config::RunnerConfig;
use agentrun::io::trace::TraceEvent;
use agentrun::queue::{TaskConfig, TaskPatch};
use agentrun::test_support::{
    FailingPlanner, ScriptedAgent, ScriptedJudge, StaticPlanner, test_config,
};

fn coordinator(config: RunnerConfig, planner: StaticPlanner, agent: ScriptedAgent) -> Coordinator {
    let collaborators =
        Collaborators::new(planner, ScriptedJudge::accept_all()).with_agent("web", agent);
    Coordinator::new(config, collaborators).expect("coordinator")
}

fn events(coordinator: &Coordinator, run_id: &str) -> Vec<TraceEvent> {
    coordinator
        .handle()
        .activity(Some(run_id), 0, 1000)
        .expect("activity")
        .events
}

fn count(events: &[TraceEvent], kind: &str) -> usize {
    events.iter().filter(|event| event.event_kind == kind).count()
}

fn tool_results(events: &[TraceEvent]) -> Vec<bool> {
    events
        .iter()
        .filter(|event| event.event_kind == "tool_executed")
        .map(|event| event.fields["success"].as_bool().expect("success flag"))
        .collect()
}

fn saved_plan(runs_dir: &Path, run_id: &str) -> Plan {
    let paths = RunPaths::new(runs_dir, run_id);
    serde_json::from_str(&fs::read_to_string(paths.plan_json_path).expect("read plan"))
        .expect("parse plan")
}

/// Verifies a three-step plan runs every step once and finishes `done`.
#[test]
fn three_step_run_reaches_done() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let runs_dir = config.runs_dir.clone();
    let planner = StaticPlanner::new(&[
        ("search cafe listings", "web"),
        ("check opening hours", "web"),
        ("summarize the best three", "web"),
    ]);
    let agent = ScriptedAgent::always("Cafe A, Cafe B, Cafe C");
    let coordinator = coordinator(config, planner, agent.clone());
    let handle = coordinator.handle();

    let uid = handle.submit("best cafes near the station", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    assert_eq!(report.uid, uid);
    assert_eq!(report.status, TaskStatus::Done);
    assert_eq!(agent.calls().len(), 3);

    let events = events(&coordinator, &report.run_id);
    assert_eq!(tool_results(&events), vec![true, true, true]);
    assert_eq!(events.first().expect("first").event_kind, "run_started");
    assert_eq!(events.last().expect("last").event_kind, "run_finished");
    let ids: Vec<u64> = events.iter().map(|event| event.id).collect();
    assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());

    let result = handle.result(&uid).expect("result");
    assert_eq!(result.status, TaskStatus::Done);
    assert_eq!(result.answer.as_deref(), Some("Cafe A, Cafe B, Cafe C"));
    assert_eq!(result.agent_name.as_deref(), Some("web"));
    assert_eq!(result.run_id.as_deref(), Some(report.run_id.as_str()));

    let plan = saved_plan(&runs_dir, &report.run_id);
    assert!(
        plan.steps()
            .iter()
            .all(|step| step.status == StepStatus::Completed)
    );
    let answer = fs::read_to_string(RunPaths::new(&runs_dir, &report.run_id).answer_path)
        .expect("answer file");
    assert!(answer.contains("Cafe A"));

    let status = handle.status();
    assert!(!status.is_generating);
    assert_eq!(status.current_status, "done");
    assert_eq!(status.queue_length, 0);
}

/// Verifies later steps receive earlier results as context.
#[test]
fn later_steps_see_prior_results() {
    let temp = tempfile::tempdir().expect("tempdir");
    let planner = StaticPlanner::new(&[("collect", "web"), ("summarize", "web")]);
    let agent = ScriptedAgent::new()
        .then(StepOutput::ok("raw findings: espresso bar"))
        .then(StepOutput::ok("summary"));
    let coordinator = coordinator(test_config(temp.path()), planner, agent.clone());

    coordinator.handle().submit("goal", TaskConfig::default());
    coordinator.run_once().expect("run").expect("report");

    let calls = agent.calls();
    assert!(calls[0].prior_results.is_empty());
    assert_eq!(calls[1].prior_results.len(), 1);
    assert_eq!(calls[1].prior_results[0].output, "raw findings: espresso bar");
    assert!(calls[1].task.contains("espresso bar"));
}

/// Verifies two tool failures followed by a success still finish the step.
#[test]
fn tool_failures_then_success_finishes_done() {
    let temp = tempfile::tempdir().expect("tempdir");
    let planner = StaticPlanner::new(&[("fetch menu", "web")]);
    let agent = ScriptedAgent::new()
        .then(StepOutput::failed("timeout"))
        .then(StepOutput::failed("timeout"))
        .then(StepOutput::ok("menu with prices"));
    let coordinator = coordinator(test_config(temp.path()), planner, agent);

    coordinator.handle().submit("get the menu", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    assert_eq!(report.status, TaskStatus::Done);
    let events = events(&coordinator, &report.run_id);
    assert_eq!(tool_results(&events), vec![false, false, true]);
    assert_eq!(count(&events, "plan_step_verdict"), 3);
}

/// Verifies tasks run in submission order and only queued tasks are editable.
#[test]
fn queue_is_fifo_and_guards_edits() {
    let temp = tempfile::tempdir().expect("tempdir");
    let planner = StaticPlanner::new(&[("only", "web")]);
    let coordinator = coordinator(
        test_config(temp.path()),
        planner,
        ScriptedAgent::always("ok"),
    );
    let handle = coordinator.handle();

    let first = handle.submit("first", TaskConfig::default());
    let second = handle.submit("second", TaskConfig::default());
    let third = handle.submit("third", TaskConfig::default());
    assert_ne!(first, second);
    assert_ne!(second, third);
    assert_eq!(handle.status().queue_length, 3);

    handle
        .update(
            &second,
            TaskPatch {
                query: Some("second, edited".to_string()),
                config: None,
            },
        )
        .expect("update queued");
    handle.delete(&third).expect("delete queued");
    let queued: Vec<String> = handle.queued().into_iter().map(|task| task.uid).collect();
    assert_eq!(queued, vec![first.clone(), second.clone()]);

    let report = coordinator.run_once().expect("run").expect("report");
    assert_eq!(report.uid, first);
    let err = handle
        .update(
            &first,
            TaskPatch {
                query: Some("too late".to_string()),
                config: None,
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::InvalidState {
            status: TaskStatus::Done,
            ..
        }
    ));
    assert!(matches!(handle.delete(&first), Err(RunError::InvalidState { .. })));

    let report = coordinator.run_once().expect("run").expect("report");
    assert_eq!(report.uid, second);
    assert_eq!(handle.task(&second).expect("task").query, "second, edited");
    assert!(coordinator.run_once().expect("idle").is_none());
    assert!(matches!(handle.result(&third), Err(RunError::TaskNotFound(_))));
}

/// Verifies amendments are rejected while nothing is running.
#[test]
fn amend_without_run_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(
        test_config(temp.path()),
        StaticPlanner::new(&[("only", "web")]),
        ScriptedAgent::always("ok"),
    );
    let handle = coordinator.handle();
    assert_eq!(handle.amend("also check prices"), Err(RunError::NoActiveRun));

    handle.submit("goal", TaskConfig::default());
    coordinator.run_once().expect("run").expect("report");
    assert_eq!(handle.amend("too late"), Err(RunError::NoActiveRun));
}

/// Verifies a failed step triggers a replan that keeps completed work.
#[test]
fn replan_keeps_completed_results() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let runs_dir = config.runs_dir.clone();
    let planner = StaticPlanner::new(&[("collect listings", "web"), ("scrape reviews", "web")])
        .with_replan(&[("read reviews from a cached page", "web")]);
    let agent = ScriptedAgent::new()
        .then(StepOutput::ok("listings: Cafe A"))
        .then(StepOutput::failed("blocked"))
        .then(StepOutput::failed("blocked"))
        .then(StepOutput::failed("blocked"))
        .then(StepOutput::ok("reviews: 4.5 stars"));
    let coordinator = coordinator(config, planner.clone(), agent);

    coordinator.handle().submit("rate cafes", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    assert_eq!(report.status, TaskStatus::Done);
    let calls = planner.replan_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].failed.id, "step-2");
    assert_eq!(calls[0].completed.len(), 1);
    assert_eq!(calls[0].completed[0].output, "listings: Cafe A");
    assert!(calls[0].remaining.is_empty());

    let plan = saved_plan(&runs_dir, &report.run_id);
    let statuses: Vec<StepStatus> = plan.steps().iter().map(|step| step.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Completed]
    );
    let first = plan.steps()[0].result.as_ref().expect("kept result");
    assert_eq!(first.output, "listings: Cafe A");
    assert_eq!(count(&events(&coordinator, &report.run_id), "plan_replanned"), 1);
}

/// Verifies a failed step with no replans left fails the task.
#[test]
fn exhausted_step_without_replan_fails_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.max_replans = 0;
    let agent = ScriptedAgent::always("");
    let agent = agent
        .then(StepOutput::failed("down"))
        .then(StepOutput::failed("down"))
        .then(StepOutput::failed("down"));
    let coordinator = coordinator(
        config,
        StaticPlanner::new(&[("search", "web"), ("summarize", "web")]),
        agent.clone(),
    );
    let handle = coordinator.handle();

    let uid = handle.submit("goal", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(agent.calls().len(), 3);
    let result = handle.result(&uid).expect("result");
    assert!(
        result
            .error
            .as_deref()
            .expect("error")
            .contains("not_improving")
    );
    let events = events(&coordinator, &report.run_id);
    assert_eq!(events.last().expect("last").event_kind, "run_failed");
}

/// Verifies a run-level failure fails only its task; the next task still runs.
#[test]
fn fatal_run_does_not_stop_the_queue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let judge = ScriptedJudge::accept_all().then_error("judge process crashed");
    let collaborators = Collaborators::new(StaticPlanner::new(&[("only", "web")]), judge)
        .with_agent("web", ScriptedAgent::always("fine"));
    let coordinator =
        Coordinator::new(test_config(temp.path()), collaborators).expect("coordinator");
    let handle = coordinator.handle();

    let broken = handle.submit("first", TaskConfig::default());
    let healthy = handle.submit("second", TaskConfig::default());

    let first = coordinator.run_once().expect("run").expect("report");
    assert_eq!(first.uid, broken);
    assert_eq!(first.status, TaskStatus::Failed);
    let error = handle.result(&broken).expect("result").error.expect("error");
    assert!(error.contains("judge process crashed"));
    assert_eq!(count(&events(&coordinator, &first.run_id), "run_failed"), 1);

    let second = coordinator.run_once().expect("run").expect("report");
    assert_eq!(second.uid, healthy);
    assert_eq!(second.status, TaskStatus::Done);
}

/// Verifies an agent error is retried instead of failing the run.
#[test]
fn agent_error_is_retried_within_the_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = ScriptedAgent::always("menu with prices").then_error("agent process crashed");
    let coordinator = coordinator(
        test_config(temp.path()),
        StaticPlanner::new(&[("fetch menu", "web")]),
        agent.clone(),
    );

    coordinator.handle().submit("get the menu", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    assert_eq!(report.status, TaskStatus::Done);
    assert_eq!(agent.calls().len(), 2);
    let events = events(&coordinator, &report.run_id);
    assert_eq!(tool_results(&events), vec![false, true]);
    assert_eq!(count(&events, "run_failed"), 0);
}

/// Verifies a planner failure is reported as a failed task.
#[test]
fn planner_failure_fails_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let collaborators = Collaborators::new(FailingPlanner, ScriptedJudge::accept_all())
        .with_agent("web", ScriptedAgent::always("ok"));
    let coordinator = Coordinator::new(test_config(temp.path()), collaborators).expect("coordinator");
    let handle = coordinator.handle();

    let uid = handle.submit("goal", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    assert_eq!(report.status, TaskStatus::Failed);
    let error = handle.result(&uid).expect("result").error.expect("error");
    assert!(error.contains("planner backend unavailable"));
    assert_eq!(handle.status().current_status, "failed");
}

/// Verifies trace reads page through events with a cursor.
#[test]
fn activity_pages_with_cursor() {
    let temp = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(
        test_config(temp.path()),
        StaticPlanner::new(&[("one", "web"), ("two", "web")]),
        ScriptedAgent::always("ok"),
    );
    let handle = coordinator.handle();
    handle.submit("goal", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    let first = handle
        .activity(Some(report.run_id.as_str()), 0, 2)
        .expect("first page");
    let ids: Vec<u64> = first.events.iter().map(|event| event.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(first.next_since_id, 2);
    assert!(first.latest_id > 2);

    let rest = handle
        .activity(Some(report.run_id.as_str()), first.next_since_id, 1000)
        .expect("rest");
    assert_eq!(rest.events.first().expect("next").id, 3);
    assert_eq!(rest.next_since_id, first.latest_id);

    let empty = handle
        .activity(Some(report.run_id.as_str()), rest.next_since_id, 10)
        .expect("empty");
    assert!(empty.events.is_empty());
    assert_eq!(empty.next_since_id, rest.next_since_id);

    // With no explicit run id the current run is used.
    let current = handle.activity(None, 0, 1).expect("current");
    assert_eq!(current.events[0].id, 1);
}

/// Verifies a pause requested while idle holds back the queue until resume.
#[test]
fn pause_while_idle_defers_next_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(
        test_config(temp.path()),
        StaticPlanner::new(&[("only", "web")]),
        ScriptedAgent::always("ok"),
    );
    let handle = coordinator.handle();

    handle.pause();
    handle.submit("goal", TaskConfig::default());
    assert!(coordinator.run_once().expect("paused").is_none());
    let status = handle.status();
    assert!(status.paused);
    assert_eq!(status.queue_length, 1);

    handle.resume();
    let report = coordinator.run_once().expect("run").expect("report");
    assert_eq!(report.status, TaskStatus::Done);
}

/// Verifies sources from step pages are aggregated and persisted per run.
#[test]
fn sources_are_aggregated_per_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let runs_dir = config.runs_dir.clone();
    let coordinator = coordinator(
        config,
        StaticPlanner::new(&[("one", "web"), ("two", "web")]),
        ScriptedAgent::always("see https://cafes.example/list?page=2 and https://cafes.example/list#map"),
    );
    let handle = coordinator.handle();
    handle.submit("goal", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    let view = handle.sources(Some(report.run_id.as_str())).expect("sources");
    assert_eq!(view.sources.len(), 1);
    let source = &view.sources[0];
    assert_eq!(source.normalized_url, "https://cafes.example/list");
    assert_eq!(source.seen_in_steps, vec!["step-1", "step-2"]);
    assert!(RunPaths::new(&runs_dir, &report.run_id).sources_json_path.exists());
}

/// Verifies earlier runs stay browsable after later runs finish.
#[test]
fn finished_runs_stay_browsable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(
        test_config(temp.path()),
        StaticPlanner::new(&[("only", "web")]),
        ScriptedAgent::always("found https://cafes.example/a"),
    );
    let handle = coordinator.handle();
    handle.submit("first", TaskConfig::default());
    handle.submit("second", TaskConfig::default());
    let first = coordinator.run_once().expect("run").expect("report");
    let second = coordinator.run_once().expect("run").expect("report");

    let runs = handle.runs(10).expect("runs");
    let mut ids: Vec<&str> = runs.iter().map(|run| run.run_id.as_str()).collect();
    ids.sort_unstable();
    let mut expected = vec![first.run_id.as_str(), second.run_id.as_str()];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    let page = handle
        .activity(Some(first.run_id.as_str()), 0, 1000)
        .expect("activity");
    assert_eq!(page.events.last().expect("last").event_kind, "run_finished");
    let sources = handle.sources(Some(first.run_id.as_str())).expect("sources");
    assert_eq!(sources.sources.len(), 1);

    let files = handle
        .run_files(&first.run_id)
        .expect("files")
        .expect("run exists");
    let names: Vec<&str> = files.iter().map(|file| file.name.as_str()).collect();
    assert!(names.contains(&"trace.jsonl"));
    assert!(names.contains(&"answer.md"));
    let answer = handle
        .run_file_text(&first.run_id, "answer.md", 10_000)
        .expect("read")
        .expect("answer present");
    assert!(answer.content.contains("https://cafes.example/a"));
    assert!(handle.run_files("run-unknown").expect("files").is_none());
}

/// Verifies an exported source list can be imported into another run.
#[test]
fn sources_import_into_finished_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(
        test_config(temp.path()),
        StaticPlanner::new(&[("only", "web")]),
        ScriptedAgent::always("found https://cafes.example/a"),
    );
    let handle = coordinator.handle();
    handle.submit("goal", TaskConfig::default());
    let report = coordinator.run_once().expect("run").expect("report");

    let mut export = handle.sources(Some(report.run_id.as_str())).expect("sources");
    let mut extra = export.sources[0].clone();
    extra.normalized_url = "https://cafes.example/b".to_string();
    extra.url = "https://cafes.example/b".to_string();
    export.sources.push(extra);

    let summary = handle
        .import_sources(&report.run_id, &export)
        .expect("import");
    assert_eq!(summary.added, 1);
    assert_eq!(summary.total, 2);
    let view = handle.sources(Some(report.run_id.as_str())).expect("sources");
    let merged = view
        .sources
        .iter()
        .find(|source| source.normalized_url == "https://cafes.example/a")
        .expect("merged");
    assert_eq!(merged.visits, 2);
}
