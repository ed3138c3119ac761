// End-to-end orchestrator flows against stub agents and a stub source host:
// event sequencing per pipeline, skip rules, failure transitions, recursion
// suppression, and the terminal notification calls.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use hackademia_core::agent::{
    AnalyzeAgent, BuildAgent, BuildStageOutput, FixAgent, ProgressReporter, TestAgent,
};
use hackademia_core::bus::{EventBus, ALL_PIPELINES};
use hackademia_core::config::Config;
use hackademia_core::github::{CommitInfo, FileBlob, HostError, SourceHost, WriteOutcome};
use hackademia_core::pipeline::{Agents, Orchestrator};
use hackademia_core::types::{
    AnalysisResult, BuildMetadata, BuildResult, ChangedFile, Event, EventKind, FixStageResult,
    Issue, PipelineStage, PrInfo, ProjectKind, Severity, TestStageResult, TriggerInfo,
};

// ── Stub source host ─────────────────────────────────────────────────────

#[derive(Default)]
struct StubHost {
    comments: Mutex<Vec<String>>,
    head_commit_message: String,
}

#[async_trait]
impl SourceHost for StubHost {
    async fn pull_request(&self, _repo: &str, pr: u64) -> Result<PrInfo, HostError> {
        Ok(PrInfo {
            number: pr,
            title: "Add feature".into(),
            body: String::new(),
            base_branch: "main".into(),
            head_branch: "feat".into(),
            author: "alice".into(),
        })
    }

    async fn changed_files(&self, _repo: &str, _pr: u64) -> Result<Vec<ChangedFile>, HostError> {
        Ok(Vec::new())
    }

    async fn read_file(
        &self,
        _repo: &str,
        path: &str,
        _reference: &str,
    ) -> Result<FileBlob, HostError> {
        Err(HostError::NotFound(path.to_string()))
    }

    async fn write_file(
        &self,
        _repo: &str,
        _path: &str,
        _content: &str,
        _message: &str,
        _branch: &str,
        _prior_blob_id: &str,
    ) -> Result<WriteOutcome, HostError> {
        Ok(WriteOutcome {
            commit_sha: "deadbeef".into(),
            blob_sha: "cafe".into(),
        })
    }

    async fn post_comment(&self, _repo: &str, _pr: u64, markdown: &str) -> Result<(), HostError> {
        self.comments.lock().await.push(markdown.to_string());
        Ok(())
    }

    async fn recent_commits(
        &self,
        _repo: &str,
        _reference: &str,
        _limit: u32,
    ) -> Result<Vec<CommitInfo>, HostError> {
        Ok(vec![CommitInfo {
            sha: "abc".into(),
            message: self.head_commit_message.clone(),
            author_name: "bot".into(),
            author_email: "bot@example.com".into(),
        }])
    }
}

// ── Stub agents ──────────────────────────────────────────────────────────

struct StubBuild {
    success: bool,
    /// When set, the build blocks until the test releases it.
    gate: Option<Arc<tokio::sync::Notify>>,
}

impl StubBuild {
    fn ok() -> Self {
        Self { success: true, gate: None }
    }
}

#[async_trait]
impl BuildAgent for StubBuild {
    async fn run(
        &self,
        repo: &str,
        branch: &str,
        pr: u64,
        progress: &ProgressReporter,
    ) -> Result<BuildStageOutput> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        progress.update("cloning", 20).await;
        progress.update("analyzing", 85).await;
        let host = StubHost::default();
        let pr_info = host.pull_request(repo, pr).await.unwrap();
        Ok(BuildStageOutput {
            build: BuildResult {
                success: self.success,
                project_type: ProjectKind::Python,
                dependencies: Vec::new(),
                file_info: HashMap::new(),
                metadata: BuildMetadata::default(),
                errors: if self.success { Vec::new() } else { vec!["clone failed".into()] },
                warnings: Vec::new(),
                build_logs: Vec::new(),
                workspace_dir: None,
                duration: 0.01,
            },
            diff: hackademia_core::types::PrDiff {
                pr_info,
                changed_files: Vec::new(),
                total_additions: 0,
                total_deletions: 0,
            },
        })
    }
}

struct StubAnalyze {
    issues: usize,
}

#[async_trait]
impl AnalyzeAgent for StubAnalyze {
    async fn run(
        &self,
        _diff: &hackademia_core::types::PrDiff,
        _build: &BuildResult,
        progress: &ProgressReporter,
    ) -> Result<AnalysisResult> {
        progress.update("scanning", 15).await;
        progress.update("classifying", 60).await;
        let issue = |n: u32| Issue {
            issue_type: "SQL_INJECTION".into(),
            severity: Severity::High,
            filename: "auth.py".into(),
            line_number: n,
            description: "bad".into(),
            recommendation: None,
            code_snippet: None,
            confidence: 90,
        };
        Ok(AnalysisResult {
            success: true,
            vulnerabilities: (0..self.issues as u32).map(issue).collect(),
            security_issues: Vec::new(),
            quality_issues: Vec::new(),
            recommendations: Vec::new(),
            overall_risk: if self.issues > 0 { Severity::High } else { Severity::Low },
            files_analyzed: 1,
            total_issues: self.issues,
            errors: Vec::new(),
            duration: 0.01,
        })
    }
}

struct StubFix;

#[async_trait]
impl FixAgent for StubFix {
    async fn run(
        &self,
        _analysis: &AnalysisResult,
        _repo: &str,
        _branch: &str,
        progress: &ProgressReporter,
    ) -> Result<FixStageResult> {
        progress.update("fixing", 40).await;
        Ok(FixStageResult::empty(0.01))
    }
}

struct StubTest;

#[async_trait]
impl TestAgent for StubTest {
    async fn run(
        &self,
        _diff: &hackademia_core::types::PrDiff,
        _fix: &FixStageResult,
        _repo: &str,
        _branch: &str,
        progress: &ProgressReporter,
    ) -> Result<TestStageResult> {
        progress.emit(Event::new(EventKind::TestStart).with_message("starting")).await;
        progress.update("discovering", 10).await;
        Ok(TestStageResult::skipped(0.01))
    }
}

struct PanickingAnalyze;

#[async_trait]
impl AnalyzeAgent for PanickingAnalyze {
    async fn run(
        &self,
        _diff: &hackademia_core::types::PrDiff,
        _build: &BuildResult,
        _progress: &ProgressReporter,
    ) -> Result<AnalysisResult> {
        panic!("analysis exploded");
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

fn test_config() -> Config {
    // Empty webhook URL keeps the results sender inert.
    Config {
        github_token: String::new(),
        gemini_api_key: String::new(),
        gemini_model: "gemini-2.5-flash".into(),
        code_model_url: "http://localhost:1234/v1".into(),
        code_model: "coderm".into(),
        results_webhook_url: String::new(),
        bind: "127.0.0.1".into(),
        port: 0,
        command_timeout_s: 300,
        test_timeout_s: 30,
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    host: Arc<StubHost>,
    bus: Arc<EventBus>,
}

fn harness(build_ok: bool, issues: usize, analyze: Option<Arc<dyn AnalyzeAgent>>) -> Harness {
    let bus = EventBus::new();
    let host = Arc::new(StubHost::default());
    let agents = Agents {
        build: Arc::new(StubBuild { success: build_ok, gate: None }),
        analyze: analyze.unwrap_or_else(|| Arc::new(StubAnalyze { issues })),
        fix: Arc::new(StubFix),
        test: Arc::new(StubTest),
    };
    let orchestrator = Orchestrator::new(
        Arc::clone(&bus),
        host.clone() as Arc<dyn SourceHost>,
        agents,
        &test_config(),
    );
    Harness {
        orchestrator,
        host,
        bus,
    }
}

/// Collect every event for one pipeline off the `all_pipelines` sentinel
/// until `pipeline_results_complete` arrives.
async fn run_and_collect(h: &Harness) -> (String, Vec<Event>) {
    let (_handle, mut rx) = h.bus.subscribe(ALL_PIPELINES).await;
    let id = h
        .orchestrator
        .start_pipeline(7, "o/r", TriggerInfo::manual("test"))
        .await
        .unwrap();

    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for pipeline events")
            .expect("bus closed");
        if event.pipeline_id.as_deref() != Some(id.as_str()) {
            continue;
        }
        let done = event.kind == EventKind::PipelineResultsComplete;
        events.push(event);
        if done {
            break;
        }
    }
    (id, events)
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn stage_events(events: &[Event], kind: EventKind) -> Vec<&Event> {
    events.iter().filter(|e| e.kind == kind).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_pipeline_with_issues_runs_all_four_stages() {
    let h = harness(true, 2, None);
    let (id, events) = run_and_collect(&h).await;

    assert!(id.starts_with("o/r_7_"));
    assert_eq!(events[0].kind, EventKind::PipelineStart);

    let starts = stage_events(&events, EventKind::StageStart);
    let stages: Vec<_> = starts.iter().map(|e| e.stage.unwrap()).collect();
    assert_eq!(
        stages,
        vec![
            PipelineStage::Build,
            PipelineStage::Analyze,
            PipelineStage::Fix,
            PipelineStage::Test
        ]
    );

    let completes = stage_events(&events, EventKind::StageComplete);
    assert_eq!(completes.len(), 4);

    // pipeline_complete precedes pipeline_results_complete.
    let ks = kinds(&events);
    let complete_pos = ks.iter().position(|k| *k == EventKind::PipelineComplete).unwrap();
    let results_pos = ks.iter().position(|k| *k == EventKind::PipelineResultsComplete).unwrap();
    assert!(complete_pos < results_pos);
    assert_eq!(results_pos, events.len() - 1);

    let complete = &events[complete_pos];
    assert_eq!(complete.status.as_deref(), Some("complete"));

    // The PR comment went out exactly once.
    let comments = h.host.comments.lock().await;
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("Hackademia AI Pipeline Results"));
}

#[tokio::test]
async fn per_stage_progress_is_monotone_while_non_null() {
    let h = harness(true, 1, None);
    let (_id, events) = run_and_collect(&h).await;

    let mut last_by_stage: HashMap<&str, u8> = HashMap::new();
    for event in &events {
        if event.kind != EventKind::StatusUpdate {
            continue;
        }
        let Some(Some(pct)) = event.progress else { continue };
        let stage = event.stage.map(|s| s.as_str()).unwrap_or("");
        let last = last_by_stage.entry(stage).or_insert(0);
        assert!(pct >= *last, "progress regressed in stage {stage}: {pct} < {last}");
        *last = pct;
    }
}

#[tokio::test]
async fn zero_issue_analysis_skips_fix_stage() {
    let h = harness(true, 0, None);
    let (_id, events) = run_and_collect(&h).await;

    let starts = stage_events(&events, EventKind::StageStart);
    let stages: Vec<_> = starts.iter().map(|e| e.stage.unwrap()).collect();
    assert!(!stages.contains(&PipelineStage::Fix));
    assert!(stages.contains(&PipelineStage::Test));

    let complete = stage_events(&events, EventKind::PipelineComplete)[0];
    let summary = &complete.details.as_ref().unwrap()["summary"];
    assert_eq!(summary["fix"]["status"], "skipped");
    assert_eq!(complete.status.as_deref(), Some("complete"));
}

#[tokio::test]
async fn build_failure_skips_remaining_stages_and_fails_pipeline() {
    let h = harness(false, 0, None);
    let (_id, events) = run_and_collect(&h).await;

    let starts = stage_events(&events, EventKind::StageStart);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].stage, Some(PipelineStage::Build));

    let completes = stage_events(&events, EventKind::StageComplete);
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].status.as_deref(), Some("failed"));

    let complete = stage_events(&events, EventKind::PipelineComplete)[0];
    assert_eq!(complete.status.as_deref(), Some("failed"));

    // Failed pipelines still notify the PR.
    assert_eq!(h.host.comments.lock().await.len(), 1);
}

#[tokio::test]
async fn agent_panic_becomes_failed_pipeline_with_error_event() {
    let h = harness(true, 0, Some(Arc::new(PanickingAnalyze)));
    let (_id, events) = run_and_collect(&h).await;

    let errors = stage_events(&events, EventKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.as_deref().unwrap().contains("analysis exploded"));

    let ks = kinds(&events);
    let error_pos = ks.iter().position(|k| *k == EventKind::Error).unwrap();
    let complete_pos = ks.iter().position(|k| *k == EventKind::PipelineComplete).unwrap();
    assert!(error_pos < complete_pos);

    let complete = stage_events(&events, EventKind::PipelineComplete)[0];
    assert_eq!(complete.status.as_deref(), Some("failed"));
}

#[tokio::test]
async fn skipped_test_stage_reports_skipped_status() {
    let h = harness(true, 0, None);
    let (_id, events) = run_and_collect(&h).await;

    let test_complete = stage_events(&events, EventKind::StageComplete)
        .into_iter()
        .find(|e| e.stage == Some(PipelineStage::Test))
        .unwrap();
    assert_eq!(test_complete.status.as_deref(), Some("skipped"));
}

#[tokio::test]
async fn pipeline_is_removed_from_active_set_after_terminal_events() {
    let h = harness(true, 0, None);
    let (id, _events) = run_and_collect(&h).await;

    // Removal races the last event by a hair; give it a moment.
    for _ in 0..50 {
        if h.orchestrator.snapshot(&id).await.is_none() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("pipeline {id} still in the active set");
}

#[tokio::test]
async fn recursion_filter_suppresses_bot_head_commit() {
    let bus = EventBus::new();
    let host = Arc::new(StubHost {
        comments: Mutex::new(Vec::new()),
        head_commit_message: "🤖 AI Fix: X [skip-pipeline]".into(),
    });
    let orchestrator = Orchestrator::new(
        bus,
        host as Arc<dyn SourceHost>,
        Agents {
            build: Arc::new(StubBuild::ok()),
            analyze: Arc::new(StubAnalyze { issues: 0 }),
            fix: Arc::new(StubFix),
            test: Arc::new(StubTest),
        },
        &test_config(),
    );

    let suppressed = orchestrator.should_suppress("o/r", "abc").await;
    assert!(suppressed.is_some());
    // Re-delivery of the same payload stays suppressed.
    assert!(orchestrator.should_suppress("o/r", "abc").await.is_some());
}

#[tokio::test]
async fn human_head_commit_is_admitted() {
    let bus = EventBus::new();
    let host = Arc::new(StubHost {
        comments: Mutex::new(Vec::new()),
        head_commit_message: "fix: handle empty diff".into(),
    });
    let orchestrator = Orchestrator::new(
        bus,
        host as Arc<dyn SourceHost>,
        Agents {
            build: Arc::new(StubBuild::ok()),
            analyze: Arc::new(StubAnalyze { issues: 0 }),
            fix: Arc::new(StubFix),
            test: Arc::new(StubTest),
        },
        &test_config(),
    );
    assert!(orchestrator.should_suppress("o/r", "abc").await.is_none());
}

#[tokio::test]
async fn snapshot_exposes_stage_and_ids_while_active() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let bus = EventBus::new();
    let host = Arc::new(StubHost::default());
    let orchestrator = Orchestrator::new(
        Arc::clone(&bus),
        host as Arc<dyn SourceHost>,
        Agents {
            build: Arc::new(StubBuild { success: true, gate: Some(Arc::clone(&gate)) }),
            analyze: Arc::new(StubAnalyze { issues: 0 }),
            fix: Arc::new(StubFix),
            test: Arc::new(StubTest),
        },
        &test_config(),
    );

    let (_handle, mut rx) = bus.subscribe(ALL_PIPELINES).await;
    let id = orchestrator
        .start_pipeline(9, "o/r", TriggerInfo::manual("test"))
        .await
        .unwrap();

    // The build agent is parked on the gate, so the pipeline is guaranteed
    // to still be in the active set.
    let snapshot = orchestrator.snapshot(&id).await.unwrap();
    assert_eq!(snapshot["pipeline_id"], id.as_str());
    assert_eq!(snapshot["pr_number"], 9);
    assert_eq!(snapshot["repo_name"], "o/r");
    assert!(snapshot["duration"].as_f64().unwrap() >= 0.0);

    gate.notify_one();
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if event.pipeline_id.as_deref() == Some(id.as_str())
            && event.kind == EventKind::PipelineResultsComplete
        {
            break;
        }
    }
}
