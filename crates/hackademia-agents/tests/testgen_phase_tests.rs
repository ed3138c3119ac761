// Test-agent phase behavior with a stub host and canned collaborators:
// function discovery against changed lines, bounds validation, question
// matching, and the per-function generation event stream.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use hackademia_agents::llm::ChatModel;
use hackademia_agents::testgen::LlmTestAgent;
use hackademia_core::agent::{ProgressReporter, TestAgent};
use hackademia_core::bus::EventBus;
use hackademia_core::github::{CommitInfo, FileBlob, HostError, SourceHost, WriteOutcome};
use hackademia_core::types::{
    ChangedFile, DiffLine, Event, EventKind, FileStatus, FixStageResult, PipelineStage, PrDiff,
    PrInfo,
};

// `f` spans lines 3-7 and `g` spans lines 10-20 of a 20-line file.
const PY_SOURCE: &str = "# helpers\n\
\n\
def f(a, b):\n\
    x = a + b\n\
    y = x * 2\n\
    z = y - 1\n\
    return z\n\
\n\
\n\
def g(n):\n\
    total = 0\n\
    for i in range(n):\n\
        total += i\n\
    if n > 10:\n\
        total += 1\n\
    else:\n\
        total -= 1\n\
    while False:\n\
        pass\n\
    return total";

struct StubHost;

#[async_trait]
impl SourceHost for StubHost {
    async fn pull_request(&self, _repo: &str, pr: u64) -> Result<PrInfo, HostError> {
        Ok(PrInfo {
            number: pr,
            title: String::new(),
            body: String::new(),
            base_branch: "main".into(),
            head_branch: "feat".into(),
            author: "a".into(),
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
        if path.ends_with(".py") {
            Ok(FileBlob {
                content: PY_SOURCE.as_bytes().to_vec(),
                sha: "blob".into(),
            })
        } else {
            Err(HostError::NotFound(path.to_string()))
        }
    }

    async fn write_file(
        &self,
        _repo: &str,
        path: &str,
        _content: &str,
        _message: &str,
        _branch: &str,
        _prior_blob_id: &str,
    ) -> Result<WriteOutcome, HostError> {
        Err(HostError::NotFound(path.to_string()))
    }

    async fn post_comment(&self, _repo: &str, _pr: u64, _markdown: &str) -> Result<(), HostError> {
        Ok(())
    }

    async fn recent_commits(
        &self,
        _repo: &str,
        _reference: &str,
        _limit: u32,
    ) -> Result<Vec<CommitInfo>, HostError> {
        Ok(Vec::new())
    }
}

struct CannedModel {
    response: Result<String, String>,
}

impl CannedModel {
    fn ok(response: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { response: Ok(response.into()) })
    }

    fn err(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { response: Err(message.into()) })
    }
}

#[async_trait]
impl ChatModel for CannedModel {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(message) => Err(anyhow!("{message}")),
        }
    }
}

fn diff_with_changed_lines(lines: &[u32]) -> PrDiff {
    PrDiff {
        pr_info: PrInfo {
            number: 7,
            title: String::new(),
            body: String::new(),
            base_branch: "main".into(),
            head_branch: "feat".into(),
            author: "a".into(),
        },
        changed_files: vec![ChangedFile {
            filename: "u.py".into(),
            status: FileStatus::Modified,
            additions: lines.len() as u32,
            deletions: 0,
            patch: Some(String::new()),
            file_extension: "py".into(),
            is_binary: false,
            added_lines: lines
                .iter()
                .map(|n| DiffLine { line_number: *n, content: format!("line {n}") })
                .collect(),
            removed_lines: Vec::new(),
            context_lines: Vec::new(),
        }],
        total_additions: lines.len() as u32,
        total_deletions: 0,
    }
}

fn questions_json(entries: &[(&str, &str)]) -> String {
    let items: Vec<serde_json::Value> = entries
        .iter()
        .map(|(filename, function)| {
            serde_json::json!({
                "filename": filename,
                "function_name": function,
                "question": format!("What does {function} compute?"),
                "reasoning": "changed in this PR",
            })
        })
        .collect();
    serde_json::json!({ "function_questions": items }).to_string()
}

struct Run {
    result: hackademia_core::types::TestStageResult,
    events: Vec<Event>,
}

async fn run_agent(diff: &PrDiff, question_model: Arc<CannedModel>, code_model: Arc<CannedModel>) -> Run {
    let bus = EventBus::new();
    let (_h, mut rx) = bus.subscribe("p1").await;
    let progress = ProgressReporter::new(Arc::clone(&bus), "p1", PipelineStage::Test);
    let agent = LlmTestAgent::new(
        question_model,
        code_model,
        Arc::new(StubHost) as Arc<dyn SourceHost>,
        30,
    );
    let result = agent
        .run(diff, &FixStageResult::empty(0.0), "o/r", "feat", &progress)
        .await
        .unwrap();
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    Run { result, events }
}

#[tokio::test]
async fn changed_lines_in_both_functions_discover_both() {
    let diff = diff_with_changed_lines(&[5, 12]);
    let questions = CannedModel::ok(questions_json(&[("u.py", "f"), ("u.py", "g")]));
    let run = run_agent(&diff, questions, CannedModel::err("model offline")).await;

    assert_eq!(run.result.functions_discovered, 2);
    assert_eq!(run.result.questions_generated, 2);
    assert!(!run.result.skipped);
}

#[tokio::test]
async fn out_of_bounds_changed_lines_skip_the_file() {
    // Line 25 in a 20-line file: the diff and the content disagree.
    let diff = diff_with_changed_lines(&[25]);
    let questions = CannedModel::ok(questions_json(&[]));
    let run = run_agent(&diff, questions, CannedModel::err("unused")).await;

    assert_eq!(run.result.functions_discovered, 0);
    assert!(run.result.skipped);
    assert!(run.result.success);
}

#[tokio::test]
async fn changed_lines_outside_any_function_discover_nothing() {
    let diff = diff_with_changed_lines(&[1, 2]);
    let questions = CannedModel::ok(questions_json(&[]));
    let run = run_agent(&diff, questions, CannedModel::err("unused")).await;
    assert!(run.result.skipped);
}

#[tokio::test]
async fn unmatched_question_entries_are_dropped() {
    let diff = diff_with_changed_lines(&[5]);
    // One matching entry, one for a function that was never discovered.
    let questions = CannedModel::ok(questions_json(&[("u.py", "f"), ("u.py", "phantom")]));
    let run = run_agent(&diff, questions, CannedModel::err("model offline")).await;

    assert_eq!(run.result.functions_discovered, 1);
    assert_eq!(run.result.questions_generated, 1);
}

#[tokio::test]
async fn non_python_files_are_ignored() {
    let mut diff = diff_with_changed_lines(&[5]);
    diff.changed_files[0].filename = "style.css".into();
    diff.changed_files[0].file_extension = "css".into();
    let run = run_agent(&diff, CannedModel::ok("{}"), CannedModel::err("unused")).await;
    assert!(run.result.skipped);
}

#[tokio::test]
async fn generation_failure_emits_failed_events_and_keeps_stage_green() {
    let diff = diff_with_changed_lines(&[5, 12]);
    let questions = CannedModel::ok(questions_json(&[("u.py", "f"), ("u.py", "g")]));
    let run = run_agent(&diff, questions, CannedModel::err("model offline")).await;

    assert!(run.result.success);
    assert_eq!(run.result.tests_generated, 0);
    assert_eq!(run.result.tests_executed, 0);

    let kinds: Vec<EventKind> = run.events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds[0], EventKind::TestStart);
    assert!(kinds.contains(&EventKind::FunctionsDiscovered));
    let starts = kinds.iter().filter(|k| **k == EventKind::TestGenerationStart).count();
    let failures = kinds.iter().filter(|k| **k == EventKind::TestGenerationFailed).count();
    assert_eq!(starts, 2);
    assert_eq!(failures, 2);
    assert!(!kinds.contains(&EventKind::TestGenerated));

    // The phase-wide aggregate tick closes the stream at 90%.
    let last = run.events.last().unwrap();
    assert_eq!(last.kind, EventKind::StatusUpdate);
    assert_eq!(last.progress, Some(Some(90)));
}

#[tokio::test]
async fn functions_discovered_event_carries_names_and_counts() {
    let diff = diff_with_changed_lines(&[5, 12]);
    let questions = CannedModel::ok(questions_json(&[("u.py", "f"), ("u.py", "g")]));
    let run = run_agent(&diff, questions, CannedModel::err("model offline")).await;

    let discovered = run
        .events
        .iter()
        .find(|e| e.kind == EventKind::FunctionsDiscovered)
        .unwrap();
    assert_eq!(discovered.progress, Some(Some(30)));
    let details = discovered.details.as_ref().unwrap();
    assert_eq!(details["functions_count"], 2);
    assert_eq!(details["files_with_changes"], 1);
    let names: Vec<&str> = details["function_names"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(names.contains(&"f"));
    assert!(names.contains(&"g"));
}

#[tokio::test]
async fn successful_generation_emits_test_generated_with_name() {
    let diff = diff_with_changed_lines(&[5]);
    let questions = CannedModel::ok(questions_json(&[("u.py", "f")]));
    let code = CannedModel::ok("```python\ndef test_f_returns_double_minus_one():\n    assert f(1, 1) == 3\n```");
    let run = run_agent(&diff, questions, code).await;

    assert_eq!(run.result.tests_generated, 1);
    let generated = run
        .events
        .iter()
        .find(|e| e.kind == EventKind::TestGenerated)
        .unwrap();
    let details = generated.details.as_ref().unwrap();
    assert_eq!(details["function_name"], "f");
    assert_eq!(details["test_name"], "test_f_returns_double_minus_one");
}
