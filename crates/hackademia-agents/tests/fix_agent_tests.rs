// Fix agent against a stub host and canned proposals: exact application,
// marker commit messages, no-op reporting, stale-blob skip.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use hackademia_agents::fix::LlmFixAgent;
use hackademia_agents::llm::ChatModel;
use hackademia_core::agent::{FixAgent, ProgressReporter};
use hackademia_core::bus::EventBus;
use hackademia_core::github::{CommitInfo, FileBlob, HostError, SourceHost, WriteOutcome};
use hackademia_core::pipeline::is_bot_commit;
use hackademia_core::types::{
    AnalysisResult, ChangedFile, Issue, PipelineStage, PrInfo, Severity,
};

const FILE_CONTENT: &str = "def login(user):\n    query = \"SELECT * FROM users WHERE name='\" + user + \"'\"\n    return db.run(query)\n";

struct RecordingHost {
    stale: bool,
    writes: Mutex<Vec<(String, String, String)>>,
}

impl RecordingHost {
    fn new(stale: bool) -> Arc<Self> {
        Arc::new(Self {
            stale,
            writes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SourceHost for RecordingHost {
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
        _path: &str,
        _reference: &str,
    ) -> Result<FileBlob, HostError> {
        Ok(FileBlob {
            content: FILE_CONTENT.as_bytes().to_vec(),
            sha: "blob-1".into(),
        })
    }

    async fn write_file(
        &self,
        _repo: &str,
        path: &str,
        content: &str,
        message: &str,
        _branch: &str,
        prior_blob_id: &str,
    ) -> Result<WriteOutcome, HostError> {
        if self.stale {
            return Err(HostError::StaleBlob(path.to_string()));
        }
        assert_eq!(prior_blob_id, "blob-1");
        self.writes
            .lock()
            .await
            .push((path.to_string(), content.to_string(), message.to_string()));
        Ok(WriteOutcome {
            commit_sha: "commit-1".into(),
            blob_sha: "blob-2".into(),
        })
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
    response: String,
}

#[async_trait]
impl ChatModel for CannedModel {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.response.clone())
    }
}

fn analysis_with_one_issue() -> AnalysisResult {
    AnalysisResult {
        success: true,
        vulnerabilities: vec![Issue {
            issue_type: "SQL_INJECTION".into(),
            severity: Severity::High,
            filename: "auth.py".into(),
            line_number: 2,
            description: "string concatenation in SQL query".into(),
            recommendation: Some("use parameterized queries".into()),
            code_snippet: None,
            confidence: 90,
        }],
        security_issues: Vec::new(),
        quality_issues: Vec::new(),
        recommendations: Vec::new(),
        overall_risk: Severity::High,
        files_analyzed: 1,
        total_issues: 1,
        errors: Vec::new(),
        duration: 0.1,
    }
}

fn proposal(old_code: &str, new_code: &str) -> String {
    serde_json::json!({
        "function_name": "login",
        "fix_summary": "Parameterize the SQL query",
        "issue_type": "vulnerability",
        "confidence": 90,
        "lines_affected": "2",
        "old_code": old_code,
        "new_code": new_code,
        "explanation": "Prevents SQL injection",
    })
    .to_string()
}

fn reporter() -> ProgressReporter {
    ProgressReporter::new(EventBus::new(), "p1", PipelineStage::Fix)
}

#[tokio::test]
async fn verbatim_old_code_yields_exactly_one_marker_commit() {
    let host = RecordingHost::new(false);
    let old = "query = \"SELECT * FROM users WHERE name='\" + user + \"'\"";
    let new = "query = \"SELECT * FROM users WHERE name=%s\"";
    let model = Arc::new(CannedModel { response: proposal(old, new) });
    let agent = LlmFixAgent::new(model, host.clone() as Arc<dyn SourceHost>);

    let result = agent
        .run(&analysis_with_one_issue(), "o/r", "feat", &reporter())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.fixes_applied, 1);
    assert_eq!(result.files_modified, 1);
    assert_eq!(result.commits_made, 1);
    assert_eq!(result.fixes[0].commit_sha.as_deref(), Some("commit-1"));

    let writes = host.writes.lock().await;
    assert_eq!(writes.len(), 1);
    let (path, content, message) = &writes[0];
    assert_eq!(path, "auth.py");
    assert!(content.contains("name=%s"));
    assert!(message.starts_with("🤖 AI Fix:"));
    assert!(message.ends_with("[skip-pipeline]"));
    assert!(is_bot_commit(message));
}

#[tokio::test]
async fn identical_old_and_new_code_is_reported_noop_without_commit() {
    let host = RecordingHost::new(false);
    let same = "return db.run(query)";
    let model = Arc::new(CannedModel { response: proposal(same, same) });
    let agent = LlmFixAgent::new(model, host.clone() as Arc<dyn SourceHost>);

    let result = agent
        .run(&analysis_with_one_issue(), "o/r", "feat", &reporter())
        .await
        .unwrap();

    assert_eq!(result.fixes_applied, 0);
    assert_eq!(result.commits_made, 0);
    assert!(result.errors.iter().any(|e| e.contains("No-op fix")));
    assert!(host.writes.lock().await.is_empty());
}

#[tokio::test]
async fn stale_blob_skips_that_fix_with_error() {
    let host = RecordingHost::new(true);
    let old = "return db.run(query)";
    let model = Arc::new(CannedModel { response: proposal(old, "return db.run(query, params)") });
    let agent = LlmFixAgent::new(model, host.clone() as Arc<dyn SourceHost>);

    let result = agent
        .run(&analysis_with_one_issue(), "o/r", "feat", &reporter())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.fixes_applied, 0);
    assert!(result.errors.iter().any(|e| e.contains("Stale blob")));
}

#[tokio::test]
async fn unparseable_proposal_is_skipped() {
    let host = RecordingHost::new(false);
    let model = Arc::new(CannedModel { response: "I could not produce a fix, sorry.".into() });
    let agent = LlmFixAgent::new(model, host.clone() as Arc<dyn SourceHost>);

    let result = agent
        .run(&analysis_with_one_issue(), "o/r", "feat", &reporter())
        .await
        .unwrap();

    assert_eq!(result.fixes_applied, 0);
    assert!(result.errors.iter().any(|e| e.contains("Unparseable")));
    assert!(host.writes.lock().await.is_empty());
}

#[tokio::test]
async fn empty_analysis_returns_empty_result() {
    let host = RecordingHost::new(false);
    let model = Arc::new(CannedModel { response: String::new() });
    let agent = LlmFixAgent::new(model, host as Arc<dyn SourceHost>);

    let analysis = AnalysisResult {
        vulnerabilities: Vec::new(),
        total_issues: 0,
        ..analysis_with_one_issue()
    };
    let result = agent.run(&analysis, "o/r", "feat", &reporter()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.fixes_applied, 0);
}
