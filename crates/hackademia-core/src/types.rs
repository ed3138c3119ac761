use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Epoch seconds with sub-second precision, the timestamp unit used on every
/// event and on the comprehensive-results record.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ── Pipeline stages ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Pending,
    Build,
    Analyze,
    Fix,
    Test,
    Complete,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Build => "build",
            Self::Analyze => "analyze",
            Self::Fix => "fix",
            Self::Test => "test",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Position in the forward-only progression. `failed` is absorbing and
    /// reachable from anywhere, so it sorts last.
    pub fn index(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Build => 1,
            Self::Analyze => 2,
            Self::Fix => 3,
            Self::Test => 4,
            Self::Complete => 5,
            Self::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

// ── Event envelope ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PipelineStart,
    StageStart,
    StatusUpdate,
    StageComplete,
    PipelineComplete,
    PipelineResultsComplete,
    Error,
    FunctionsDiscovered,
    TestStart,
    TestGenerationStart,
    TestGenerated,
    TestGenerationFailed,
    TestExecutionResult,
    TerminalConnected,
    TerminalStart,
    TerminalOutput,
    TerminalEnd,
    TerminalTerminating,
    Ack,
    Pong,
}

/// Tri-state `progress` field: absent (not a progress-bearing event), `null`
/// (sub-step tick), or an integer in [0, 100].
mod progress_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Option<u8>>, s: S) -> Result<S::Ok, S::Error> {
        // Outer None is filtered by skip_serializing_if before we get here.
        match v {
            Some(inner) => inner.serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<u8>>, D::Error> {
        Ok(Some(Option::<u8>::deserialize(d)?))
    }
}

/// A single pipeline or terminal event as delivered to bus subscribers.
///
/// Every event carries `type` and `timestamp`; the remaining fields are
/// populated per kind and omitted from the JSON wire form when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        with = "progress_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress: Option<Option<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    /// Terminal streaming: `stdout` | `stderr` | `system`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: now_ts(),
            pipeline_id: None,
            session_id: None,
            stage: None,
            stage_index: None,
            status: None,
            message: None,
            progress: None,
            duration: None,
            details: None,
            results: None,
            stream: None,
            output: None,
            exit_code: None,
        }
    }

    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_stage_index(mut self, index: u8) -> Self {
        self.stage_index = Some(index);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Integer progress in [0, 100].
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(Some(progress.min(100)));
        self
    }

    /// Sub-step tick: `progress: null` on the wire.
    pub fn with_progress_tick(mut self) -> Self {
        self.progress = Some(None);
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_results(mut self, results: Value) -> Self {
        self.results = Some(results);
        self
    }

    pub fn status_update(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::new(EventKind::StatusUpdate)
            .with_stage(stage)
            .with_status("in_progress")
            .with_message(message)
    }

    pub fn error(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error)
            .with_stage(stage)
            .with_message(message)
    }
}

// ── Changed files and parsed diff ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    /// Anything else the host reports (renamed, copied, ...).
    #[serde(other)]
    Other,
}

/// One (line number, content) entry from a parsed diff projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub line_number: u32,
    pub content: String,
}

/// A context line exists in both file versions, so it carries both counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLine {
    pub old_line_number: u32,
    pub new_line_number: u32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
    /// Unified-diff hunk text; `None` for binary files.
    pub patch: Option<String>,
    pub file_extension: String,
    pub is_binary: bool,
    pub added_lines: Vec<DiffLine>,
    pub removed_lines: Vec<DiffLine>,
    pub context_lines: Vec<ContextLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub base_branch: String,
    pub head_branch: String,
    pub author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrDiff {
    pub pr_info: PrInfo,
    pub changed_files: Vec<ChangedFile>,
    pub total_additions: u32,
    pub total_deletions: u32,
}

// ── Build stage ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Python,
    Node,
    Generic,
    Unknown,
}

impl ProjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Generic => "generic",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    pub line: u32,
    pub args: Vec<String>,
    pub decorators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassRecord {
    pub name: String,
    pub line: u32,
    pub bases: Vec<String>,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    Plain,
    From,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRecord {
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// The imported symbol for `from x import y` records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub kind: ImportKind,
}

/// Static metadata for one walked source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: usize,
    pub lines: usize,
    pub extension: String,
    pub functions: Vec<FunctionRecord>,
    pub classes: Vec<ClassRecord>,
    pub imports: Vec<ImportRecord>,
    pub complexity_score: usize,
    pub errors: Vec<String>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub total_files: usize,
    pub supported_files: usize,
    pub total_functions: usize,
    pub total_classes: usize,
    pub unique_dependencies: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub project_type: ProjectKind,
    pub dependencies: Vec<String>,
    pub file_info: HashMap<String, FileInfo>,
    pub metadata: BuildMetadata,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub build_logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    pub duration: f64,
}

impl BuildResult {
    /// Baseline failure record used when the clone step itself fails: success
    /// is false, project kind is unknown, every counter is zero.
    pub fn clone_failure(error: String, logs: Vec<String>) -> Self {
        Self {
            success: false,
            project_type: ProjectKind::Unknown,
            dependencies: Vec::new(),
            file_info: HashMap::new(),
            metadata: BuildMetadata::default(),
            errors: vec![error],
            warnings: Vec::new(),
            build_logs: logs,
            workspace_dir: None,
            duration: 0.0,
        }
    }
}

// ── Analyze stage ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// One classified finding; lives in exactly one of the three issue lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub filename: String,
    pub line_number: u32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
    /// Confidence percentage in [0, 100].
    pub confidence: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub success: bool,
    pub vulnerabilities: Vec<Issue>,
    pub security_issues: Vec<Issue>,
    pub quality_issues: Vec<Issue>,
    pub recommendations: Vec<String>,
    pub overall_risk: Severity,
    pub files_analyzed: usize,
    pub total_issues: usize,
    pub errors: Vec<String>,
    pub duration: f64,
}

impl AnalysisResult {
    pub fn failed(error: String) -> Self {
        Self {
            success: false,
            vulnerabilities: Vec::new(),
            security_issues: Vec::new(),
            quality_issues: Vec::new(),
            recommendations: Vec::new(),
            overall_risk: Severity::Low,
            files_analyzed: 0,
            total_issues: 0,
            errors: vec![error],
            duration: 0.0,
        }
    }

    /// All three issue lists flattened, with the originating list recorded as
    /// a category tag.
    pub fn all_issues(&self) -> Vec<(&'static str, &Issue)> {
        let mut all = Vec::with_capacity(self.total_issues);
        all.extend(self.vulnerabilities.iter().map(|i| ("vulnerability", i)));
        all.extend(self.security_issues.iter().map(|i| ("security_issue", i)));
        all.extend(self.quality_issues.iter().map(|i| ("quality_issue", i)));
        all
    }
}

// ── Fix stage ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRecord {
    pub filename: String,
    pub function_name: String,
    pub issue_type: String,
    pub fix_summary: String,
    pub confidence: u8,
    pub lines_affected: String,
    pub old_code: String,
    pub new_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStageResult {
    pub success: bool,
    pub fixes_applied: usize,
    pub files_modified: usize,
    pub commits_made: usize,
    pub fixes: Vec<FixRecord>,
    pub errors: Vec<String>,
    pub duration: f64,
}

impl FixStageResult {
    pub fn empty(duration: f64) -> Self {
        Self {
            success: true,
            fixes_applied: 0,
            files_modified: 0,
            commits_made: 0,
            fixes: Vec::new(),
            errors: Vec::new(),
            duration,
        }
    }
}

// ── Test stage ───────────────────────────────────────────────────────────

/// A function definition whose span intersects the PR's changed lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFunction {
    pub filename: String,
    pub function_name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub source: String,
    pub is_class_method: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub decorators: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionQuestion {
    pub function: ChangedFunction,
    pub question: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub function: ChangedFunction,
    pub question: String,
    pub test_code: String,
    pub test_name: String,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// One `file::Class::method STATUS` line from the runner's verbose output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMethodResult {
    pub file: String,
    pub class_name: String,
    pub method: String,
    pub status: TestStatus,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

/// Per-test-file execution outcome, including its parsed method results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFileOutcome {
    pub function_name: String,
    pub test_name: String,
    /// The source file the tested function came from.
    pub source_file: String,
    /// The generated test file that was executed.
    pub filename: String,
    pub status: TestStatus,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub methods: Vec<TestMethodResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStageResult {
    pub success: bool,
    /// True when Phase 1 discovered no candidate functions and the stage was
    /// skipped before generation.
    pub skipped: bool,
    pub functions_discovered: usize,
    pub questions_generated: usize,
    pub tests_generated: usize,
    pub tests_executed: usize,
    pub files_passed: usize,
    pub files_failed: usize,
    pub methods_passed: usize,
    pub methods_failed: usize,
    pub methods_errored: usize,
    pub outcomes: Vec<TestFileOutcome>,
    pub errors: Vec<String>,
    pub duration: f64,
}

impl TestStageResult {
    pub fn skipped(duration: f64) -> Self {
        Self {
            success: true,
            skipped: true,
            functions_discovered: 0,
            questions_generated: 0,
            tests_generated: 0,
            tests_executed: 0,
            files_passed: 0,
            files_failed: 0,
            methods_passed: 0,
            methods_failed: 0,
            methods_errored: 0,
            outcomes: Vec::new(),
            errors: Vec::new(),
            duration,
        }
    }
}

// ── Pipeline record ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: String,
    pub triggered_by: String,
    pub event_type: String,
    pub timestamp: String,
}

impl TriggerInfo {
    pub fn webhook(triggered_by: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            trigger_type: "webhook".into(),
            triggered_by: triggered_by.into(),
            event_type: event_type.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn manual(triggered_by: impl Into<String>) -> Self {
        Self {
            trigger_type: "manual".into(),
            triggered_by: triggered_by.into(),
            event_type: "manual_trigger".into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// One execution of the four-stage workflow for one PR event. Owned
/// exclusively by the orchestrator for its lifetime; destroyed after the
/// final event emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub pr_number: u64,
    pub repo_name: String,
    pub branch: String,
    pub files_changed: Vec<ChangedFile>,
    pub stage: PipelineStage,
    pub trigger: TriggerInfo,
    pub started_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<PrDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixStageResult>,
    pub fix_skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<TestStageResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Pipeline {
    pub fn new(
        pr_number: u64,
        repo_name: impl Into<String>,
        branch: impl Into<String>,
        files_changed: Vec<ChangedFile>,
        trigger: TriggerInfo,
    ) -> Self {
        let repo_name = repo_name.into();
        let started_at = now_ts();
        let id = format!("{}_{}_{}", repo_name, pr_number, started_at as i64);
        Self {
            id,
            pr_number,
            repo_name,
            branch: branch.into(),
            files_changed,
            stage: PipelineStage::Pending,
            trigger,
            started_at,
            diff: None,
            build: None,
            analysis: None,
            fix: None,
            fix_skipped: false,
            test: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Move to a later stage. Backward transitions are ignored so the
    /// forward-only invariant holds even on buggy call orders; `failed` is
    /// always reachable.
    pub fn advance(&mut self, next: PipelineStage) {
        if next == PipelineStage::Failed || next.index() > self.stage.index() {
            self.stage = next;
        }
    }

    pub fn duration(&self) -> f64 {
        now_ts() - self.started_at
    }
}
