use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::types::{Pipeline, PipelineStage, Severity, TriggerInfo};

pub const RESULTS_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Success,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub success: bool,
    pub duration: f64,
    pub files_downloaded: usize,
    pub file_types_processed: Vec<String>,
    pub build_errors: Vec<String>,
    pub files_analyzed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityDetail {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub description: String,
    pub severity: String,
    pub file_path: String,
    pub line_number: u32,
    pub confidence_score: f64,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub success: bool,
    pub duration: f64,
    pub files_analyzed: usize,
    pub total_issues: usize,
    pub vulnerabilities: Vec<VulnerabilityDetail>,
    pub severity_breakdown: HashMap<String, usize>,
    pub categories_breakdown: HashMap<String, usize>,
    pub overall_risk_level: String,
    pub ai_confidence_score: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixDetail {
    pub function_name: String,
    pub file_path: String,
    pub fix_type: String,
    pub description: String,
    pub confidence_score: f64,
    pub lines_changed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSummary {
    pub success: bool,
    pub duration: f64,
    pub files_modified: usize,
    pub functions_fixed: Vec<FixDetail>,
    pub commit_sha: Option<String>,
    pub commit_message: String,
    pub total_lines_changed: usize,
    pub fix_confidence_average: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFunctionRecord {
    pub function_name: String,
    pub file_path: String,
    pub test_name: String,
    pub status: String,
    pub execution_time: f64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub success: bool,
    pub duration: f64,
    pub functions_discovered: usize,
    pub test_functions: Vec<TestFunctionRecord>,
    pub tests_generated: usize,
    pub tests_executed: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub test_coverage_percentage: f64,
    pub execution_time_total: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub total_api_calls: usize,
    pub gemini_api_calls: usize,
    pub github_api_calls: usize,
    pub total_processing_time: f64,
    pub memory_usage_peak: f64,
}

/// The aggregated record posted to the external results URL and re-emitted
/// as `pipeline_results_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveResults {
    pub pipeline_id: String,
    pub repository_name: String,
    pub branch_name: String,
    pub pr_number: u64,
    pub pipeline_status: PipelineStatus,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub total_duration: f64,
    pub trigger_info: TriggerInfo,
    pub build_results: BuildSummary,
    pub analysis_results: AnalysisSummary,
    pub fix_results: FixSummary,
    pub test_results: TestSummary,
    pub success_rate: f64,
    pub resource_metrics: ResourceMetrics,
    pub previous_run_comparison: Option<Value>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsEnvelope {
    pub event_type: String,
    pub timestamp: String,
    pub version: String,
    pub results: ComprehensiveResults,
}

impl ResultsEnvelope {
    pub fn new(results: ComprehensiveResults) -> Self {
        Self {
            event_type: "pipeline_complete".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: RESULTS_VERSION.to_string(),
            results,
        }
    }
}

fn iso(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp_millis((ts * 1000.0) as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Per-stage success flags in pipeline order. Skipped stages count as
/// successful; stages never reached because of an earlier failure count as
/// failed.
fn stage_flags(p: &Pipeline) -> [bool; 4] {
    [
        p.build.as_ref().map(|b| b.success).unwrap_or(false),
        p.analysis.as_ref().map(|a| a.success).unwrap_or(false),
        if p.fix_skipped {
            true
        } else {
            p.fix.as_ref().map(|f| f.success).unwrap_or(false)
        },
        p.test.as_ref().map(|t| t.success).unwrap_or(false),
    ]
}

/// Build the comprehensive record from a terminal pipeline.
pub fn aggregate(p: &Pipeline) -> ComprehensiveResults {
    let flags = stage_flags(p);
    let passed = flags.iter().filter(|f| **f).count();
    let pipeline_status = if flags.iter().all(|f| *f) {
        PipelineStatus::Success
    } else if flags.iter().any(|f| *f) {
        PipelineStatus::Partial
    } else {
        PipelineStatus::Failed
    };

    let end_ts = crate::types::now_ts();

    // Build
    let build_results = match &p.build {
        Some(b) => {
            let mut types: Vec<String> = b
                .file_info
                .values()
                .map(|f| f.extension.clone())
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();
            types.sort();
            BuildSummary {
                success: b.success,
                duration: b.duration,
                files_downloaded: b.metadata.total_files,
                file_types_processed: types,
                build_errors: b.errors.clone(),
                files_analyzed: b.metadata.total_files,
            }
        }
        None => BuildSummary {
            success: false,
            duration: 0.0,
            files_downloaded: 0,
            file_types_processed: Vec::new(),
            build_errors: Vec::new(),
            files_analyzed: 0,
        },
    };

    // Analysis
    let analysis_results = match &p.analysis {
        Some(a) => {
            let vulnerabilities: Vec<VulnerabilityDetail> = a
                .all_issues()
                .into_iter()
                .map(|(category, issue)| VulnerabilityDetail {
                    issue_type: issue.issue_type.clone(),
                    description: issue.description.clone(),
                    severity: issue.severity.as_str().to_string(),
                    file_path: issue.filename.clone(),
                    line_number: issue.line_number,
                    confidence_score: f64::from(issue.confidence),
                    category: match category {
                        "quality_issue" => "code_quality".to_string(),
                        "security_issue" => "security".to_string(),
                        _ => "vulnerability".to_string(),
                    },
                })
                .collect();
            let mut severity_breakdown = HashMap::new();
            let mut categories_breakdown = HashMap::new();
            for v in &vulnerabilities {
                *severity_breakdown.entry(v.severity.clone()).or_insert(0) += 1;
                *categories_breakdown.entry(v.category.clone()).or_insert(0) += 1;
            }
            let ai_confidence_score = if vulnerabilities.is_empty() {
                0.0
            } else {
                vulnerabilities.iter().map(|v| v.confidence_score).sum::<f64>()
                    / vulnerabilities.len() as f64
                    / 100.0
            };
            AnalysisSummary {
                success: a.success,
                duration: a.duration,
                files_analyzed: a.files_analyzed,
                total_issues: a.total_issues,
                vulnerabilities,
                severity_breakdown,
                categories_breakdown,
                overall_risk_level: a.overall_risk.as_str().to_string(),
                ai_confidence_score,
                recommendations: a.recommendations.clone(),
            }
        }
        None => AnalysisSummary {
            success: false,
            duration: 0.0,
            files_analyzed: 0,
            total_issues: 0,
            vulnerabilities: Vec::new(),
            severity_breakdown: HashMap::new(),
            categories_breakdown: HashMap::new(),
            overall_risk_level: Severity::Low.as_str().to_string(),
            ai_confidence_score: 0.0,
            recommendations: Vec::new(),
        },
    };

    // Fix
    let fix_results = match &p.fix {
        Some(f) => {
            let functions_fixed: Vec<FixDetail> = f
                .fixes
                .iter()
                .map(|fix| FixDetail {
                    function_name: fix.function_name.clone(),
                    file_path: fix.filename.clone(),
                    fix_type: fix.issue_type.clone(),
                    description: fix.fix_summary.clone(),
                    confidence_score: f64::from(fix.confidence),
                    lines_changed: fix.new_code.lines().count(),
                })
                .collect();
            let total_lines_changed = functions_fixed.iter().map(|d| d.lines_changed).sum();
            let fix_confidence_average = if functions_fixed.is_empty() {
                0.0
            } else {
                functions_fixed.iter().map(|d| d.confidence_score).sum::<f64>()
                    / functions_fixed.len() as f64
            };
            // sha and message must describe the same commit: both come from
            // the most recent fix that actually committed.
            let last_committed = f.fixes.iter().rev().find(|x| x.commit_sha.is_some());
            FixSummary {
                success: f.success,
                duration: f.duration,
                files_modified: f.files_modified,
                functions_fixed,
                commit_sha: last_committed.and_then(|x| x.commit_sha.clone()),
                commit_message: last_committed
                    .map(|x| format!("🤖 AI Fix: {} [skip-pipeline]", x.fix_summary))
                    .unwrap_or_default(),
                total_lines_changed,
                fix_confidence_average,
            }
        }
        None => FixSummary {
            success: p.fix_skipped,
            duration: 0.0,
            files_modified: 0,
            functions_fixed: Vec::new(),
            commit_sha: None,
            commit_message: String::new(),
            total_lines_changed: 0,
            fix_confidence_average: 0.0,
        },
    };

    // Test
    let test_results = match &p.test {
        Some(t) => TestSummary {
            success: t.success,
            duration: t.duration,
            functions_discovered: t.functions_discovered,
            test_functions: t
                .outcomes
                .iter()
                .map(|o| TestFunctionRecord {
                    function_name: o.function_name.clone(),
                    file_path: o.source_file.clone(),
                    test_name: o.test_name.clone(),
                    status: o.status.as_str().to_string(),
                    execution_time: o.execution_time,
                    error_message: o.error_message.clone(),
                })
                .collect(),
            tests_generated: t.tests_generated,
            tests_executed: t.tests_executed,
            tests_passed: t.files_passed,
            tests_failed: t.tests_executed.saturating_sub(t.files_passed),
            test_coverage_percentage: 0.0,
            execution_time_total: t.outcomes.iter().map(|o| o.execution_time).sum(),
        },
        None => TestSummary {
            success: false,
            duration: 0.0,
            functions_discovered: 0,
            test_functions: Vec::new(),
            tests_generated: 0,
            tests_executed: 0,
            tests_passed: 0,
            tests_failed: 0,
            test_coverage_percentage: 0.0,
            execution_time_total: 0.0,
        },
    };

    ComprehensiveResults {
        pipeline_id: p.id.clone(),
        repository_name: p.repo_name.clone(),
        branch_name: p.branch.clone(),
        pr_number: p.pr_number,
        pipeline_status,
        start_timestamp: iso(p.started_at),
        end_timestamp: iso(end_ts),
        total_duration: end_ts - p.started_at,
        trigger_info: p.trigger.clone(),
        build_results,
        analysis_results,
        fix_results,
        test_results,
        success_rate: passed as f64 / 4.0 * 100.0,
        resource_metrics: ResourceMetrics {
            total_processing_time: end_ts - p.started_at,
            ..ResourceMetrics::default()
        },
        previous_run_comparison: None,
        errors: p.errors.clone(),
        warnings: p.warnings.clone(),
    }
}

/// One-line-per-stage summary carried on `pipeline_complete`.
pub fn stage_summary(p: &Pipeline) -> Value {
    let build = match &p.build {
        Some(b) => json!({
            "status": if b.success { "success" } else { "failed" },
            "files_analyzed": b.metadata.total_files,
            "project_type": b.project_type.as_str(),
            "duration": b.duration,
        }),
        None => json!({ "status": "not_run" }),
    };
    let analyze = match &p.analysis {
        Some(a) => json!({
            "status": if a.success { "success" } else { "failed" },
            "total_issues": a.total_issues,
            "overall_risk": a.overall_risk.as_str(),
            "duration": a.duration,
        }),
        None => json!({ "status": "not_run" }),
    };
    let fix = if p.fix_skipped {
        json!({ "status": "skipped", "fixes_applied": 0 })
    } else {
        match &p.fix {
            Some(f) => json!({
                "status": if f.success { "success" } else { "failed" },
                "fixes_applied": f.fixes_applied,
                "commits_made": f.commits_made,
                "duration": f.duration,
            }),
            None => json!({ "status": "not_run" }),
        }
    };
    let test = match &p.test {
        Some(t) => json!({
            "status": if t.skipped { "skipped" } else if t.success { "success" } else { "failed" },
            "functions_discovered": t.functions_discovered,
            "tests_generated": t.tests_generated,
            "methods_passed": t.methods_passed,
            "methods_failed": t.methods_failed,
            "duration": t.duration,
        }),
        None => json!({ "status": "not_run" }),
    };
    json!({ "build": build, "analyze": analyze, "fix": fix, "test": test })
}

/// Markdown summary posted back to the pull request.
pub fn build_pr_comment(p: &Pipeline) -> String {
    let emoji = if p.stage == PipelineStage::Complete { "✅" } else { "❌" };
    let mut comment = format!(
        "# {emoji} Hackademia AI Pipeline Results\n\n\
         **Pipeline ID**: `{}`  \n\
         **Duration**: {:.2} seconds  \n\
         **Status**: {}\n\n\
         ## 🔨 Build Agent Results\n",
        p.id,
        p.duration(),
        p.stage.as_str()
    );

    if let Some(b) = &p.build {
        comment.push_str(&format!(
            "- **Status**: {}\n- **Files Analyzed**: {}\n- **Functions Found**: {}\n- **Classes Found**: {}\n- **Dependencies**: {}\n",
            if b.success { "✅ Success" } else { "❌ Failed" },
            b.metadata.total_files,
            b.metadata.total_functions,
            b.metadata.total_classes,
            b.metadata.unique_dependencies,
        ));
        if !b.errors.is_empty() {
            comment.push_str("\n**Build Errors:**\n");
            for error in &b.errors {
                comment.push_str(&format!("- ❌ {error}\n"));
            }
        }
    } else {
        comment.push_str("Not executed\n");
    }

    comment.push_str("\n## 🔍 Analyze Agent Results\n");
    if let Some(a) = &p.analysis {
        comment.push_str(&format!(
            "- **Status**: {}\n- **Issues Found**: {}\n- **Overall Risk**: {}\n",
            if a.success { "✅ Success" } else { "❌ Failed" },
            a.total_issues,
            a.overall_risk.as_str(),
        ));
        let top: Vec<String> = a
            .all_issues()
            .into_iter()
            .take(5)
            .map(|(_, i)| {
                format!(
                    "- ⚠️ [{}] `{}:{}` {}",
                    i.severity.as_str(),
                    i.filename,
                    i.line_number,
                    i.description
                )
            })
            .collect();
        if !top.is_empty() {
            comment.push_str("\n**Top Issues:**\n");
            comment.push_str(&top.join("\n"));
            comment.push('\n');
        }
    } else {
        comment.push_str("Not executed\n");
    }

    comment.push_str("\n## 🔧 Fix Agent Results\n");
    if p.fix_skipped {
        comment.push_str("- **Status**: ⏭️ Skipped (no issues to fix)\n");
    } else if let Some(f) = &p.fix {
        comment.push_str(&format!(
            "- **Status**: {}\n- **Fixes Applied**: {}\n- **Commits Made**: {}\n",
            if f.success { "✅ Success" } else { "❌ Failed" },
            f.fixes_applied,
            f.commits_made,
        ));
    } else {
        comment.push_str("Not executed\n");
    }

    comment.push_str("\n## 🧪 Test Agent Results\n");
    if let Some(t) = &p.test {
        if t.skipped {
            comment.push_str("- **Status**: ⏭️ Skipped (no functions found in changed files)\n");
        } else {
            comment.push_str(&format!(
                "- **Status**: {}\n- **Functions Discovered**: {}\n- **Tests Generated**: {}\n- **Tests Executed**: {}\n- **Methods Passed**: {}\n- **Methods Failed**: {}\n",
                if t.success { "✅ Success" } else { "❌ Failed" },
                t.functions_discovered,
                t.tests_generated,
                t.tests_executed,
                t.methods_passed,
                t.methods_failed,
            ));
        }
    } else {
        comment.push_str("Not executed\n");
    }

    comment.push_str("\n---\n*Powered by Hackademia Multi-Agent AI Pipeline* 🚀\n");
    comment
}

/// Delivers the comprehensive record to the configured external URL, falling
/// back to a timestamped JSON file next to the process.
pub struct ResultsWebhookSender {
    url: String,
    client: reqwest::Client,
}

impl ResultsWebhookSender {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn configured(&self) -> bool {
        !self.url.is_empty()
    }

    pub async fn send(&self, envelope: &ResultsEnvelope) -> Result<()> {
        if !self.configured() {
            anyhow::bail!("no results webhook URL configured");
        }
        let resp = self
            .client
            .post(&self.url)
            .header("User-Agent", "Hackademia-Pipeline/1.0")
            .json(envelope)
            .send()
            .await
            .context("results webhook POST")?;
        if !resp.status().is_success() {
            anyhow::bail!("results webhook returned {}", resp.status());
        }
        info!(pipeline_id = %envelope.results.pipeline_id, "results webhook delivered");
        Ok(())
    }

    pub fn save_backup_in(&self, dir: &Path, envelope: &ResultsEnvelope) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let safe_id = envelope.results.pipeline_id.replace('/', "_");
        let path = dir.join(format!("pipeline_results_{safe_id}_{stamp}.json"));
        let body = serde_json::to_string_pretty(envelope)?;
        std::fs::write(&path, body).with_context(|| format!("write backup {}", path.display()))?;
        Ok(path)
    }

    /// Send, and on any failure write the backup file. Never raises into the
    /// pipeline.
    pub async fn deliver(&self, envelope: &ResultsEnvelope) {
        if !self.configured() {
            return;
        }
        if let Err(e) = self.send(envelope).await {
            warn!("results webhook failed: {e}");
            match self.save_backup_in(Path::new("."), envelope) {
                Ok(path) => info!("results saved to {}", path.display()),
                Err(e) => warn!("results backup failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnalysisResult, BuildMetadata, BuildResult, FixStageResult, Issue, Pipeline,
        ProjectKind, TestStageResult, TriggerInfo,
    };

    fn pipeline_with(build_ok: bool, analyze_ok: bool) -> Pipeline {
        let mut p = Pipeline::new(3, "o/r", "feat", Vec::new(), TriggerInfo::manual("t"));
        p.build = Some(BuildResult {
            success: build_ok,
            project_type: ProjectKind::Python,
            dependencies: vec!["os".into()],
            file_info: Default::default(),
            metadata: BuildMetadata {
                total_files: 2,
                supported_files: 2,
                total_functions: 3,
                total_classes: 1,
                unique_dependencies: 1,
            },
            errors: Vec::new(),
            warnings: Vec::new(),
            build_logs: Vec::new(),
            workspace_dir: None,
            duration: 1.5,
        });
        p.analysis = Some(AnalysisResult {
            success: analyze_ok,
            vulnerabilities: vec![Issue {
                issue_type: "SQL_INJECTION".into(),
                severity: Severity::High,
                filename: "auth.py".into(),
                line_number: 45,
                description: "string concatenation in query".into(),
                recommendation: None,
                code_snippet: None,
                confidence: 90,
            }],
            security_issues: Vec::new(),
            quality_issues: Vec::new(),
            recommendations: vec!["use parameterized queries".into()],
            overall_risk: Severity::High,
            files_analyzed: 1,
            total_issues: 1,
            errors: Vec::new(),
            duration: 2.0,
        });
        p.fix = Some(FixStageResult::empty(0.5));
        p.test = Some(TestStageResult::skipped(0.1));
        p
    }

    #[test]
    fn all_stages_green_is_success() {
        let p = pipeline_with(true, true);
        let results = aggregate(&p);
        assert_eq!(results.pipeline_status, PipelineStatus::Success);
        assert_eq!(results.success_rate, 100.0);
    }

    #[test]
    fn mixed_stages_are_partial() {
        let p = pipeline_with(true, false);
        let results = aggregate(&p);
        assert_eq!(results.pipeline_status, PipelineStatus::Partial);
        assert_eq!(results.success_rate, 75.0);
    }

    #[test]
    fn nothing_green_is_failed() {
        let mut p = Pipeline::new(3, "o/r", "feat", Vec::new(), TriggerInfo::manual("t"));
        p.errors.push("clone failed".into());
        let results = aggregate(&p);
        assert_eq!(results.pipeline_status, PipelineStatus::Failed);
        assert_eq!(results.success_rate, 0.0);
    }

    #[test]
    fn skipped_fix_counts_as_successful_stage() {
        let mut p = pipeline_with(true, true);
        p.fix = None;
        p.fix_skipped = true;
        let results = aggregate(&p);
        assert_eq!(results.pipeline_status, PipelineStatus::Success);
        assert!(results.fix_results.success);
    }

    #[test]
    fn breakdowns_count_flattened_issues() {
        let p = pipeline_with(true, true);
        let results = aggregate(&p);
        assert_eq!(results.analysis_results.severity_breakdown.get("HIGH"), Some(&1));
        assert_eq!(
            results.analysis_results.categories_breakdown.get("vulnerability"),
            Some(&1)
        );
        assert!((results.analysis_results.ai_confidence_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn fix_commit_sha_and_message_come_from_the_same_record() {
        use crate::types::FixRecord;
        let record = |summary: &str, sha: Option<&str>| FixRecord {
            filename: "auth.py".into(),
            function_name: "login".into(),
            issue_type: "vulnerability".into(),
            fix_summary: summary.into(),
            confidence: 90,
            lines_affected: "1".into(),
            old_code: "a".into(),
            new_code: "b".into(),
            commit_sha: sha.map(str::to_string),
        };
        let mut p = pipeline_with(true, true);
        p.fix = Some(FixStageResult {
            success: true,
            fixes_applied: 3,
            files_modified: 1,
            commits_made: 2,
            fixes: vec![
                record("first fix", Some("sha-1")),
                record("second fix", Some("sha-2")),
                // Applied but never committed (e.g. stale blob on retry).
                record("third fix", None),
            ],
            errors: Vec::new(),
            duration: 0.5,
        });
        let results = aggregate(&p);
        assert_eq!(results.fix_results.commit_sha.as_deref(), Some("sha-2"));
        assert!(results.fix_results.commit_message.contains("second fix"));
    }

    #[test]
    fn stage_summary_marks_skipped_fix() {
        let mut p = pipeline_with(true, true);
        p.fix = None;
        p.fix_skipped = true;
        let summary = stage_summary(&p);
        assert_eq!(summary["fix"]["status"], "skipped");
    }

    #[test]
    fn envelope_has_fixed_event_type_and_version() {
        let p = pipeline_with(true, true);
        let envelope = ResultsEnvelope::new(aggregate(&p));
        assert_eq!(envelope.event_type, "pipeline_complete");
        assert_eq!(envelope.version, "1.0");
    }

    #[test]
    fn backup_file_name_replaces_slashes() {
        let p = pipeline_with(true, true);
        let envelope = ResultsEnvelope::new(aggregate(&p));
        let dir = tempfile::tempdir().unwrap();
        let sender = ResultsWebhookSender::new("http://127.0.0.1:1/results");
        let path = sender.save_backup_in(dir.path(), &envelope).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("pipeline_results_o_r_3_"));
        assert!(name.ends_with(".json"));
        let body = std::fs::read_to_string(&path).unwrap();
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["event_type"], "pipeline_complete");
    }

    #[test]
    fn pr_comment_mentions_each_stage() {
        let mut p = pipeline_with(true, true);
        p.advance(crate::types::PipelineStage::Complete);
        let comment = build_pr_comment(&p);
        assert!(comment.contains("Build Agent Results"));
        assert!(comment.contains("Analyze Agent Results"));
        assert!(comment.contains("Fix Agent Results"));
        assert!(comment.contains("Test Agent Results"));
        assert!(comment.contains("auth.py:45"));
        assert!(comment.starts_with("# ✅"));
    }
}
