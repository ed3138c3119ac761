use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use hackademia_core::agent::{AnalyzeAgent, ProgressReporter};
use hackademia_core::types::{
    AnalysisResult, BuildResult, ChangedFile, Event, FileStatus, Issue, PrDiff, Severity,
};
use hackademia_core::workspace::SUPPORTED_EXTENSIONS;

use crate::llm::{extract_json, ChatModel};

/// Analyze stage: classifies the changed lines of every supported code file
/// into vulnerabilities, security issues and quality issues via an LLM
/// collaborator.
pub struct LlmAnalyzeAgent {
    model: Arc<dyn ChatModel>,
}

impl LlmAnalyzeAgent {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

/// Supported code files with real content changes: added or modified, not
/// binary.
fn filter_code_files(files: &[ChangedFile]) -> Vec<&ChangedFile> {
    files
        .iter()
        .filter(|f| {
            SUPPORTED_EXTENSIONS.contains(&f.file_extension.as_str())
                && !f.is_binary
                && matches!(f.status, FileStatus::Added | FileStatus::Modified)
        })
        .collect()
}

/// The code window submitted for one file: the trailing context lines
/// followed by every added line, each tagged with its new line number.
fn build_code_snippet(file: &ChangedFile) -> String {
    let mut lines = Vec::new();
    let context_tail = file.context_lines.len().saturating_sub(3);
    for line in &file.context_lines[context_tail..] {
        lines.push(format!("  {}: {}", line.new_line_number, line.content));
    }
    for line in &file.added_lines {
        lines.push(format!("+ {}: {}", line.line_number, line.content));
    }
    lines.join("\n")
}

fn analysis_prompt(file: &ChangedFile, snippet: &str, build: &BuildResult) -> String {
    let deps: Vec<&str> = build.dependencies.iter().take(5).map(String::as_str).collect();
    format!(
        "You are a senior security engineer analyzing code changes in a pull request.\n\n\
         **File**: {filename}\n\
         **Language**: {ext}\n\n\
         **Code Changes (NEW LINES ONLY):**\n```\n{snippet}\n```\n\n\
         **Build Context:**\n\
         - Project Type: {project}\n\
         - Dependencies: {deps}\n\n\
         Identify security vulnerabilities, security issues and code quality problems \
         in the NEW lines only. Be specific about line numbers.\n\n\
         Respond with ONLY a JSON object of this exact shape:\n\
         {{\n\
           \"vulnerabilities\": [{{\"type\": \"SQL_INJECTION\", \"severity\": \"HIGH|MEDIUM|LOW\", \
         \"line_number\": 123, \"description\": \"...\", \"code_snippet\": \"...\", \
         \"recommendation\": \"...\", \"confidence\": 90}}],\n\
           \"security_issues\": [{{\"type\": \"...\", \"severity\": \"HIGH|MEDIUM|LOW\", \
         \"line_number\": 1, \"description\": \"...\", \"recommendation\": \"...\", \"confidence\": 80}}],\n\
           \"quality_issues\": [{{\"type\": \"CODE_SMELL\", \"severity\": \"MEDIUM|LOW\", \
         \"line_number\": 1, \"description\": \"...\", \"recommendation\": \"...\", \"confidence\": 70}}],\n\
           \"recommendations\": [\"...\"]\n\
         }}\n\n\
         Keep descriptions under 200 characters, with no line breaks inside JSON strings.",
        filename = file.filename,
        ext = file.file_extension,
        snippet = snippet,
        project = build.project_type.as_str(),
        deps = deps.join(", "),
    )
}

fn parse_severity(v: &Value) -> Severity {
    match v.as_str().unwrap_or("MEDIUM") {
        "HIGH" => Severity::High,
        "LOW" => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Every returned issue is stamped with the input file's name; the
/// collaborator is not trusted to tag files correctly.
fn parse_issues(list: Option<&Value>, filename: &str) -> Vec<Issue> {
    let Some(items) = list.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let description = item["description"].as_str()?.to_string();
            Some(Issue {
                issue_type: item["type"].as_str().unwrap_or("UNKNOWN").to_string(),
                severity: parse_severity(&item["severity"]),
                filename: filename.to_string(),
                line_number: item["line_number"].as_u64().unwrap_or(0) as u32,
                description,
                recommendation: item["recommendation"].as_str().map(str::to_string),
                code_snippet: item["code_snippet"].as_str().map(str::to_string),
                confidence: item["confidence"].as_u64().unwrap_or(0).min(100) as u8,
            })
        })
        .collect()
}

/// Overall risk: any HIGH item wins, then more than two MEDIUMs or more than
/// five issues of any kind, then LOW.
fn overall_risk(result: &AnalysisResult) -> Severity {
    let high = result
        .vulnerabilities
        .iter()
        .chain(&result.security_issues)
        .filter(|i| i.severity == Severity::High)
        .count();
    let medium = result
        .vulnerabilities
        .iter()
        .chain(&result.security_issues)
        .filter(|i| i.severity == Severity::Medium)
        .count();
    if high > 0 {
        Severity::High
    } else if medium > 2 || result.total_issues > 5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[async_trait]
impl AnalyzeAgent for LlmAnalyzeAgent {
    async fn run(
        &self,
        diff: &PrDiff,
        build: &BuildResult,
        progress: &ProgressReporter,
    ) -> Result<AnalysisResult> {
        let started = Instant::now();
        progress.update("🔍 Starting AI-powered code analysis...", 5).await;
        progress.update("📂 Scanning changed files for analysis...", 10).await;

        let code_files = filter_code_files(&diff.changed_files);
        let preview: Vec<&str> = code_files.iter().take(5).map(|f| f.filename.as_str()).collect();
        progress
            .emit(
                Event::status_update(
                    progress.stage(),
                    format!("📊 Found {} code files to analyze", code_files.len()),
                )
                .with_progress(15)
                .with_details(json!({
                    "files_changed": diff.changed_files.len(),
                    "code_files_to_analyze": code_files.len(),
                    "files_filtered": preview,
                })),
            )
            .await;

        let mut result = AnalysisResult {
            success: true,
            vulnerabilities: Vec::new(),
            security_issues: Vec::new(),
            quality_issues: Vec::new(),
            recommendations: Vec::new(),
            overall_risk: Severity::Low,
            files_analyzed: code_files.len(),
            total_issues: 0,
            errors: Vec::new(),
            duration: 0.0,
        };

        if code_files.is_empty() {
            result.recommendations.push("No code files found to analyze".to_string());
            result.duration = started.elapsed().as_secs_f64();
            return Ok(result);
        }

        progress
            .update(format!("📂 Analyzing {} code files...", code_files.len()), 30)
            .await;

        let total = code_files.len();
        for (i, file) in code_files.iter().enumerate() {
            progress
                .emit(
                    Event::status_update(
                        progress.stage(),
                        format!("🔍 Analyzing file {}/{}: {}", i + 1, total, file.filename),
                    )
                    .with_progress((30 + i * 40 / total) as u8)
                    .with_details(json!({
                        "current_file": file.filename,
                        "files_completed": i,
                        "total_files": total,
                    })),
                )
                .await;

            if file.added_lines.is_empty() {
                continue;
            }

            let snippet = build_code_snippet(file);
            let prompt = analysis_prompt(file, &snippet, build);
            progress
                .tick(format!("🧠 Analyzing security of {}...", file.filename))
                .await;

            // A collaborator transport failure degrades the whole stage; a
            // malformed response only skips this file's findings.
            let response = match self.model.complete(&prompt).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(file = %file.filename, "analysis collaborator unavailable: {e}");
                    result.success = false;
                    result.errors.push(format!("Analysis failed: {e}"));
                    result.duration = started.elapsed().as_secs_f64();
                    return Ok(result);
                }
            };

            let Some(parsed) = extract_json(&response) else {
                warn!(file = %file.filename, "unparseable analysis response, skipping file");
                continue;
            };

            result
                .vulnerabilities
                .extend(parse_issues(parsed.get("vulnerabilities"), &file.filename));
            result
                .security_issues
                .extend(parse_issues(parsed.get("security_issues"), &file.filename));
            result
                .quality_issues
                .extend(parse_issues(parsed.get("quality_issues"), &file.filename));
            if let Some(recs) = parsed.get("recommendations").and_then(Value::as_array) {
                result
                    .recommendations
                    .extend(recs.iter().filter_map(|r| r.as_str().map(str::to_string)));
            }

            progress
                .update(
                    format!("✅ Analyzed {}", file.filename),
                    (30 + (i + 1) * 40 / total) as u8,
                )
                .await;
        }

        result.total_issues = result.vulnerabilities.len()
            + result.security_issues.len()
            + result.quality_issues.len();
        result.overall_risk = overall_risk(&result);
        result.duration = started.elapsed().as_secs_f64();

        let high = result
            .all_issues()
            .iter()
            .filter(|(_, i)| i.severity == Severity::High)
            .count();
        progress
            .emit(
                Event::status_update(
                    progress.stage(),
                    "📊 Security analysis complete - compiling results...",
                )
                .with_progress(90)
                .with_details(json!({
                    "vulnerabilities_found": result.vulnerabilities.len(),
                    "security_issues_found": result.security_issues.len(),
                    "quality_issues_found": result.quality_issues.len(),
                    "total_issues": result.total_issues,
                    "overall_risk": result.overall_risk.as_str(),
                    "high_severity": high,
                    "files_analyzed": result.files_analyzed,
                })),
            )
            .await;

        info!(issues = result.total_issues, "analysis completed");
        Ok(result)
    }
}
