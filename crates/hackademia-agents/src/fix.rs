use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use hackademia_core::agent::{FixAgent, ProgressReporter};
use hackademia_core::github::{HostError, SourceHost};
use hackademia_core::types::{AnalysisResult, Event, FixRecord, FixStageResult};

use crate::llm::{extract_json, ChatModel};

/// Fix stage: for every reported issue, reads the current blob, asks the
/// collaborator for a minimal-change proposal, applies it by exact or fuzzy
/// substring replacement and commits with the bot marker message.
pub struct LlmFixAgent {
    model: Arc<dyn ChatModel>,
    host: Arc<dyn SourceHost>,
}

impl LlmFixAgent {
    pub fn new(model: Arc<dyn ChatModel>, host: Arc<dyn SourceHost>) -> Self {
        Self { model, host }
    }
}

fn fix_prompt(filename: &str, content: &str, issue_type: &str, description: &str, line: u32, confidence: u8) -> String {
    format!(
        "You are an expert code security fixer. Fix the following issue with MINIMAL changes.\n\n\
         **Issue Details**:\n\
         - File: {filename}\n\
         - Issue Type: {issue_type}\n\
         - Description: {description}\n\
         - Confidence: {confidence}%\n\
         - Line: {line}\n\n\
         **Current File Content**:\n```\n{content}\n```\n\n\
         **STRICT REQUIREMENTS**:\n\
         1. Apply ONLY the minimal fix needed\n\
         2. Preserve exact code style, indentation, variable names\n\
         3. Keep all existing functionality intact\n\
         4. Identify the exact function/method being fixed\n\n\
         **OUTPUT FORMAT** (JSON only, no explanations):\n\
         {{\n\
           \"function_name\": \"authenticate_user\",\n\
           \"fix_summary\": \"Replace SQL string concatenation with parameterized query\",\n\
           \"issue_type\": \"{issue_type}\",\n\
           \"confidence\": {confidence},\n\
           \"lines_affected\": \"45-47\",\n\
           \"old_code\": \"...exact code being replaced...\",\n\
           \"new_code\": \"...replacement code...\",\n\
           \"explanation\": \"...one sentence...\"\n\
         }}"
    )
}

const REQUIRED_FIELDS: &[&str] = &[
    "function_name",
    "fix_summary",
    "old_code",
    "new_code",
    "lines_affected",
];

fn validate_proposal(v: &Value) -> bool {
    REQUIRED_FIELDS.iter().all(|f| v.get(*f).map(|x| x.is_string()).unwrap_or(false))
}

/// Apply a proposal to the blob. Exact substring replacement first; when the
/// old code is not present verbatim, a line-window scan accepting windows
/// where at least 80% of lines match by trimmed containment.
pub(crate) fn apply_fix(content: &str, old_code: &str, new_code: &str) -> Option<String> {
    if content.contains(old_code) {
        return Some(content.replace(old_code, new_code));
    }

    let lines: Vec<&str> = content.split('\n').collect();
    let old_lines: Vec<&str> = old_code.split('\n').collect();
    if old_lines.is_empty() || lines.len() < old_lines.len() {
        return None;
    }

    for i in 0..=(lines.len() - old_lines.len()) {
        let matched = old_lines
            .iter()
            .enumerate()
            .filter(|(j, old_line)| lines[i + j].trim().contains(old_line.trim()))
            .count();
        if (matched as f64) >= (old_lines.len() as f64) * 0.8 {
            let mut patched: Vec<&str> = Vec::with_capacity(lines.len());
            patched.extend(&lines[..i]);
            patched.extend(new_code.split('\n'));
            patched.extend(&lines[i + old_lines.len()..]);
            return Some(patched.join("\n"));
        }
    }
    None
}

#[async_trait]
impl FixAgent for LlmFixAgent {
    async fn run(
        &self,
        analysis: &AnalysisResult,
        repo_name: &str,
        branch: &str,
        progress: &ProgressReporter,
    ) -> Result<FixStageResult> {
        let started = Instant::now();
        let issues = analysis.all_issues();

        if issues.is_empty() {
            return Ok(FixStageResult::empty(started.elapsed().as_secs_f64()));
        }

        let issue_types: Vec<&str> = issues
            .iter()
            .map(|(_, i)| i.issue_type.as_str())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        progress
            .emit(
                Event::status_update(
                    progress.stage(),
                    format!("🔍 Found {} issues to fix", issues.len()),
                )
                .with_progress(10)
                .with_details(json!({
                    "fixable_issues": issues.len(),
                    "issue_types": issue_types,
                })),
            )
            .await;

        let mut fixes: Vec<FixRecord> = Vec::new();
        let mut files_modified: HashSet<String> = HashSet::new();
        let mut commits_made = 0usize;
        let mut errors: Vec<String> = Vec::new();
        let total = issues.len();

        for (i, (category, issue)) in issues.iter().enumerate() {
            progress
                .update(
                    format!(
                        "🔧 Generating fix {}/{} for {}",
                        i + 1,
                        total,
                        issue.filename
                    ),
                    (15 + i * 60 / total) as u8,
                )
                .await;

            if issue.filename.is_empty() || issue.filename == "unknown" {
                errors.push("Cannot fix issue - filename is missing or unknown".to_string());
                continue;
            }

            // 1. Read the current blob; its sha is the optimistic token.
            let blob = match self.host.read_file(repo_name, &issue.filename, branch).await {
                Ok(blob) => blob,
                Err(e) => {
                    errors.push(format!("Could not retrieve {}: {e}", issue.filename));
                    continue;
                }
            };
            let content = blob.text();

            progress
                .emit(
                    Event::status_update(
                        progress.stage(),
                        format!("🧠 Generating fix for {}...", issue.filename),
                    )
                    .with_progress_tick()
                    .with_details(json!({
                        "current_file": issue.filename,
                        "step": "ai_fix_generation",
                        "issue_type": category,
                    })),
                )
                .await;

            // 2. Minimal-change proposal from the collaborator.
            let response = match self
                .model
                .complete(&fix_prompt(
                    &issue.filename,
                    &content,
                    category,
                    &issue.description,
                    issue.line_number,
                    issue.confidence,
                ))
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    errors.push(format!("Fix generation failed for {}: {e}", issue.filename));
                    continue;
                }
            };
            let Some(proposal) = extract_json(&response).filter(validate_proposal) else {
                warn!(file = %issue.filename, "unparseable fix proposal, skipping");
                errors.push(format!("Unparseable fix proposal for {}", issue.filename));
                continue;
            };

            let old_code = proposal["old_code"].as_str().unwrap_or_default();
            let new_code = proposal["new_code"].as_str().unwrap_or_default();
            let function_name = proposal["function_name"].as_str().unwrap_or("unknown");
            let fix_summary = proposal["fix_summary"].as_str().unwrap_or_default();
            let lines_affected = proposal["lines_affected"].as_str().unwrap_or_default();

            // 3. Identical pre- and post-image is a no-op: reported, not
            // committed.
            if old_code == new_code {
                errors.push(format!(
                    "No-op fix proposed for {} (old and new code identical)",
                    issue.filename
                ));
                continue;
            }

            let Some(patched) = apply_fix(&content, old_code, new_code) else {
                errors.push(format!(
                    "Fix could not be applied to {} - no matching code found",
                    issue.filename
                ));
                continue;
            };
            if patched == content {
                errors.push(format!(
                    "Fix could not be applied to {} - no changes made",
                    issue.filename
                ));
                continue;
            }

            // 4. Commit with the bot marker so the recursion filter catches
            // the resulting synchronize event.
            let message = format!("🤖 AI Fix: {fix_summary} [skip-pipeline]");
            let commit_sha = match self
                .host
                .write_file(repo_name, &issue.filename, &patched, &message, branch, &blob.sha)
                .await
            {
                Ok(outcome) => {
                    commits_made += 1;
                    Some(outcome.commit_sha)
                }
                Err(HostError::StaleBlob(path)) => {
                    warn!(%path, "blob changed under us, skipping fix");
                    errors.push(format!("Stale blob for {path}, fix skipped"));
                    continue;
                }
                Err(e) => {
                    errors.push(format!("Commit failed for {}: {e}", issue.filename));
                    continue;
                }
            };

            files_modified.insert(issue.filename.clone());
            let record = FixRecord {
                filename: issue.filename.clone(),
                function_name: function_name.to_string(),
                issue_type: (*category).to_string(),
                fix_summary: fix_summary.to_string(),
                confidence: issue.confidence,
                lines_affected: lines_affected.to_string(),
                old_code: old_code.to_string(),
                new_code: new_code.to_string(),
                commit_sha,
            };

            progress
                .emit(
                    Event::status_update(
                        progress.stage(),
                        format!("✅ Applied fix to {}() in {}", record.function_name, record.filename),
                    )
                    .with_progress((15 + (i + 1) * 60 / total) as u8)
                    .with_details(json!({
                        "filename": record.filename,
                        "function_name": record.function_name,
                        "fix_summary": record.fix_summary,
                        "issue_type": record.issue_type,
                        "confidence": record.confidence,
                        "lines_changed": record.lines_affected,
                        "commit_sha": record.commit_sha,
                    })),
                )
                .await;
            fixes.push(record);
        }

        info!(
            fixes = fixes.len(),
            files = files_modified.len(),
            commits = commits_made,
            "fix stage completed"
        );

        Ok(FixStageResult {
            success: true,
            fixes_applied: fixes.len(),
            files_modified: files_modified.len(),
            commits_made,
            fixes,
            errors,
            duration: started.elapsed().as_secs_f64(),
        })
    }
}
