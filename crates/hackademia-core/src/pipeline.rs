use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::agent::{
    AnalyzeAgent, BuildAgent, BuildStageOutput, FixAgent, ProgressReporter, TestAgent,
};
use crate::bus::EventBus;
use crate::config::Config;
use crate::github::SourceHost;
use crate::results::{self, ResultsEnvelope, ResultsWebhookSender};
use crate::types::{
    Event, EventKind, FixStageResult, Pipeline, PipelineStage, TestStageResult, TriggerInfo,
};

/// Commit-message markers identifying commits produced by this system. A
/// `synchronize` whose head commit carries any of them must not start a
/// pipeline.
pub const RECURSION_MARKERS: &[&str] = &[
    "[skip-pipeline]",
    "🤖 AI Fix:",
    "🤖 AI Test:",
    "🤖 AI Refactor:",
    "[ai-generated]",
    "[hackademia-ai]",
];

pub fn is_bot_commit(message: &str) -> bool {
    RECURSION_MARKERS.iter().any(|m| message.contains(m))
}

/// The four stage contracts the orchestrator drives.
pub struct Agents {
    pub build: Arc<dyn BuildAgent>,
    pub analyze: Arc<dyn AnalyzeAgent>,
    pub fix: Arc<dyn FixAgent>,
    pub test: Arc<dyn TestAgent>,
}

/// Owns pipeline lifecycle: sequencing, skip rules, recursion filter, final
/// aggregation and notification. Pipelines run concurrently and share nothing
/// beyond the bus and the source-host adapter.
pub struct Orchestrator {
    pub bus: Arc<EventBus>,
    pub host: Arc<dyn SourceHost>,
    agents: Agents,
    results_sender: ResultsWebhookSender,
    active: Mutex<HashMap<String, Arc<Mutex<Pipeline>>>>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        host: Arc<dyn SourceHost>,
        agents: Agents,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            host,
            agents,
            results_sender: ResultsWebhookSender::new(config.results_webhook_url.clone()),
            active: Mutex::new(HashMap::new()),
        })
    }

    // ── Recursion prevention ─────────────────────────────────────────────

    /// Inspect the head commit of `reference`; `Some(message)` means the
    /// event was produced by this system and must be suppressed. Host errors
    /// are permissive: the pipeline is admitted.
    pub async fn should_suppress(&self, repo: &str, reference: &str) -> Option<String> {
        match self.host.recent_commits(repo, reference, 1).await {
            Ok(commits) => commits
                .first()
                .filter(|c| is_bot_commit(&c.message))
                .map(|c| c.message.clone()),
            Err(e) => {
                warn!(repo, reference, "recursion check failed, admitting: {e}");
                None
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Create a pipeline for a PR event and spawn its execution. Returns the
    /// new pipeline id once the PR metadata is resolved.
    pub async fn start_pipeline(
        self: &Arc<Self>,
        pr_number: u64,
        repo_name: &str,
        trigger: TriggerInfo,
    ) -> Result<String> {
        let pr = self
            .host
            .pull_request(repo_name, pr_number)
            .await
            .with_context(|| format!("could not access PR #{pr_number}"))?;
        let files = self
            .host
            .changed_files(repo_name, pr_number)
            .await
            .unwrap_or_default();

        let pipeline = Pipeline::new(pr_number, repo_name, pr.head_branch, files, trigger);
        let id = pipeline.id.clone();
        info!(pipeline_id = %id, "starting pipeline");

        let handle = Arc::new(Mutex::new(pipeline));
        self.active.lock().await.insert(id.clone(), Arc::clone(&handle));

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(handle).await;
        });

        Ok(id)
    }

    async fn execute(self: Arc<Self>, handle: Arc<Mutex<Pipeline>>) {
        let (id, repo, branch, pr_number) = {
            let p = handle.lock().await;
            (p.id.clone(), p.repo_name.clone(), p.branch.clone(), p.pr_number)
        };

        self.bus
            .publish(
                &id,
                Event::new(EventKind::PipelineStart)
                    .with_message(format!("🚀 Pipeline started for PR #{pr_number}"))
                    .with_details(json!({
                        "repo_name": repo,
                        "pr_number": pr_number,
                        "branch": branch,
                    })),
            )
            .await;

        // ── Build ────────────────────────────────────────────────────────
        {
            let mut p = handle.lock().await;
            p.advance(PipelineStage::Build);
        }
        self.stage_start(&id, PipelineStage::Build, 1, "🔨 Starting build stage...").await;
        let progress = ProgressReporter::new(Arc::clone(&self.bus), &id, PipelineStage::Build);
        let agent = Arc::clone(&self.agents.build);
        let (r, b2, pr2) = (repo.clone(), branch.clone(), pr_number);
        let p2 = progress.clone();
        let build_outcome: Result<BuildStageOutput> = join_agent(tokio::spawn(async move {
            agent.run(&r, &b2, pr2, &p2).await
        }))
        .await;

        let build_ok = match build_outcome {
            Ok(output) => {
                let ok = output.build.success;
                let results = json!({
                    "success": ok,
                    "project_type": output.build.project_type.as_str(),
                    "files_analyzed": output.build.metadata.total_files,
                    "total_functions": output.build.metadata.total_functions,
                    "errors": output.build.errors,
                });
                let duration = output.build.duration;
                {
                    let mut p = handle.lock().await;
                    p.errors.extend(output.build.errors.iter().cloned());
                    p.warnings.extend(output.build.warnings.iter().cloned());
                    p.build = Some(output.build);
                    p.diff = Some(output.diff);
                }
                self.stage_complete(&id, PipelineStage::Build, ok, duration, results).await;
                ok
            }
            Err(e) => {
                self.record_stage_failure(&handle, &id, PipelineStage::Build, &e).await;
                false
            }
        };

        if !build_ok {
            // Build failure is fatal; the remaining stages are skipped.
            handle.lock().await.advance(PipelineStage::Failed);
            self.finalize(&handle).await;
            return;
        }

        // ── Analyze ──────────────────────────────────────────────────────
        {
            let mut p = handle.lock().await;
            p.advance(PipelineStage::Analyze);
        }
        self.stage_start(&id, PipelineStage::Analyze, 2, "🔍 Starting AI-powered code analysis...").await;
        let (diff, build) = {
            let p = handle.lock().await;
            (p.diff.clone(), p.build.clone())
        };
        let (Some(diff), Some(build)) = (diff, build) else {
            handle.lock().await.advance(PipelineStage::Failed);
            self.finalize(&handle).await;
            return;
        };

        let agent = Arc::clone(&self.agents.analyze);
        let progress = ProgressReporter::new(Arc::clone(&self.bus), &id, PipelineStage::Analyze);
        let (d2, b2, p2) = (diff.clone(), build.clone(), progress.clone());
        let analysis = join_agent(tokio::spawn(async move { agent.run(&d2, &b2, &p2).await })).await;

        let (analyze_ok, total_issues) = match analysis {
            Ok(result) => {
                let ok = result.success;
                let total = result.total_issues;
                let projection = json!({
                    "success": ok,
                    "total_issues": total,
                    "vulnerabilities": result.vulnerabilities.len(),
                    "security_issues": result.security_issues.len(),
                    "quality_issues": result.quality_issues.len(),
                    "overall_risk": result.overall_risk.as_str(),
                });
                let duration = result.duration;
                {
                    let mut p = handle.lock().await;
                    p.errors.extend(result.errors.iter().cloned());
                    p.analysis = Some(result);
                }
                self.stage_complete(&id, PipelineStage::Analyze, ok, duration, projection).await;
                (ok, total)
            }
            Err(e) => {
                self.record_stage_failure(&handle, &id, PipelineStage::Analyze, &e).await;
                (false, 0)
            }
        };

        if !analyze_ok {
            handle.lock().await.advance(PipelineStage::Failed);
            self.finalize(&handle).await;
            return;
        }

        // ── Fix (skipped when the analysis came back clean) ──────────────
        if total_issues == 0 {
            info!(pipeline_id = %id, "no issues found, skipping fix stage");
            handle.lock().await.fix_skipped = true;
        } else {
            {
                let mut p = handle.lock().await;
                p.advance(PipelineStage::Fix);
            }
            self.stage_start(&id, PipelineStage::Fix, 3, "🔧 Starting AI-powered code fixing...").await;
            let analysis = {
                let p = handle.lock().await;
                p.analysis.clone()
            };
            let agent = Arc::clone(&self.agents.fix);
            let progress = ProgressReporter::new(Arc::clone(&self.bus), &id, PipelineStage::Fix);
            let (a2, r2, b2, p2) = (
                analysis.unwrap_or_else(|| crate::types::AnalysisResult::failed(String::new())),
                repo.clone(),
                branch.clone(),
                progress.clone(),
            );
            let fix = join_agent(tokio::spawn(async move { agent.run(&a2, &r2, &b2, &p2).await })).await;

            // Any Fix outcome lets the pipeline continue to Test.
            match fix {
                Ok(result) => {
                    let ok = result.success;
                    let projection = json!({
                        "success": ok,
                        "fixes_applied": result.fixes_applied,
                        "files_modified": result.files_modified,
                        "commits_made": result.commits_made,
                        "errors": result.errors,
                    });
                    let duration = result.duration;
                    {
                        let mut p = handle.lock().await;
                        p.errors.extend(result.errors.iter().cloned());
                        p.fix = Some(result);
                    }
                    self.stage_complete(&id, PipelineStage::Fix, ok, duration, projection).await;
                }
                Err(e) => {
                    self.record_stage_failure(&handle, &id, PipelineStage::Fix, &e).await;
                    let mut failed = FixStageResult::empty(0.0);
                    failed.success = false;
                    failed.errors.push(e.to_string());
                    handle.lock().await.fix = Some(failed);
                }
            }
        }

        // ── Test ─────────────────────────────────────────────────────────
        {
            let mut p = handle.lock().await;
            p.advance(PipelineStage::Test);
        }
        self.stage_start(&id, PipelineStage::Test, 4, "🧪 Starting AI-powered test generation...").await;
        let fix_result = {
            let p = handle.lock().await;
            p.fix.clone().unwrap_or_else(|| FixStageResult::empty(0.0))
        };
        let agent = Arc::clone(&self.agents.test);
        let progress = ProgressReporter::new(Arc::clone(&self.bus), &id, PipelineStage::Test);
        let (d2, f2, r2, b2, p2) = (
            diff.clone(),
            fix_result,
            repo.clone(),
            branch.clone(),
            progress.clone(),
        );
        let test = join_agent(tokio::spawn(async move {
            agent.run(&d2, &f2, &r2, &b2, &p2).await
        }))
        .await;

        match test {
            Ok(result) => {
                let status = if result.skipped {
                    "skipped"
                } else if result.success {
                    "success"
                } else {
                    "failed"
                };
                let projection = json!({
                    "status": status,
                    "functions_discovered": result.functions_discovered,
                    "tests_generated": result.tests_generated,
                    "tests_executed": result.tests_executed,
                    "methods_passed": result.methods_passed,
                    "methods_failed": result.methods_failed,
                });
                let duration = result.duration;
                {
                    let mut p = handle.lock().await;
                    p.errors.extend(result.errors.iter().cloned());
                    p.test = Some(result);
                }
                self.bus
                    .publish(
                        &id,
                        Event::new(EventKind::StageComplete)
                            .with_stage(PipelineStage::Test)
                            .with_status(status)
                            .with_duration(duration)
                            .with_results(projection),
                    )
                    .await;
            }
            Err(e) => {
                self.record_stage_failure(&handle, &id, PipelineStage::Test, &e).await;
                let mut failed = TestStageResult::skipped(0.0);
                failed.success = false;
                failed.skipped = false;
                failed.errors.push(e.to_string());
                handle.lock().await.test = Some(failed);
            }
        }

        handle.lock().await.advance(PipelineStage::Complete);
        self.finalize(&handle).await;
    }

    // ── Per-stage protocol helpers ───────────────────────────────────────

    async fn stage_start(&self, id: &str, stage: PipelineStage, index: u8, message: &str) {
        self.bus
            .publish(
                id,
                Event::new(EventKind::StageStart)
                    .with_stage(stage)
                    .with_stage_index(index)
                    .with_message(message),
            )
            .await;
    }

    async fn stage_complete(
        &self,
        id: &str,
        stage: PipelineStage,
        success: bool,
        duration: f64,
        results: Value,
    ) {
        self.bus
            .publish(
                id,
                Event::new(EventKind::StageComplete)
                    .with_stage(stage)
                    .with_status(if success { "success" } else { "failed" })
                    .with_duration(duration)
                    .with_results(results),
            )
            .await;
    }

    /// An `Err` out of an agent (including a caught panic) becomes a failed
    /// stage with the error on the pipeline and an `error` event on the bus.
    async fn record_stage_failure(
        &self,
        handle: &Arc<Mutex<Pipeline>>,
        id: &str,
        stage: PipelineStage,
        e: &anyhow::Error,
    ) {
        error!(pipeline_id = id, stage = stage.as_str(), "stage failed: {e:#}");
        {
            let mut p = handle.lock().await;
            p.errors.push(format!("{} stage failed: {e:#}", stage.as_str()));
        }
        self.bus
            .publish(id, Event::error(stage, format!("{e:#}")))
            .await;
        self.stage_complete(id, stage, false, 0.0, json!({ "error": format!("{e:#}") }))
            .await;
    }

    // ── Terminal aggregation / notification ─────────────────────────────

    async fn finalize(&self, handle: &Arc<Mutex<Pipeline>>) {
        let pipeline = handle.lock().await.clone();
        let id = pipeline.id.clone();

        let comprehensive = results::aggregate(&pipeline);
        let summary = results::stage_summary(&pipeline);
        let status = pipeline.stage.as_str();
        let total_duration = pipeline.duration();

        self.bus
            .publish(
                &id,
                Event::new(EventKind::PipelineComplete)
                    .with_status(status)
                    .with_duration(total_duration)
                    .with_details(json!({ "summary": summary })),
            )
            .await;

        let envelope = ResultsEnvelope::new(comprehensive);
        self.bus
            .publish(
                &id,
                Event::new(EventKind::PipelineResultsComplete).with_details(json!({
                    "comprehensive_results": envelope,
                    "summary": summary,
                })),
            )
            .await;

        // Comment failure is a warning, never a pipeline failure.
        let comment = results::build_pr_comment(&pipeline);
        if let Err(e) = self
            .host
            .post_comment(&pipeline.repo_name, pipeline.pr_number, &comment)
            .await
        {
            warn!(pipeline_id = %id, "failed to post PR comment: {e}");
        } else {
            info!(pipeline_id = %id, "results posted to PR #{}", pipeline.pr_number);
        }

        self.results_sender.deliver(&envelope).await;

        // The workspace belongs to this pipeline until now.
        if let Some(dir) = pipeline.build.as_ref().and_then(|b| b.workspace_dir.clone()) {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(pipeline_id = %id, "workspace cleanup failed: {e}");
            }
        }

        self.active.lock().await.remove(&id);
        info!(pipeline_id = %id, status, "pipeline finished in {total_duration:.2}s");
    }

    // ── Introspection (ingress endpoints) ────────────────────────────────

    pub async fn snapshot(&self, pipeline_id: &str) -> Option<Value> {
        let handle = {
            let active = self.active.lock().await;
            active.get(pipeline_id).cloned()
        }?;
        let p = handle.lock().await;
        Some(json!({
            "pipeline_id": p.id,
            "stage": p.stage.as_str(),
            "pr_number": p.pr_number,
            "repo_name": p.repo_name,
            "duration": p.duration(),
            "results": results::stage_summary(&p),
            "errors": p.errors,
        }))
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

/// Await an agent task, converting a panic into an `Err` so one misbehaving
/// agent fails its stage instead of the process.
async fn join_agent<T>(handle: tokio::task::JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let text = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "agent panicked".to_string());
            Err(anyhow::anyhow!("agent panicked: {text}"))
        }
        Err(join_err) => Err(anyhow::anyhow!("agent task failed: {join_err}")),
    }
}
