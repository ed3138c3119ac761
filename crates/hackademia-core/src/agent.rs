use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::bus::EventBus;
use crate::types::{
    AnalysisResult, BuildResult, Event, EventKind, FixStageResult, PipelineStage, PrDiff,
    TestStageResult,
};

/// Handle agents publish progress through. Every event lands on the owning
/// pipeline's bus topic (and the `all_pipelines` sentinel).
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<EventBus>,
    pipeline_id: String,
    stage: PipelineStage,
}

impl ProgressReporter {
    pub fn new(bus: Arc<EventBus>, pipeline_id: impl Into<String>, stage: PipelineStage) -> Self {
        Self {
            bus,
            pipeline_id: pipeline_id.into(),
            stage,
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Publish an event, stamping the stage tag when the caller left it unset.
    pub async fn emit(&self, mut event: Event) {
        if event.stage.is_none() {
            event.stage = Some(self.stage);
        }
        self.bus.publish(&self.pipeline_id, event).await;
    }

    /// `status_update` with integer progress.
    pub async fn update(&self, message: impl Into<String>, progress: u8) {
        self.emit(Event::status_update(self.stage, message).with_progress(progress))
            .await;
    }

    /// `status_update` with `progress: null` (sub-step tick).
    pub async fn tick(&self, message: impl Into<String>) {
        self.emit(Event::status_update(self.stage, message).with_progress_tick())
            .await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.emit(Event::new(EventKind::Error).with_message(message))
            .await;
    }
}

/// Output of the Build stage: the materialized-workspace record plus the
/// parsed PR diff the later stages consume.
#[derive(Debug, Clone)]
pub struct BuildStageOutput {
    pub build: BuildResult,
    pub diff: PrDiff,
}

// The orchestrator depends only on these four contracts. Agents do not raise
// domain failures: they come back as `success = false` with populated error
// lists. A returned `Err` is an agent-infrastructure defect and is converted
// by the orchestrator into a failed stage.

#[async_trait]
pub trait BuildAgent: Send + Sync {
    async fn run(
        &self,
        repo_name: &str,
        branch: &str,
        pr_number: u64,
        progress: &ProgressReporter,
    ) -> Result<BuildStageOutput>;
}

#[async_trait]
pub trait AnalyzeAgent: Send + Sync {
    async fn run(
        &self,
        diff: &PrDiff,
        build: &BuildResult,
        progress: &ProgressReporter,
    ) -> Result<AnalysisResult>;
}

#[async_trait]
pub trait FixAgent: Send + Sync {
    async fn run(
        &self,
        analysis: &AnalysisResult,
        repo_name: &str,
        branch: &str,
        progress: &ProgressReporter,
    ) -> Result<FixStageResult>;
}

#[async_trait]
pub trait TestAgent: Send + Sync {
    async fn run(
        &self,
        diff: &PrDiff,
        fix: &FixStageResult,
        repo_name: &str,
        branch: &str,
        progress: &ProgressReporter,
    ) -> Result<TestStageResult>;
}
