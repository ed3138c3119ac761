use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use hackademia_core::agent::{BuildAgent, BuildStageOutput, ProgressReporter};
use hackademia_core::github::SourceHost;
use hackademia_core::workspace::WorkspaceManager;

/// Build stage: a thin wrapper over the workspace manager that also fetches
/// the parsed PR diff once, for every later stage to consume.
pub struct WorkspaceBuildAgent {
    workspace: WorkspaceManager,
    host: Arc<dyn SourceHost>,
}

impl WorkspaceBuildAgent {
    pub fn new(workspace: WorkspaceManager, host: Arc<dyn SourceHost>) -> Self {
        Self { workspace, host }
    }
}

#[async_trait]
impl BuildAgent for WorkspaceBuildAgent {
    async fn run(
        &self,
        repo_name: &str,
        branch: &str,
        pr_number: u64,
        progress: &ProgressReporter,
    ) -> Result<BuildStageOutput> {
        let diff = self
            .host
            .pr_diff(repo_name, pr_number)
            .await
            .with_context(|| format!("fetching diff for {repo_name}#{pr_number}"))?;
        let build = self
            .workspace
            .materialize(repo_name, branch, pr_number, progress)
            .await;
        Ok(BuildStageOutput { build, diff })
    }
}
