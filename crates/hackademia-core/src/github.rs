use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::diff::parse_patch;
use crate::types::{ChangedFile, FileStatus, PrDiff, PrInfo};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "hackademia-pipeline/0.1";

/// Error kinds surfaced by the adapter. Callers branch on these; everything
/// else in the system stays on `anyhow`.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("source-host token is not configured")]
    AuthMissing,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stale blob id for {0}")]
    StaleBlob(String),
    #[error("source-host transport error: {0}")]
    Transport(String),
    #[error("source-host API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl From<reqwest::Error> for HostError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// A file blob read from the host, with its optimistic-concurrency id.
#[derive(Debug, Clone)]
pub struct FileBlob {
    pub content: Vec<u8>,
    pub sha: String,
}

impl FileBlob {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub commit_sha: String,
    pub blob_sha: String,
}

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawRef {
    #[serde(rename = "ref")]
    refname: String,
}

#[derive(Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Deserialize)]
struct RawPull {
    number: u64,
    title: Option<String>,
    body: Option<String>,
    base: RawRef,
    head: RawRef,
    user: RawUser,
}

#[derive(Deserialize)]
struct RawFile {
    filename: String,
    status: FileStatus,
    additions: u32,
    deletions: u32,
    patch: Option<String>,
}

#[derive(Deserialize)]
struct RawContent {
    content: String,
    sha: String,
}

#[derive(Deserialize)]
struct RawCommitAuthor {
    name: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize)]
struct RawCommitInner {
    message: String,
    author: Option<RawCommitAuthor>,
}

#[derive(Deserialize)]
struct RawCommit {
    sha: String,
    commit: RawCommitInner,
}

#[derive(Deserialize)]
struct RawWriteResult {
    commit: RawWriteCommit,
    content: Option<RawWriteContent>,
}

#[derive(Deserialize)]
struct RawWriteCommit {
    sha: String,
}

#[derive(Deserialize)]
struct RawWriteContent {
    sha: String,
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// File extension without the dot; empty when there is none.
pub fn extension_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') => ext.to_string(),
        _ => String::new(),
    }
}

/// Percent-encode each path segment, keeping the separators. Branch names and
/// file paths routinely contain `/`.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn raw_to_changed_file(raw: RawFile) -> ChangedFile {
    let file_extension = extension_of(&raw.filename);
    let is_binary = raw.patch.is_none();
    ChangedFile {
        filename: raw.filename,
        status: raw.status,
        additions: raw.additions,
        deletions: raw.deletions,
        patch: raw.patch,
        file_extension,
        is_binary,
        added_lines: Vec::new(),
        removed_lines: Vec::new(),
        context_lines: Vec::new(),
    }
}

/// The source-host operations the pipeline consumes. The orchestrator and
/// agents depend on this seam; tests substitute it wholesale.
#[async_trait]
pub trait SourceHost: Send + Sync {
    async fn pull_request(&self, repo: &str, pr: u64) -> Result<PrInfo, HostError>;

    /// Changed-file records with patches left unparsed.
    async fn changed_files(&self, repo: &str, pr: u64) -> Result<Vec<ChangedFile>, HostError>;

    async fn read_file(
        &self,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<FileBlob, HostError>;

    /// Commit new content for a path. Fails with `StaleBlob` when
    /// `prior_blob_id` no longer matches the branch head's blob.
    async fn write_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
        prior_blob_id: &str,
    ) -> Result<WriteOutcome, HostError>;

    async fn post_comment(&self, repo: &str, pr: u64, markdown: &str) -> Result<(), HostError>;

    async fn recent_commits(
        &self,
        repo: &str,
        reference: &str,
        limit: u32,
    ) -> Result<Vec<CommitInfo>, HostError>;

    /// PR metadata plus changed files with the three parsed projections.
    async fn pr_diff(&self, repo: &str, pr: u64) -> Result<PrDiff, HostError> {
        let pr_info = self.pull_request(repo, pr).await?;
        let mut changed_files = self.changed_files(repo, pr).await?;
        let mut total_additions = 0;
        let mut total_deletions = 0;
        for file in &mut changed_files {
            total_additions += file.additions;
            total_deletions += file.deletions;
            if let Some(patch) = &file.patch {
                let parsed = parse_patch(patch);
                file.added_lines = parsed.added_lines;
                file.removed_lines = parsed.removed_lines;
                file.context_lines = parsed.context_lines;
            }
        }
        Ok(PrDiff {
            pr_info,
            changed_files,
            total_additions,
            total_deletions,
        })
    }
}

/// Stateless GitHub REST adapter. Authentication is injected at construction;
/// one instance is shared by every pipeline.
pub struct GitHubClient {
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the adapter at a different API base (tests, GHE).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, HostError> {
        if self.token.is_empty() {
            return Err(HostError::AuthMissing);
        }
        Ok(self
            .client
            .request(method, format!("{}{}", self.api_base, path))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(&self.token))
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, HostError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Err(HostError::NotFound(what.to_string())),
            401 => Err(HostError::AuthMissing),
            s => Err(HostError::Api { status: s, body }),
        }
    }

}

#[async_trait]
impl SourceHost for GitHubClient {
    async fn pull_request(&self, repo: &str, pr: u64) -> Result<PrInfo, HostError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/repos/{repo}/pulls/{pr}"))?
            .send()
            .await?;
        let raw: RawPull = Self::check(resp, &format!("{repo}#{pr}"))
            .await?
            .json()
            .await?;
        Ok(PrInfo {
            number: raw.number,
            title: raw.title.unwrap_or_default(),
            body: raw.body.unwrap_or_default(),
            base_branch: raw.base.refname,
            head_branch: raw.head.refname,
            author: raw.user.login,
        })
    }

    async fn changed_files(&self, repo: &str, pr: u64) -> Result<Vec<ChangedFile>, HostError> {
        let mut files = Vec::new();
        let mut page = 1u32;
        loop {
            let resp = self
                .request(
                    reqwest::Method::GET,
                    &format!("/repos/{repo}/pulls/{pr}/files?per_page=100&page={page}"),
                )?
                .send()
                .await?;
            let batch: Vec<RawFile> = Self::check(resp, &format!("{repo}#{pr} files"))
                .await?
                .json()
                .await?;
            let len = batch.len();
            files.extend(batch.into_iter().map(raw_to_changed_file));
            if len < 100 {
                break;
            }
            page += 1;
        }
        Ok(files)
    }

    async fn read_file(
        &self,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<FileBlob, HostError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/repos/{repo}/contents/{}?ref={}",
                    encode_path(path),
                    urlencoding::encode(reference)
                ),
            )?
            .send()
            .await?;
        let raw: RawContent = Self::check(resp, &format!("{repo}:{path}@{reference}"))
            .await?
            .json()
            .await?;
        let packed: String = raw.content.chars().filter(|c| !c.is_whitespace()).collect();
        let content = BASE64
            .decode(packed.as_bytes())
            .map_err(|e| HostError::Transport(format!("blob decode for {path}: {e}")))?;
        Ok(FileBlob {
            content,
            sha: raw.sha,
        })
    }

    async fn write_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
        prior_blob_id: &str,
    ) -> Result<WriteOutcome, HostError> {
        let body = json!({
            "message": message,
            "content": BASE64.encode(content.as_bytes()),
            "sha": prior_blob_id,
            "branch": branch,
        });
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{repo}/contents/{}", encode_path(path)),
            )?
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status == 409 || status == 422 {
            let body = resp.text().await.unwrap_or_default();
            warn!(repo, path, status, "write_file rejected: {body}");
            return Err(HostError::StaleBlob(path.to_string()));
        }
        let raw: RawWriteResult = Self::check(resp, &format!("{repo}:{path}"))
            .await?
            .json()
            .await?;
        Ok(WriteOutcome {
            commit_sha: raw.commit.sha,
            blob_sha: raw.content.map(|c| c.sha).unwrap_or_default(),
        })
    }

    async fn post_comment(&self, repo: &str, pr: u64, markdown: &str) -> Result<(), HostError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{pr}/comments"),
            )?
            .json(&json!({ "body": markdown }))
            .send()
            .await?;
        Self::check(resp, &format!("{repo}#{pr} comment")).await?;
        Ok(())
    }

    async fn recent_commits(
        &self,
        repo: &str,
        reference: &str,
        limit: u32,
    ) -> Result<Vec<CommitInfo>, HostError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/repos/{repo}/commits?sha={}&per_page={limit}",
                    urlencoding::encode(reference)
                ),
            )?
            .send()
            .await?;
        let raw: Vec<RawCommit> = Self::check(resp, &format!("{repo}@{reference}"))
            .await?
            .json()
            .await?;
        Ok(raw
            .into_iter()
            .map(|c| CommitInfo {
                sha: c.sha,
                message: c.commit.message,
                author_name: c
                    .commit
                    .author
                    .as_ref()
                    .and_then(|a| a.name.clone())
                    .unwrap_or_default(),
                author_email: c
                    .commit
                    .author
                    .and_then(|a| a.email)
                    .unwrap_or_default(),
            })
            .collect())
    }
}
