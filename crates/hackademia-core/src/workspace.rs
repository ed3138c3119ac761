use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::agent::ProgressReporter;
use crate::pyast;
use crate::types::{BuildMetadata, BuildResult, FileInfo, ProjectKind};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["py", "js", "ts", "java", "cpp", "c"];
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", "dist", "build"];
const ERROR_TAIL_LINES: usize = 20;

fn js_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r#"(?:import|require)\s*\(?['"]([^'"]+)['"]"#).unwrap()
    })
}

#[derive(Debug)]
struct CommandOutcome {
    exit_code: i32,
    timed_out: bool,
    tail: Vec<String>,
}

impl CommandOutcome {
    fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Materializes a PR branch into an ephemeral workspace: shallow clone,
/// project-kind probe, best-effort dependency install and build, then a
/// static-analysis walk that feeds the per-file symbol tables.
pub struct WorkspaceManager {
    token: String,
    command_timeout: Duration,
}

impl WorkspaceManager {
    pub fn new(token: impl Into<String>, command_timeout_s: u64) -> Self {
        Self {
            token: token.into(),
            command_timeout: Duration::from_secs(command_timeout_s),
        }
    }

    pub async fn materialize(
        &self,
        repo_name: &str,
        branch: &str,
        pr_number: u64,
        progress: &ProgressReporter,
    ) -> BuildResult {
        let started = Instant::now();
        let mut logs: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        log(&mut logs, progress, format!("Starting build for PR #{pr_number} (branch {branch})"), Some(5)).await;

        // 1. Shallow clone. Failure here is fatal for the stage.
        let workspace = match self.clone_repository(repo_name, branch, &mut logs, progress).await {
            Ok(dir) => dir,
            Err((dir, e)) => {
                if let Some(dir) = dir {
                    std::fs::remove_dir_all(dir).ok();
                }
                let msg = format!("Repository clone failed: {e}");
                log(&mut logs, progress, msg.clone(), Some(100)).await;
                let mut result = BuildResult::clone_failure(msg, logs);
                result.duration = started.elapsed().as_secs_f64();
                return result;
            }
        };
        log(&mut logs, progress, "Repository cloned".to_string(), Some(20)).await;

        // 2. Project-kind probe.
        let project_type = detect_project_type(&workspace);
        log(&mut logs, progress, format!("Detected project type: {}", project_type.as_str()), Some(30)).await;

        // 3. Dependency install, best-effort.
        match self.install_dependencies(&workspace, project_type, &mut logs, progress).await {
            Ok(true) => log(&mut logs, progress, "Dependencies installed".to_string(), Some(45)).await,
            Ok(false) => {
                warnings.push("Some dependency installation steps failed".to_string());
                log(&mut logs, progress, "Dependency installation issues (continuing)".to_string(), Some(45)).await;
            }
            Err(e) => {
                warnings.push(format!("Dependency installation error: {e}"));
                log(&mut logs, progress, format!("Dependency installation error: {e}"), Some(45)).await;
            }
        }

        // 4. Build, best-effort.
        match self.run_project_build(&workspace, project_type, &mut logs, progress).await {
            Ok(true) => log(&mut logs, progress, "Build succeeded".to_string(), Some(70)).await,
            Ok(false) => {
                warnings.push("Build commands failed; proceeding with analysis".to_string());
                log(&mut logs, progress, "Build commands failed; continuing".to_string(), Some(70)).await;
            }
            Err(e) => {
                warnings.push(format!("Build execution error: {e}"));
                log(&mut logs, progress, format!("Build execution error: {e}"), Some(70)).await;
            }
        }

        // 5. Static analysis walk.
        log(&mut logs, progress, "Analyzing code files...".to_string(), Some(85)).await;
        let walk = walk_workspace(&workspace, &mut warnings, &mut errors);
        log(&mut logs, progress, "Analysis complete".to_string(), Some(95)).await;

        let success = errors.is_empty();
        log(
            &mut logs,
            progress,
            if success { "Build completed".to_string() } else { "Build finished with errors".to_string() },
            Some(100),
        )
        .await;

        let metadata = BuildMetadata {
            total_files: walk.file_info.len(),
            supported_files: walk.file_info.len(),
            total_functions: walk.file_info.values().map(|f| f.functions.len()).sum(),
            total_classes: walk.file_info.values().map(|f| f.classes.len()).sum(),
            unique_dependencies: walk.dependencies.len(),
        };

        BuildResult {
            success,
            project_type,
            dependencies: walk.dependencies,
            file_info: walk.file_info,
            metadata,
            errors,
            warnings,
            build_logs: logs,
            workspace_dir: Some(workspace),
            duration: started.elapsed().as_secs_f64(),
        }
    }

    /// On failure the partially created workspace path (if any) rides along
    /// so the caller can remove it.
    async fn clone_repository(
        &self,
        repo_name: &str,
        branch: &str,
        logs: &mut Vec<String>,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, (Option<PathBuf>, anyhow::Error)> {
        if !repo_name.contains('/') {
            return Err((
                None,
                anyhow::anyhow!("invalid repo name '{repo_name}' (expected 'owner/repo')"),
            ));
        }
        let dir = tempfile::Builder::new()
            .prefix("build_agent_")
            .tempdir()
            .map_err(|e| (None, e.into()))?;
        // The pipeline owns the directory until terminal cleanup.
        let workspace = dir.keep();

        let url = if self.token.is_empty() {
            format!("https://github.com/{repo_name}.git")
        } else {
            format!("https://{}@github.com/{repo_name}.git", self.token)
        };
        log(
            logs,
            progress,
            format!("Running: git clone --depth 1 --branch {branch} [AUTHENTICATED_URL]"),
            None,
        )
        .await;

        let target = workspace.to_string_lossy().into_owned();
        let outcome = self
            .run_command(
                "git",
                &["clone", "--depth", "1", "--branch", branch, &url, &target],
                Path::new("."),
                logs,
                progress,
                "git clone",
            )
            .await
            .map_err(|e| (Some(workspace.clone()), e))?;

        if outcome.timed_out {
            return Err((
                Some(workspace),
                anyhow::anyhow!("git clone timed out for {repo_name}@{branch}"),
            ));
        }
        if !outcome.success() {
            let tail = outcome.tail.join("\n");
            let detail = if tail.trim().is_empty() {
                "no output from git command (check repo name / branch / token permissions)".to_string()
            } else {
                tail
            };
            return Err((
                Some(workspace),
                anyhow::anyhow!(
                    "git clone failed (exit {}) for {repo_name}@{branch}: {detail}",
                    outcome.exit_code
                ),
            ));
        }
        let mut entries = match std::fs::read_dir(&workspace) {
            Ok(entries) => entries,
            Err(e) => return Err((Some(workspace), e.into())),
        };
        if entries.next().is_none() {
            return Err((
                Some(workspace),
                anyhow::anyhow!("repository cloned but directory is empty"),
            ));
        }
        Ok(workspace)
    }

    async fn install_dependencies(
        &self,
        root: &Path,
        project_type: ProjectKind,
        logs: &mut Vec<String>,
        progress: &ProgressReporter,
    ) -> anyhow::Result<bool> {
        match project_type {
            ProjectKind::Python => {
                if root.join("requirements.txt").exists() {
                    let outcome = self
                        .run_command(
                            "pip",
                            &["install", "-r", "requirements.txt"],
                            root,
                            logs,
                            progress,
                            "pip install",
                        )
                        .await?;
                    return Ok(outcome.success());
                }
                Ok(true)
            }
            ProjectKind::Node => {
                if root.join("package.json").exists() {
                    let outcome = self
                        .run_command(
                            "npm",
                            &["install", "--no-audit", "--no-fund"],
                            root,
                            logs,
                            progress,
                            "npm install",
                        )
                        .await?;
                    return Ok(outcome.success());
                }
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    async fn run_project_build(
        &self,
        root: &Path,
        project_type: ProjectKind,
        logs: &mut Vec<String>,
        progress: &ProgressReporter,
    ) -> anyhow::Result<bool> {
        match project_type {
            ProjectKind::Python => {
                let modern = self
                    .run_command("python", &["-m", "build"], root, logs, progress, "python build")
                    .await?;
                if modern.success() {
                    return Ok(true);
                }
                let legacy = self
                    .run_command(
                        "python",
                        &["setup.py", "build"],
                        root,
                        logs,
                        progress,
                        "python build",
                    )
                    .await?;
                Ok(legacy.success())
            }
            ProjectKind::Node => {
                let package_json = root.join("package.json");
                if !package_json.exists() {
                    return Ok(false);
                }
                let data = std::fs::read_to_string(&package_json)?;
                let parsed: serde_json::Value = serde_json::from_str(&data)?;
                if parsed["scripts"]["build"].is_string() {
                    let outcome = self
                        .run_command("npm", &["run", "build"], root, logs, progress, "npm build")
                        .await?;
                    return Ok(outcome.success());
                }
                Ok(false)
            }
            _ => {
                // A generic project with no Makefile still counts as built.
                let _ = self
                    .run_command("make", &["build"], root, logs, progress, "generic build")
                    .await?;
                Ok(true)
            }
        }
    }

    /// Spawn a child command, streaming every stdout/stderr line through the
    /// progress callback and into the build log, under the hard timeout.
    async fn run_command(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
        logs: &mut Vec<String>,
        progress: &ProgressReporter,
        label: &str,
    ) -> anyhow::Result<CommandOutcome> {
        log(logs, progress, format!("Running: {program} {}", args.join(" ")), None).await;

        let spawned = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log(logs, progress, format!("Command not found: {program}"), None).await;
                return Ok(CommandOutcome {
                    exit_code: 127,
                    timed_out: false,
                    tail: vec![format!("command not found: {program}")],
                });
            }
            Err(e) => return Err(e.into()),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to take stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to take stderr"))?;
        let mut tail: VecDeque<String> = VecDeque::new();

        let io_future = async {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_done = false;
            let mut err_done = false;
            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line {
                        Ok(Some(l)) => {
                            push_tail(&mut tail, &l);
                            log(logs, progress, format!("{label}: {l}"), None).await;
                        }
                        _ => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line {
                        Ok(Some(l)) => {
                            push_tail(&mut tail, &l);
                            log(logs, progress, format!("{label} [stderr]: {l}"), None).await;
                        }
                        _ => err_done = true,
                    },
                }
            }
            child.wait().await
        };

        match tokio::time::timeout(self.command_timeout, io_future).await {
            Ok(status) => {
                let status = status?;
                let exit_code = status.code().unwrap_or(1);
                if exit_code != 0 {
                    log(logs, progress, format!("{label} failed with exit {exit_code}"), None).await;
                }
                Ok(CommandOutcome {
                    exit_code,
                    timed_out: false,
                    tail: tail.into_iter().collect(),
                })
            }
            Err(_) => {
                warn!(label, timeout_s = self.command_timeout.as_secs(), "command timed out");
                log(logs, progress, format!("{label} timed out after {}s", self.command_timeout.as_secs()), None).await;
                Ok(CommandOutcome {
                    exit_code: 1,
                    timed_out: true,
                    tail: tail.into_iter().collect(),
                })
            }
        }
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: &str) {
    tail.push_back(line.to_string());
    if tail.len() > ERROR_TAIL_LINES {
        tail.pop_front();
    }
}

async fn log(logs: &mut Vec<String>, progress: &ProgressReporter, message: String, pct: Option<u8>) {
    let clean = message.replace('\n', " ").trim().to_string();
    logs.push(clean.clone());
    match pct {
        Some(p) => progress.update(clean, p).await,
        None => progress.tick(clean).await,
    }
}

/// File-probe project-kind detection.
pub fn detect_project_type(root: &Path) -> ProjectKind {
    if root.join("pyproject.toml").exists() || root.join("requirements.txt").exists() {
        return ProjectKind::Python;
    }
    if root.join("package.json").exists() {
        return ProjectKind::Node;
    }
    ProjectKind::Generic
}

struct WalkOutput {
    file_info: std::collections::HashMap<String, FileInfo>,
    dependencies: Vec<String>,
}

/// Walk the workspace, skipping vendored/build directories, and compute the
/// static metadata for every supported-extension file.
fn walk_workspace(root: &Path, warnings: &mut Vec<String>, errors: &mut Vec<String>) -> WalkOutput {
    let mut files = Vec::new();
    collect_files(root, &mut files);

    let mut file_info = std::collections::HashMap::new();
    let mut all_deps: HashSet<String> = HashSet::new();

    for path in files {
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            warnings.push(format!("Unsupported file type: {rel}"));
            continue;
        }
        let content = match std::fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warnings.push(format!("Could not read {rel}: {e}"));
                continue;
            }
        };

        let mut info = FileInfo {
            size: content.len(),
            lines: content.lines().count(),
            extension: ext.clone(),
            ..FileInfo::default()
        };

        match ext.as_str() {
            "py" => match pyast::analyze_source(&content) {
                Ok(module) if module.has_errors => {
                    let msg = format!("Syntax error in {rel}");
                    info.errors.push(msg.clone());
                    errors.push(msg);
                }
                Ok(module) => {
                    info.dependencies = module.top_level_dependencies();
                    info.complexity_score = module.complexity_score();
                    info.functions = module.functions;
                    info.classes = module.classes;
                    info.imports = module.imports;
                }
                Err(e) => {
                    let msg = format!("Parse error in {rel}: {e}");
                    info.errors.push(msg.clone());
                    errors.push(msg);
                }
            },
            "js" | "ts" => {
                info.dependencies = js_import_re()
                    .captures_iter(&content)
                    .map(|c| c[1].to_string())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
            }
            _ => {}
        }

        for dep in &info.dependencies {
            all_deps.insert(dep.clone());
        }
        file_info.insert(rel, info);
    }

    info!(files = file_info.len(), deps = all_deps.len(), "workspace walk complete");
    let mut dependencies: Vec<String> = all_deps.into_iter().collect();
    dependencies.sort();
    WalkOutput {
        file_info,
        dependencies,
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}
