use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::types::{now_ts, Event, EventKind};

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    pub is_running: bool,
    pub start_time: f64,
    pub exit_code: Option<i32>,
    pub connections: usize,
}

struct Session {
    command: String,
    cwd: String,
    started_at: f64,
    pid: Option<u32>,
    running: Arc<AtomicBool>,
    exit_code: Arc<std::sync::Mutex<Option<i32>>>,
}

/// Spawns one child process per session and streams its stdout/stderr
/// line-by-line as `terminal_output` events on the session's bus topic.
///
/// Exactly one `terminal_start` and at most one `terminal_end` are published
/// per session; spawn failures publish nothing and return an error.
pub struct TerminalManager {
    bus: Arc<EventBus>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl TerminalManager {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start(
        self: &Arc<Self>,
        session_id: &str,
        command: &str,
        cwd: Option<String>,
    ) -> Result<()> {
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(session_id) {
                anyhow::bail!("terminal session {session_id} already exists");
            }
        }
        let cwd = cwd.unwrap_or_else(|| ".".to_string());

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn terminal session {session_id}"))?;

        let stdout = child.stdout.take().context("terminal stdout unavailable")?;
        let stderr = child.stderr.take().context("terminal stderr unavailable")?;

        let running = Arc::new(AtomicBool::new(true));
        let exit_code = Arc::new(std::sync::Mutex::new(None));
        let started_at = now_ts();

        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                session_id.to_string(),
                Session {
                    command: command.to_string(),
                    cwd: cwd.clone(),
                    started_at,
                    pid: child.id(),
                    running: Arc::clone(&running),
                    exit_code: Arc::clone(&exit_code),
                },
            );
        }

        info!(session_id, command, "terminal session started");
        self.bus
            .publish_terminal(
                session_id,
                Event::new(EventKind::TerminalStart)
                    .with_details(serde_json::json!({ "command": command, "cwd": cwd })),
            )
            .await;

        let bus = Arc::clone(&self.bus);
        let sid = session_id.to_string();
        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_done = false;
            let mut err_done = false;

            // Output events go out in arrival order; per stream that is the
            // order the child produced them.
            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line {
                        Ok(Some(l)) => publish_output(&bus, &sid, "stdout", &l).await,
                        _ => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line {
                        Ok(Some(l)) => publish_output(&bus, &sid, "stderr", &l).await,
                        _ => err_done = true,
                    },
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(session_id = %sid, "terminal wait failed: {e}");
                    -1
                }
            };
            publish_output(
                &bus,
                &sid,
                "system",
                &format!("[Process completed with exit code: {code}]"),
            )
            .await;

            *exit_code.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
            running.store(false, Ordering::Release);

            let mut end = Event::new(EventKind::TerminalEnd)
                .with_duration(now_ts() - started_at);
            end.exit_code = Some(code);
            bus.publish_terminal(&sid, end).await;
            info!(session_id = %sid, code, "terminal session completed");
        });

        Ok(())
    }

    /// Send SIGTERM. The runner task still publishes the trailing
    /// `terminal_end` once the process exits.
    pub async fn terminate(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(session_id) else {
            return false;
        };
        if !session.running.load(Ordering::Acquire) {
            return false;
        }
        self.bus
            .publish_terminal(session_id, Event::new(EventKind::TerminalTerminating))
            .await;
        if let Some(pid) = session.pid {
            // SAFETY: signalling a pid we spawned; worst case the pid is
            // already gone and kill returns ESRCH.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            info!(session_id, pid, "terminal session terminated");
        }
        true
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id)?;
        let session_id_owned = session_id.to_string();
        let command = session.command.clone();
        let cwd = session.cwd.clone();
        let is_running = session.running.load(Ordering::Acquire);
        let start_time = session.started_at;
        let exit_code = *session.exit_code.lock().unwrap_or_else(|e| e.into_inner());
        drop(sessions);
        let status = SessionStatus {
            session_id: session_id_owned,
            command,
            cwd,
            is_running,
            start_time,
            exit_code,
            connections: self.bus.subscriber_count(session_id).await,
        };
        Some(status)
    }

    pub async fn list_sessions(&self) -> Vec<SessionStatus> {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().cloned().collect()
        };
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(status) = self.status(&id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Tear a session down once its last subscriber is gone: terminate the
    /// process if still running and drop the session record.
    pub async fn cleanup(&self, session_id: &str) {
        let running = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .map(|s| s.running.load(Ordering::Acquire))
        };
        if running == Some(true) {
            self.terminate(session_id).await;
        }
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(session_id).is_some() {
            info!(session_id, "terminal session removed");
        }
    }
}

async fn publish_output(bus: &Arc<EventBus>, session_id: &str, stream: &str, line: &str) {
    let mut ev = Event::new(EventKind::TerminalOutput);
    ev.stream = Some(stream.to_string());
    ev.output = Some(format!("{line}\n"));
    bus.publish_terminal(session_id, ev).await;
}
