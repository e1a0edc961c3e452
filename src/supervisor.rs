//! Process Supervisor
//!
//! Owns a single persistent subprocess (e.g. a language-model CLI), restarts
//! it when the requested profile/model changes, and sandboxes it by
//! overriding its `HOME` to a runtime-owned directory. Grounded in the
//! original system's `llm/gemini_cli.py::_ensure_proc`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare isolated home {path}: {source}")]
    Home {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct Running {
    pub child: Child,
    /// Buffered line reader over the child's stdout, shared across
    /// `generate()` calls so the same persistent process can answer more
    /// than one request.
    pub stdout_lines: Option<Arc<Mutex<Lines<BufReader<ChildStdout>>>>>,
    cmdline: Vec<String>,
}

/// Keeps exactly one child process alive per logical adapter, relaunching it
/// when the desired command line (driven by model/profile selection)
/// changes, and on exit if `restart_on_exit` is set.
pub struct ProcessSupervisor {
    base_cmd: String,
    cwd: PathBuf,
    isolated_home: PathBuf,
    restart_on_exit: bool,
    state: Mutex<Option<Running>>,
}

impl ProcessSupervisor {
    pub fn new(
        base_cmd: impl Into<String>,
        cwd: impl Into<PathBuf>,
        isolated_home: impl Into<PathBuf>,
        restart_on_exit: bool,
    ) -> Self {
        Self {
            base_cmd: base_cmd.into(),
            cwd: cwd.into(),
            isolated_home: isolated_home.into(),
            restart_on_exit,
            state: Mutex::new(None),
        }
    }

    fn build_cmdline(&self, model: &str) -> Vec<String> {
        let mut parts: Vec<String> = self
            .base_cmd
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if parts.is_empty() {
            parts.push("gemini".to_string());
        }
        if !model.is_empty() && model != "auto" {
            parts.push("--model".to_string());
            parts.push(model.to_string());
        }
        parts
    }

    /// Ensures a child matching `model`'s command line is running, relaunching
    /// if the selection changed or the previous child exited. Returns a
    /// mutex guard so callers can write to stdin / read stdout while holding
    /// the lock — the supervisor serializes access to the single process.
    pub async fn ensure_running(
        &self,
        model: &str,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<Running>>, SupervisorError> {
        let desired = self.build_cmdline(model);
        let mut guard = self.state.lock().await;

        let needs_restart = match guard.as_mut() {
            Some(running) => {
                running.cmdline != desired || running.child.try_wait().ok().flatten().is_some()
            }
            None => true,
        };

        if needs_restart {
            if let Some(mut running) = guard.take() {
                let _ = running.child.start_kill();
            }

            tokio::fs::create_dir_all(&self.isolated_home)
                .await
                .map_err(|source| SupervisorError::Home { path: self.isolated_home.clone(), source })?;
            let home = tokio::fs::canonicalize(&self.isolated_home)
                .await
                .unwrap_or_else(|_| self.isolated_home.clone());

            info!(cmdline = ?desired, home = %home.display(), "spawning supervised process");

            let mut command = Command::new(&desired[0]);
            command
                .args(&desired[1..])
                .current_dir(&self.cwd)
                .env("HOME", &home)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = command
                .spawn()
                .map_err(|source| SupervisorError::Spawn { cmd: desired.join(" "), source })?;
            let stdout_lines = child
                .stdout
                .take()
                .map(|stdout| Arc::new(Mutex::new(tokio::io::AsyncBufReadExt::lines(BufReader::new(stdout)))));

            *guard = Some(Running { child, stdout_lines, cmdline: desired });
        }

        Ok(guard)
    }

    pub fn restart_on_exit(&self) -> bool {
        self.restart_on_exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cmdline_omits_model_flag_for_auto() {
        let sup = ProcessSupervisor::new("gemini", ".", ".runtime/home", true);
        assert_eq!(sup.build_cmdline("auto"), vec!["gemini".to_string()]);
        assert_eq!(sup.build_cmdline(""), vec!["gemini".to_string()]);
    }

    #[test]
    fn build_cmdline_appends_model_flag() {
        let sup = ProcessSupervisor::new("gemini", ".", ".runtime/home", true);
        assert_eq!(
            sup.build_cmdline("gemini-3-pro-preview"),
            vec!["gemini", "--model", "gemini-3-pro-preview"]
        );
    }
}
