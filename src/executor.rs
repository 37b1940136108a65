//! Spawns an agent CLI, feeds it a prompt, enforces a timeout, captures its
//! streams, and writes a per-invocation log file. No process leaves this
//! module alive: every exit path reaps the child or kills then reaps it.

use crate::config::Role;
use crate::errors::InvocationError;
use crate::invoker::{AgentInvoker, InvocationResult, TIMEOUT_EXIT_CODE};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

pub struct Executor {
    log_dir: PathBuf,
}

impl Executor {
    pub fn new(log_dir: PathBuf) -> Self {
        Executor { log_dir }
    }

    pub async fn run(
        &self,
        invoker: &AgentInvoker,
        prompt: &str,
        working_dir: &Path,
        role: Role,
        timeout_seconds: u64,
        wp_id: &str,
    ) -> Result<(InvocationResult, PathBuf), InvocationError> {
        let argv = invoker.build_command(role, working_dir, timeout_seconds);
        let (program, args) = argv.split_first().expect("argv is never empty");

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| InvocationError::SpawnFailed {
            agent_id: invoker.agent_id.to_string(),
            source,
        })?;

        if invoker.uses_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(|source| InvocationError::StdinWriteFailed {
                        agent_id: invoker.agent_id.to_string(),
                        source,
                    })?;
                let _ = stdin.shutdown().await;
            }
        }

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let (exit_code, timed_out) = match tokio::time::timeout(Duration::from_secs(timeout_seconds), child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(source)) => {
                return Err(InvocationError::SpawnFailed {
                    agent_id: invoker.agent_id.to_string(),
                    source,
                });
            }
            Err(_elapsed) => {
                graceful_then_kill(&mut child).await;
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        let stdout_content = stdout_task.await.unwrap_or_default();
        let stderr_content = stderr_task.await.unwrap_or_default();
        let duration = start.elapsed();

        let log_path = self.write_log(wp_id, role, invoker.agent_id, exit_code, duration, &stdout_content, &stderr_content)?;

        let mut result = invoker.parse_output(&stdout_content, &stderr_content, exit_code, duration);
        if timed_out {
            result.success = false;
            result.files_modified = None;
            result.commits_made = None;
            result.errors = None;
            result.warnings = None;
            result.stderr.push_str("\n[executor] invocation exceeded timeout and was killed\n");
        }
        Ok((result, log_path))
    }

    pub fn log_path(&self, wp_id: &str, role: Role) -> PathBuf {
        self.log_dir.join(format!("{wp_id}-{}.log", role.as_str()))
    }

    fn write_log(
        &self,
        wp_id: &str,
        role: Role,
        agent_id: &str,
        exit_code: i32,
        duration: Duration,
        stdout: &str,
        stderr: &str,
    ) -> Result<PathBuf, InvocationError> {
        std::fs::create_dir_all(&self.log_dir).map_err(|source| InvocationError::LogWriteFailed {
            path: self.log_dir.clone(),
            source,
        })?;
        let path = self.log_path(wp_id, role);
        let contents = format!(
            "agent: {agent_id}\nrole: {role}\nexit_code: {exit_code}\nduration_seconds: {duration:.3}\n--- STDOUT ---\n{stdout}\n--- STDERR ---\n{stderr}\n",
            role = role.as_str(),
            duration = duration.as_secs_f64(),
        );
        std::fs::write(&path, contents).map_err(|source| InvocationError::LogWriteFailed {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(unix)]
async fn graceful_then_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    let grace = Duration::from_secs(5);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn graceful_then_kill(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
