use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

use crate::sandbox::error::SandboxError;

/// Spawns, watches and stops long-running local processes.
///
/// Children inherit only allowlisted host variables plus the explicit env
/// passed to `start`. Stdout and stdin are handed to the caller once; stderr
/// is drained into the log. On unix each child leads its own process group,
/// and signals go to the whole group so helpers the agent spawned stop too.
pub struct ProcessManager {
    /// Environment variables to inherit from host (allowlist).
    env_allowlist: Vec<String>,
}

/// A running child process. Its process group is killed when dropped.
pub struct ProcessHandle {
    pid: u32,
    executable: String,
    child: Mutex<Child>,
    stdio: std::sync::Mutex<Option<(ChildStdin, ChildStdout)>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Take the child's stdin/stdout. Returns `None` after the first call.
    pub fn take_stdio(&self) -> Option<(ChildStdin, ChildStdout)> {
        self.stdio
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let Ok(mut child) = self.child.try_lock() else {
            return;
        };
        if matches!(child.try_wait(), Ok(None)) {
            signal_group(&mut child, self.pid, GroupSignal::Kill);
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("executable", &self.executable)
            .finish()
    }
}

impl ProcessManager {
    pub fn new(env_allowlist: Vec<String>) -> Self {
        Self { env_allowlist }
    }

    /// Build a filtered env map: only allowlisted host vars + request vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    /// Start `executable` with piped stdio in `cwd`.
    pub fn start(
        &self,
        executable: &str,
        args: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, SandboxError> {
        let launch_err = |reason: String| SandboxError::Launch {
            executable: executable.to_string(),
            reason,
        };

        if executable.is_empty() {
            return Err(launch_err("empty command".into()));
        }
        if !cwd.is_dir() {
            return Err(launch_err(format!("cwd {} does not exist", cwd.display())));
        }
        tempfile::tempfile_in(cwd)
            .map_err(|e| launch_err(format!("cwd {} is not writable: {e}", cwd.display())))?;

        let mut cmd = Command::new(executable);
        cmd.args(args);
        cmd.current_dir(cwd);
        cmd.env_clear();
        for (k, v) in self.build_env(env) {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_err(format!("spawn failed: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_err("process exited before it could be tracked".into()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(launch_err("stdio was not captured".into()));
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stderr).lines());
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!(pid, stderr = %line, "agent stderr");
                }
            });
        }

        tracing::info!(pid, executable, cwd = %cwd.display(), "process started");

        Ok(ProcessHandle {
            pid,
            executable: executable.to_string(),
            child: Mutex::new(child),
            stdio: std::sync::Mutex::new(Some((stdin, stdout))),
        })
    }

    /// SIGTERM the process group, wait up to `grace` for the leader, then
    /// SIGKILL the group. A process that already exited is left alone.
    pub async fn terminate(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
    ) -> Result<(), SandboxError> {
        let mut child = handle.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(pid = handle.pid, ?status, "process already exited");
            return Ok(());
        }

        signal_group(&mut child, handle.pid, GroupSignal::Term);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = handle.pid, ?status, "process terminated");
                // Stragglers that outlived the leader.
                signal_group(&mut child, handle.pid, GroupSignal::Kill);
                Ok(())
            }
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => {
                tracing::warn!(
                    pid = handle.pid,
                    grace = ?grace,
                    "process ignored SIGTERM, killing"
                );
                signal_group(&mut child, handle.pid, GroupSignal::Kill);
                match child.kill().await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                    Err(e) => Err(SandboxError::Io(e)),
                }
            }
        }
    }

    pub async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        handle.is_running().await
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: u32, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::debug!(pid, signal = ?sig, error = %e, "signalling process group failed")
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, pid: u32, _signal: GroupSignal) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(pid, error = %e, "kill failed");
    }
}
