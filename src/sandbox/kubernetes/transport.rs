//! How cluster commands reach the Kubernetes API.
//!
//! - `KubectlTransport`: shells out to the `kubectl` binary with the host's
//!   kubeconfig and cloud credentials

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::protocol::AgentTransport;
use crate::sandbox::error::SandboxError;
use crate::sandbox::local_host::process_manager::{ProcessHandle, ProcessManager};

/// Host variables kubectl and its auth plugins may need.
pub const KUBECTL_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "KUBECONFIG",
    "AWS_PROFILE",
    "AWS_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "CLOUDSDK_CONFIG",
    "AZURE_CONFIG_DIR",
];

/// Result of one kubectl invocation.
#[derive(Debug)]
pub struct KubectlOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl KubectlOutput {
    /// Returns true if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Returns an error if the command did not exit with code 0.
    pub fn check(&self) -> Result<(), SandboxError> {
        if self.success() {
            Ok(())
        } else {
            Err(SandboxError::CommandFailed {
                code: self.exit_code,
                stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
            })
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// A long-lived `kubectl exec -i` whose stdio is the agent's.
pub struct AttachedExec {
    pub transport: AgentTransport,
    /// Local kubectl process, when there is one. Killed when dropped.
    pub process: Option<ProcessHandle>,
}

/// Abstraction over how cluster commands run.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Run kubectl to completion, optionally feeding `stdin`.
    async fn run(
        &self,
        args: &[String],
        stdin: Option<Bytes>,
    ) -> Result<KubectlOutput, SandboxError>;

    /// Start kubectl with stdio left open for streaming.
    async fn attach(&self, args: &[String]) -> Result<AttachedExec, SandboxError>;
}

// ── Kubectl ─────────────────────────────────────────────────────────

pub struct KubectlTransport {
    kubectl_bin: String,
    processes: ProcessManager,
}

impl KubectlTransport {
    pub fn new(kubectl_bin: impl Into<String>) -> Self {
        let allowlist = KUBECTL_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect();
        Self {
            kubectl_bin: kubectl_bin.into(),
            processes: ProcessManager::new(allowlist),
        }
    }
}

#[async_trait]
impl ClusterTransport for KubectlTransport {
    async fn run(
        &self,
        args: &[String],
        stdin: Option<Bytes>,
    ) -> Result<KubectlOutput, SandboxError> {
        tracing::debug!(args = ?args, "kubectl");
        let mut cmd = tokio::process::Command::new(&self.kubectl_bin);
        cmd.args(args);
        cmd.env_clear();
        for key in KUBECTL_ENV_ALLOWLIST {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SandboxError::Launch {
            executable: self.kubectl_bin.clone(),
            reason: e.to_string(),
        })?;

        let feeder = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => Some(tokio::spawn(async move {
                let written = pipe.write_all(&data).await;
                drop(pipe);
                written
            })),
            _ => None,
        };

        let output = child.wait_with_output().await?;
        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "kubectl closed stdin early"),
                Err(e) => tracing::warn!(error = %e, "kubectl stdin task failed"),
            }
        }

        Ok(KubectlOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn attach(&self, args: &[String]) -> Result<AttachedExec, SandboxError> {
        tracing::debug!(args = ?args, "kubectl (attached)");
        let cwd = std::env::temp_dir();
        let process = self
            .processes
            .start(&self.kubectl_bin, args, &cwd, &Default::default())?;
        let Some((stdin, stdout)) = process.take_stdio() else {
            return Err(SandboxError::Launch {
                executable: self.kubectl_bin.clone(),
                reason: "stdio unavailable".into(),
            });
        };
        Ok(AttachedExec {
            transport: AgentTransport::new(stdout, stdin),
            process: Some(process),
        })
    }
}

// ── Test double ─────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::protocol::client::tests::{Act, chunk, handshake_then, result, spawn_agent};

    type Handler = Box<dyn Fn(&[String], Option<&Bytes>) -> KubectlOutput + Send + Sync>;

    pub(crate) fn output(code: i32, stdout: &[u8]) -> KubectlOutput {
        KubectlOutput {
            exit_code: Some(code),
            stdout: stdout.to_vec(),
            stderr: Vec::new(),
        }
    }

    /// Records every kubectl call. Attached execs get an in-process agent
    /// that answers each prompt with one chunk and `end_turn`. The prompt
    /// `hold` never finishes, `garble` gets three malformed frames and
    /// `exit` closes the agent's stdio.
    pub(crate) struct FakeCluster {
        calls: Mutex<Vec<(Vec<String>, Option<Bytes>)>>,
        handler: Handler,
    }

    impl FakeCluster {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&[String], Option<&Bytes>) -> KubectlOutput + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            }
        }

        /// Every command succeeds; pods report `Running`.
        pub(crate) fn succeeding() -> Self {
            Self::new(|args, _| {
                if args.first().is_some_and(|a| a == "get") {
                    output(0, b"Running")
                } else {
                    output(0, b"")
                }
            })
        }

        pub(crate) fn calls(&self) -> Vec<(Vec<String>, Option<Bytes>)> {
            self.calls.lock().unwrap().clone()
        }

        /// Calls whose first argument is `verb`.
        pub(crate) fn calls_to(&self, verb: &str) -> Vec<(Vec<String>, Option<Bytes>)> {
            self.calls()
                .into_iter()
                .filter(|(args, _)| args.first().is_some_and(|a| a == verb))
                .collect()
        }
    }

    #[async_trait]
    impl ClusterTransport for FakeCluster {
        async fn run(
            &self,
            args: &[String],
            stdin: Option<Bytes>,
        ) -> Result<KubectlOutput, SandboxError> {
            let out = (self.handler)(args, stdin.as_ref());
            self.calls.lock().unwrap().push((args.to_vec(), stdin));
            Ok(out)
        }

        async fn attach(&self, args: &[String]) -> Result<AttachedExec, SandboxError> {
            self.calls.lock().unwrap().push((args.to_vec(), None));
            let (transport, agent_end) = AgentTransport::pair(64 * 1024);
            spawn_agent(
                agent_end,
                handshake_then(|frame| {
                    if frame["method"] != "session/prompt" {
                        return Vec::<Act>::new();
                    }
                    match frame["params"]["prompt"][0]["text"].as_str() {
                        Some("hold") => vec![chunk("working")],
                        Some("garble") => vec![
                            Act::Send(json!([1])),
                            Act::Send(json!([2])),
                            Act::Send(json!([3])),
                        ],
                        Some("exit") => vec![chunk("working"), Act::Close],
                        _ => vec![
                            chunk("done"),
                            result(frame, json!({ "stopReason": "end_turn" })),
                        ],
                    }
                }),
            );
            Ok(AttachedExec {
                transport,
                process: None,
            })
        }
    }
}
