use crate::error::{FlintrockError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Fully captured result of a remote command. A non-zero exit code is data,
/// not an error: the caller decides severity.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One established session against one host. Sessions are single-task; the
/// orchestrator opens one per node and never shares it across tasks.
#[async_trait]
pub trait SshSession: Send {
    fn host(&self) -> &str;

    /// Run a shell snippet on the remote default shell with `env` exported
    /// first. Output is fully captured.
    async fn run(&mut self, command: &str, env: &[(String, String)]) -> Result<CommandOutput>;

    /// Atomic remote write: stage under a temporary name, chmod, rename.
    async fn copy(&mut self, data: &[u8], remote_path: &str, mode: u32) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Session factory. The orchestrator only ever sees this trait, which is
/// what lets the test suite substitute an in-memory transport.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        identity: Option<&Path>,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Box<dyn SshSession>>;
}

/// Quote a string for the remote POSIX shell. Plain tokens pass through,
/// everything else gets single-quoted with embedded quotes escaped.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'\''"#))
    }
}

/// Join argv-style words into one shell command line.
pub fn shell_join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| shell_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Prefix a shell snippet with exported environment variables.
pub fn with_env(command: &str, env: &[(String, String)]) -> String {
    if env.is_empty() {
        return command.to_string();
    }
    let exports: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("export {}={};", k, shell_quote(v)))
        .collect();
    format!("{} {}", exports.join(" "), command)
}

/// Classification of an ssh client failure.
#[derive(Debug, PartialEq, Eq)]
enum ConnectFailure {
    /// Worth another attempt: sshd not up yet, auth subsystem still booting.
    Transient,
    /// Never retried: a changed host key means we are talking to the wrong
    /// machine, or the caller's key is simply not accepted.
    Fatal,
}

fn classify_connect_stderr(stderr: &str) -> ConnectFailure {
    const FATAL_MARKERS: [&str; 2] = [
        "REMOTE HOST IDENTIFICATION HAS CHANGED",
        "Host key verification failed",
    ];
    if FATAL_MARKERS.iter().any(|m| stderr.contains(m)) {
        ConnectFailure::Fatal
    } else {
        // Everything else is retryable: freshly booted instances refuse
        // connections, then briefly reject auth while cloud-init is still
        // writing authorized_keys.
        ConnectFailure::Transient
    }
}

// ---------------------------------------------------------------------------
// OpenSSH transport. One control-master process per session gives us an
// authenticated connection that every subsequent run/copy multiplexes over,
// without re-handshaking per command.
// ---------------------------------------------------------------------------

pub struct OpenSshConnector;

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        identity: Option<&Path>,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Box<dyn SshSession>> {
        let control_path = std::env::temp_dir().join(format!(
            "flintrock-ssh-{}-{:08x}.sock",
            host.replace(['/', ':'], "_"),
            rand::random::<u32>()
        ));

        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            let mut cmd = Command::new("ssh");
            base_args(&mut cmd, &control_path, user, host, identity);
            cmd.arg("-o")
                .arg("ControlMaster=yes")
                .arg("-o")
                .arg("ControlPersist=600")
                .arg("true");
            cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

            let output = cmd.output().await.map_err(|e| {
                FlintrockError::Network(format!("failed to spawn ssh client: {}", e))
            })?;

            if output.status.success() {
                debug!("ssh: connected, host={}, attempt={}", host, attempt);
                return Ok(Box::new(OpenSshSession {
                    host: host.to_string(),
                    user: user.to_string(),
                    identity: identity.map(Path::to_path_buf),
                    control_path,
                    closed: false,
                }));
            }

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            match classify_connect_stderr(&stderr) {
                ConnectFailure::Fatal => {
                    return Err(FlintrockError::Network(format!(
                        "ssh to {} failed fatally: {}",
                        host,
                        stderr.trim()
                    )));
                }
                ConnectFailure::Transient if attempt < attempts => {
                    warn!(
                        "ssh: connect attempt failed, host={}, attempt={}/{}, error={}",
                        host,
                        attempt,
                        attempts,
                        stderr.trim()
                    );
                    // Linear backoff.
                    tokio::time::sleep(retry_delay * attempt).await;
                }
                ConnectFailure::Transient => {
                    return Err(FlintrockError::Network(format!(
                        "ssh to {} failed after {} attempts: {}",
                        host,
                        attempts,
                        stderr.trim()
                    )));
                }
            }
        }
        unreachable!("connect loop returns on the last attempt")
    }
}

struct OpenSshSession {
    host: String,
    user: String,
    identity: Option<PathBuf>,
    control_path: PathBuf,
    closed: bool,
}

fn base_args(cmd: &mut Command, control_path: &Path, user: &str, host: &str, identity: Option<&Path>) {
    cmd.arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new")
        .arg("-o")
        .arg("ConnectTimeout=10")
        .arg("-o")
        .arg(format!("ControlPath={}", control_path.display()));
    if let Some(identity) = identity {
        cmd.arg("-o").arg("IdentitiesOnly=yes").arg("-i").arg(identity);
    }
    cmd.arg(format!("{}@{}", user, host));
}

impl OpenSshSession {
    async fn exec(&self, remote_command: &str, stdin_data: Option<&[u8]>) -> Result<CommandOutput> {
        let mut cmd = Command::new("ssh");
        base_args(
            &mut cmd,
            &self.control_path,
            &self.user,
            &self.host,
            self.identity.as_deref(),
        );
        cmd.arg(remote_command);
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| FlintrockError::Network(format!("failed to spawn ssh client: {}", e)))?;

        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                FlintrockError::Network("ssh client stdin unavailable".to_string())
            })?;
            stdin.write_all(data).await.map_err(|e| {
                FlintrockError::Network(format!("writing to ssh stdin failed: {}", e))
            })?;
            drop(stdin);
        }

        let output = child.wait_with_output().await.map_err(|e| {
            FlintrockError::Network(format!("waiting for ssh client failed: {}", e))
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl SshSession for OpenSshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&mut self, command: &str, env: &[(String, String)]) -> Result<CommandOutput> {
        let full = with_env(command, env);
        debug!("ssh: run, host={}, command={}", self.host, command);
        self.exec(&full, None).await
    }

    async fn copy(&mut self, data: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let staged = format!("{}.{:08x}.tmp", remote_path, rand::random::<u32>());
        let command = format!(
            "mkdir -p \"$(dirname {path})\" && cat > {staged} && chmod {mode:o} {staged} && mv {staged} {path}",
            path = shell_quote(remote_path),
            staged = shell_quote(&staged),
            mode = mode,
        );
        let output = self.exec(&command, Some(data)).await?;
        if output.success() {
            debug!(
                "ssh: copied, host={}, path={}, bytes={}",
                self.host,
                remote_path,
                data.len()
            );
            Ok(())
        } else {
            Err(FlintrockError::RemoteCommand {
                host: self.host.clone(),
                command: format!("copy to {}", remote_path),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut cmd = Command::new("ssh");
        base_args(
            &mut cmd,
            &self.control_path,
            &self.user,
            &self.host,
            self.identity.as_deref(),
        );
        cmd.arg("-O").arg("exit");
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        // The control master may already be gone; that is fine.
        let _ = cmd.status().await;
        let _ = std::fs::remove_file(&self.control_path);
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best-effort teardown when the task was cancelled before close().
        let _ = std::process::Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(format!("{}@{}", self.user, self.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let _ = std::fs::remove_file(&self.control_path);
    }
}
