//! File transfer abstraction for staged uploads: ensure a
//! remote directory exists, then copy one local file to it over SCP.
//!
//! Subprocess invocation follows a `run_cmd_with_timeout`/`CommandOutput`
//! shape: spawn, capture stdout/stderr concurrently, and enforce a timeout
//! that kills and reaps the child. Cipher selection, per-directory
//! `mkdir -p` memoization, and retry-on-transient-failure are specific to
//! the ssh/scp transfer itself.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("SshFailure: mkdir -p {remote_dir} failed (exit_code={exit_code:?}): {stderr}")]
    Mkdir {
        remote_dir: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("ScpFailure: scp to {remote_path} failed (exit_code={exit_code:?}): {stderr}")]
    Scp {
        remote_path: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

fn is_transient_transfer_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("broken pipe")
        || msg.contains("temporarily")
}

async fn run_cmd_once(program: &str, args: &[String], timeout_dur: Duration, operation: &str) -> Result<CommandOutput> {
    let started = Instant::now();
    debug!(
        "[PHASE: transfer] [STEP: cmd] running {} (operation={}, args_count={})",
        program,
        operation,
        args.len()
    );

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn '{}' (operation={})", program, operation))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(anyhow::Error::new(e)).with_context(|| format!("wait failed (operation={})", operation)),
        Err(_) => {
            warn!(
                "[PHASE: transfer] [STEP: cmd] timed out (operation={}, program={}); killing",
                operation, program
            );
            let _ = child.kill().await;
            let _ = timeout(Duration::from_secs(5), child.wait()).await;
            return Err(anyhow!("command timed out (operation={}, program={})", operation, program));
        }
    };

    let stdout_str = stdout_task.await.context("stdout join failed")?.context("stdout read failed")?;
    let stderr_str = stderr_task.await.context("stderr join failed")?.context("stderr read failed")?;

    Ok(CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    })
}

async fn run_cmd_with_retry(program: &str, args: &[String], timeout_dur: Duration, operation: &str) -> Result<CommandOutput> {
    let program_owned = program.to_string();
    let args_owned = args.to_vec();
    let op_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let op = op_owned.clone();
        async move { run_cmd_once(&program, &args, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200).factor(2).max_delay(Duration::from_secs(2)).take(3).map(jitter);

    RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| is_transient_transfer_error(e)).await
}

/// Connection parameters for one staged-upload destination.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: String,
    pub cipher: String,
    pub use_none_cipher: bool,
}

#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// `mkdir -p` the remote directory if it has not already been created
    /// this run. Memoized per target directory to avoid a redundant round trip.
    async fn ensure_remote_dir(&self, remote_dir: &str) -> Result<()>;

    /// Copy `local_path` to `remote_path` (full destination path, not just a
    /// directory).
    async fn copy(&self, local_path: &Path, remote_path: &str) -> Result<()>;
}

pub struct SshScpTransfer {
    target: SshTarget,
    transfer_timeout: Duration,
    dirs_created: Mutex<HashSet<String>>,
}

impl SshScpTransfer {
    pub fn new(target: SshTarget, transfer_timeout: Duration) -> Self {
        for bin in ["ssh", "scp"] {
            if which::which(bin).is_err() {
                log::warn!("[PHASE: upload] [STEP: preflight] `{}` not found on PATH; staged uploads will fail", bin);
            }
        }
        SshScpTransfer {
            target,
            transfer_timeout,
            dirs_created: Mutex::new(HashSet::new()),
        }
    }

    fn cipher_args(&self) -> Vec<String> {
        if self.target.use_none_cipher {
            vec!["-oNoneEnabled=yes".to_string(), "-oNoneSwitch=yes".to_string()]
        } else {
            vec!["-c".to_string(), self.target.cipher.clone()]
        }
    }
}

#[async_trait]
impl FileTransfer for SshScpTransfer {
    async fn ensure_remote_dir(&self, remote_dir: &str) -> Result<()> {
        {
            let created = self.dirs_created.lock().unwrap();
            if created.contains(remote_dir) {
                return Ok(());
            }
        }

        let mut args = vec![
            "-p".to_string(),
            self.target.port.to_string(),
            "-n".to_string(),
        ];
        args.extend(self.cipher_args());
        args.extend([
            "-i".to_string(),
            self.target.private_key_path.clone(),
            "-l".to_string(),
            self.target.username.clone(),
            self.target.host.clone(),
            format!("mkdir -p '{}'", remote_dir.replace('\'', "'\\''")),
        ]);

        let out = run_cmd_with_retry("ssh", &args, self.transfer_timeout, "mkdir_remote_dir").await?;
        if out.exit_code != Some(0) {
            return Err(TransferError::Mkdir {
                remote_dir: remote_dir.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr,
            }
            .into());
        }

        self.dirs_created.lock().unwrap().insert(remote_dir.to_string());
        Ok(())
    }

    async fn copy(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let mut args = vec!["-P".to_string(), self.target.port.to_string(), "-i".to_string(), self.target.private_key_path.clone()];
        args.extend(self.cipher_args());
        args.push(local_path.to_string_lossy().to_string());
        args.push(format!("{}@{}:{}", self.target.username, self.target.host, remote_path));

        let out = run_cmd_with_retry("scp", &args, self.transfer_timeout, "scp_upload").await?;
        if out.exit_code != Some(0) {
            return Err(TransferError::Scp {
                remote_path: remote_path.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr,
            }
            .into());
        }
        info!("[PHASE: transfer] [STEP: copy] uploaded {:?} -> {}", local_path, remote_path);
        Ok(())
    }
}

/// In-memory double for tests: never spawns a subprocess.
pub struct TestFileTransfer {
    pub dirs_created: Mutex<HashSet<String>>,
    pub copies: Mutex<Vec<(std::path::PathBuf, String)>>,
    pub fail_copy: bool,
}

impl Default for TestFileTransfer {
    fn default() -> Self {
        TestFileTransfer {
            dirs_created: Mutex::new(HashSet::new()),
            copies: Mutex::new(Vec::new()),
            fail_copy: false,
        }
    }
}

#[async_trait]
impl FileTransfer for TestFileTransfer {
    async fn ensure_remote_dir(&self, remote_dir: &str) -> Result<()> {
        self.dirs_created.lock().unwrap().insert(remote_dir.to_string());
        Ok(())
    }

    async fn copy(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        if self.fail_copy {
            return Err(TransferError::Scp {
                remote_path: remote_path.to_string(),
                exit_code: None,
                stderr: "simulated failure".to_string(),
            }
            .into());
        }
        self.copies.lock().unwrap().push((local_path.to_path_buf(), remote_path.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_double_records_copies_and_created_dirs() {
        let transfer = TestFileTransfer::default();
        transfer.ensure_remote_dir("/remote/alice/Birds").await.unwrap();
        transfer.copy(Path::new("/local/bird1.jpg"), "/remote/alice/Birds/bird1.jpg").await.unwrap();

        assert!(transfer.dirs_created.lock().unwrap().contains("/remote/alice/Birds"));
        assert_eq!(transfer.copies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_double_honors_fail_copy() {
        let transfer = TestFileTransfer {
            fail_copy: true,
            ..Default::default()
        };
        let err = transfer.copy(Path::new("/local/a"), "/remote/a").await.unwrap_err();
        assert!(err.to_string().contains("ScpFailure"));
    }
}
