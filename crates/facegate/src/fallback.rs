//! External fallback verifier.
//!
//! Runs an isolated verifier process per call: one JSON request on stdin, one
//! JSON line on stdout after exit. The whole exchange is bounded by a hard
//! deadline. A child that exits on its own is reaped by the exchange; on every
//! other path its process group is killed and the child reaped before the call
//! returns. Any failure degrades to a labeled
//! payload-presence heuristic instead of an error.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use facegate_core::image_source::payload_bytes;
use facegate_core::{ImageDataError, VerificationResult};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Stdout beyond this is not read; a valid response is a single short line.
const MAX_RESPONSE_BYTES: u64 = 64 * 1024;
/// Stderr kept for diagnostics.
const MAX_STDERR_BYTES: u64 = 8 * 1024;

const DEGRADED_MATCH_SIMILARITY: f32 = 85.0;
const DEGRADED_REJECT_SIMILARITY: f32 = 10.0;

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("fallback verifier queue saturated for {0:?}")]
    Saturated(Duration),
    #[error("failed to spawn fallback verifier: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to write request to fallback verifier: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to read fallback verifier output: {0}")]
    Read(#[source] std::io::Error),
    #[error("fallback verifier timed out after {0:?}")]
    Timeout(Duration),
    #[error("fallback verifier exited with {status}: {stderr}")]
    ExitStatus { status: ExitStatus, stderr: String },
    #[error("fallback verifier wrote an invalid response: {0}")]
    MalformedOutput(String),
    #[error("payload could not be prepared for the fallback verifier: {0}")]
    Payload(#[from] ImageDataError),
}

#[derive(Serialize)]
struct WireRequest<'a> {
    reference: &'a str,
    candidate: &'a str,
}

/// Response line accepted from the external verifier.
#[derive(Debug, Deserialize)]
pub struct WireResponse {
    #[serde(rename = "match", alias = "matched")]
    pub matched: bool,
    #[serde(default)]
    pub similarity: f32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Settings for [`ProcessVerifier`].
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Extra environment for the verifier process.
    pub env: Vec<(OsString, OsString)>,
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub match_threshold: f32,
    pub degraded_min_payload_bytes: usize,
    pub degraded_match: bool,
}

/// Spawns, feeds and tears down the external verifier process.
pub struct ProcessVerifier {
    settings: FallbackSettings,
    permits: Arc<Semaphore>,
}

impl ProcessVerifier {
    pub fn new(settings: FallbackSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self { settings, permits }
    }

    pub fn settings(&self) -> &FallbackSettings {
        &self.settings
    }

    /// Verifier processes currently running.
    pub fn in_flight(&self) -> usize {
        self.settings.max_concurrent.max(1) - self.permits.available_permits()
    }

    /// Verify two payloads, as received, through the external process. Never fails.
    pub async fn verify(&self, reference: &[u8], candidate: &[u8]) -> VerificationResult {
        match self.run(reference, candidate).await {
            Ok(response) => {
                let result = VerificationResult::fallback(
                    response.matched,
                    response.similarity,
                    self.settings.match_threshold,
                    response
                        .message
                        .unwrap_or_else(|| "Verified by fallback verifier".to_string()),
                    response.error,
                );
                tracing::info!(
                    matched = result.matched,
                    similarity = result.similarity,
                    "fallback verifier answered"
                );
                result
            }
            Err(err) => {
                tracing::warn!(error = %err, "fallback verifier unusable; applying degraded heuristic");
                self.degraded(reference.len(), candidate.len(), &err)
            }
        }
    }

    /// Payload-presence heuristic. Not a biometric comparison.
    fn degraded(&self, reference_len: usize, candidate_len: usize, cause: &FallbackError) -> VerificationResult {
        let min = self.settings.degraded_min_payload_bytes;
        let has_data = reference_len > min && candidate_len > min;
        let error = Some(format!("fallback verifier unavailable ({cause}); degraded heuristic used"));

        if !self.settings.degraded_match {
            return VerificationResult::fallback(
                false,
                0.0,
                self.settings.match_threshold,
                "Degraded mode: heuristic matching disabled",
                error,
            );
        }

        if has_data {
            tracing::warn!(
                reference_len,
                candidate_len,
                "degraded heuristic granted a match on payload size alone (reduced trust)"
            );
        }
        let (similarity, message) = if has_data {
            (DEGRADED_MATCH_SIMILARITY, "Degraded mode: verified by payload check only")
        } else {
            (DEGRADED_REJECT_SIMILARITY, "Degraded mode: no usable photo data captured")
        };
        VerificationResult::fallback(has_data, similarity, self.settings.match_threshold, message, error)
    }

    async fn run(&self, reference: &[u8], candidate: &[u8]) -> Result<WireResponse, FallbackError> {
        let deadline = Instant::now() + self.settings.timeout;

        let _permit = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| FallbackError::Saturated(self.settings.timeout))?
            .map_err(|_| FallbackError::Saturated(self.settings.timeout))?;

        let request = serde_json::to_vec(&WireRequest {
            reference: &STANDARD.encode(payload_bytes(reference)?),
            candidate: &STANDARD.encode(payload_bytes(candidate)?),
        })
        .map_err(|e| FallbackError::Write(std::io::Error::other(e)))?;

        let mut command = Command::new(&self.settings.program);
        command
            .args(&self.settings.args)
            .envs(self.settings.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate(&mut command);

        let mut child = command.spawn().map_err(FallbackError::Spawn)?;
        let pid = child.id();
        tracing::debug!(?pid, program = %self.settings.program.display(), "fallback verifier spawned");

        let outcome = match tokio::time::timeout_at(deadline, exchange(&mut child, &request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(FallbackError::Timeout(self.settings.timeout)),
        };

        // After a completed exchange the leader is reaped and its pid may already
        // belong to another process group, so only unfinished children are signalled.
        if outcome.is_err() {
            terminate(&mut child, pid).await;
        }

        let (status, stdout, stderr) = outcome?;
        if !status.success() {
            return Err(FallbackError::ExitStatus {
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        parse_response(&stdout)
    }
}

type Exchange = (ExitStatus, Vec<u8>, Vec<u8>);

/// Write the request, close stdin, drain both pipes and wait for exit.
async fn exchange(child: &mut Child, request: &[u8]) -> Result<Exchange, FallbackError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| FallbackError::Write(std::io::Error::other("stdin not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FallbackError::Read(std::io::Error::other("stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FallbackError::Read(std::io::Error::other("stderr not captured")))?;

    let write = async move {
        stdin.write_all(request).await?;
        stdin.shutdown().await
        // stdin dropped here: the verifier sees EOF.
    };
    let read_out = async move {
        let mut buf = Vec::new();
        stdout.take(MAX_RESPONSE_BYTES).read_to_end(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    };
    let read_err = async move {
        let mut buf = Vec::new();
        stderr.take(MAX_STDERR_BYTES).read_to_end(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    };

    // Pipes are serviced concurrently so a chatty verifier cannot deadlock the write.
    let ((), out, err) = tokio::try_join!(
        async { write.await.map_err(FallbackError::Write) },
        async { read_out.await.map_err(FallbackError::Read) },
        async { read_err.await.map_err(FallbackError::Read) },
    )?;

    let status = child.wait().await.map_err(FallbackError::Read)?;
    Ok((status, out, err))
}

/// Put the verifier in its own process group so teardown reaches anything it forks.
#[cfg(unix)]
fn isolate(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command) {}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => tracing::warn!(pid, error = %err, "failed to signal fallback verifier group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Kill the verifier's process group and reap the child.
///
/// Only valid while the child is unreaped: its pid then still names the group.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);

    if let Ok(None) = child.try_wait() {
        if let Err(err) = child.kill().await {
            tracing::warn!(error = %err, "failed to kill fallback verifier");
        }
    }
}

/// Parse exactly one JSON line.
fn parse_response(stdout: &[u8]) -> Result<WireResponse, FallbackError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| FallbackError::MalformedOutput(format!("not UTF-8: {e}")))?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let line = lines
        .next()
        .ok_or_else(|| FallbackError::MalformedOutput("empty output".to_string()))?;
    if lines.next().is_some() {
        return Err(FallbackError::MalformedOutput("more than one output line".to_string()));
    }

    let response: WireResponse = serde_json::from_str(line.trim())
        .map_err(|e| FallbackError::MalformedOutput(e.to_string()))?;
    if !response.similarity.is_finite() {
        return Err(FallbackError::MalformedOutput("non-finite similarity".to_string()));
    }
    Ok(response)
}
