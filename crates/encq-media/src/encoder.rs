//! Encoder trait and the kind-dispatching implementation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use encq_models::EncodeParams;

use crate::av1::SvtAv1Encoder;
use crate::error::{MediaError, MediaResult};
use crate::webp::CwebpEncoder;

/// Encoder timeouts, configured per job kind. Video re-encodes can run
/// for many minutes; image encodes should not.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Timeout for a single video encode
    pub video_timeout: Duration,
    /// Timeout for a single image encode
    pub image_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_timeout: Duration::from_secs(3600),
            image_timeout: Duration::from_secs(300),
        }
    }
}

impl MediaConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            video_timeout: Duration::from_secs(
                std::env::var("ENCODER_VIDEO_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            image_timeout: Duration::from_secs(
                std::env::var("ENCODER_IMAGE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }
}

/// Synchronous (from the job's point of view) encode of one input file
/// into one output file. May fail or time out; both are retryable.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        params: &EncodeParams,
        input: &Path,
        output: &Path,
    ) -> MediaResult<()>;
}

/// Production encoder: dispatches on the job kind to ffmpeg or cwebp.
pub struct MediaEncoder {
    av1: SvtAv1Encoder,
    webp: CwebpEncoder,
    config: MediaConfig,
}

impl MediaEncoder {
    /// Create an encoder, discovering both binaries in PATH.
    pub fn new(config: MediaConfig) -> MediaResult<Self> {
        Ok(Self {
            av1: SvtAv1Encoder::new()?,
            webp: CwebpEncoder::new()?,
            config,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> MediaResult<Self> {
        Self::new(MediaConfig::from_env())
    }
}

#[async_trait]
impl Encoder for MediaEncoder {
    async fn encode(
        &self,
        params: &EncodeParams,
        input: &Path,
        output: &Path,
    ) -> MediaResult<()> {
        match params {
            EncodeParams::Video(p) => {
                let args = self.av1.build_args(p, input, output);
                run_encoder(self.av1.binary(), &args, self.config.video_timeout).await
            }
            EncodeParams::Image(p) => {
                let args = self.webp.build_args(p, input, output);
                run_encoder(self.webp.binary(), &args, self.config.image_timeout).await
            }
        }
    }
}

/// Run an encoder subprocess, capturing stderr, enforcing a timeout.
pub(crate) async fn run_encoder(
    binary: &Path,
    args: &[String],
    timeout: Duration,
) -> MediaResult<()> {
    let program = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string());

    debug!("Running {} {}", program, args.join(" "));

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(())
            } else {
                let stderr_text = String::from_utf8_lossy(&output.stderr);
                let tail = stderr_tail(&stderr_text);
                warn!("{} exited with {:?}: {}", program, output.status.code(), tail);
                Err(MediaError::encode_failed(program, output.status.code(), tail))
            }
        }
        Ok(Err(e)) => Err(e.into()),
        // Timing out drops the wait future, and kill_on_drop reaps the
        // child with it.
        Err(_) => Err(MediaError::Timeout {
            program,
            seconds: timeout.as_secs(),
        }),
    }
}

/// Last portion of an encoder's stderr, enough to diagnose without
/// storing megabytes of log in the job record.
fn stderr_tail(stderr: &str) -> String {
    const TAIL: usize = 2000;
    let trimmed = stderr.trim();
    if trimmed.len() <= TAIL {
        return trimmed.to_string();
    }
    let start = trimmed.len() - TAIL;
    // Avoid splitting a UTF-8 code point.
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_short_output() {
        assert_eq!(stderr_tail("  error: bad frame  "), "error: bad frame");
    }

    #[test]
    fn stderr_tail_truncates_long_output() {
        let long = "x".repeat(5000);
        assert_eq!(stderr_tail(&long).len(), 2000);
    }
}
