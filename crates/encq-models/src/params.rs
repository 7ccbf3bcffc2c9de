//! Kind-specific encoding parameters.
//!
//! Every numeric field is bounded to a validated range at submission time
//! and immutable once the job is created.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::job::JobKind;

/// Default lossless WebP compression effort (0-9).
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 9;
/// Default SVT-AV1 preset (0-13).
pub const DEFAULT_PRESET: u8 = 2;
/// Default SVT-AV1 CRF (0-63).
pub const DEFAULT_CRF: u8 = 2;

/// Submission parameter rejected before any side effect.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("priority {0} out of range 0-10")]
    InvalidPriority(u8),

    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(String),

    #[error("parameter {field} out of range: {detail}")]
    ParamOutOfRange { field: String, detail: String },

    #[error("unsupported input extension for {kind} job: {locator}")]
    UnsupportedExtension { kind: JobKind, locator: String },
}

impl From<validator::ValidationErrors> for ValidationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        // Report the first offending field; one is enough to reject.
        let mut field = "params".to_string();
        let mut detail = "invalid".to_string();
        if let Some((name, errs)) = errors.field_errors().into_iter().next() {
            field = name.to_string();
            if let Some(e) = errs.first() {
                detail = e.code.to_string();
            }
        }
        ValidationError::ParamOutOfRange { field, detail }
    }
}

/// Lossless WebP encoding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ImageParams {
    /// Compression effort (cwebp -z), 0-9.
    #[serde(default = "default_compression_level")]
    #[validate(range(min = 0, max = 9))]
    pub compression_level: u8,
}

fn default_compression_level() -> u8 {
    DEFAULT_COMPRESSION_LEVEL
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// SVT-AV1 video encoding parameters.
///
/// Only the video stream is re-encoded; audio, subtitles, metadata and
/// chapters are stream-copied unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct VideoParams {
    /// Encoder preset (speed/quality trade-off), 0-13.
    #[serde(default = "default_preset")]
    #[validate(range(min = 0, max = 13))]
    pub preset: u8,

    /// Constant rate factor (quality), 0-63, lower is better.
    #[serde(default = "default_crf")]
    #[validate(range(min = 0, max = 63))]
    pub crf: u8,
}

fn default_preset() -> u8 {
    DEFAULT_PRESET
}

fn default_crf() -> u8 {
    DEFAULT_CRF
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            preset: DEFAULT_PRESET,
            crf: DEFAULT_CRF,
        }
    }
}

/// Kind-specific encoding parameters attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncodeParams {
    Image(ImageParams),
    Video(VideoParams),
}

impl EncodeParams {
    /// The job kind these parameters apply to.
    pub fn kind(&self) -> JobKind {
        match self {
            EncodeParams::Image(_) => JobKind::Image,
            EncodeParams::Video(_) => JobKind::Video,
        }
    }

    /// Validate every field against its allowed range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            EncodeParams::Image(p) => Validate::validate(p)?,
            EncodeParams::Video(p) => Validate::validate(p)?,
        }
        Ok(())
    }

    /// Defaults for a given kind.
    pub fn default_for(kind: JobKind) -> Self {
        match kind {
            JobKind::Image => EncodeParams::Image(ImageParams::default()),
            JobKind::Video => EncodeParams::Video(VideoParams::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EncodeParams::default_for(JobKind::Image).validate().unwrap();
        EncodeParams::default_for(JobKind::Video).validate().unwrap();
    }

    #[test]
    fn image_compression_level_bounds() {
        let ok = EncodeParams::Image(ImageParams {
            compression_level: 9,
        });
        assert!(ok.validate().is_ok());

        let bad = EncodeParams::Image(ImageParams {
            compression_level: 10,
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn video_param_bounds() {
        let ok = EncodeParams::Video(VideoParams { preset: 13, crf: 63 });
        assert!(ok.validate().is_ok());

        let bad_preset = EncodeParams::Video(VideoParams { preset: 14, crf: 0 });
        assert!(bad_preset.validate().is_err());

        let bad_crf = EncodeParams::Video(VideoParams { preset: 0, crf: 64 });
        assert!(bad_crf.validate().is_err());
    }

    #[test]
    fn params_serde_tagged_by_kind() {
        let params = EncodeParams::Video(VideoParams::default());
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"kind\":\"video\""));
        let decoded: EncodeParams = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, params);
    }
}
