//! SVT-AV1 video re-encode via ffmpeg.

use std::path::{Path, PathBuf};

use encq_models::VideoParams;

use crate::error::{MediaError, MediaResult};

/// Quantization-matrix tuning, fixed for all encodes.
const SVT_AV1_PARAMS: &str = "tune=0:enable-qm=1:qm-min=0:qm-max=8";

/// Re-encodes the video stream with libsvtav1 while copying audio,
/// subtitles, metadata and chapters through untouched.
pub struct SvtAv1Encoder {
    binary: PathBuf,
}

impl SvtAv1Encoder {
    /// Discover ffmpeg in PATH.
    pub fn new() -> MediaResult<Self> {
        let binary = which::which("ffmpeg")
            .map_err(|_| MediaError::binary_not_found("ffmpeg"))?;
        Ok(Self { binary })
    }

    /// Use an explicit ffmpeg path instead of PATH discovery.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Argument vector for one encode. All input streams are mapped so
    /// multi-audio and subtitled files survive the re-encode.
    pub fn build_args(&self, params: &VideoParams, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-i".into(),
            input.display().to_string(),
            "-y".into(),
            "-loglevel".into(),
            "warning".into(),
            "-hide_banner".into(),
            "-c:v".into(),
            "libsvtav1".into(),
            "-preset".into(),
            params.preset.to_string(),
            "-crf".into(),
            params.crf.to_string(),
            "-svtav1-params".into(),
            SVT_AV1_PARAMS.into(),
            "-c:a".into(),
            "copy".into(),
            "-c:s".into(),
            "copy".into(),
            "-map".into(),
            "0".into(),
            "-map_metadata".into(),
            "0".into(),
            "-map_chapters".into(),
            "0".into(),
            output.display().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_uses_params() {
        let enc = SvtAv1Encoder::with_binary("/usr/bin/ffmpeg");
        let params = VideoParams { preset: 4, crf: 30 };
        let args = enc.build_args(
            &params,
            Path::new("/tmp/in.mkv"),
            Path::new("/tmp/out.mkv"),
        );

        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "/tmp/in.mkv");
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mkv"));

        let preset_at = args.iter().position(|a| a == "-preset").unwrap();
        assert_eq!(args[preset_at + 1], "4");
        let crf_at = args.iter().position(|a| a == "-crf").unwrap();
        assert_eq!(args[crf_at + 1], "30");
    }

    #[test]
    fn build_args_copies_side_streams() {
        let enc = SvtAv1Encoder::with_binary("ffmpeg");
        let args = enc.build_args(
            &VideoParams::default(),
            Path::new("in.mp4"),
            Path::new("out.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-c:s copy"));
        assert!(joined.contains("-map_metadata 0"));
        assert!(joined.contains("-map_chapters 0"));
    }
}
