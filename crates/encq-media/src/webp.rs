//! Lossless WebP image encode via cwebp.

use std::path::{Path, PathBuf};

use encq_models::ImageParams;

use crate::error::{MediaError, MediaResult};

/// Lossless, exact-pixel WebP conversion preserving all metadata.
pub struct CwebpEncoder {
    binary: PathBuf,
}

impl CwebpEncoder {
    /// Discover cwebp in PATH.
    pub fn new() -> MediaResult<Self> {
        let binary = which::which("cwebp")
            .map_err(|_| MediaError::binary_not_found("cwebp"))?;
        Ok(Self { binary })
    }

    /// Use an explicit cwebp path instead of PATH discovery.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn build_args(&self, params: &ImageParams, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-quiet".into(),
            "-mt".into(),
            "-metadata".into(),
            "all".into(),
            "-lossless".into(),
            "-exact".into(),
            "-z".into(),
            params.compression_level.to_string(),
            input.display().to_string(),
            "-o".into(),
            output.display().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_is_lossless_with_level() {
        let enc = CwebpEncoder::with_binary("/usr/bin/cwebp");
        let params = ImageParams {
            compression_level: 6,
        };
        let args = enc.build_args(
            &params,
            Path::new("/tmp/photo.png"),
            Path::new("/tmp/photo.webp"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-lossless"));
        assert!(joined.contains("-exact"));
        assert!(joined.contains("-z 6"));
        assert!(joined.ends_with("/tmp/photo.png -o /tmp/photo.webp"));
    }
}
