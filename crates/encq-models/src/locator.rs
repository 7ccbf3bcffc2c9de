//! Output locator derivation.
//!
//! Pure and deterministic: deriving twice from the same `(input, kind)`
//! always yields the same output key.

use crate::job::JobKind;

/// Source extensions accepted for video jobs.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov"];
/// Source extensions accepted for image jobs.
pub const IMAGE_EXTENSIONS: &[&str] = &["png"];

/// Target extension for image jobs.
const WEBP_EXTENSION: &str = "webp";

/// Derive the blob-store key the encoded result is written to.
///
/// Input keys follow the upload scheme `input/<id>_<name>.<ext>`. The
/// output key keeps the id, inserts an `encoded_` marker and lands under
/// the `output/` prefix. Image jobs rewrite the extension to the target
/// codec; video jobs keep the container extension (only the video stream
/// is re-encoded).
///
/// `input/abc_photo.png` (image) -> `output/abc_encoded_photo.webp`
/// `input/abc_movie.mkv` (video) -> `output/abc_encoded_movie.mkv`
pub fn derive_output_locator(input_locator: &str, kind: JobKind) -> String {
    let name = input_locator
        .strip_prefix("input/")
        .unwrap_or(input_locator);

    let marked = match name.split_once('_') {
        Some((id, rest)) => format!("{id}_encoded_{rest}"),
        None => format!("encoded_{name}"),
    };

    let renamed = match kind {
        JobKind::Image => match marked.rsplit_once('.') {
            Some((stem, _)) => format!("{stem}.{WEBP_EXTENSION}"),
            None => format!("{marked}.{WEBP_EXTENSION}"),
        },
        JobKind::Video => marked,
    };

    format!("output/{renamed}")
}

/// Whether the input locator's extension is supported for the given kind.
pub fn extension_matches_kind(input_locator: &str, kind: JobKind) -> bool {
    let ext = match input_locator.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return false,
    };
    let accepted = match kind {
        JobKind::Image => IMAGE_EXTENSIONS,
        JobKind::Video => VIDEO_EXTENSIONS,
    };
    accepted.contains(&ext.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_locator_rewrites_extension() {
        assert_eq!(
            derive_output_locator("input/abc_photo.png", JobKind::Image),
            "output/abc_encoded_photo.webp"
        );
    }

    #[test]
    fn video_locator_keeps_extension() {
        assert_eq!(
            derive_output_locator("input/abc_movie.mkv", JobKind::Video),
            "output/abc_encoded_movie.mkv"
        );
        assert_eq!(
            derive_output_locator("input/xyz_clip.mp4", JobKind::Video),
            "output/xyz_encoded_clip.mp4"
        );
    }

    #[test]
    fn derivation_is_idempotent() {
        let a = derive_output_locator("input/abc_photo.png", JobKind::Image);
        let b = derive_output_locator("input/abc_photo.png", JobKind::Image);
        assert_eq!(a, b);
    }

    #[test]
    fn locator_without_prefix_or_underscore() {
        assert_eq!(
            derive_output_locator("photo.png", JobKind::Image),
            "output/encoded_photo.webp"
        );
    }

    #[test]
    fn extension_checks() {
        assert!(extension_matches_kind("input/a_b.png", JobKind::Image));
        assert!(extension_matches_kind("input/a_b.MKV", JobKind::Video));
        assert!(!extension_matches_kind("input/a_b.png", JobKind::Video));
        assert!(!extension_matches_kind("input/a_b.gif", JobKind::Image));
        assert!(!extension_matches_kind("noext", JobKind::Video));
    }
}
