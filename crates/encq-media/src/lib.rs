//! Encoder collaborator.
//!
//! Encoding is an external subprocess, not a library concern: this crate
//! wraps ffmpeg (SVT-AV1 video re-encode with stream copy for everything
//! else) and cwebp (lossless WebP) behind the `Encoder` trait, with
//! per-kind timeouts. An encoder failure aborts the attempt; callers
//! never see a partially written output as success.

pub mod av1;
pub mod encoder;
pub mod error;
pub mod webp;

pub use av1::SvtAv1Encoder;
pub use encoder::{Encoder, MediaConfig, MediaEncoder};
pub use error::{MediaError, MediaResult};
pub use webp::CwebpEncoder;
