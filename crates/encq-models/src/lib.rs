//! Shared data models for the encq dispatch core.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, job ids and job status
//! - Routing keys and priorities
//! - Kind-specific encoding parameters with validated ranges
//! - Output locator derivation

pub mod job;
pub mod locator;
pub mod params;
pub mod routing;

pub use job::{Job, JobId, JobKind, JobStatus};
pub use locator::{derive_output_locator, extension_matches_kind};
pub use params::{EncodeParams, ImageParams, VideoParams, ValidationError};
pub use routing::{RoutingKey, DEFAULT_PRIORITY, MAX_PRIORITY};
