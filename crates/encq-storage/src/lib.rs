//! Blob store collaborator.
//!
//! The dispatch core treats durable key/bytes storage as an external
//! collaborator behind the `BlobStore` trait. This crate provides:
//! - The trait itself
//! - An S3-compatible client (MinIO, R2) with transparent multipart
//!   upload for large objects
//! - An in-memory store for tests

pub mod error;
pub mod memory;
pub mod s3;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryBlobStore;
pub use s3::{S3BlobStore, S3Config};
pub use store::BlobStore;
