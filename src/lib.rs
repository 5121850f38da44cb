//! s3flux - concurrent client for S3-compatible object storage
//!
//! Speaks the S3 REST API directly over virtual-host style addressing
//! (`bucket.endpoint`) under either of two authentication schemes (the
//! legacy HMAC-SHA1 header scheme and AWS Signature V4), and layers
//! concurrent pipelines on top: parallel multipart upload, parallel ranged
//! download, server-side multipart copy, cross-endpoint streaming sync,
//! directory-scoped batch operations and multipart abort sweeps.

pub mod config;
pub mod pipeline;
pub mod s3;
pub mod signer;
pub mod transport;

pub use config::{ClientConfig, Credentials};
pub use s3::{Client, Result, S3Error};
