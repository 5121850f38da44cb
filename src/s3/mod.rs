//! S3 operations: the client core plus the bucket, multipart, directory
//! and sync engines layered on top of it.

pub mod bucket;
pub mod client;
pub mod dir;
pub mod error;
pub mod multipart;
pub mod sync;
pub mod types;

pub use client::Client;
pub use error::{Result, S3Error};
