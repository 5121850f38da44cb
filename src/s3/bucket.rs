//! Bucket-level operations: service listing, bucket lifecycle/ACL
//! management, multipart upload listing and the abort sweep.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{NaiveDateTime, Utc};
use hyper::Method;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::pipeline::{BatchCounters, PartPipeline};
use crate::s3::client::{Client, S3Request};
use crate::s3::error::Result;
use crate::s3::types::{
    self, AclResult, LifecycleResult, LifecycleRule, ListOptions, ListUploadsResult,
    MultipartUploadEntry, ServiceResult, SweepOptions, SweepSummary,
};
use crate::signer::uri_encode_into;

/// Timestamp format of `<Initiated>` in upload listings
const INITIATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

impl Client {
    /// List all buckets owned by the credentials
    pub async fn get_service(&self) -> Result<ServiceResult> {
        let response = self
            .send(
                "get_service",
                S3Request {
                    method: Method::GET,
                    bucket: None,
                    path: "/".to_string(),
                    query: String::new(),
                    resource_v2: "/".to_string(),
                    headers: BTreeMap::new(),
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        types::parse_service(&response.body)
    }

    /// Create a bucket. The V4 scheme sends a `LocationConstraint` document
    /// naming the signing region; the legacy scheme sends an empty body.
    pub async fn create_bucket(&self, bucket: &str, acl: Option<&str>) -> Result<()> {
        let body = if self.is_v4() {
            let region = self.config.region();
            Bytes::from(format!(
                "<CreateBucketConfiguration><LocationConstraint>{region}</LocationConstraint></CreateBucketConfiguration>"
            ))
        } else {
            Bytes::new()
        };
        let mut headers = BTreeMap::new();
        if let Some(acl) = acl {
            headers.insert("x-amz-acl".to_string(), acl.to_string());
        }
        self.send(
            "create_bucket",
            S3Request {
                method: Method::PUT,
                bucket: Some(bucket.to_string()),
                path: "/".to_string(),
                query: String::new(),
                resource_v2: format!("/{bucket}/"),
                headers,
                body,
                cancel: None,
                accept: &[200],
            },
            None,
        )
        .await?;
        Ok(())
    }

    /// Delete a bucket
    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.send(
            "delete_bucket",
            S3Request {
                method: Method::DELETE,
                bucket: Some(bucket.to_string()),
                path: "/".to_string(),
                query: String::new(),
                resource_v2: format!("/{bucket}/"),
                headers: BTreeMap::new(),
                body: Bytes::new(),
                cancel: None,
                accept: &[200, 204],
            },
            None,
        )
        .await?;
        Ok(())
    }

    /// Fetch the bucket ACL
    pub async fn get_acl(&self, bucket: &str) -> Result<AclResult> {
        let response = self
            .send(
                "get_acl",
                S3Request {
                    method: Method::GET,
                    bucket: Some(bucket.to_string()),
                    path: "/".to_string(),
                    query: "acl".to_string(),
                    resource_v2: format!("/{bucket}/?acl"),
                    headers: BTreeMap::new(),
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        types::parse_acl(&response.body)
    }

    /// Set the bucket's canned ACL
    pub async fn set_acl(&self, bucket: &str, acl: &str) -> Result<()> {
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-acl".to_string(), acl.to_string());
        self.send(
            "set_acl",
            S3Request {
                method: Method::PUT,
                bucket: Some(bucket.to_string()),
                path: "/".to_string(),
                query: "acl".to_string(),
                resource_v2: format!("/{bucket}/?acl"),
                headers,
                body: Bytes::new(),
                cancel: None,
                accept: &[200],
            },
            None,
        )
        .await?;
        Ok(())
    }

    /// Fetch the bucket lifecycle configuration
    pub async fn get_lifecycle(&self, bucket: &str) -> Result<LifecycleResult> {
        let response = self
            .send(
                "get_lifecycle",
                S3Request {
                    method: Method::GET,
                    bucket: Some(bucket.to_string()),
                    path: "/".to_string(),
                    query: "lifecycle".to_string(),
                    resource_v2: format!("/{bucket}/?lifecycle"),
                    headers: BTreeMap::new(),
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        types::parse_lifecycle(&response.body)
    }

    /// Append one expiration rule to the bucket lifecycle.
    ///
    /// Fetches the current ruleset (an unreadable one counts as empty),
    /// appends a rule with a fresh UUID and `Enabled` status, and PUTs the
    /// whole document back. Existing rules are neither deduplicated nor
    /// capped.
    pub async fn set_lifecycle(&self, bucket: &str, prefix: &str, expiration_days: u32) -> Result<()> {
        let mut rules = match self.get_lifecycle(bucket).await {
            Ok(existing) => existing.rules,
            Err(_) => Vec::new(),
        };
        rules.push(LifecycleRule {
            id: Uuid::new_v4().to_string(),
            status: "Enabled".to_string(),
            prefix: prefix.to_string(),
            expiration_days,
        });

        let document = types::build_lifecycle_document(&rules);
        let body = Bytes::from(document);
        let mut headers = BTreeMap::new();
        headers.insert(
            "content-md5".to_string(),
            BASE64.encode(md5::compute(&body).0),
        );

        self.send(
            "set_lifecycle",
            S3Request {
                method: Method::PUT,
                bucket: Some(bucket.to_string()),
                path: "/".to_string(),
                query: "lifecycle".to_string(),
                resource_v2: format!("/{bucket}/?lifecycle"),
                headers,
                body,
                cancel: None,
                accept: &[200],
            },
            None,
        )
        .await?;
        Ok(())
    }

    /// Remove the bucket lifecycle configuration
    pub async fn delete_lifecycle(&self, bucket: &str) -> Result<()> {
        self.send(
            "delete_lifecycle",
            S3Request {
                method: Method::DELETE,
                bucket: Some(bucket.to_string()),
                path: "/".to_string(),
                query: "lifecycle".to_string(),
                resource_v2: format!("/{bucket}/?lifecycle"),
                headers: BTreeMap::new(),
                body: Bytes::new(),
                cancel: None,
                accept: &[200, 204],
            },
            None,
        )
        .await?;
        Ok(())
    }

    /// List one page of in-progress multipart uploads. `options.marker`
    /// maps to `key-marker` and `options.max_keys` to `max-uploads`.
    pub async fn list_part(&self, bucket: &str, options: &ListOptions) -> Result<ListUploadsResult> {
        let mut query = String::with_capacity(64);
        let mut push = |name: &str, value: &str| {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(name);
            query.push('=');
            uri_encode_into(&mut query, value, true);
        };
        if let Some(delimiter) = &options.delimiter {
            push("delimiter", delimiter);
        }
        if let Some(marker) = &options.marker {
            push("key-marker", marker);
        }
        if let Some(max_keys) = options.max_keys {
            push("max-uploads", &max_keys.to_string());
        }
        if let Some(prefix) = &options.prefix {
            push("prefix", prefix);
        }
        // `uploads` sorts after every other parameter, so appending keeps
        // the query in canonical order.
        if query.is_empty() {
            query.push_str("uploads");
        } else {
            query.push_str("&uploads");
        }

        let response = self
            .send(
                "list_part",
                S3Request {
                    method: Method::GET,
                    bucket: Some(bucket.to_string()),
                    path: "/".to_string(),
                    query,
                    resource_v2: format!("/{bucket}/?uploads"),
                    headers: BTreeMap::new(),
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        types::parse_list_uploads(&response.body)
    }

    /// Abort every in-progress multipart upload under `prefix` that is
    /// older than `options.expired_secs`. Younger uploads count as skipped.
    pub async fn delete_all_part(
        &self,
        bucket: &str,
        prefix: &str,
        options: &SweepOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<SweepSummary> {
        let max_keys = options.max_keys.unwrap_or(1000);
        let expired_secs = options.expired_secs.unwrap_or(0) as i64;

        let mut total = 0u64;
        let mut skip = 0u64;
        let mut stale: Vec<MultipartUploadEntry> = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .list_part(
                    bucket,
                    &ListOptions {
                        prefix: Some(prefix.to_string()),
                        marker: marker.clone(),
                        max_keys: Some(max_keys),
                        ..Default::default()
                    },
                )
                .await?;
            total += page.uploads.len() as u64;

            for upload in page.uploads {
                let age_secs = NaiveDateTime::parse_from_str(&upload.initiated, INITIATED_FORMAT)
                    .ok()
                    .map(|t| (Utc::now() - t.and_utc()).num_seconds());
                if let Some(age) = age_secs {
                    if age < expired_secs {
                        skip += 1;
                        continue;
                    }
                }
                stale.push(upload);
            }

            if !page.is_truncated {
                break;
            }
            marker = page.next_key_marker;
        }

        if total == 0 {
            return Ok(SweepSummary::default());
        }
        debug!(total, stale = stale.len(), "aborting stale uploads");

        let counters = Arc::new(BatchCounters::new());
        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let pipeline = PartPipeline::new(thread_num, self.config.max_retry_num)
            .with_progress(progress);

        let client = self.clone();
        let bucket = bucket.to_string();
        let entries = Arc::new(stale);
        let job_counters = Arc::clone(&counters);
        pipeline
            .run(entries.len(), move |index| {
                let client = client.clone();
                let bucket = bucket.clone();
                let entries = Arc::clone(&entries);
                let counters = Arc::clone(&job_counters);
                async move {
                    let upload = &entries[index];
                    client
                        .abort_upload(&bucket, &upload.key, &upload.upload_id)
                        .await?;
                    counters.add_finish();
                    Ok(())
                }
            })
            .await?;

        Ok(SweepSummary {
            total,
            finish: counters.finish(),
            skip,
        })
    }
}
