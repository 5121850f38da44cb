//! Multipart engine: init/part/complete/abort primitives and the
//! high-level parallel pipelines (large upload, server-side large copy,
//! move, ranged download).

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use hyper::Method;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::pipeline::{split_ranges, PartPipeline};
use crate::s3::client::{basename, default_object_name, header_etag, object_path, Client, S3Request};
use crate::s3::error::{Result, S3Error};
use crate::s3::types::{
    self, CompleteResult, CompletedPart, GetOptions, GetResult, InitUploadResult,
    LargeFileOptions, PutOptions, SourceUri,
};
use crate::signer::uri_encode;

impl Client {
    // =========================================================================
    // Multipart primitives
    // =========================================================================

    /// Start a multipart upload and return its upload ID
    pub async fn init_upload(
        &self,
        bucket: &str,
        object: &str,
        options: &PutOptions,
    ) -> Result<InitUploadResult> {
        let path = object_path(object);
        let mut headers = BTreeMap::new();
        if let Some(acl) = &options.acl {
            headers.insert("x-amz-acl".to_string(), acl.clone());
        }
        if let Some(name) = &options.disposition {
            headers.insert(
                "content-disposition".to_string(),
                format!("attachment; filename=\"{name}\""),
            );
        }
        for (name, value) in &options.metadata {
            headers.insert(format!("x-amz-meta-{name}"), value.clone());
        }
        let response = self
            .send(
                "init_upload",
                S3Request {
                    method: Method::POST,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}?uploads"),
                    path,
                    query: "uploads".to_string(),
                    headers,
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        types::parse_init_upload(&response.body)
    }

    /// Upload one part body; returns the part's ETag
    pub async fn upload_part(
        &self,
        body: Bytes,
        bucket: &str,
        object: &str,
        part_number: u32,
        upload_id: &str,
    ) -> Result<String> {
        let path = object_path(object);
        let query = part_query(part_number, upload_id);
        let response = self
            .send(
                "upload_part",
                S3Request {
                    method: Method::PUT,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}?{query}"),
                    path,
                    query,
                    headers: BTreeMap::new(),
                    body,
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        Ok(header_etag(&response.headers))
    }

    /// Server-side copy of one source range into a part; returns the
    /// part's ETag. `part_range` is `bytes=start-end`.
    #[allow(clippy::too_many_arguments)]
    pub async fn copy_part(
        &self,
        part_range: &str,
        bucket: &str,
        object: &str,
        source: &str,
        part_number: u32,
        upload_id: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<String> {
        let path = object_path(object);
        let query = part_query(part_number, upload_id);
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-copy-source".to_string(), source.to_string());
        headers.insert("x-amz-copy-source-range".to_string(), part_range.to_string());
        let response = self
            .send(
                "copy_part",
                S3Request {
                    method: Method::PUT,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}?{query}"),
                    path,
                    query,
                    headers,
                    body: Bytes::new(),
                    cancel,
                    accept: &[200],
                },
                None,
            )
            .await?;
        Ok(types::parse_copy_result(&response.body)?.etag)
    }

    /// Finish a multipart upload with an ordered part manifest
    pub async fn complete_upload(
        &self,
        parts: &[CompletedPart],
        bucket: &str,
        object: &str,
        upload_id: &str,
        object_size: u64,
    ) -> Result<CompleteResult> {
        let path = object_path(object);
        let query = format!("uploadId={}", uri_encode(upload_id, true));
        let manifest = types::build_complete_manifest(parts);
        let response = self
            .send(
                "complete_upload",
                S3Request {
                    method: Method::POST,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}?{query}"),
                    path,
                    query,
                    headers: BTreeMap::new(),
                    body: Bytes::from(manifest),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        let completed = types::parse_complete_upload(&response.body)?;
        Ok(CompleteResult {
            bucket: completed.bucket,
            key: completed.key,
            etag: completed.etag,
            size: object_size,
            location: self.object_location(bucket, object),
        })
    }

    /// Abort a multipart upload and release its server-side state
    pub async fn abort_upload(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()> {
        let path = object_path(object);
        let query = format!("uploadId={}", uri_encode(upload_id, true));
        self.send(
            "abort_upload",
            S3Request {
                method: Method::DELETE,
                bucket: Some(bucket.to_string()),
                resource_v2: format!("/{bucket}{path}?{query}"),
                path,
                query,
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

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Upload a local file as a parallel multipart upload.
    ///
    /// The file is sliced into equal parts (last one clamped), each part is
    /// uploaded by the bounded worker pool with per-part retry, and the
    /// ordered ETag manifest completes the upload. On pipeline failure the
    /// upload is aborted before the error is returned.
    pub async fn upload_large_file(
        &self,
        file_path: &Path,
        bucket: &str,
        object: &str,
        options: &LargeFileOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<CompleteResult> {
        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| S3Error::Input(format!("invalid file path: {}", file_path.display())))?;
        let object = default_object_name(object, file_name);
        let file_size = std::fs::metadata(file_path)?.len();

        let part_size = self
            .config
            .clamp_part_size(options.part_size, self.config.part_max_size);
        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let ranges = split_ranges(file_size, part_size);
        let total = ranges.len();

        let init = self
            .init_upload(
                bucket,
                &object,
                &PutOptions {
                    acl: options.acl.clone(),
                    disposition: options.disposition.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let pipeline =
            PartPipeline::new(thread_num, self.config.max_retry_num).with_progress(progress);
        let client = self.clone();
        let job_bucket = bucket.to_string();
        let job_object = object.clone();
        let upload_id = init.upload_id.clone();
        let ranges = Arc::new(ranges);
        let file_path = Arc::new(file_path.to_path_buf());

        let outcome = pipeline
            .run(total, move |index| {
                let client = client.clone();
                let bucket = job_bucket.clone();
                let object = job_object.clone();
                let upload_id = upload_id.clone();
                let ranges = Arc::clone(&ranges);
                let file_path = Arc::clone(&file_path);
                async move {
                    let (start, end) = ranges[index];
                    let body = read_file_range(&file_path, start, end)?;
                    client
                        .upload_part(body, &bucket, &object, index as u32 + 1, &upload_id)
                        .await
                }
            })
            .await;

        self.finish_pipeline(outcome, bucket, &object, &init.upload_id, file_size)
            .await
    }

    /// Server-side copy of a large object as a parallel multipart copy.
    /// The optional cancel channel aborts in-flight range copies.
    pub async fn copy_large_file(
        &self,
        bucket: &str,
        object: &str,
        source: &str,
        options: &LargeFileOptions,
        progress: Option<mpsc::Sender<usize>>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<CompleteResult> {
        let src = SourceUri::parse(source)?;
        let source_head = self.head(&src.bucket, &src.key).await?;
        let object = default_object_name(object, basename(&src.key));
        let object_size = source_head.content_length;

        let part_size = self
            .config
            .clamp_part_size(options.part_size, self.config.part_max_size);
        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let ranges = split_ranges(object_size, part_size);
        let total = ranges.len();

        let init = self
            .init_upload(
                bucket,
                &object,
                &PutOptions {
                    acl: options.acl.clone(),
                    disposition: options.disposition.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let pipeline = PartPipeline::new(thread_num, self.config.max_retry_num)
            .with_progress(progress)
            .with_cancel(cancel.clone());
        let client = self.clone();
        let job_bucket = bucket.to_string();
        let job_object = object.clone();
        let job_source = source.to_string();
        let upload_id = init.upload_id.clone();
        let ranges = Arc::new(ranges);

        let outcome = pipeline
            .run(total, move |index| {
                let client = client.clone();
                let bucket = job_bucket.clone();
                let object = job_object.clone();
                let source = job_source.clone();
                let upload_id = upload_id.clone();
                let cancel = cancel.clone();
                let ranges = Arc::clone(&ranges);
                async move {
                    let (start, end) = ranges[index];
                    let part_range = format!("bytes={start}-{end}");
                    client
                        .copy_part(
                            &part_range,
                            &bucket,
                            &object,
                            &source,
                            index as u32 + 1,
                            &upload_id,
                            cancel,
                        )
                        .await
                }
            })
            .await;

        self.finish_pipeline(outcome, bucket, &object, &init.upload_id, object_size)
            .await
    }

    /// Copy a large object then delete the source. The source's
    /// `Content-Disposition` filename is preserved on the copy; identical
    /// source and destination are refused.
    pub async fn move_large_file(
        &self,
        bucket: &str,
        object: &str,
        source: &str,
        options: &LargeFileOptions,
    ) -> Result<CompleteResult> {
        let src = SourceUri::parse(source)?;
        if bucket == src.bucket && object == src.key {
            return Err(S3Error::Input(
                "move source and target object must differ".to_string(),
            ));
        }
        let source_head = self.head(&src.bucket, &src.key).await?;
        let disposition = source_head
            .content_disposition
            .as_deref()
            .map(types::disposition_filename)
            .filter(|name| !name.is_empty());

        let copy_options = LargeFileOptions {
            disposition,
            ..options.clone()
        };
        let copied = self
            .copy_large_file(bucket, object, source, &copy_options, None, None)
            .await?;

        self.delete_with_retry(&src.bucket, &src.key).await?;
        Ok(copied)
    }

    /// Download an object with parallel ranged GETs.
    ///
    /// Each part spools into its own uniquely-named temp file and is then
    /// written into the destination at its absolute offset; the destination
    /// is opened once and never shares a cursor between workers. A local
    /// path ending in `/` is completed with the object's basename.
    pub async fn get(
        &self,
        bucket: &str,
        object: &str,
        local_file: &Path,
        options: &GetOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<GetResult> {
        let head = self.head(bucket, object).await?;
        let object_size = head.content_length;
        let part_size = self
            .config
            .clamp_part_size(options.part_size, self.config.part_min_size);
        let thread_num = self.config.clamp_thread_num(options.thread_num);

        let local_file: PathBuf = if local_file.as_os_str().to_string_lossy().ends_with('/') {
            local_file.join(basename(object))
        } else {
            local_file.to_path_buf()
        };
        if let Some(parent) = local_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let dest = Arc::new(std::fs::File::create(&local_file)?);

        let ranges = split_ranges(object_size, part_size);
        let total = ranges.len();

        let pipeline =
            PartPipeline::new(thread_num, self.config.max_retry_num).with_progress(progress);
        let client = self.clone();
        let job_bucket = bucket.to_string();
        let job_object = object.to_string();
        let ranges = Arc::new(ranges);

        pipeline
            .run(total, move |index| {
                let client = client.clone();
                let bucket = job_bucket.clone();
                let object = job_object.clone();
                let ranges = Arc::clone(&ranges);
                let dest = Arc::clone(&dest);
                async move {
                    let (start, end) = ranges[index];
                    let range = format!("bytes={start}-{end}");
                    // Fresh spool file per attempt, removed on every exit path.
                    let mut spool = tempfile::Builder::new().prefix("aws-v4-get").tempfile()?;
                    client
                        .cat(&bucket, &object, Some(&range), spool.as_file_mut())
                        .await?;

                    let mut buf = Vec::with_capacity((end - start + 1) as usize);
                    let mut reread = spool.reopen()?;
                    reread.read_to_end(&mut buf)?;

                    use std::os::unix::fs::FileExt;
                    dest.write_all_at(&buf, start)?;
                    Ok(())
                }
            })
            .await?;

        Ok(GetResult {
            key: object.to_string(),
            local_file,
        })
    }

    /// Complete the upload on pipeline success; abort it on failure and
    /// propagate the first pipeline error.
    pub(crate) async fn finish_pipeline(
        &self,
        outcome: Result<Vec<String>>,
        bucket: &str,
        object: &str,
        upload_id: &str,
        object_size: u64,
    ) -> Result<CompleteResult> {
        match outcome {
            Ok(etags) => {
                let parts: Vec<CompletedPart> = etags
                    .into_iter()
                    .enumerate()
                    .map(|(index, etag)| CompletedPart {
                        part_number: index as u32 + 1,
                        etag,
                    })
                    .collect();
                self.complete_upload(&parts, bucket, object, upload_id, object_size)
                    .await
            }
            Err(err) => {
                warn!(object, upload_id, error = %err, "pipeline failed, aborting upload");
                if let Err(abort_err) = self.abort_upload(bucket, object, upload_id).await {
                    warn!(object, upload_id, error = %abort_err, "abort after failure also failed");
                }
                Err(err)
            }
        }
    }

    /// Delete with the configured retry bound; used by the move cleanup.
    pub(crate) async fn delete_with_retry(&self, bucket: &str, object: &str) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.config.max_retry_num {
            match self.delete(bucket, object).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.config.max_retry_num => {
                    warn!(object, attempt, error = %err, "delete failed, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| S3Error::Input("retry bound is zero".to_string())))
    }
}

fn part_query(part_number: u32, upload_id: &str) -> String {
    format!("partNumber={part_number}&uploadId={}", uri_encode(upload_id, true))
}

/// Read the inclusive byte range `[start, end]` of a file into memory.
/// Opens its own handle, so concurrent part readers never share a cursor.
fn read_file_range(path: &Path, start: u64, end: u64) -> Result<Bytes> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start + 1) as usize];
    file.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_part_query_encodes_upload_id() {
        assert_eq!(part_query(3, "abc"), "partNumber=3&uploadId=abc");
        assert_eq!(
            part_query(1, "a/b+c"),
            "partNumber=1&uploadId=a%2Fb%2Bc"
        );
    }

    #[test]
    fn test_read_file_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let body = read_file_range(file.path(), 2, 5).unwrap();
        assert_eq!(&body[..], b"2345");

        let tail = read_file_range(file.path(), 8, 9).unwrap();
        assert_eq!(&tail[..], b"89");
    }
}
