//! Cross-endpoint sync engine: ranged download from the source endpoint
//! spooled through local temp files into a multipart upload (or plain PUT)
//! on the destination endpoint.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::pipeline::{split_ranges, BatchCounters, PartPipeline};
use crate::s3::client::{basename, default_object_name, Client};
use crate::s3::dir::{
    normalize_prefix, parse_http_date_epoch, should_skip, suffix_match, target_key, ListCursor,
};
use crate::s3::error::{Result, S3Error};
use crate::s3::types::{
    self, BatchOptions, BatchSummary, CompleteResult, LargeFileOptions, PutOptions, SourceUri,
};

impl Client {
    /// Stream one large object from this client's endpoint into a
    /// multipart upload on `to_client`'s endpoint.
    ///
    /// Every part range is downloaded into its own temp spool file and
    /// re-read into an `upload_part` on the destination; parts run through
    /// the pipeline with full parallelism. A source with zero
    /// `Content-Length` is rejected.
    pub async fn sync_large_file(
        &self,
        to_client: &Client,
        bucket: &str,
        object: &str,
        source: &str,
        options: &LargeFileOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<CompleteResult> {
        let src = SourceUri::parse(source)?;
        let source_head = self.head(&src.bucket, &src.key).await?;
        let object = default_object_name(object, basename(&src.key));
        let object_size = source_head.content_length;
        if object_size == 0 {
            return Err(S3Error::Protocol(format!(
                "sync source {source} has zero Content-Length"
            )));
        }

        let part_size = self
            .config
            .clamp_part_size(options.part_size, self.config.part_max_size);
        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let ranges = split_ranges(object_size, part_size);
        let total = ranges.len();
        debug!(object, total, "sync large file");

        let init = to_client
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
        let from = self.clone();
        let to = to_client.clone();
        let job_bucket = bucket.to_string();
        let job_object = object.clone();
        let job_src = src.clone();
        let upload_id = init.upload_id.clone();
        let ranges = Arc::new(ranges);

        let outcome = pipeline
            .run(total, move |index| {
                let from = from.clone();
                let to = to.clone();
                let bucket = job_bucket.clone();
                let object = job_object.clone();
                let src = job_src.clone();
                let upload_id = upload_id.clone();
                let ranges = Arc::clone(&ranges);
                async move {
                    let (start, end) = ranges[index];
                    let range = format!("bytes={start}-{end}");
                    // Fresh spool per attempt, removed on every exit path.
                    let mut spool = tempfile::Builder::new()
                        .prefix("aws-v4-sync-large")
                        .tempfile()?;
                    from.cat(&src.bucket, &src.key, Some(&range), spool.as_file_mut())
                        .await?;

                    let mut body = Vec::with_capacity((end - start + 1) as usize);
                    spool.reopen()?.read_to_end(&mut body)?;
                    to.upload_part(
                        Bytes::from(body),
                        &bucket,
                        &object,
                        index as u32 + 1,
                        &upload_id,
                    )
                    .await
                }
            })
            .await;

        to_client
            .finish_pipeline(outcome, bucket, &object, &init.upload_id, object_size)
            .await
    }

    /// Stream every object under a source prefix to `to_client`'s endpoint,
    /// spooling whole objects through temp files (required when source and
    /// destination are different endpoints).
    pub async fn sync_all_object(
        &self,
        to_client: &Client,
        bucket: &str,
        prefix: &str,
        source: &str,
        options: &BatchOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<BatchSummary> {
        let prefix = normalize_prefix(prefix);
        let src = SourceUri::parse(source)?;
        let max_keys = options.max_keys.unwrap_or(1000);
        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let counters = Arc::new(BatchCounters::new());
        let mut total = 0u64;

        let mut cursor = ListCursor::new(Some(src.key.clone()), max_keys);
        while let Some(page) = cursor.next_page(self, &src.bucket).await? {
            total += page.contents.len() as u64;
            if page.contents.is_empty() {
                continue;
            }

            let pipeline = PartPipeline::new(thread_num, self.config.max_retry_num)
                .with_progress(progress.clone());
            let from = self.clone();
            let to = to_client.clone();
            let job_bucket = bucket.to_string();
            let job_prefix = prefix.clone();
            let job_src = src.clone();
            let entries = Arc::new(page.contents);
            let job_counters = Arc::clone(&counters);
            let options = options.clone();

            pipeline
                .run(entries.len(), move |index| {
                    let from = from.clone();
                    let to = to.clone();
                    let bucket = job_bucket.clone();
                    let prefix = job_prefix.clone();
                    let src = job_src.clone();
                    let entries = Arc::clone(&entries);
                    let counters = Arc::clone(&job_counters);
                    let options = options.clone();
                    async move {
                        let entry = &entries[index];
                        if !suffix_match(&entry.key, &options.suffix) {
                            counters.add_skip();
                            return Ok(());
                        }
                        let target = target_key(&prefix, &entry.key, &src.key, options.full_path);

                        let source_head =
                            from.head(&src.bucket, &entry.key).await.unwrap_or_default();
                        let disposition = source_head
                            .content_disposition
                            .as_deref()
                            .map(types::disposition_filename)
                            .filter(|name| !name.is_empty());

                        if !options.replace {
                            let source_epoch = source_head
                                .last_modified
                                .as_deref()
                                .and_then(parse_http_date_epoch);
                            let target_head = to.head(&bucket, &target).await.ok();
                            if should_skip(
                                source_head.content_length,
                                source_epoch,
                                target_head.as_ref(),
                            ) {
                                counters.add_skip();
                                return Ok(());
                            }
                        }

                        // Spool the whole object, then re-read for the PUT.
                        let mut spool = tempfile::Builder::new()
                            .prefix("aws-v4-sync-all")
                            .tempfile()?;
                        from.cat(&src.bucket, &entry.key, None, spool.as_file_mut())
                            .await?;
                        let mut body = Vec::new();
                        spool.reopen()?.read_to_end(&mut body)?;

                        to.put(
                            Bytes::from(body),
                            &bucket,
                            &target,
                            &PutOptions {
                                acl: options.acl.clone(),
                                disposition,
                                ..Default::default()
                            },
                        )
                        .await?;
                        counters.add_size(source_head.content_length);
                        counters.add_finish();
                        Ok(())
                    }
                })
                .await?;
        }

        Ok(BatchSummary {
            total,
            finish: counters.finish(),
            skip: counters.skip(),
            size: counters.size(),
        })
    }
}
