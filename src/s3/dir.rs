//! Directory engine: paginated listing cross-fed into the worker pipeline
//! with per-object skip policies, suffix filtering and target key naming.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::DateTime;
use hyper::Method;
use tokio::sync::mpsc;
use tracing::debug;

use crate::pipeline::{BatchCounters, PartPipeline};
use crate::s3::client::{basename, Client, S3Request};
use crate::s3::error::{Result, S3Error};
use crate::s3::types::{
    self, BatchOptions, BatchSummary, GetOptions, HeadResult, LargeFileOptions, ListObjectResult,
    ListOptions, PutOptions, SourceUri,
};

/// Pagination cursor over an object listing.
///
/// Yields pages until a response arrives with `IsTruncated` false; the
/// marker advances to `NextMarker` when the server provides one, else to
/// the last key of the page.
pub struct ListCursor {
    prefix: Option<String>,
    marker: Option<String>,
    max_keys: u32,
    done: bool,
}

impl ListCursor {
    pub fn new(prefix: Option<String>, max_keys: u32) -> Self {
        Self {
            prefix,
            marker: None,
            max_keys,
            done: false,
        }
    }

    /// Fetch the next page, or `None` once the listing is exhausted.
    pub async fn next_page(
        &mut self,
        client: &Client,
        bucket: &str,
    ) -> Result<Option<ListObjectResult>> {
        if self.done {
            return Ok(None);
        }
        let page = client
            .list_object(
                bucket,
                &ListOptions {
                    prefix: self.prefix.clone(),
                    marker: self.marker.clone(),
                    max_keys: Some(self.max_keys),
                    ..Default::default()
                },
            )
            .await?;

        if page.is_truncated {
            self.marker = page
                .next_marker
                .clone()
                .or_else(|| page.contents.last().map(|entry| entry.key.clone()));
            // A truncated page with no marker cannot advance.
            if self.marker.is_none() {
                self.done = true;
            }
        } else {
            self.done = true;
        }
        Ok(Some(page))
    }
}

impl Client {
    /// Walk a local directory and upload every file under `prefix`,
    /// skipping up-to-date targets unless `replace` is set.
    pub async fn upload_from_dir(
        &self,
        local_dir: &Path,
        bucket: &str,
        prefix: &str,
        options: &BatchOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<BatchSummary> {
        let prefix = normalize_prefix(prefix);
        let files = walk_dir(local_dir, &options.suffix)?;
        let total = files.len() as u64;

        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let counters = Arc::new(BatchCounters::new());
        let pipeline =
            PartPipeline::new(thread_num, self.config.max_retry_num).with_progress(progress);

        let client = self.clone();
        let job_bucket = bucket.to_string();
        let local_dir = Arc::new(local_dir.to_path_buf());
        let files = Arc::new(files);
        let job_counters = Arc::clone(&counters);
        let replace = options.replace;
        let acl = options.acl.clone();

        pipeline
            .run(files.len(), move |index| {
                let client = client.clone();
                let bucket = job_bucket.clone();
                let prefix = prefix.clone();
                let local_dir = Arc::clone(&local_dir);
                let files = Arc::clone(&files);
                let counters = Arc::clone(&job_counters);
                let acl = acl.clone();
                async move {
                    let file_name = &files[index];
                    let file_path = local_dir.join(file_name);
                    let object = format!("{prefix}{file_name}");

                    let metadata = std::fs::metadata(&file_path)?;
                    let file_size = metadata.len();
                    let file_epoch = metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64);

                    if !replace {
                        let target = client.head(&bucket, &object).await.ok();
                        if should_skip(file_size, file_epoch, target.as_ref()) {
                            counters.add_skip();
                            return Ok(());
                        }
                    }

                    let data = std::fs::read(&file_path)?;
                    client
                        .put(
                            Bytes::from(data),
                            &bucket,
                            &object,
                            &PutOptions {
                                acl,
                                disposition: Some(file_name.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    counters.add_size(file_size);
                    counters.add_finish();
                    Ok(())
                }
            })
            .await?;

        Ok(BatchSummary {
            total,
            finish: counters.finish(),
            skip: counters.skip(),
            size: counters.size(),
        })
    }

    /// Download every object under `prefix` into `local_dir`, mirroring
    /// key paths, skipping up-to-date local files unless `replace` is set.
    pub async fn download_all_object(
        &self,
        bucket: &str,
        prefix: &str,
        local_dir: &Path,
        options: &BatchOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<BatchSummary> {
        let max_keys = options.max_keys.unwrap_or(1000);
        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let counters = Arc::new(BatchCounters::new());
        let mut total = 0u64;

        let mut cursor = ListCursor::new(Some(prefix.to_string()), max_keys);
        while let Some(page) = cursor.next_page(self, bucket).await? {
            total += page.contents.len() as u64;
            if page.contents.is_empty() {
                continue;
            }

            // Inner ranged downloads carry their own per-part retries.
            let pipeline = PartPipeline::new(thread_num, 1).with_progress(progress.clone());
            let client = self.clone();
            let job_bucket = bucket.to_string();
            let local_dir = Arc::new(local_dir.to_path_buf());
            let entries = Arc::new(page.contents);
            let job_counters = Arc::clone(&counters);
            let options = options.clone();

            pipeline
                .run(entries.len(), move |index| {
                    let client = client.clone();
                    let bucket = job_bucket.clone();
                    let local_dir = Arc::clone(&local_dir);
                    let entries = Arc::clone(&entries);
                    let counters = Arc::clone(&job_counters);
                    let options = options.clone();
                    async move {
                        let entry = &entries[index];
                        if !suffix_match(&entry.key, &options.suffix) {
                            counters.add_skip();
                            return Ok(());
                        }
                        let local_file = local_dir.join(&entry.key);

                        if !options.replace {
                            let head = client.head(&bucket, &entry.key).await.ok();
                            if let (Some(head), Ok(meta)) =
                                (head.as_ref(), std::fs::metadata(&local_file))
                            {
                                let local_epoch = meta
                                    .modified()
                                    .ok()
                                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                                    .map(|d| d.as_secs() as i64)
                                    .unwrap_or(i64::MIN);
                                let remote_epoch = head
                                    .last_modified
                                    .as_deref()
                                    .and_then(parse_http_date_epoch)
                                    .unwrap_or(i64::MIN);
                                if meta.len() == head.content_length && remote_epoch <= local_epoch
                                {
                                    counters.add_skip();
                                    return Ok(());
                                }
                            }
                        }

                        client
                            .get(
                                &bucket,
                                &entry.key,
                                &local_file,
                                &GetOptions {
                                    part_size: options.part_size,
                                    thread_num: options.thread_num,
                                },
                                None,
                            )
                            .await?;
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

    /// Server-side copy of every object under a source prefix
    pub async fn copy_all_object(
        &self,
        bucket: &str,
        prefix: &str,
        source: &str,
        options: &BatchOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<BatchSummary> {
        self.transfer_all_object(bucket, prefix, source, options, progress, false)
            .await
    }

    /// Server-side copy then source delete of every object under a source
    /// prefix. Identical source and destination prefixes are refused.
    pub async fn move_all_object(
        &self,
        bucket: &str,
        prefix: &str,
        source: &str,
        options: &BatchOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<BatchSummary> {
        let src = SourceUri::parse(source)?;
        if bucket == src.bucket && normalize_prefix(prefix) == src.key {
            return Err(S3Error::Input(
                "move source and target prefix must differ".to_string(),
            ));
        }
        self.transfer_all_object(bucket, prefix, source, options, progress, true)
            .await
    }

    /// Batch delete of every object under `prefix`: one quiet `?delete`
    /// POST per listing page, at most 1000 keys each.
    pub async fn delete_all_object(
        &self,
        bucket: &str,
        prefix: &str,
        options: &BatchOptions,
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<BatchSummary> {
        let max_keys = options.max_keys.unwrap_or(1000);
        let mut batches: Vec<Vec<String>> = Vec::new();
        let mut total = 0u64;

        let mut cursor = ListCursor::new(Some(prefix.to_string()), max_keys);
        while let Some(page) = cursor.next_page(self, bucket).await? {
            total += page.contents.len() as u64;
            if !page.contents.is_empty() {
                batches.push(page.contents.into_iter().map(|entry| entry.key).collect());
            }
        }
        if total == 0 {
            return Ok(BatchSummary::default());
        }
        debug!(total, batches = batches.len(), "batch delete");

        let thread_num = self.config.clamp_thread_num(options.thread_num);
        let counters = Arc::new(BatchCounters::new());
        let pipeline =
            PartPipeline::new(thread_num, self.config.max_retry_num).with_progress(progress);

        let client = self.clone();
        let job_bucket = bucket.to_string();
        let batches = Arc::new(batches);
        let job_counters = Arc::clone(&counters);

        pipeline
            .run(batches.len(), move |index| {
                let client = client.clone();
                let bucket = job_bucket.clone();
                let batches = Arc::clone(&batches);
                let counters = Arc::clone(&job_counters);
                async move {
                    let keys = &batches[index];
                    let body = Bytes::from(types::build_batch_delete(keys));
                    let mut headers = BTreeMap::new();
                    headers.insert(
                        "content-md5".to_string(),
                        BASE64.encode(md5::compute(&body).0),
                    );
                    client
                        .send(
                            "delete_all_object",
                            S3Request {
                                method: Method::POST,
                                bucket: Some(bucket.clone()),
                                path: "/".to_string(),
                                query: "delete".to_string(),
                                resource_v2: format!("/{bucket}/?delete"),
                                headers,
                                body,
                                cancel: None,
                                accept: &[200],
                            },
                            None,
                        )
                        .await?;
                    counters.add_finish_n(keys.len() as u64);
                    Ok(())
                }
            })
            .await?;

        Ok(BatchSummary {
            total,
            finish: counters.finish(),
            skip: 0,
            size: 0,
        })
    }

    /// Shared copy/move traversal: list the source prefix page by page and
    /// dispatch one large-copy per entry through the pipeline.
    async fn transfer_all_object(
        &self,
        bucket: &str,
        prefix: &str,
        source: &str,
        options: &BatchOptions,
        progress: Option<mpsc::Sender<usize>>,
        delete_source: bool,
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

            // Inner large-copies carry their own per-part retries.
            let pipeline = PartPipeline::new(thread_num, 1).with_progress(progress.clone());
            let client = self.clone();
            let job_bucket = bucket.to_string();
            let job_prefix = prefix.clone();
            let job_src = src.clone();
            let entries = Arc::new(page.contents);
            let job_counters = Arc::clone(&counters);
            let options = options.clone();

            pipeline
                .run(entries.len(), move |index| {
                    let client = client.clone();
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

                        let source_head = client
                            .head(&src.bucket, &entry.key)
                            .await
                            .unwrap_or_default();
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
                            let target_head = client.head(&bucket, &target).await.ok();
                            if should_skip(
                                source_head.content_length,
                                source_epoch,
                                target_head.as_ref(),
                            ) {
                                counters.add_skip();
                                return Ok(());
                            }
                        }

                        let entry_source = format!("/{}/{}", src.bucket, entry.key);
                        client
                            .copy_large_file(
                                &bucket,
                                &target,
                                &entry_source,
                                &LargeFileOptions {
                                    part_size: options.part_size,
                                    thread_num: options.thread_num,
                                    acl: options.acl.clone(),
                                    disposition,
                                },
                                None,
                                None,
                            )
                            .await?;
                        if delete_source {
                            client.delete_with_retry(&src.bucket, &entry.key).await?;
                        }
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

/// Normalize a target prefix: empty stays empty, anything else gets exactly
/// one trailing slash.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", prefix.trim_end_matches('/'))
    }
}

/// Target key naming: with `full_path` the source key (minus the source
/// prefix) lands under the target prefix, otherwise just its basename.
pub(crate) fn target_key(prefix: &str, source_key: &str, source_prefix: &str, full_path: bool) -> String {
    if full_path {
        let stripped = source_key.strip_prefix(source_prefix).unwrap_or(source_key);
        format!("{prefix}{stripped}")
    } else {
        format!("{prefix}{}", basename(source_key))
    }
}

/// Case-insensitive comma-separated suffix allowlist; an empty list
/// includes everything.
pub(crate) fn suffix_match(key: &str, suffix: &Option<String>) -> bool {
    let Some(list) = suffix else {
        return true;
    };
    let suffixes: Vec<&str> = list.split(',').filter(|s| !s.is_empty()).collect();
    if suffixes.is_empty() {
        return true;
    }
    let key = key.to_lowercase();
    suffixes
        .iter()
        .any(|suffix| key.ends_with(&suffix.to_lowercase()))
}

/// Skip policy: the target must exist, match the source size and be no
/// older than the source. Unparseable timestamps sort oldest.
pub(crate) fn should_skip(
    source_size: u64,
    source_epoch: Option<i64>,
    target: Option<&HeadResult>,
) -> bool {
    let Some(target) = target else {
        return false;
    };
    if target.content_length != source_size {
        return false;
    }
    let source = source_epoch.unwrap_or(i64::MIN);
    let target_epoch = target
        .last_modified
        .as_deref()
        .and_then(parse_http_date_epoch)
        .unwrap_or(i64::MIN);
    target_epoch >= source
}

/// Epoch seconds of an RFC-1123 `Last-Modified` value
pub(crate) fn parse_http_date_epoch(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value).ok().map(|t| t.timestamp())
}

/// Recursively collect files under `root` as slash-separated relative
/// paths, filtered by the suffix allowlist, in sorted order.
fn walk_dir(root: &Path, suffix: &Option<String>) -> Result<Vec<String>> {
    fn visit(dir: &Path, root: &Path, list: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                visit(&path, root, list)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                list.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    let mut list = Vec::new();
    visit(root, root, &mut list)?;
    list.retain(|name| suffix_match(name, suffix));
    list.sort();
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("dst"), "dst/");
        assert_eq!(normalize_prefix("dst/"), "dst/");
    }

    #[test]
    fn test_target_key_naming() {
        assert_eq!(
            target_key("dst/", "src/a/b.txt", "src/", true),
            "dst/a/b.txt"
        );
        assert_eq!(target_key("dst/", "src/a/b.txt", "src/", false), "dst/b.txt");
        assert_eq!(target_key("", "src/a.txt", "src/", true), "a.txt");
    }

    #[test]
    fn test_suffix_match() {
        assert!(suffix_match("a.txt", &None));
        assert!(suffix_match("a.txt", &Some(String::new())));
        assert!(suffix_match("a.TXT", &Some(".txt,.log".to_string())));
        assert!(suffix_match("b.log", &Some(".txt,.log".to_string())));
        assert!(!suffix_match("c.bin", &Some(".txt,.log".to_string())));
        assert!(suffix_match("c.bin", &Some(",".to_string())));
    }

    #[test]
    fn test_should_skip() {
        let target = HeadResult {
            content_length: 100,
            last_modified: Some("Thu, 02 May 2024 10:00:00 GMT".to_string()),
            ..Default::default()
        };
        let older = parse_http_date_epoch("Wed, 01 May 2024 10:00:00 GMT");
        let newer = parse_http_date_epoch("Fri, 03 May 2024 10:00:00 GMT");

        // Same size, target at least as new: skip.
        assert!(should_skip(100, older, Some(&target)));
        // Source newer than target: no skip.
        assert!(!should_skip(100, newer, Some(&target)));
        // Size mismatch: no skip.
        assert!(!should_skip(99, older, Some(&target)));
        // Missing target: no skip.
        assert!(!should_skip(100, older, None));
    }

    #[test]
    fn test_walk_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.log"), b"b").unwrap();
        std::fs::write(dir.path().join("sub/c.bin"), b"c").unwrap();

        let all = walk_dir(dir.path(), &None).unwrap();
        assert_eq!(all, vec!["a.txt", "sub/b.log", "sub/c.bin"]);

        let filtered = walk_dir(dir.path(), &Some(".txt,.log".to_string())).unwrap();
        assert_eq!(filtered, vec!["a.txt", "sub/b.log"]);
    }
}
