//! Operation options, result records and XML payload codecs

use std::fmt;
use std::path::PathBuf;

use hyper::header::HeaderMap;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::s3::error::{Result, S3Error};

// =============================================================================
// Options
// =============================================================================

/// Options for single-object PUT and copy
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Canned ACL sent as `x-amz-acl`
    pub acl: Option<String>,
    /// Attachment filename sent as `Content-Disposition` (PUT) or
    /// `response-content-disposition` (copy)
    pub disposition: Option<String>,
    /// User metadata, each entry sent as `x-amz-meta-<name>`
    pub metadata: std::collections::BTreeMap<String, String>,
}

/// Options for the multipart pipelines (upload, copy, move, sync)
#[derive(Debug, Clone, Default)]
pub struct LargeFileOptions {
    /// Part size in bytes; values outside the configured bounds fall back
    /// to the default
    pub part_size: Option<u64>,
    /// Worker parallelism; values outside the configured bounds fall back
    /// to the maximum
    pub thread_num: Option<usize>,
    pub acl: Option<String>,
    pub disposition: Option<String>,
}

/// Options for ranged downloads
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub part_size: Option<u64>,
    pub thread_num: Option<usize>,
}

/// Options for object listing
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub delimiter: Option<String>,
    pub marker: Option<String>,
    pub max_keys: Option<u32>,
    pub prefix: Option<String>,
}

/// Options for directory-scoped batch operations
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Overwrite targets unconditionally, bypassing the skip policy
    pub replace: bool,
    /// Keep the full source key (minus the source prefix) instead of its
    /// basename when naming the target
    pub full_path: bool,
    /// Comma-separated suffix allowlist; empty means include all
    pub suffix: Option<String>,
    /// Listing page size (default 1000)
    pub max_keys: Option<u32>,
    pub thread_num: Option<usize>,
    pub part_size: Option<u64>,
    pub acl: Option<String>,
}

/// Options for the multipart abort sweep
#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    /// Keep uploads initiated within this many seconds
    pub expired_secs: Option<u64>,
    pub max_keys: Option<u32>,
    pub thread_num: Option<usize>,
}

// =============================================================================
// Result records
// =============================================================================

/// Result of a single-object PUT or server-side copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResult {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub location: String,
    pub request_id: String,
}

/// Result of a completed multipart pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResult {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub location: String,
}

/// Result of a ranged download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResult {
    pub key: String,
    pub local_file: PathBuf,
}

/// Typed view of a HEAD response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeadResult {
    pub content_length: u64,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
    pub etag: Option<String>,
}

impl HeadResult {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            content_length: text("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_modified: text("last-modified"),
            content_disposition: text("content-disposition"),
            etag: text("etag").map(|v| v.trim_matches('"').to_string()),
        }
    }
}

/// Aggregate outcome of a batch operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: u64,
    pub finish: u64,
    pub skip: u64,
    pub size: u64,
}

/// Aggregate outcome of a multipart abort sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    pub total: u64,
    pub finish: u64,
    pub skip: u64,
}

/// One entry of the completion manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-indexed part number
    pub part_number: u32,
    pub etag: String,
}

// =============================================================================
// Source URIs
// =============================================================================

/// A parsed `/bucket/key` source reference. The key keeps embedded slashes;
/// the split happens once at the first `/` after the leading one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUri {
    pub bucket: String,
    pub key: String,
}

impl SourceUri {
    pub fn parse(source: &str) -> Result<Self> {
        let rest = source
            .strip_prefix('/')
            .ok_or_else(|| S3Error::Input(format!("source must start with '/': {source}")))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| S3Error::Input(format!("source must be /bucket/key: {source}")))?;
        if bucket.is_empty() {
            return Err(S3Error::Input(format!("source bucket is empty: {source}")));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.bucket, self.key)
    }
}

/// Extract the attachment filename from a `Content-Disposition` value;
/// returns the input unchanged when no `filename="…"` is present.
pub fn disposition_filename(disposition: &str) -> String {
    if let Some(start) = disposition.find("filename=\"") {
        let tail = &disposition[start + "filename=\"".len()..];
        if let Some(end) = tail.rfind('"') {
            return tail[..end].to_string();
        }
    }
    disposition.to_string()
}

// =============================================================================
// XML decode targets
// =============================================================================

/// One `<Contents>` entry of an object listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// Decoded `ListBucketResult`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListObjectResult {
    pub contents: Vec<ListObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub prefix: Option<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
    pub max_keys: Option<u32>,
}

/// One bucket of the service listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceBucket {
    pub name: String,
    pub creation_date: String,
}

/// Decoded `ListAllMyBucketsResult`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceResult {
    pub owner_id: String,
    pub owner_display_name: String,
    pub buckets: Vec<ServiceBucket>,
}

/// One grant of an ACL document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclGrant {
    /// Grantee ID, or URI for group grants
    pub grantee: String,
    pub permission: String,
}

/// Decoded `AccessControlPolicy`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclResult {
    pub owner_id: String,
    pub owner_display_name: String,
    pub grants: Vec<AclGrant>,
}

/// One lifecycle rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub id: String,
    pub status: String,
    pub prefix: String,
    pub expiration_days: u32,
}

/// Decoded `LifecycleConfiguration`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleResult {
    pub rules: Vec<LifecycleRule>,
}

/// One in-progress upload of `ListMultipartUploadsResult`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUploadEntry {
    pub key: String,
    pub upload_id: String,
    pub initiated: String,
}

/// Decoded `ListMultipartUploadsResult`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListUploadsResult {
    pub uploads: Vec<MultipartUploadEntry>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
}

/// Decoded `InitiateMultipartUploadResult`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitUploadResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Decoded `CopyObjectResult` / `CopyPartResult`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyObjectResult {
    pub etag: String,
    pub last_modified: Option<String>,
}

/// Decoded `CompleteMultipartUploadResult`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteUploadResult {
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    pub etag: String,
}

// =============================================================================
// XML parsing
// =============================================================================

fn xml_reader(xml: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;
    reader
}

/// Decode an S3 `<Error>` document, lenient on malformed bodies.
pub fn parse_error(xml: &[u8]) -> (String, String) {
    let mut reader = xml_reader(xml);
    let mut code = String::new();
    let mut message = String::new();
    let mut current_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                if let Ok(text) = e.unescape() {
                    current_text.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Code" => code = std::mem::take(&mut current_text),
                    b"Message" => message = std::mem::take(&mut current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    (code, message)
}

/// Decode a `ListBucketResult` page
pub fn parse_list_object(xml: &[u8]) -> Result<ListObjectResult> {
    let mut reader = xml_reader(xml);
    let mut response = ListObjectResult::default();
    let mut current_entry: Option<ListObjectEntry> = None;
    let mut in_common_prefixes = false;
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"Contents" => {
                    current_entry = Some(ListObjectEntry {
                        key: String::new(),
                        size: 0,
                        last_modified: None,
                        etag: None,
                    });
                }
                b"CommonPrefixes" => in_common_prefixes = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Key" => {
                        if let Some(entry) = current_entry.as_mut() {
                            entry.key = std::mem::take(&mut current_text);
                        }
                    }
                    b"Size" => {
                        if let Some(entry) = current_entry.as_mut() {
                            entry.size = current_text.parse().unwrap_or(0);
                        }
                    }
                    b"LastModified" => {
                        if let Some(entry) = current_entry.as_mut() {
                            entry.last_modified = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"ETag" => {
                        if let Some(entry) = current_entry.as_mut() {
                            entry.etag = Some(
                                std::mem::take(&mut current_text)
                                    .trim_matches('"')
                                    .to_string(),
                            );
                        }
                    }
                    b"Contents" => {
                        if let Some(entry) = current_entry.take() {
                            response.contents.push(entry);
                        }
                    }
                    b"CommonPrefixes" => in_common_prefixes = false,
                    b"Prefix" => {
                        if in_common_prefixes {
                            response
                                .common_prefixes
                                .push(std::mem::take(&mut current_text));
                        } else {
                            response.prefix = Some(std::mem::take(&mut current_text));
                        }
                    }
                    b"IsTruncated" => response.is_truncated = current_text == "true",
                    b"NextMarker" => response.next_marker = Some(std::mem::take(&mut current_text)),
                    b"MaxKeys" => response.max_keys = current_text.parse().ok(),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    Ok(response)
}

/// Decode a `ListAllMyBucketsResult`
pub fn parse_service(xml: &[u8]) -> Result<ServiceResult> {
    let mut reader = xml_reader(xml);
    let mut response = ServiceResult::default();
    let mut current_bucket: Option<ServiceBucket> = None;
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Bucket" {
                    current_bucket = Some(ServiceBucket {
                        name: String::new(),
                        creation_date: String::new(),
                    });
                }
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"ID" => response.owner_id = std::mem::take(&mut current_text),
                    b"DisplayName" => {
                        response.owner_display_name = std::mem::take(&mut current_text);
                    }
                    b"Name" => {
                        if let Some(bucket) = current_bucket.as_mut() {
                            bucket.name = std::mem::take(&mut current_text);
                        }
                    }
                    b"CreationDate" => {
                        if let Some(bucket) = current_bucket.as_mut() {
                            bucket.creation_date = std::mem::take(&mut current_text);
                        }
                    }
                    b"Bucket" => {
                        if let Some(bucket) = current_bucket.take() {
                            response.buckets.push(bucket);
                        }
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    Ok(response)
}

/// Decode an `AccessControlPolicy`
pub fn parse_acl(xml: &[u8]) -> Result<AclResult> {
    let mut reader = xml_reader(xml);
    let mut response = AclResult::default();
    let mut in_grant = false;
    let mut grantee = String::new();
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Grant" {
                    in_grant = true;
                    grantee.clear();
                }
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"ID" if !in_grant => response.owner_id = std::mem::take(&mut current_text),
                    b"DisplayName" if !in_grant => {
                        response.owner_display_name = std::mem::take(&mut current_text);
                    }
                    b"ID" | b"URI" => grantee = std::mem::take(&mut current_text),
                    b"Permission" => {
                        response.grants.push(AclGrant {
                            grantee: std::mem::take(&mut grantee),
                            permission: std::mem::take(&mut current_text),
                        });
                    }
                    b"Grant" => in_grant = false,
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    Ok(response)
}

/// Decode a `LifecycleConfiguration`
pub fn parse_lifecycle(xml: &[u8]) -> Result<LifecycleResult> {
    let mut reader = xml_reader(xml);
    let mut response = LifecycleResult::default();
    let mut current_rule: Option<LifecycleRule> = None;
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Rule" {
                    current_rule = Some(LifecycleRule {
                        id: String::new(),
                        status: String::new(),
                        prefix: String::new(),
                        expiration_days: 0,
                    });
                }
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"ID" => {
                        if let Some(rule) = current_rule.as_mut() {
                            rule.id = std::mem::take(&mut current_text);
                        }
                    }
                    b"Status" => {
                        if let Some(rule) = current_rule.as_mut() {
                            rule.status = std::mem::take(&mut current_text);
                        }
                    }
                    b"Prefix" => {
                        if let Some(rule) = current_rule.as_mut() {
                            rule.prefix = std::mem::take(&mut current_text);
                        }
                    }
                    b"Days" => {
                        if let Some(rule) = current_rule.as_mut() {
                            rule.expiration_days = current_text.parse().unwrap_or(0);
                        }
                    }
                    b"Rule" => {
                        if let Some(rule) = current_rule.take() {
                            response.rules.push(rule);
                        }
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    Ok(response)
}

/// Decode a `ListMultipartUploadsResult` page
pub fn parse_list_uploads(xml: &[u8]) -> Result<ListUploadsResult> {
    let mut reader = xml_reader(xml);
    let mut response = ListUploadsResult::default();
    let mut current_upload: Option<MultipartUploadEntry> = None;
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Upload" {
                    current_upload = Some(MultipartUploadEntry {
                        key: String::new(),
                        upload_id: String::new(),
                        initiated: String::new(),
                    });
                }
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Key" => {
                        if let Some(upload) = current_upload.as_mut() {
                            upload.key = std::mem::take(&mut current_text);
                        }
                    }
                    b"UploadId" => {
                        if let Some(upload) = current_upload.as_mut() {
                            upload.upload_id = std::mem::take(&mut current_text);
                        }
                    }
                    b"Initiated" => {
                        if let Some(upload) = current_upload.as_mut() {
                            upload.initiated = std::mem::take(&mut current_text);
                        }
                    }
                    b"Upload" => {
                        if let Some(upload) = current_upload.take() {
                            response.uploads.push(upload);
                        }
                    }
                    b"IsTruncated" => response.is_truncated = current_text == "true",
                    b"NextKeyMarker" => {
                        response.next_key_marker = Some(std::mem::take(&mut current_text));
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    Ok(response)
}

/// Decode an `InitiateMultipartUploadResult`; a missing `UploadId` is a
/// protocol violation.
pub fn parse_init_upload(xml: &[u8]) -> Result<InitUploadResult> {
    let mut reader = xml_reader(xml);
    let mut bucket = String::new();
    let mut key = String::new();
    let mut upload_id = String::new();
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Bucket" => bucket = std::mem::take(&mut current_text),
                    b"Key" => key = std::mem::take(&mut current_text),
                    b"UploadId" => upload_id = std::mem::take(&mut current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    if upload_id.is_empty() {
        return Err(S3Error::Protocol("missing UploadId in response".to_string()));
    }

    Ok(InitUploadResult {
        bucket,
        key,
        upload_id,
    })
}

/// Decode a `CopyObjectResult` or `CopyPartResult`
pub fn parse_copy_result(xml: &[u8]) -> Result<CopyObjectResult> {
    let mut reader = xml_reader(xml);
    let mut result = CopyObjectResult::default();
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"ETag" => {
                        result.etag = std::mem::take(&mut current_text)
                            .trim_matches('"')
                            .to_string();
                    }
                    b"LastModified" => {
                        result.last_modified = Some(std::mem::take(&mut current_text));
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    Ok(result)
}

/// Decode a `CompleteMultipartUploadResult`
pub fn parse_complete_upload(xml: &[u8]) -> Result<CompleteUploadResult> {
    let mut reader = xml_reader(xml);
    let mut result = CompleteUploadResult::default();
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Location" => result.location = Some(std::mem::take(&mut current_text)),
                    b"Bucket" => result.bucket = std::mem::take(&mut current_text),
                    b"Key" => result.key = std::mem::take(&mut current_text),
                    b"ETag" => {
                        result.etag = std::mem::take(&mut current_text)
                            .trim_matches('"')
                            .to_string();
                    }
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    Ok(result)
}

// =============================================================================
// XML building
// =============================================================================

/// Escape XML special characters into an existing buffer
pub fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}

/// Build the `CompleteMultipartUpload` manifest; parts must already be in
/// ascending part-number order.
pub fn build_complete_manifest(parts: &[CompletedPart]) -> String {
    use std::fmt::Write;

    let mut xml = String::with_capacity(parts.len() * 90 + 64);
    xml.push_str("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str("<Part><PartNumber>");
        let _ = write!(xml, "{}", part.part_number);
        xml.push_str("</PartNumber><ETag>\"");
        xml.push_str(part.etag.trim_matches('"'));
        xml.push_str("\"</ETag></Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Build a quiet batch `<Delete>` document for up to 1000 keys
pub fn build_batch_delete(keys: &[String]) -> String {
    let mut xml = String::with_capacity(keys.len() * 60 + 64);
    xml.push_str("<Delete><Quiet>true</Quiet>");
    for key in keys {
        xml.push_str("<Object><Key>");
        xml_escape_into(&mut xml, key);
        xml.push_str("</Key></Object>");
    }
    xml.push_str("</Delete>");
    xml
}

/// Build a `LifecycleConfiguration` document. Every rule is re-emitted with
/// status `Enabled`, mirroring the fetch-append-put update cycle.
pub fn build_lifecycle_document(rules: &[LifecycleRule]) -> String {
    use std::fmt::Write;

    let mut xml = String::with_capacity(rules.len() * 160 + 64);
    xml.push_str("<LifecycleConfiguration>");
    for rule in rules {
        xml.push_str("<Rule><ID>");
        xml_escape_into(&mut xml, &rule.id);
        xml.push_str("</ID><Status>Enabled</Status><Filter><Prefix>");
        xml_escape_into(&mut xml, &rule.prefix);
        xml.push_str("</Prefix></Filter><Expiration><Days>");
        let _ = write!(xml, "{}", rule.expiration_days);
        xml.push_str("</Days></Expiration></Rule>");
    }
    xml.push_str("</LifecycleConfiguration>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_uri_parse() {
        let uri = SourceUri::parse("/bucket/path/to/key.txt").unwrap();
        assert_eq!(uri.bucket, "bucket");
        assert_eq!(uri.key, "path/to/key.txt");
        assert_eq!(uri.to_string(), "/bucket/path/to/key.txt");

        let prefix = SourceUri::parse("/bucket/").unwrap();
        assert_eq!(prefix.key, "");

        assert!(SourceUri::parse("bucket/key").is_err());
        assert!(SourceUri::parse("/bucketonly").is_err());
        assert!(SourceUri::parse("//key").is_err());
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="report.pdf""#),
            "report.pdf"
        );
        assert_eq!(disposition_filename("inline"), "inline");
        assert_eq!(disposition_filename(""), "");
    }

    #[test]
    fn test_parse_error_document() {
        let xml = br#"<?xml version="1.0"?><Error><Code>NoSuchKey</Code><Message>The key does not exist</Message></Error>"#;
        let (code, message) = parse_error(xml);
        assert_eq!(code, "NoSuchKey");
        assert_eq!(message, "The key does not exist");

        let (code, message) = parse_error(b"not xml at all");
        assert!(code.is_empty());
        assert!(message.is_empty());
    }

    #[test]
    fn test_parse_list_object() {
        let xml = br#"<?xml version="1.0"?>
<ListBucketResult>
  <Prefix>logs/</Prefix>
  <MaxKeys>2</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextMarker>logs/b.txt</NextMarker>
  <Contents>
    <Key>logs/a.txt</Key>
    <LastModified>2024-05-01T00:00:00.000Z</LastModified>
    <ETag>"abc123"</ETag>
    <Size>42</Size>
  </Contents>
  <Contents>
    <Key>logs/b.txt</Key>
    <Size>7</Size>
  </Contents>
  <CommonPrefixes><Prefix>logs/sub/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let result = parse_list_object(xml).unwrap();
        assert_eq!(result.contents.len(), 2);
        assert_eq!(result.contents[0].key, "logs/a.txt");
        assert_eq!(result.contents[0].size, 42);
        assert_eq!(result.contents[0].etag.as_deref(), Some("abc123"));
        assert_eq!(result.contents[1].size, 7);
        assert!(result.is_truncated);
        assert_eq!(result.next_marker.as_deref(), Some("logs/b.txt"));
        assert_eq!(result.prefix.as_deref(), Some("logs/"));
        assert_eq!(result.common_prefixes, vec!["logs/sub/"]);
        assert_eq!(result.max_keys, Some(2));
    }

    #[test]
    fn test_parse_service() {
        let xml = br#"<ListAllMyBucketsResult>
  <Owner><ID>abc</ID><DisplayName>owner</DisplayName></Owner>
  <Buckets>
    <Bucket><Name>one</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate></Bucket>
    <Bucket><Name>two</Name><CreationDate>2024-02-01T00:00:00.000Z</CreationDate></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#;
        let result = parse_service(xml).unwrap();
        assert_eq!(result.owner_id, "abc");
        assert_eq!(result.owner_display_name, "owner");
        assert_eq!(result.buckets.len(), 2);
        assert_eq!(result.buckets[1].name, "two");
    }

    #[test]
    fn test_parse_acl() {
        let xml = br#"<AccessControlPolicy>
  <Owner><ID>owner-id</ID><DisplayName>owner</DisplayName></Owner>
  <AccessControlList>
    <Grant>
      <Grantee><ID>owner-id</ID><DisplayName>owner</DisplayName></Grantee>
      <Permission>FULL_CONTROL</Permission>
    </Grant>
    <Grant>
      <Grantee><URI>http://acs.amazonaws.com/groups/global/AllUsers</URI></Grantee>
      <Permission>READ</Permission>
    </Grant>
  </AccessControlList>
</AccessControlPolicy>"#;
        let result = parse_acl(xml).unwrap();
        assert_eq!(result.owner_id, "owner-id");
        assert_eq!(result.grants.len(), 2);
        assert_eq!(result.grants[0].permission, "FULL_CONTROL");
        assert!(result.grants[1].grantee.contains("AllUsers"));
    }

    #[test]
    fn test_parse_lifecycle_roundtrip() {
        let rules = vec![
            LifecycleRule {
                id: "rule-1".to_string(),
                status: "Enabled".to_string(),
                prefix: "tmp/".to_string(),
                expiration_days: 7,
            },
            LifecycleRule {
                id: "rule-2".to_string(),
                status: "Enabled".to_string(),
                prefix: "logs/".to_string(),
                expiration_days: 30,
            },
        ];
        let xml = build_lifecycle_document(&rules);
        let parsed = parse_lifecycle(xml.as_bytes()).unwrap();
        assert_eq!(parsed.rules.len(), 2);
        assert_eq!(parsed.rules[0].prefix, "tmp/");
        assert_eq!(parsed.rules[1].expiration_days, 30);
    }

    #[test]
    fn test_parse_list_uploads() {
        let xml = br#"<ListMultipartUploadsResult>
  <IsTruncated>false</IsTruncated>
  <NextKeyMarker>last.bin</NextKeyMarker>
  <Upload>
    <Key>big.bin</Key>
    <UploadId>upload-1</UploadId>
    <Initiated>2024-05-01T10:00:00.000Z</Initiated>
  </Upload>
</ListMultipartUploadsResult>"#;
        let result = parse_list_uploads(xml).unwrap();
        assert_eq!(result.uploads.len(), 1);
        assert_eq!(result.uploads[0].upload_id, "upload-1");
        assert!(!result.is_truncated);
        assert_eq!(result.next_key_marker.as_deref(), Some("last.bin"));
    }

    #[test]
    fn test_parse_init_upload_requires_upload_id() {
        let xml = br#"<InitiateMultipartUploadResult>
  <Bucket>b</Bucket><Key>k</Key><UploadId>xyz</UploadId>
</InitiateMultipartUploadResult>"#;
        let result = parse_init_upload(xml).unwrap();
        assert_eq!(result.upload_id, "xyz");

        let missing = br#"<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>k</Key></InitiateMultipartUploadResult>"#;
        assert!(matches!(
            parse_init_upload(missing),
            Err(S3Error::Protocol(_))
        ));
    }

    #[test]
    fn test_build_complete_manifest_in_order() {
        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: "aaa".to_string(),
            },
            CompletedPart {
                part_number: 2,
                etag: "\"bbb\"".to_string(),
            },
        ];
        let xml = build_complete_manifest(&parts);
        assert_eq!(
            xml,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"aaa\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"bbb\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_build_batch_delete_quiet_and_escaped() {
        let keys = vec!["a.txt".to_string(), "b&c.txt".to_string()];
        let xml = build_batch_delete(&keys);
        assert!(xml.starts_with("<Delete><Quiet>true</Quiet>"));
        assert!(xml.contains("<Object><Key>a.txt</Key></Object>"));
        assert!(xml.contains("<Object><Key>b&amp;c.txt</Key></Object>"));
    }
}
