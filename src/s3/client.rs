//! S3 client core: request assembly, signing dispatch, response
//! classification and the single-request object operations.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use hyper::header::HeaderMap;
use hyper::Method;
use tokio::sync::watch;
use tracing::debug;

use crate::config::{ClientConfig, Credentials, TIME_FORMAT_ISO8601, TIME_FORMAT_RFC1123_GMT};
use crate::s3::error::{Result, S3Error};
use crate::s3::types::{
    self, HeadResult, ListObjectResult, ListOptions, PutOptions, PutResult, SourceUri,
};
use crate::signer::v2::SignerV2;
use crate::signer::v4::{self, SignerV4, EMPTY_BODY_SHA256};
use crate::signer::uri_encode_into;
use crate::transport::{HttpRequest, HttpResponse, HttpSend, HyperTransport};

#[derive(Clone)]
enum Signer {
    V2(SignerV2),
    V4(SignerV4),
}

/// Client for one S3-compatible endpoint
///
/// Buckets are addressed virtual-host style (`bucket.endpoint`). Clone is
/// cheap; clones share the underlying transport and its connection pool.
#[derive(Clone)]
pub struct Client {
    pub(crate) transport: Arc<dyn HttpSend>,
    pub(crate) config: ClientConfig,
    signer: Signer,
}

impl Client {
    /// Client using AWS Signature V4
    pub fn new_v4(credentials: &Credentials, config: ClientConfig) -> Self {
        let region = config.region();
        Self {
            transport: Arc::new(HyperTransport::new()),
            signer: Signer::V4(SignerV4::new(credentials, region)),
            config,
        }
    }

    /// Client using the legacy HMAC-SHA1 header scheme
    pub fn new_v2(credentials: &Credentials, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(HyperTransport::new()),
            signer: Signer::V2(SignerV2::new(credentials)),
            config,
        }
    }

    /// Substitute the HTTP transport (custom stacks, tests)
    pub fn with_transport(mut self, transport: Arc<dyn HttpSend>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn is_v4(&self) -> bool {
        matches!(self.signer, Signer::V4(_))
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    /// Sign and submit one request, then classify the response status.
    pub(crate) async fn send(
        &self,
        op: &'static str,
        mut req: S3Request,
        sink: Option<&mut (dyn Write + Send)>,
    ) -> Result<HttpResponse> {
        let host = match &req.bucket {
            Some(bucket) => format!("{}.{}", bucket, self.config.endpoint),
            None => self.config.endpoint.clone(),
        };
        let url = if req.query.is_empty() {
            format!("http://{host}{}", req.path)
        } else {
            format!("http://{host}{}?{}", req.path, req.query)
        };

        let now = Utc::now();
        match &self.signer {
            Signer::V4(signer) => {
                req.headers.insert("host".to_string(), host);
                req.headers
                    .entry("x-amz-date".to_string())
                    .or_insert_with(|| now.format(TIME_FORMAT_ISO8601).to_string());
                if !req.headers.contains_key("x-amz-content-sha256") {
                    let hash = if req.body.is_empty() {
                        EMPTY_BODY_SHA256.to_string()
                    } else {
                        v4::payload_sha256_hex(&req.body)
                    };
                    req.headers.insert("x-amz-content-sha256".to_string(), hash);
                }
                let authorization =
                    signer.authorization(req.method.as_str(), &req.path, &req.query, &req.headers);
                req.headers.insert("authorization".to_string(), authorization);
            }
            Signer::V2(signer) => {
                req.headers
                    .entry("date".to_string())
                    .or_insert_with(|| now.format(TIME_FORMAT_RFC1123_GMT).to_string());
                let authorization =
                    signer.authorization(req.method.as_str(), &req.headers, &req.resource_v2);
                req.headers.insert("authorization".to_string(), authorization);
            }
        }

        debug!(op, url = %url, "s3 request");
        let response = self
            .transport
            .send(
                HttpRequest {
                    method: req.method,
                    url,
                    headers: req.headers,
                    body: req.body,
                    cancel: req.cancel,
                },
                sink,
            )
            .await?;

        if req.accept.contains(&response.status.as_u16()) {
            return Ok(response);
        }
        let (code, message) = types::parse_error(&response.body);
        Err(S3Error::status(
            op,
            response.status,
            code,
            message,
            request_id(&response.headers),
        ))
    }

    // =========================================================================
    // Object operations
    // =========================================================================

    /// Upload a single object from memory
    pub async fn put(
        &self,
        body: Bytes,
        bucket: &str,
        object: &str,
        options: &PutOptions,
    ) -> Result<PutResult> {
        let size = body.len() as u64;
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
                "put",
                S3Request {
                    method: Method::PUT,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}"),
                    path,
                    query: String::new(),
                    headers,
                    body,
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;

        Ok(PutResult {
            bucket: bucket.to_string(),
            key: object.to_string(),
            etag: header_etag(&response.headers),
            size,
            location: self.object_location(bucket, object),
            request_id: request_id(&response.headers),
        })
    }

    /// Upload a single object from a local file. An empty object name, or
    /// one ending in `/`, is completed with the file's basename.
    pub async fn upload_file(
        &self,
        file_path: &Path,
        bucket: &str,
        object: &str,
        options: &PutOptions,
    ) -> Result<PutResult> {
        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| S3Error::Input(format!("invalid file path: {}", file_path.display())))?;
        let object = default_object_name(object, file_name);
        let data = std::fs::read(file_path)?;
        self.put(Bytes::from(data), bucket, &object, options).await
    }

    /// Server-side copy of a single object. `source` is `/bucket/key`.
    pub async fn copy(
        &self,
        bucket: &str,
        object: &str,
        source: &str,
        options: &PutOptions,
    ) -> Result<PutResult> {
        let src = SourceUri::parse(source)?;
        let source_head = self.head(&src.bucket, &src.key).await?;
        let object = if object.is_empty() {
            basename(&src.key).to_string()
        } else {
            object.to_string()
        };

        let path = object_path(&object);
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-copy-source".to_string(), source.to_string());
        if let Some(acl) = &options.acl {
            headers.insert("x-amz-acl".to_string(), acl.clone());
        }
        if let Some(name) = &options.disposition {
            headers.insert(
                "response-content-disposition".to_string(),
                format!("attachment; filename=\"{name}\""),
            );
        }

        let response = self
            .send(
                "copy",
                S3Request {
                    method: Method::PUT,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}"),
                    path,
                    query: String::new(),
                    headers,
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;

        let copied = types::parse_copy_result(&response.body)?;
        Ok(PutResult {
            bucket: bucket.to_string(),
            key: object.clone(),
            etag: copied.etag,
            size: source_head.content_length,
            location: self.object_location(bucket, &object),
            request_id: request_id(&response.headers),
        })
    }

    /// Fetch object metadata
    pub async fn head(&self, bucket: &str, object: &str) -> Result<HeadResult> {
        let path = object_path(object);
        let response = self
            .send(
                "head",
                S3Request {
                    method: Method::HEAD,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}"),
                    path,
                    query: String::new(),
                    headers: BTreeMap::new(),
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        Ok(HeadResult::from_headers(&response.headers))
    }

    /// Delete a single object
    pub async fn delete(&self, bucket: &str, object: &str) -> Result<()> {
        let path = object_path(object);
        self.send(
            "delete",
            S3Request {
                method: Method::DELETE,
                bucket: Some(bucket.to_string()),
                resource_v2: format!("/{bucket}{path}"),
                path,
                query: String::new(),
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

    /// Stream an object (or a byte range of it) into a writer. Returns the
    /// number of bytes written. Ranged requests accept both 200 and 206.
    pub async fn cat<W: Write + Send>(
        &self,
        bucket: &str,
        object: &str,
        range: Option<&str>,
        dst: &mut W,
    ) -> Result<u64> {
        let path = object_path(object);
        let mut headers = BTreeMap::new();
        if let Some(range) = range {
            headers.insert("range".to_string(), range.to_string());
        }
        let response = self
            .send(
                "cat",
                S3Request {
                    method: Method::GET,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}{path}"),
                    path,
                    query: String::new(),
                    headers,
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200, 206],
                },
                Some(dst as &mut (dyn Write + Send)),
            )
            .await?;
        Ok(response.body_len)
    }

    /// List one page of objects
    pub async fn list_object(&self, bucket: &str, options: &ListOptions) -> Result<ListObjectResult> {
        let query = list_query(options);
        let response = self
            .send(
                "list_object",
                S3Request {
                    method: Method::GET,
                    bucket: Some(bucket.to_string()),
                    resource_v2: format!("/{bucket}/"),
                    path: "/".to_string(),
                    query,
                    headers: BTreeMap::new(),
                    body: Bytes::new(),
                    cancel: None,
                    accept: &[200],
                },
                None,
            )
            .await?;
        types::parse_list_object(&response.body)
    }

    pub(crate) fn object_location(&self, bucket: &str, object: &str) -> String {
        format!("http://{}.{}/{}", bucket, self.config.endpoint, object)
    }
}

/// One assembled S3 request, pre-signing
pub(crate) struct S3Request {
    pub method: Method,
    /// `None` addresses the service endpoint itself
    pub bucket: Option<String>,
    /// Already-encoded path: `/` or `/{encoded_key}`
    pub path: String,
    /// Already-encoded query string without the leading `?`
    pub query: String,
    /// Canonical resource for the legacy signing scheme
    pub resource_v2: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub cancel: Option<watch::Receiver<bool>>,
    pub accept: &'static [u16],
}

/// Percent-encode an object key with query-escape semantics: `/` and all
/// reserved characters are encoded. Borrows when nothing needs encoding.
pub(crate) fn encode_key(key: &str) -> Cow<'_, str> {
    let clean = key
        .bytes()
        .all(|b| matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~'));
    if clean {
        return Cow::Borrowed(key);
    }
    let mut encoded = String::with_capacity(key.len() + 32);
    uri_encode_into(&mut encoded, key, true);
    Cow::Owned(encoded)
}

/// `/` + encoded key
pub(crate) fn object_path(key: &str) -> String {
    format!("/{}", encode_key(key))
}

/// Listing query string in the fixed order `delimiter`, `marker`,
/// `max-keys`, `prefix`; already sorted for the V4 canonical form.
pub(crate) fn list_query(options: &ListOptions) -> String {
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
        push("marker", marker);
    }
    if let Some(max_keys) = options.max_keys {
        push("max-keys", &max_keys.to_string());
    }
    if let Some(prefix) = &options.prefix {
        push("prefix", prefix);
    }
    query
}

/// Last path segment, ignoring a trailing slash
pub(crate) fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Default an empty or directory-style (`…/`) object name with the source
/// file's basename.
pub(crate) fn default_object_name(object: &str, source_name: &str) -> String {
    if object.is_empty() {
        source_name.to_string()
    } else if object.ends_with('/') {
        format!("{object}{source_name}")
    } else {
        object.to_string()
    }
}

pub(crate) fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-amz-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

pub(crate) fn header_etag(headers: &HeaderMap) -> String {
    headers
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_key_query_escape_semantics() {
        assert!(matches!(encode_key("simple.txt"), Cow::Borrowed(_)));
        assert_eq!(encode_key("a/b.txt"), "a%2Fb.txt");
        assert_eq!(encode_key("with space"), "with%20space");
        assert_eq!(encode_key("p+q"), "p%2Bq");
    }

    #[test]
    fn test_list_query_fixed_order() {
        let options = ListOptions {
            delimiter: Some("/".to_string()),
            marker: Some("after/key".to_string()),
            max_keys: Some(500),
            prefix: Some("logs/".to_string()),
        };
        assert_eq!(
            list_query(&options),
            "delimiter=%2F&marker=after%2Fkey&max-keys=500&prefix=logs%2F"
        );
        assert_eq!(list_query(&ListOptions::default()), "");
    }

    #[test]
    fn test_default_object_name() {
        assert_eq!(default_object_name("", "file.bin"), "file.bin");
        assert_eq!(default_object_name("dir/", "file.bin"), "dir/file.bin");
        assert_eq!(default_object_name("dir/key", "file.bin"), "dir/key");
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("a/b/c.txt"), "c.txt");
        assert_eq!(basename("c.txt"), "c.txt");
        assert_eq!(basename("a/b/"), "b");
    }
}
