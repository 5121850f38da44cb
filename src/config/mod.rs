//! Client configuration and credentials

use serde::{Deserialize, Serialize};

/// RFC-1123 GMT date format used by the legacy signing scheme and by
/// `Last-Modified` response headers (chrono strftime syntax).
pub const TIME_FORMAT_RFC1123_GMT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Compact ISO-8601 format for `x-amz-date` (chrono strftime syntax).
pub const TIME_FORMAT_ISO8601: &str = "%Y%m%dT%H%M%SZ";

fn default_part_min_size() -> u64 {
    5 * 1024 * 1024
}

fn default_part_max_size() -> u64 {
    100 * 1024 * 1024
}

fn default_thread_min_num() -> usize {
    1
}

fn default_thread_max_num() -> usize {
    10
}

fn default_max_retry_num() -> usize {
    3
}

/// Static access credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// AWS access key ID
    pub access_key_id: String,

    /// AWS secret access key
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

/// Immutable per-client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Endpoint hostname, no scheme. Buckets are addressed virtual-host
    /// style as `bucket.endpoint`.
    pub endpoint: String,

    /// Lower bound for multipart part size (default 5 MiB)
    #[serde(default = "default_part_min_size")]
    pub part_min_size: u64,

    /// Upper bound for multipart part size (default 100 MiB)
    #[serde(default = "default_part_max_size")]
    pub part_max_size: u64,

    /// Lower bound for worker parallelism (default 1)
    #[serde(default = "default_thread_min_num")]
    pub thread_min_num: usize,

    /// Upper bound for worker parallelism (default 10)
    #[serde(default = "default_thread_max_num")]
    pub thread_max_num: usize,

    /// Attempt bound for each retried mutation (default 3)
    #[serde(default = "default_max_retry_num")]
    pub max_retry_num: usize,

    /// Signing region override. When absent the region is derived from the
    /// endpoint hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            part_min_size: default_part_min_size(),
            part_max_size: default_part_max_size(),
            thread_min_num: default_thread_min_num(),
            thread_max_num: default_thread_max_num(),
            max_retry_num: default_max_retry_num(),
            region: None,
        }
    }

    /// Override the signing region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Signing region: explicit override, else derived from the endpoint
    pub fn region(&self) -> String {
        self.region
            .clone()
            .unwrap_or_else(|| derive_region(&self.endpoint))
    }

    /// Effective part size: requested value kept when inside
    /// `[part_min_size, part_max_size]`, `default` otherwise.
    pub fn clamp_part_size(&self, requested: Option<u64>, default: u64) -> u64 {
        match requested {
            Some(n) if n >= self.part_min_size && n <= self.part_max_size => n,
            _ => default,
        }
    }

    /// Effective worker count: requested value kept when inside
    /// `[thread_min_num, thread_max_num]`, `thread_max_num` otherwise.
    pub fn clamp_thread_num(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(n) if n >= self.thread_min_num && n <= self.thread_max_num => n,
            _ => self.thread_max_num,
        }
    }
}

/// Derive the signing region from an endpoint hostname.
///
/// The region is the second dot-separated label (`s3.us-east-1.example.com`
/// gives `us-east-1`); hostnames with fewer than three labels fall back to
/// `us-east-1`.
pub fn derive_region(endpoint: &str) -> String {
    let host = endpoint.split(':').next().unwrap_or(endpoint);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        labels[1].to_string()
    } else {
        "us-east-1".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_region() {
        assert_eq!(derive_region("s3.us-west-2.amazonaws.com"), "us-west-2");
        assert_eq!(derive_region("oss.cn-north-1.example.net"), "cn-north-1");
        assert_eq!(derive_region("localhost"), "us-east-1");
        assert_eq!(derive_region("storage.local:9000"), "us-east-1");
    }

    #[test]
    fn test_region_override_wins() {
        let config = ClientConfig::new("s3.eu-central-1.example.com").with_region("us-east-1");
        assert_eq!(config.region(), "us-east-1");
    }

    #[test]
    fn test_clamp_part_size() {
        let config = ClientConfig::new("s3.example.com");
        assert_eq!(
            config.clamp_part_size(None, config.part_max_size),
            100 * 1024 * 1024
        );
        assert_eq!(
            config.clamp_part_size(Some(8 * 1024 * 1024), config.part_max_size),
            8 * 1024 * 1024
        );
        // Out-of-range requests fall back to the default
        assert_eq!(
            config.clamp_part_size(Some(1024), config.part_min_size),
            5 * 1024 * 1024
        );
        assert_eq!(
            config.clamp_part_size(Some(1 << 40), config.part_max_size),
            100 * 1024 * 1024
        );
    }

    #[test]
    fn test_clamp_thread_num() {
        let config = ClientConfig::new("s3.example.com");
        assert_eq!(config.clamp_thread_num(None), 10);
        assert_eq!(config.clamp_thread_num(Some(3)), 3);
        assert_eq!(config.clamp_thread_num(Some(0)), 10);
        assert_eq!(config.clamp_thread_num(Some(64)), 10);
    }
}
