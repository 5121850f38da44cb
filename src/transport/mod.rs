//! HTTP transport seam
//!
//! All S3 operations funnel through [`HttpSend::send`]: one request
//! submission with bounded deadlines, an optional streaming body sink and a
//! cooperative cancel signal. The production implementation is
//! [`HyperTransport`]; tests substitute their own `HttpSend` to run the
//! full client stack against an in-memory server.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::s3::error::{Result, S3Error};

/// TCP connect deadline
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle connection keep-alive
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the response headers to arrive
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline for the full response body read
pub const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// A fully-assembled, signed HTTP request
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    /// Cooperative cancel: when the channel observes `true` the in-flight
    /// request is aborted with [`S3Error::Cancelled`].
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Response headers plus body, buffered or streamed
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Buffered body; empty when the body was streamed into a sink
    pub body: Bytes,
    /// Body length: bytes buffered, or bytes written to the sink
    pub body_len: u64,
}

/// The single request-submission seam the client core consumes
#[async_trait]
pub trait HttpSend: Send + Sync {
    /// Submit one request. When `sink` is provided and the response status
    /// is successful the body is streamed into it and the returned response
    /// carries an empty `body`; error-status bodies are always buffered so
    /// the caller can decode the failure document.
    async fn send(
        &self,
        req: HttpRequest,
        sink: Option<&mut (dyn Write + Send)>,
    ) -> Result<HttpResponse>;
}

/// Production transport: tuned hyper client over TCP/TLS
///
/// Clone is cheap, clones share the underlying connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    /// Build the transport with its tuned connection pool: TCP_NODELAY,
    /// 60 s connect deadline, 60 s keep-alive, generous idle pool.
    pub fn new() -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http.set_keepalive(Some(KEEPALIVE_TIMEOUT));

        let tls = TlsConnector::new().expect("failed to build TLS connector");
        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(KEEPALIVE_TIMEOUT)
            .pool_max_idle_per_host(200)
            .set_host(true)
            .build(https);

        Self { client }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpSend for HyperTransport {
    async fn send(
        &self,
        req: HttpRequest,
        sink: Option<&mut (dyn Write + Send)>,
    ) -> Result<HttpResponse> {
        let mut builder = Request::builder().method(req.method.clone()).uri(&req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        let request = builder.body(Full::new(req.body))?;

        let mut cancel = req.cancel;
        debug!(method = %req.method, url = %req.url, "sending request");

        let response = with_deadline(
            async { Ok(self.client.request(request).await?) },
            RESPONSE_HEADER_TIMEOUT,
            cancel.as_mut(),
        )
        .await?;

        let status = response.status();
        let headers = response.headers().clone();

        if let (Some(sink), true) = (sink, status.is_success()) {
            // Stream the body into the caller's sink; sync writes batch fine
            // behind the kernel socket buffer.
            let written = with_deadline(
                async {
                    let mut stream = BodyStream::new(response.into_body());
                    let mut written = 0u64;
                    while let Some(frame) = stream.next().await {
                        let frame = frame.map_err(|e| S3Error::Transport(e.to_string()))?;
                        if let Some(chunk) = frame.data_ref() {
                            sink.write_all(chunk)?;
                            written += chunk.len() as u64;
                        }
                    }
                    sink.flush()?;
                    Ok(written)
                },
                READ_TIMEOUT,
                cancel.as_mut(),
            )
            .await?;

            return Ok(HttpResponse {
                status,
                headers,
                body: Bytes::new(),
                body_len: written,
            });
        }

        let body = with_deadline(
            async {
                Ok(response
                    .collect()
                    .await
                    .map_err(|e| S3Error::Transport(e.to_string()))?
                    .to_bytes())
            },
            READ_TIMEOUT,
            cancel.as_mut(),
        )
        .await?;

        let body_len = body.len() as u64;
        Ok(HttpResponse {
            status,
            headers,
            body,
            body_len,
        })
    }
}

/// Run `work` under `deadline`, aborting early if the cancel channel
/// observes `true`. A closed cancel channel never cancels.
async fn with_deadline<F, T>(
    work: F,
    deadline: Duration,
    cancel: Option<&mut watch::Receiver<bool>>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match cancel {
        Some(rx) => tokio::select! {
            res = timeout(deadline, work) => res.map_err(|_| S3Error::Cancelled)?,
            _ = wait_for_cancel(rx) => Err(S3Error::Cancelled),
        },
        None => timeout(deadline, work)
            .await
            .map_err(|_| S3Error::Cancelled)?,
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without signalling: never cancel.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_expiry_is_cancelled() {
        let result: Result<()> = with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
            None,
        )
        .await;
        assert!(matches!(result, Err(S3Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_signal_aborts_work() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result: Result<()> = with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(60),
            Some(&mut rx),
        )
        .await;
        assert!(matches!(result, Err(S3Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_cancel_sender_does_not_cancel() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result = with_deadline(
            async { Ok(7u32) },
            Duration::from_secs(1),
            Some(&mut rx),
        )
        .await
        .unwrap();
        assert_eq!(result, 7);
    }
}
