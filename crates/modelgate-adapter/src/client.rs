use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method};

use crate::http::{
    HttpMethod, TransportErrorKind, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse,
};
use crate::headers::Headers;

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    /// Applied to non-stream requests end to end. Stream requests are
    /// open-ended here; the pump owns their idle/total deadlines.
    pub request_timeout: Duration,
    pub stream_buffer: usize,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            stream_buffer: 16,
        }
    }
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
            };
            let mut builder = self.client.request(method, &req.url);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            if !req.is_stream {
                let fut = async {
                    let resp = builder.send().await.map_err(map_wreq_error)?;
                    let status = resp.status().as_u16();
                    let headers = headers_from_wreq(resp.headers());
                    let body = resp.bytes().await.map_err(map_wreq_error)?;
                    Ok(UpstreamHttpResponse {
                        status,
                        headers,
                        body: UpstreamBody::Bytes(body),
                    })
                };
                return match tokio::time::timeout(self.config.request_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamFailure::Transport {
                        kind: TransportErrorKind::Timeout,
                        message: "upstream request timed out".to_string(),
                    }),
                };
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            let status = resp.status().as_u16();
            let headers = headers_from_wreq(resp.headers());

            // Error statuses never stream; capture the body for the adapter.
            if !(200..300).contains(&status) {
                let body = resp.bytes().await.map_err(map_wreq_error)?;
                return Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(self.config.stream_buffer);
            tokio::spawn(async move {
                let mut stream = resp.bytes_stream();
                while let Some(item) = stream.next().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(_) => break,
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });

            Ok(UpstreamHttpResponse {
                status,
                headers,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let kind = classify_wreq_error(&err);
    UpstreamFailure::Transport {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportErrorKind::ReadTimeout;
        }
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return TransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Other
}
