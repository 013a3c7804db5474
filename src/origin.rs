use async_trait::async_trait;
use axum::http::{HeaderMap, Method, header};
use bytes::Bytes;
use reqwest::{Client, Response};
use tracing::{debug, info};

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, ProxyResult};

/// Headers that describe a single connection or transfer and must not be
/// relayed in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Request headers that would make upstream pick a transfer coding the proxy
/// cannot re-relay byte for byte.
const NEGOTIATION_HEADERS: &[&str] = &["accept-encoding"];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// An inbound request as seen by the proxy pipeline.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path plus query string, exactly as received.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: header::HeaderName, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.path_and_query)
    }

    /// Raw caller identity token, if the request carries one.
    pub fn identity(&self) -> Option<&[u8]> {
        self.headers
            .get(header::AUTHORIZATION)
            .map(|v| v.as_bytes())
    }

    pub fn is_safe_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// Response headers in upstream order. Repeated names stay separate entries
/// and values are kept as raw bytes.
pub type HeaderList = Vec<(String, Vec<u8>)>;

/// First value of `name` in `headers`, if it is valid UTF-8.
pub fn header_str<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
}

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status_code: u16,
    pub headers: HeaderList,
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl OriginResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// The upstream service being protected.
///
/// Implementations forward the request once; retries are never applied at
/// this layer.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn send(&self, request: &ProxyRequest) -> ProxyResult<OriginResponse>;
}

pub struct OriginFetcher {
    client: Client,
    base_url: String,
    config: UpstreamConfig,
}

impl OriginFetcher {
    pub fn new(config: UpstreamConfig) -> ProxyResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            upstream = %config.url,
            max_idle = config.pool_max_idle_per_host,
            timeout_secs = config.timeout_secs,
            "Initialized upstream HTTP client"
        );

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn build_url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    async fn parse_response(&self, response: Response) -> ProxyResult<OriginResponse> {
        let status_code = response.status().as_u16();
        let headers = extract_headers(response.headers());

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = response.bytes().await?;

        debug!(
            status_code = status_code,
            body_size = body.len(),
            content_type = ?content_type,
            "Received upstream response"
        );

        Ok(OriginResponse {
            status_code,
            headers,
            body,
            content_type,
        })
    }
}

#[async_trait]
impl Upstream for OriginFetcher {
    async fn send(&self, request: &ProxyRequest) -> ProxyResult<OriginResponse> {
        let url = self.build_url(&request.path_and_query);

        debug!(method = %request.method, url = %url, "Forwarding to upstream");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(self.config.timeout());

        for (name, value) in request.headers.iter() {
            let name_str = name.as_str();
            if is_hop_by_hop(name_str)
                || NEGOTIATION_HEADERS
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(name_str))
            {
                continue;
            }
            builder = builder.header(name, value);
        }

        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        self.parse_response(response).await
    }
}

fn extract_headers(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}
