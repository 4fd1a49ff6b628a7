// =============================================================================
// Transport seam — swappable HTTP and WebSocket implementations
// =============================================================================
//
// §9 Design Notes: "Choose interface-over-implementation: a Limiter,
// Breaker, ClockSource, Transport, Session abstraction lets each be
// swapped for tests." This module is the Transport half of that list.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
    Put,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A pluggable HTTP transport. The production implementation wraps
/// `reqwest::Client`; tests substitute a fake that returns canned
/// responses without touching the network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production `HttpTransport` backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
        }
        .timeout(request.timeout);

        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp.text().await?;

        Ok(HttpResponse { status, headers, body })
    }
}

/// One WebSocket text or control frame, transport-agnostic.
#[derive(Debug, Clone)]
pub enum WsFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// A pluggable WebSocket connection. The production implementation wraps
/// `tokio_tungstenite`; tests substitute a fake stream of frames.
#[async_trait]
pub trait WsConnection: Send {
    async fn send(&mut self, frame: WsFrame) -> Result<()>;
    async fn recv(&mut self) -> Option<Result<WsFrame>>;
    async fn close(&mut self) -> Result<()>;
}

/// Dials new `WsConnection`s for a given URL.
#[async_trait]
pub trait WsDialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Box<dyn WsConnection>>;
}

/// Production `WsDialer`/`WsConnection` backed by `tokio_tungstenite`.
pub struct TungsteniteDialer;

#[async_trait]
impl WsDialer for TungsteniteDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn WsConnection>> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

struct TungsteniteConnection {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl WsConnection for TungsteniteConnection {
    async fn send(&mut self, frame: WsFrame) -> Result<()> {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        let msg = match frame {
            WsFrame::Text(t) => Message::Text(t.into()),
            WsFrame::Ping(p) => Message::Ping(p.into()),
            WsFrame::Pong(p) => Message::Pong(p.into()),
            WsFrame::Close => Message::Close(None),
        };
        self.stream.send(msg).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WsFrame>> {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(t))) => return Some(Ok(WsFrame::Text(t.to_string()))),
                Some(Ok(Message::Ping(p))) => return Some(Ok(WsFrame::Ping(p.to_vec()))),
                Some(Ok(Message::Pong(p))) => return Some(Ok(WsFrame::Pong(p.to_vec()))),
                Some(Ok(Message::Close(_))) => return Some(Ok(WsFrame::Close)),
                // Neither venue sends binary market-data frames; drop them
                // rather than forging an empty text frame that would fail
                // to parse as JSON downstream.
                Some(Ok(Message::Binary(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }

    /// §4.7 "Cancellation semantics": a clean close frame with code 1000.
    async fn close(&mut self) -> Result<()> {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
        use tokio_tungstenite::tungstenite::Message;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: std::borrow::Cow::Borrowed(""),
        };
        self.stream.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}
