//! Transport
//!
//! Byte-chunk sources feeding the frame decoder.
//!
//! # Design Philosophy
//!
//! The pipeline only needs "give me the next chunk" and "stop now". Anything
//! that can answer those two questions is a [`ChunkSource`]:
//!
//! - [`HttpChunkSource`] reads a streaming POST response body
//! - [`ChannelSource`] reads chunks pushed through an mpsc channel
//!
//! [`StreamClient`] owns the HTTP client (cookie store enabled, so session
//! credentials travel with every request) and opens HTTP sources.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::StreamError;

// ============================================================================
// Configuration
// ============================================================================

/// HTTP settings for the streaming backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Base URL that relative endpoints are joined to
    pub base_url: String,
    /// Time allowed to establish a connection
    pub connect_timeout: Duration,
    /// Maximum silence between two body reads
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
        }
    }
}

// ============================================================================
// Chunk Source
// ============================================================================

/// A supplier of raw body chunks
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, `Ok(None)` at end of stream
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses no
    /// data that a later call would have returned.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError>;

    /// Release the underlying connection; idempotent
    fn abort(&mut self);
}

#[async_trait]
impl ChunkSource for Box<dyn ChunkSource> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        (**self).next_chunk().await
    }

    fn abort(&mut self) {
        (**self).abort();
    }
}

/// Body of a successful streaming response
pub struct HttpChunkSource {
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
}

impl HttpChunkSource {
    /// Wrap a response already known to be 2xx
    #[must_use]
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            body: Some(response.bytes_stream().boxed()),
        }
    }
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };
        match body.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => {
                self.body = None;
                Err(StreamError::NetworkInterrupted(e.to_string()))
            }
            None => {
                self.body = None;
                Ok(None)
            }
        }
    }

    fn abort(&mut self) {
        if self.body.take().is_some() {
            tracing::debug!("http body dropped");
        }
    }
}

/// Sender half paired with a [`ChannelSource`]
pub type ChunkSender = mpsc::Sender<Result<Bytes, StreamError>>;

/// In-memory source fed through a channel
///
/// Dropping every sender ends the stream.
pub struct ChannelSource {
    rx: mpsc::Receiver<Result<Bytes, StreamError>>,
}

impl ChannelSource {
    #[must_use]
    pub fn new(capacity: usize) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// A source that yields the given chunks, then ends
    #[must_use]
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<Bytes> = chunks.into_iter().map(Into::into).collect();
        let (tx, source) = Self::new(chunks.len() + 1);
        for chunk in chunks {
            // Capacity covers every chunk
            let _ = tx.try_send(Ok(chunk));
        }
        source
    }
}

#[async_trait]
impl ChunkSource for ChannelSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        match self.rx.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn abort(&mut self) {
        self.rx.close();
    }
}

// ============================================================================
// Stream Client
// ============================================================================

/// HTTP client for the streaming backend
#[derive(Clone)]
pub struct StreamClient {
    config: TransportConfig,
    http_client: reqwest::Client,
}

impl StreamClient {
    /// Build a client with a cookie store and the configured timeouts
    pub fn new(config: TransportConfig) -> Result<Self, StreamError> {
        let http_client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| StreamError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Resolve an endpoint against the base URL
    ///
    /// Absolute URLs pass through unchanged.
    #[must_use]
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// POST `body` as JSON and return the response body as a chunk source
    ///
    /// A non-success status is read as text and returned as
    /// [`StreamError::Transport`]; no frames are parsed from it. A
    /// `204 No Content` reply has no body to stream and is
    /// [`StreamError::DecodeUnavailable`].
    pub async fn open<B>(&self, endpoint: &str, body: &B) -> Result<HttpChunkSource, StreamError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.url(endpoint);
        tracing::debug!(%url, "opening stream");

        let response = self
            .http_client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or_default().to_string();
            let text = response.text().await.unwrap_or_default();
            let body = if text.trim().is_empty() { reason } else { text };
            tracing::warn!(status = status.as_u16(), "stream request rejected");
            return Err(StreamError::Transport {
                status: status.as_u16(),
                body,
            });
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            tracing::warn!("stream response has no body");
            return Err(StreamError::DecodeUnavailable);
        }

        Ok(HttpChunkSource::new(response))
    }

    /// GET a JSON document
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> anyhow::Result<T> {
        let response = self.http_client.get(self.url(endpoint)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("backend returned {status}: {body}");
        }
        Ok(response.json().await?)
    }

    /// POST a JSON document and decode the JSON reply
    pub async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> anyhow::Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http_client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("backend returned {status}: {body}");
        }
        Ok(response.json().await?)
    }
}
