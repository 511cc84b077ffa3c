use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::RelayMessage;
use super::RelayRequest;

/// Raw response body. A mid-stream transport failure arrives as an `Err` item.
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("upstream is not reachable: {0}")]
    Transport(String),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub stream: ByteStream,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Issues a single streaming completion request. No retries, a failure
    /// before the stream starts is returned as is.
    async fn stream_completion(
        &self,
        model: &str,
        messages: &[RelayMessage],
    ) -> std::result::Result<UpstreamResponse, UpstreamError>;
}

/// Where the client side opens its event streams from.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    async fn open(&self, request: &RelayRequest) -> Result<ByteStream>;
}
