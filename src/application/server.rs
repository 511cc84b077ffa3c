#[cfg(test)]
#[path = "server_test.rs"]
mod tests;

use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use anyhow::bail;
use anyhow::Result;
use axum::body::Body;
use axum::extract::Request;
use axum::extract::State;
use axum::http::header;
use axum::http::Method;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use axum::Json;
use axum::Router;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use tokio::net::TcpListener;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::ByteStream;
use crate::domain::models::ErrorBody;
use crate::domain::models::RelayRequest;
use crate::domain::models::Upstream;
use crate::domain::models::UpstreamError;
use crate::infrastructure::upstream::openai::OpenAI;

/// Prepended to the upstream's own error text when it rejects a request.
const UPSTREAM_ERROR_PREFIX: &str = "OpenAI Error: ";

#[derive(Clone)]
struct RelayState {
    upstream: Arc<dyn Upstream>,
    max_request_bytes: usize,
}

/// Passes upstream chunks through untouched, counting them for the log line
/// written when the response body is dropped.
struct ForwardedStream {
    inner: ByteStream,
    chunks: usize,
    bytes: usize,
    outcome: &'static str,
    ended: bool,
}

impl ForwardedStream {
    fn new(inner: ByteStream) -> ForwardedStream {
        return ForwardedStream {
            inner,
            chunks: 0,
            bytes: 0,
            outcome: "client disconnected",
            ended: false,
        };
    }
}

impl Stream for ForwardedStream {
    type Item = std::result::Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.ended {
            return Poll::Ready(None);
        }

        let poll = self.inner.poll_next_unpin(cx);
        match &poll {
            Poll::Ready(Some(Ok(chunk))) => {
                self.chunks += 1;
                self.bytes += chunk.len();
            }
            Poll::Ready(Some(Err(err))) => {
                // An Err item aborts the connection and drops unflushed output.
                tracing::warn!(error = ?err, "Upstream stream broke, closing relay response");
                self.outcome = "upstream error";
                self.ended = true;
                return Poll::Ready(None);
            }
            Poll::Ready(None) => {
                self.outcome = "completed";
                self.ended = true;
            }
            Poll::Pending => {}
        }

        return poll;
    }
}

impl Drop for ForwardedStream {
    fn drop(&mut self) {
        tracing::info!(
            chunks = self.chunks,
            bytes = self.bytes,
            outcome = self.outcome,
            "Relay stream closed"
        );
    }
}

fn error_response(status: StatusCode, error: &str) -> Response {
    return (status, Json(ErrorBody::new(error))).into_response();
}

async fn chat(State(state): State<RelayState>, request: Request) -> Response {
    if request.method() != Method::POST {
        tracing::debug!(method = %request.method(), "Refusing non-POST request");
        return (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "POST")]).into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), state.max_request_bytes).await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(error = ?err, "Failed to read request body");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    let payload = match serde_json::from_slice::<RelayRequest>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::debug!(error = ?err, "Refusing malformed request body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    let upstream_res = state
        .upstream
        .stream_completion(&payload.model, &payload.messages)
        .await;

    // Past this point headers are flushed and failures can only close the stream.
    let upstream_res = match upstream_res {
        Ok(res) => res,
        Err(UpstreamError::Rejected { status, body }) => {
            tracing::warn!(status = status, "Upstream rejected completion request");
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            return error_response(status, &format!("{UPSTREAM_ERROR_PREFIX}{body}"));
        }
        Err(UpstreamError::Transport(err)) => {
            return error_response(StatusCode::BAD_GATEWAY, &err);
        }
    };

    tracing::info!(
        model = payload.model,
        messages = payload.messages.len(),
        upstream_status = upstream_res.status,
        "Relaying completion stream"
    );

    let res = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(ForwardedStream::new(upstream_res.stream)));

    match res {
        Ok(res) => return res,
        Err(err) => {
            tracing::error!(error = ?err, "Failed to build event stream response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
}

pub fn router(upstream: Arc<dyn Upstream>, max_request_bytes: usize) -> Router {
    return Router::new().route("/chat", any(chat)).with_state(RelayState {
        upstream,
        max_request_bytes,
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?err, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down relay");
}

pub async fn start() -> Result<()> {
    if Config::get(ConfigKey::OpenAiToken).is_empty() {
        bail!("OpenAI token is not defined. Set OPENAI_API_KEY or pass --openai-token.");
    }

    let max_request_bytes = Config::get(ConfigKey::MaxRequestBytes).parse::<usize>()?;
    let address = Config::get(ConfigKey::ListenAddress);
    let listener = TcpListener::bind(&address).await?;

    tracing::info!(
        address = address,
        upstream = Config::get(ConfigKey::OpenAiURL),
        "Relay listening"
    );
    println!("Relay listening on http://{address}/chat");

    let upstream: Arc<dyn Upstream> = Arc::new(OpenAI::default());
    axum::serve(listener, router(upstream, max_request_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    return Ok(());
}
