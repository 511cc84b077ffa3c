#[cfg(test)]
#[path = "openai_test.rs"]
mod tests;

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use futures::StreamExt;
use serde_derive::Serialize;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::RelayMessage;
use crate::domain::models::Upstream;
use crate::domain::models::UpstreamError;
use crate::domain::models::UpstreamResponse;

fn convert_err(err: reqwest::Error) -> std::io::Error {
    let err_msg = err.to_string();
    return std::io::Error::new(std::io::ErrorKind::Interrupted, err_msg);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [RelayMessage],
    stream: bool,
}

pub struct OpenAI {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl Default for OpenAI {
    fn default() -> OpenAI {
        return OpenAI::new(
            &Config::get(ConfigKey::OpenAiURL),
            &Config::get(ConfigKey::OpenAiToken),
        );
    }
}

impl OpenAI {
    pub fn new(url: &str, token: &str) -> OpenAI {
        return OpenAI {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        };
    }
}

#[async_trait]
impl Upstream for OpenAI {
    #[allow(clippy::implicit_return)]
    async fn stream_completion(
        &self,
        model: &str,
        messages: &[RelayMessage],
    ) -> Result<UpstreamResponse, UpstreamError> {
        let req = CompletionRequest {
            model,
            messages,
            stream: true,
        };

        let res = self
            .client
            .post(format!("{url}/v1/chat/completions", url = self.url))
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&req)
            .send()
            .await
            .map_err(|err| {
                tracing::error!(error = ?err, "OpenAI is not reachable");
                return UpstreamError::Transport(err.to_string());
            })?;

        let status = res.status().as_u16();
        if !res.status().is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::error!(
                status = status,
                body = body,
                "Failed to make completion request to OpenAI"
            );
            return Err(UpstreamError::Rejected { status, body });
        }

        tracing::debug!(status = status, model = model, "Completion stream opened");

        return Ok(UpstreamResponse {
            status,
            stream: res.bytes_stream().map_err(convert_err).boxed(),
        });
    }
}
