#[cfg(test)]
#[path = "relay_client_test.rs"]
mod tests;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use futures::StreamExt;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::ByteStream;
use crate::domain::models::CompletionSource;
use crate::domain::models::ErrorBody;
use crate::domain::models::RelayRequest;

fn convert_err(err: reqwest::Error) -> std::io::Error {
    let err_msg = err.to_string();
    return std::io::Error::new(std::io::ErrorKind::Interrupted, err_msg);
}

/// Calls the relay's `/chat` endpoint the way the browser does.
pub struct RelayClient {
    url: String,
    client: reqwest::Client,
}

impl Default for RelayClient {
    fn default() -> RelayClient {
        return RelayClient::new(&Config::get(ConfigKey::RelayURL));
    }
}

impl RelayClient {
    pub fn new(url: &str) -> RelayClient {
        return RelayClient {
            url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        };
    }
}

#[async_trait]
impl CompletionSource for RelayClient {
    #[allow(clippy::implicit_return)]
    async fn open(&self, request: &RelayRequest) -> Result<ByteStream> {
        let res = self
            .client
            .post(format!("{url}/chat", url = self.url))
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = res.status().as_u16();
        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| return body.error)
                .unwrap_or(text);

            tracing::error!(status = status, error = message, "Relay refused the request");
            bail!(format!("Relay responded with {status}: {message}"));
        }

        return Ok(res.bytes_stream().map_err(convert_err).boxed());
    }
}
