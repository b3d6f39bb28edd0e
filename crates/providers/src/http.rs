//! Direct HTTP transport against an OpenAI-compatible `/chat/completions` endpoint.

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::openai::{self, ChatCompletionRequest, ChatCompletionResponse};
use crate::sse::{SseLine, SseLineParser};
use crate::transport::{
    CompletionRequest, CompletionResponse, DeltaSender, ProviderError, Transport,
};
use shared::agent_api::StreamDelta;

/// Streams may run for minutes; only connection setup is bounded.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on error body text carried into a transport error.
const ERROR_BODY_CHARS: usize = 800;

pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, ProviderError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| ProviderError::transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<Response, ProviderError> {
        let url = openai::completions_url(&request.base_url);
        debug!(%url, model = %request.model, stream, "dispatching chat completion");
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", request.api_key.as_str()))
            .header("Content-Type", "application/json")
            .json(&ChatCompletionRequest::new(request, stream))
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Transport {
                status: Some(status),
                message: body.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }
        Ok(resp)
    }

    async fn read_full_body(resp: Response) -> Result<CompletionResponse, ProviderError> {
        let body: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        body.into_completion()
    }
}

/// Forward one delta. `false` once the consumer has gone away.
async fn forward(tx: &DeltaSender, delta: StreamDelta) -> bool {
    tx.send(Ok(delta)).await.is_ok()
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        tx: DeltaSender,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            resp = self.send(&request, true) => resp?,
        };

        let is_event_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("event-stream"));

        if !is_event_stream {
            // Provider ignored `stream: true`; replay the body as deltas.
            debug!("non-streaming body received, replaying");
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                body = Self::read_full_body(resp) => body?,
            };
            for delta in openai::replay_deltas(&response) {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                if !forward(&tx, delta).await {
                    break;
                }
            }
            return Ok(());
        }

        let mut parser = SseLineParser::new();
        let mut body = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                chunk = body.next() => chunk,
            };
            let (lines, closed) = match chunk {
                Some(Ok(bytes)) => (parser.feed(&bytes), false),
                Some(Err(e)) => {
                    return Err(ProviderError::transport(format!("stream read error: {}", e)))
                }
                None => (parser.finish().into_iter().collect::<Vec<_>>(), true),
            };
            for line in lines {
                match line {
                    SseLine::Done => {
                        forward(&tx, StreamDelta::done()).await;
                        return Ok(());
                    }
                    SseLine::Data(data) => {
                        let Some(delta) = openai::parse_stream_data(&data) else {
                            continue;
                        };
                        if delta.is_empty() {
                            continue;
                        }
                        if !forward(&tx, delta).await {
                            return Ok(());
                        }
                    }
                }
            }
            if closed {
                break;
            }
        }
        debug!("event stream closed without [DONE]");
        Ok(())
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let resp = self.send(&request, false).await?;
        Self::read_full_body(resp).await
    }
}
