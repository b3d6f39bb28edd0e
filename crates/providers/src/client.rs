use std::sync::Arc;

use crate::bridge::{Bridge, BridgeTransport};
use crate::http::HttpTransport;
use crate::stream::CompletionStream;
use crate::transport::{CompletionRequest, CompletionResponse, ProviderError, Transport};

/// Entry point for completions. The transport is fixed at construction by the
/// hosting application: direct HTTP, or relay through a host bridge.
#[derive(Clone)]
pub struct CompletionClient {
    transport: Arc<dyn Transport>,
}

impl CompletionClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn http() -> Result<Self, ProviderError> {
        Ok(Self::new(Arc::new(HttpTransport::new()?)))
    }

    pub fn bridge(bridge: Arc<dyn Bridge>) -> Self {
        Self::new(Arc::new(BridgeTransport::new(bridge)))
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Prepare a stream. Nothing is sent until the first `next()`.
    pub fn stream(&self, request: CompletionRequest) -> CompletionStream {
        CompletionStream::new(self.transport.clone(), request)
    }

    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.transport.complete(request).await
    }
}
