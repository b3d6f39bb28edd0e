//! Streaming completion client for OpenAI-compatible chat endpoints.
//!
//! Two transports produce the same delta stream:
//! - [`http::HttpTransport`] talks to the endpoint directly
//! - [`bridge::BridgeTransport`] relays through a host command/event bridge
//!
//! [`stream::CompletionStream`] folds deltas into accumulated snapshots.

pub mod bridge;
pub mod client;
pub mod http;
pub mod openai;
pub mod sse;
pub mod stream;
pub mod transport;

pub use client::CompletionClient;
pub use stream::{CancelHandle, CompletionStream, StreamState};
pub use transport::{CompletionRequest, CompletionResponse, ProviderError, Transport};
