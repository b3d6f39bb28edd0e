use agent_host::Orchestrator;
use anyhow::{Context, Result};
use providers::CompletionClient;
use services::{
    CredentialVault, FileIngestor, JsonFileStore, KeyValueStore, SessionStore, SettingsStore,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod repl;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let data_dir = config::data_dir();
    tracing::info!(dir = %data_dir.display(), "using data directory");
    let storage: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&data_dir));

    let settings = SettingsStore::load(storage.clone(), CredentialVault::for_host())
        .context("failed to load settings")?;
    config::bootstrap_model(&settings, |key| std::env::var(key).ok());
    let sessions = SessionStore::load(storage).context("failed to load conversations")?;

    // A terminal host has no native bridge; requests go straight to the provider.
    let client = CompletionClient::http().context("failed to set up HTTP client")?;
    let orchestrator = Arc::new(Orchestrator::new(sessions, settings, client));

    repl::Repl::new(orchestrator, FileIngestor::new()).run().await
}
