//! Local state for the chat client: credentials, file ingestion, model
//! settings and conversation history.

pub mod file_ingest;
pub mod session_store;
pub mod settings_store;
pub mod storage;
pub mod vault;

pub use file_ingest::{FileIngestor, IngestError, UploadedFile};
pub use session_store::SessionStore;
pub use settings_store::{ResolvedModel, SettingsError, SettingsStore};
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore, StorageError};
pub use vault::{CredentialVault, VaultError};
