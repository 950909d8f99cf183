//! # Synapse Storage
//!
//! Orchestration of decentralized storage across PDP providers.
//!
//! This crate provides:
//! - **Resolver**: pairs a request with a provider and, when possible, an
//!   existing data set whose metadata matches exactly
//! - **StorageContext**: one provider and one data set, with batched
//!   uploads, pulls, commits and piece management
//! - **StorageManager**: multi-copy uploads (store on a primary, pull to
//!   secondaries, commit everywhere) and SP-agnostic downloads
//! - **RetrieverChain**: CDN, chain-discovered and known providers tried
//!   in order, every result verified against its piece CID
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                StorageManager                │
//! │   default-context cache · retriever chain    │
//! ├──────────────────────────────────────────────┤
//! │      StorageContext (batch queue per ctx)    │
//! ├───────────────┬───────────────┬──────────────┤
//! │   Resolver    │  ChainAccess  │    Signer    │
//! │  + selection  │   (registry,  │ (authorized  │
//! │               │    ledger)    │  extraData)  │
//! ├───────────────┴───────────────┴──────────────┤
//! │      ProviderConnector → ProviderClient      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use synapse_storage::{ManagerUploadOptions, StorageManager, Services};
//!
//! let manager = StorageManager::new(Services::new(chain, signer, connector));
//! let result = manager.upload(data, ManagerUploadOptions::default()).await?;
//! for copy in &result.copies {
//!     println!("{} in data set {} on {}", result.piece_cid, copy.data_set_id, copy.provider_id);
//! }
//! ```

mod batch;
pub mod cache;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod memory;
pub mod options;
pub mod registry;
pub mod resolution;
pub mod retriever;
pub mod selection;
pub mod session;
pub mod types;

pub use chain::{ChainAccess, HttpConnector, ProviderConnector, Services, Signer};
pub use config::UploadSettings;
pub use context::StorageContext;
pub use error::{Result, StorageError};
pub use manager::StorageManager;
pub use options::{
    resolve_effective_options, DownloadOptions, EffectiveOptions, ManagerUploadOptions,
    StorageOptions, StoreOptions, UploadOptions, DEFAULT_COPIES,
};
pub use registry::{ProviderRegistry, ProviderRequirements};
pub use resolution::Resolver;
pub use retriever::{
    CdnRetriever, ChainRetriever, PieceRetriever, ProvidersRetriever, RetrievalOptions,
    RetrieverChain,
};
pub use session::{SessionKeyTracker, SessionState};
pub use types::*;

pub use synapse_piece::PieceCid;
