//! Synapse client implementation

use crate::{Config, Result};
use bytes::Bytes;
use std::sync::Arc;
use synapse_piece::PieceCid;
use synapse_storage::{
    CdnRetriever, ChainAccess, DownloadOptions, ManagerUploadOptions, MultiCopyResult,
    ProviderConnector, Services, SessionKeyTracker, Signer, StorageContext, StorageManager,
    StorageOptions,
};
use tracing::{info, instrument};

/// Client for Synapse storage
pub struct Synapse {
    config: Config,
    storage: StorageManager,
    session_keys: SessionKeyTracker,
}

impl Synapse {
    /// Create a client over the given chain access, signer and connector
    pub fn new(
        config: Config,
        chain: Arc<dyn ChainAccess>,
        signer: Arc<dyn Signer>,
        connector: Arc<dyn ProviderConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let services = Services::new(chain, signer, connector).with_settings(config.upload.clone());
        let mut storage = StorageManager::new(services).with_defaults(config.storage_defaults());
        if let Some(domain) = &config.cdn_domain {
            storage = storage.with_cdn_retriever(Arc::new(CdnRetriever::new(domain.clone())));
        }
        info!(rpc_url = %config.rpc_url, payer = %storage.services().payer(), "synapse client ready");

        Ok(Self {
            config,
            storage,
            session_keys: SessionKeyTracker::new(),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Storage manager for advanced use
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Session key state of this client
    pub fn session_keys(&self) -> &SessionKeyTracker {
        &self.session_keys
    }

    /// Address paying for storage
    pub fn payer(&self) -> String {
        self.storage.services().payer()
    }

    /// Store `data` with the configured number of copies
    #[instrument(skip(self, data, options))]
    pub async fn upload(
        &self,
        data: impl Into<Bytes>,
        options: ManagerUploadOptions,
    ) -> Result<MultiCopyResult> {
        Ok(self.storage.upload(data.into(), options).await?)
    }

    /// Fetch a piece from any provider holding it
    pub async fn download(&self, piece_cid: PieceCid) -> Result<Bytes> {
        self.download_with(DownloadOptions::new(piece_cid)).await
    }

    pub async fn download_with(&self, options: DownloadOptions) -> Result<Bytes> {
        Ok(self.storage.download(options).await?)
    }

    /// Resolve a single storage context
    pub async fn create_context(&self, options: &StorageOptions) -> Result<StorageContext> {
        Ok(self.storage.create_context(options).await?)
    }

    /// Resolve one context per copy
    pub async fn create_contexts(&self, options: &StorageOptions) -> Result<Vec<StorageContext>> {
        Ok(self.storage.create_contexts(options).await?)
    }
}
