//! External collaborators: chain access, signing and provider connections
//!
//! The orchestration core never talks to contracts or wallets directly.
//! It reads the provider registry and data-set ledger through
//! [`ChainAccess`], obtains signed authorizations through [`Signer`], and
//! reaches providers through a [`ProviderConnector`].

use crate::config::UploadSettings;
use crate::types::{
    ActivePieces, Address, DataSetId, DataSetInfo, Metadata, PieceId, PieceToAdd, ProviderId,
    ProviderInfo, Receipt, TxHash,
};
use crate::{Result, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use synapse_sp::{ExtraData, PdpServer, PdpServerConfig, ProviderClient, RetryPolicy};
use tracing::debug;

/// Typed reads and writes against the provider registry and data-set ledger
#[async_trait]
pub trait ChainAccess: Send + Sync {
    /// Ids of providers approved for this service
    async fn approved_provider_ids(&self) -> Result<Vec<ProviderId>>;

    /// Ids of endorsed (preferred) providers
    async fn endorsed_provider_ids(&self) -> Result<Vec<ProviderId>>;

    async fn provider(&self, id: ProviderId) -> Result<Option<ProviderInfo>>;

    async fn provider_by_address(&self, address: &str) -> Result<Option<ProviderInfo>>;

    /// Batched lookup, one entry per requested id
    async fn providers_by_ids(&self, ids: &[ProviderId]) -> Result<Vec<Option<ProviderInfo>>>;

    /// Every data set paid for by `payer`, terminated ones included
    async fn client_data_sets(&self, payer: &str) -> Result<Vec<DataSetInfo>>;

    async fn data_set(&self, id: DataSetId) -> Result<Option<DataSetInfo>>;

    async fn data_set_metadata(&self, id: DataSetId) -> Result<Metadata>;

    async fn active_piece_count(&self, id: DataSetId) -> Result<u64>;

    async fn active_pieces(&self, id: DataSetId, offset: u64, limit: u64) -> Result<ActivePieces>;

    /// Next unused client data set nonce for `payer`
    async fn next_client_data_set_id(&self, payer: &str) -> Result<u64>;

    async fn terminate_data_set(&self, id: DataSetId) -> Result<TxHash>;

    async fn wait_for_receipt(&self, tx_hash: &TxHash) -> Result<Receipt>;

    /// Address of the contract recording data sets
    fn record_keeper(&self) -> &str;
}

/// Produces signed authorizations forwarded to the record keeper
#[async_trait]
pub trait Signer: Send + Sync {
    /// Payer address
    fn address(&self) -> &str;

    async fn sign_create_data_set(
        &self,
        client_data_set_id: u64,
        payee: &str,
        metadata: &Metadata,
    ) -> Result<ExtraData>;

    async fn sign_add_pieces(
        &self,
        client_data_set_id: u64,
        nonce: u64,
        pieces: &[PieceToAdd],
    ) -> Result<ExtraData>;

    async fn sign_create_and_add(
        &self,
        client_data_set_id: u64,
        payee: &str,
        metadata: &Metadata,
        nonce: u64,
        pieces: &[PieceToAdd],
    ) -> Result<ExtraData>;

    async fn sign_schedule_piece_removals(
        &self,
        client_data_set_id: u64,
        piece_ids: &[PieceId],
    ) -> Result<ExtraData>;
}

/// Hands out a provider client for a registry entry
pub trait ProviderConnector: Send + Sync {
    fn connect(&self, provider: &ProviderInfo) -> Result<Arc<dyn ProviderClient>>;
}

/// Connector building one `PdpServer` per service URL
pub struct HttpConnector {
    timeout: Duration,
    request_retry: RetryPolicy,
    status_poll: RetryPolicy,
    servers: DashMap<String, Arc<PdpServer>>,
}

impl Default for HttpConnector {
    fn default() -> Self {
        let defaults = PdpServerConfig::new("");
        Self {
            timeout: defaults.timeout,
            request_retry: defaults.request_retry,
            status_poll: defaults.status_poll,
            servers: DashMap::new(),
        }
    }
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy for idempotent requests
    pub fn with_request_retry(mut self, policy: RetryPolicy) -> Self {
        self.request_retry = policy;
        self
    }

    /// Set the transaction status polling policy
    pub fn with_status_poll(mut self, policy: RetryPolicy) -> Self {
        self.status_poll = policy;
        self
    }

    /// Number of distinct endpoints connected so far
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl ProviderConnector for HttpConnector {
    fn connect(&self, provider: &ProviderInfo) -> Result<Arc<dyn ProviderClient>> {
        let url = provider.pdp.service_url.trim_end_matches('/').to_string();
        if let Some(server) = self.servers.get(&url) {
            return Ok(Arc::clone(server.value()) as Arc<dyn ProviderClient>);
        }

        let config = PdpServerConfig::new(url.clone())
            .with_timeout(self.timeout)
            .with_request_retry(self.request_retry.clone())
            .with_status_poll(self.status_poll.clone());
        let server = Arc::new(PdpServer::new(config).map_err(|e| {
            StorageError::Configuration(format!("provider {}: {}", provider.id, e))
        })?);
        debug!(provider_id = provider.id, url = %url, "connected to provider");

        let server = self.servers.entry(url).or_insert(server);
        Ok(Arc::clone(server.value()) as Arc<dyn ProviderClient>)
    }
}

/// Collaborators shared by resolution, contexts and the manager
#[derive(Clone)]
pub struct Services {
    pub chain: Arc<dyn ChainAccess>,
    pub signer: Arc<dyn Signer>,
    pub connector: Arc<dyn ProviderConnector>,
    pub settings: UploadSettings,
}

impl Services {
    pub fn new(
        chain: Arc<dyn ChainAccess>,
        signer: Arc<dyn Signer>,
        connector: Arc<dyn ProviderConnector>,
    ) -> Self {
        Self {
            chain,
            signer,
            connector,
            settings: UploadSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: UploadSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Payer address of the signer
    pub fn payer(&self) -> Address {
        self.signer.address().to_string()
    }
}
