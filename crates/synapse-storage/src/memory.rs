//! In-memory network for testing and demos
//!
//! [`MemoryNetwork`] plays every collaborator at once: the provider
//! registry and data-set ledger ([`MemoryChain`]), the payer wallet
//! ([`MemorySigner`]) and any number of providers ([`MemoryProvider`]).
//! Signed authorizations are JSON payloads so the providers can check
//! them the way a record keeper would.
//!
//! Faults can be injected per provider and every provider counts the
//! calls it receives.

use crate::chain::{ChainAccess, ProviderConnector, Services, Signer};
use crate::types::{
    ActivePieces, Address, DataSetId, DataSetInfo, Metadata, PdpOffering, PieceEntry, PieceId,
    PieceToAdd, ProviderId, ProviderInfo, Receipt, TxHash, METADATA_WITH_CDN,
};
use crate::{Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use synapse_piece::PieceCid;
use synapse_sp::{
    DataSetCreated, ExtraData, PiecesAdded, ProviderClient, PullPieceStatus,
    PullRequest, PullState, PullStatus, SpError, TxHandle, UploadedPiece,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Record keeper address of the in-memory ledger
pub const MEMORY_RECORD_KEEPER: &str = "0x00000000000000000000000000000000000f0c05";

/// Record keeper used for data sets seeded as unmanaged
const FOREIGN_RECORD_KEEPER: &str = "0x000000000000000000000000000000000000dead";

/// Epoch the ledger reports as current
const CURRENT_EPOCH: u64 = 1_000;

// ==================== Signed payloads ====================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum SignedPayload {
    #[serde(rename_all = "camelCase")]
    CreateDataSet {
        payer: Address,
        client_data_set_id: u64,
        payee: Address,
        metadata: Metadata,
    },
    #[serde(rename_all = "camelCase")]
    AddPieces {
        payer: Address,
        client_data_set_id: u64,
        nonce: u64,
        pieces: Vec<PieceToAdd>,
    },
    #[serde(rename_all = "camelCase")]
    CreateAndAdd {
        payer: Address,
        client_data_set_id: u64,
        payee: Address,
        metadata: Metadata,
        nonce: u64,
        pieces: Vec<PieceToAdd>,
    },
    #[serde(rename_all = "camelCase")]
    SchedulePieceRemovals {
        payer: Address,
        client_data_set_id: u64,
        piece_ids: Vec<PieceId>,
    },
}

impl SignedPayload {
    fn encode(&self) -> Result<ExtraData> {
        Ok(ExtraData::from_bytes(&serde_json::to_vec(self)?))
    }

    fn decode(operation: &str, extra_data: &ExtraData) -> std::result::Result<Self, SpError> {
        let bytes = extra_data
            .to_bytes()
            .map_err(|e| bad_request(operation, format!("extra data is not hex: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| bad_request(operation, format!("invalid signature payload: {}", e)))
    }
}

fn bad_request(operation: &str, body: impl Into<String>) -> SpError {
    SpError::Status {
        operation: operation.to_string(),
        status: 400,
        body: body.into(),
    }
}

fn injected(operation: &str) -> SpError {
    SpError::Status {
        operation: operation.to_string(),
        status: 500,
        body: "injected failure".to_string(),
    }
}

// ==================== Network state ====================

#[derive(Default)]
struct CallCounters {
    ping: AtomicU64,
    upload: AtomicU64,
    pull: AtomicU64,
    add_pieces: AtomicU64,
    download: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Faults {
    ping: bool,
    upload: bool,
    pull: bool,
    add_pieces: bool,
    /// Confirm at most this many piece ids per addition
    confirm_limit: Option<usize>,
}

struct LedgerEntry {
    info: DataSetInfo,
    metadata: Metadata,
    pieces: BTreeMap<PieceId, PieceCid>,
    next_piece_id: PieceId,
}

enum TxRecord {
    DataSetCreated {
        data_set_id: DataSetId,
        piece_ids: Vec<PieceId>,
    },
    PiecesAdded {
        data_set_id: DataSetId,
        piece_ids: Vec<PieceId>,
    },
    Other,
}

#[derive(Default)]
struct Ledger {
    data_sets: BTreeMap<DataSetId, LedgerEntry>,
    txs: HashMap<String, (u64, TxRecord)>,
    client_nonces: HashMap<String, u64>,
    last_data_set_id: u64,
    last_rail_id: u64,
    last_tx: u64,
}

impl Ledger {
    fn record(&mut self, record: TxRecord) -> TxHash {
        self.last_tx += 1;
        let hash = format!("0x{:064x}", self.last_tx);
        self.txs.insert(hash.clone(), (self.last_tx, record));
        TxHash(hash)
    }

    fn next_rail(&mut self) -> u64 {
        self.last_rail_id += 1;
        self.last_rail_id
    }

    fn reserve_client_id(&mut self, payer: &str) -> u64 {
        let next = self.client_nonces.entry(payer.to_lowercase()).or_insert(0);
        let id = *next;
        *next += 1;
        id
    }

    fn create(
        &mut self,
        payer: &str,
        payee: &str,
        provider_id: ProviderId,
        client_data_set_id: u64,
        metadata: Metadata,
        record_keeper: &str,
    ) -> std::result::Result<DataSetId, SpError> {
        let taken = self.data_sets.values().any(|entry| {
            crate::types::same_address(&entry.info.payer, payer)
                && entry.info.client_data_set_id == client_data_set_id
        });
        if taken {
            return Err(bad_request(
                "create data set",
                format!("client data set id {} already used", client_data_set_id),
            ));
        }

        self.last_data_set_id += 1;
        let data_set_id = self.last_data_set_id;
        let pdp_rail_id = self.next_rail();
        let cdn_rail_id = if metadata.contains_key(METADATA_WITH_CDN) {
            self.next_rail()
        } else {
            0
        };
        self.data_sets.insert(
            data_set_id,
            LedgerEntry {
                info: DataSetInfo {
                    data_set_id,
                    pdp_rail_id,
                    cdn_rail_id,
                    payer: payer.to_string(),
                    payee: payee.to_string(),
                    provider_id,
                    client_data_set_id,
                    pdp_end_epoch: 0,
                    record_keeper: record_keeper.to_string(),
                },
                metadata,
                pieces: BTreeMap::new(),
                next_piece_id: 0,
            },
        );
        Ok(data_set_id)
    }

    fn add(
        &mut self,
        data_set_id: DataSetId,
        pieces: &[PieceCid],
    ) -> std::result::Result<Vec<PieceId>, SpError> {
        let entry = self
            .data_sets
            .get_mut(&data_set_id)
            .ok_or_else(|| bad_request("add pieces", format!("unknown data set {}", data_set_id)))?;
        if entry.info.is_terminated() {
            return Err(bad_request(
                "add pieces",
                format!("data set {} is terminated", data_set_id),
            ));
        }
        let mut ids = Vec::with_capacity(pieces.len());
        for cid in pieces {
            let id = entry.next_piece_id;
            entry.next_piece_id += 1;
            entry.pieces.insert(id, *cid);
            ids.push(id);
        }
        Ok(ids)
    }
}

struct NetworkState {
    providers: Mutex<BTreeMap<ProviderId, ProviderInfo>>,
    approved: Mutex<Vec<ProviderId>>,
    endorsed: Mutex<Vec<ProviderId>>,
    ledger: Mutex<Ledger>,
    /// Parked piece bytes per provider
    parked: DashMap<(ProviderId, PieceCid), Bytes>,
    counters: DashMap<ProviderId, Arc<CallCounters>>,
    faults: DashMap<ProviderId, Faults>,
}

impl NetworkState {
    fn counters(&self, id: ProviderId) -> Arc<CallCounters> {
        Arc::clone(self.counters.entry(id).or_default().value())
    }

    fn faults(&self, id: ProviderId) -> Faults {
        self.faults.get(&id).map(|f| *f.value()).unwrap_or_default()
    }

    fn provider(&self, id: ProviderId) -> Option<ProviderInfo> {
        self.providers.lock().get(&id).cloned()
    }

    fn provider_by_url(&self, url: &str) -> Option<ProviderInfo> {
        self.providers
            .lock()
            .values()
            .find(|p| {
                url == p.pdp.service_url
                    || url
                        .strip_prefix(p.pdp.service_url.as_str())
                        .map_or(false, |rest| rest.starts_with('/'))
            })
            .cloned()
    }
}

// ==================== Network handle ====================

/// A whole network held in memory
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(NetworkState {
                providers: Mutex::new(BTreeMap::new()),
                approved: Mutex::new(Vec::new()),
                endorsed: Mutex::new(Vec::new()),
                ledger: Mutex::new(Ledger::default()),
                parked: DashMap::new(),
                counters: DashMap::new(),
                faults: DashMap::new(),
            }),
        }
    }

    /// Register and approve a provider; ids start at 1
    pub fn add_provider(&self, name: &str) -> ProviderInfo {
        let mut providers = self.state.providers.lock();
        let id = providers.len() as ProviderId + 1;
        let info = ProviderInfo {
            id,
            service_provider: format!("0x{:040x}", 0x5000 + id),
            payee: format!("0x{:040x}", 0x7000 + id),
            name: name.to_string(),
            active: true,
            pdp: PdpOffering {
                service_url: format!("memory://provider-{}", id),
                min_piece_size: synapse_piece::MIN_UPLOAD_SIZE,
                max_piece_size: synapse_piece::MAX_UPLOAD_SIZE,
                storage_price_per_tib_per_day: 100_000_000_000_000_000,
                min_proving_period_epochs: 30,
                location: "memory".to_string(),
                ipni_piece: false,
                ipni_ipfs: false,
                capabilities: BTreeMap::new(),
            },
        };
        providers.insert(id, info.clone());
        self.state.approved.lock().push(id);
        info
    }

    pub fn update_provider(&self, id: ProviderId, update: impl FnOnce(&mut ProviderInfo)) {
        if let Some(provider) = self.state.providers.lock().get_mut(&id) {
            update(provider);
        }
    }

    pub fn set_provider_active(&self, id: ProviderId, active: bool) {
        self.update_provider(id, |p| p.active = active);
    }

    pub fn set_approved(&self, ids: impl IntoIterator<Item = ProviderId>) {
        *self.state.approved.lock() = ids.into_iter().collect();
    }

    pub fn set_endorsed(&self, ids: impl IntoIterator<Item = ProviderId>) {
        *self.state.endorsed.lock() = ids.into_iter().collect();
    }

    pub fn chain(&self) -> Arc<MemoryChain> {
        Arc::new(MemoryChain {
            state: Arc::clone(&self.state),
        })
    }

    pub fn signer(&self, payer: &str) -> Arc<MemorySigner> {
        Arc::new(MemorySigner {
            address: payer.to_string(),
        })
    }

    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// Collaborators for a client paying from `payer`
    pub fn services(&self, payer: &str) -> Services {
        Services::new(self.chain(), self.signer(payer), self.connector())
    }

    /// Client for one provider, bypassing the connector
    pub fn provider_client(&self, id: ProviderId) -> Result<Arc<MemoryProvider>> {
        let info = self
            .state
            .provider(id)
            .ok_or_else(|| StorageError::ProviderNotFound(id.to_string()))?;
        Ok(Arc::new(MemoryProvider::new(Arc::clone(&self.state), &info)))
    }

    /// Write a data set straight into the ledger
    pub fn seed_data_set(&self, seed: DataSetSeed) -> DataSetId {
        let payee = self
            .state
            .provider(seed.provider_id)
            .map(|p| p.payee)
            .unwrap_or_default();
        let mut ledger = self.state.ledger.lock();
        let client_data_set_id = ledger.reserve_client_id(&seed.payer);

        ledger.last_data_set_id += 1;
        let data_set_id = ledger.last_data_set_id;
        let pdp_rail_id = if seed.live { ledger.next_rail() } else { 0 };
        let cdn_rail_id = if seed.metadata.contains_key(METADATA_WITH_CDN) {
            ledger.next_rail()
        } else {
            0
        };
        let record_keeper = if seed.managed {
            MEMORY_RECORD_KEEPER
        } else {
            FOREIGN_RECORD_KEEPER
        };
        ledger.data_sets.insert(
            data_set_id,
            LedgerEntry {
                info: DataSetInfo {
                    data_set_id,
                    pdp_rail_id,
                    cdn_rail_id,
                    payer: seed.payer,
                    payee,
                    provider_id: seed.provider_id,
                    client_data_set_id,
                    pdp_end_epoch: if seed.terminated { CURRENT_EPOCH } else { 0 },
                    record_keeper: record_keeper.to_string(),
                },
                metadata: seed.metadata,
                pieces: BTreeMap::new(),
                next_piece_id: 0,
            },
        );
        drop(ledger);

        self.seed_pieces(data_set_id, seed.pieces);
        data_set_id
    }

    /// Replace a data set's active pieces with `count` synthetic ones
    pub fn seed_pieces(&self, data_set_id: DataSetId, count: usize) {
        let mut ledger = self.state.ledger.lock();
        if let Some(entry) = ledger.data_sets.get_mut(&data_set_id) {
            entry.pieces.clear();
            for i in 0..count as u64 {
                let cid = synapse_piece::calculate(format!("seed:{}:{}", data_set_id, i).as_bytes());
                entry.pieces.insert(i, cid);
            }
            entry.next_piece_id = count as u64;
        }
    }

    /// Ledger view of a data set
    pub fn data_set(&self, id: DataSetId) -> Option<DataSetInfo> {
        self.state.ledger.lock().data_sets.get(&id).map(|e| e.info.clone())
    }

    /// Active piece ids of a data set, ascending
    pub fn active_piece_ids(&self, id: DataSetId) -> Vec<PieceId> {
        self.state
            .ledger
            .lock()
            .data_sets
            .get(&id)
            .map(|e| e.pieces.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `provider` holds the bytes of `piece`
    pub fn is_parked(&self, provider: ProviderId, piece: &PieceCid) -> bool {
        self.state.parked.contains_key(&(provider, *piece))
    }

    pub fn parked_count(&self, provider: ProviderId) -> usize {
        self.state
            .parked
            .iter()
            .filter(|entry| entry.key().0 == provider)
            .count()
    }

    /// Put bytes on a provider without an upload call
    pub fn park(&self, provider: ProviderId, data: Bytes) -> PieceCid {
        let cid = synapse_piece::calculate(&data);
        self.state.parked.insert((provider, cid), data);
        cid
    }

    fn set_fault(&self, id: ProviderId, apply: impl FnOnce(&mut Faults)) {
        apply(self.state.faults.entry(id).or_default().value_mut());
    }

    pub fn fail_ping(&self, id: ProviderId, fail: bool) {
        self.set_fault(id, |f| f.ping = fail);
    }

    pub fn fail_upload(&self, id: ProviderId, fail: bool) {
        self.set_fault(id, |f| f.upload = fail);
    }

    pub fn fail_pull(&self, id: ProviderId, fail: bool) {
        self.set_fault(id, |f| f.pull = fail);
    }

    pub fn fail_add_pieces(&self, id: ProviderId, fail: bool) {
        self.set_fault(id, |f| f.add_pieces = fail);
    }

    /// Confirm at most `limit` piece ids per addition
    pub fn limit_confirmations(&self, id: ProviderId, limit: Option<usize>) {
        self.set_fault(id, |f| f.confirm_limit = limit);
    }

    pub fn ping_calls(&self, id: ProviderId) -> u64 {
        self.state.counters(id).ping.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self, id: ProviderId) -> u64 {
        self.state.counters(id).upload.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self, id: ProviderId) -> u64 {
        self.state.counters(id).pull.load(Ordering::SeqCst)
    }

    /// Add-pieces submissions, combined create-and-add included
    pub fn add_pieces_calls(&self, id: ProviderId) -> u64 {
        self.state.counters(id).add_pieces.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self, id: ProviderId) -> u64 {
        self.state.counters(id).download.load(Ordering::SeqCst)
    }

    pub fn total_upload_calls(&self) -> u64 {
        self.state
            .counters
            .iter()
            .map(|c| c.value().upload.load(Ordering::SeqCst))
            .sum()
    }

    pub fn total_add_pieces_calls(&self) -> u64 {
        self.state
            .counters
            .iter()
            .map(|c| c.value().add_pieces.load(Ordering::SeqCst))
            .sum()
    }
}

/// Shape of a seeded data set
#[derive(Clone, Debug)]
pub struct DataSetSeed {
    payer: Address,
    provider_id: ProviderId,
    metadata: Metadata,
    pieces: usize,
    live: bool,
    terminated: bool,
    managed: bool,
}

impl DataSetSeed {
    /// Live, managed, empty data set
    pub fn new(payer: &str, provider_id: ProviderId) -> Self {
        Self {
            payer: payer.to_string(),
            provider_id,
            metadata: Metadata::new(),
            pieces: 0,
            live: true,
            terminated: false,
            managed: true,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_cdn(self) -> Self {
        self.with_metadata(METADATA_WITH_CDN, "")
    }

    pub fn with_pieces(mut self, count: usize) -> Self {
        self.pieces = count;
        self
    }

    pub fn terminated(mut self) -> Self {
        self.terminated = true;
        self
    }

    /// No payment rail
    pub fn not_live(mut self) -> Self {
        self.live = false;
        self
    }

    /// Recorded by a different record keeper
    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }
}

// ==================== Chain ====================

/// Registry and ledger view of a [`MemoryNetwork`]
pub struct MemoryChain {
    state: Arc<NetworkState>,
}

#[async_trait]
impl ChainAccess for MemoryChain {
    async fn approved_provider_ids(&self) -> Result<Vec<ProviderId>> {
        Ok(self.state.approved.lock().clone())
    }

    async fn endorsed_provider_ids(&self) -> Result<Vec<ProviderId>> {
        Ok(self.state.endorsed.lock().clone())
    }

    async fn provider(&self, id: ProviderId) -> Result<Option<ProviderInfo>> {
        Ok(self.state.provider(id))
    }

    async fn provider_by_address(&self, address: &str) -> Result<Option<ProviderInfo>> {
        Ok(self
            .state
            .providers
            .lock()
            .values()
            .find(|p| crate::types::same_address(&p.service_provider, address))
            .cloned())
    }

    async fn providers_by_ids(&self, ids: &[ProviderId]) -> Result<Vec<Option<ProviderInfo>>> {
        let providers = self.state.providers.lock();
        Ok(ids.iter().map(|id| providers.get(id).cloned()).collect())
    }

    async fn client_data_sets(&self, payer: &str) -> Result<Vec<DataSetInfo>> {
        Ok(self
            .state
            .ledger
            .lock()
            .data_sets
            .values()
            .filter(|e| crate::types::same_address(&e.info.payer, payer))
            .map(|e| e.info.clone())
            .collect())
    }

    async fn data_set(&self, id: DataSetId) -> Result<Option<DataSetInfo>> {
        Ok(self.state.ledger.lock().data_sets.get(&id).map(|e| e.info.clone()))
    }

    async fn data_set_metadata(&self, id: DataSetId) -> Result<Metadata> {
        self.state
            .ledger
            .lock()
            .data_sets
            .get(&id)
            .map(|e| e.metadata.clone())
            .ok_or(StorageError::DataSetNotFound(id))
    }

    async fn active_piece_count(&self, id: DataSetId) -> Result<u64> {
        self.state
            .ledger
            .lock()
            .data_sets
            .get(&id)
            .map(|e| e.pieces.len() as u64)
            .ok_or(StorageError::DataSetNotFound(id))
    }

    async fn active_pieces(&self, id: DataSetId, offset: u64, limit: u64) -> Result<ActivePieces> {
        let ledger = self.state.ledger.lock();
        let entry = ledger
            .data_sets
            .get(&id)
            .ok_or(StorageError::DataSetNotFound(id))?;
        let pieces: Vec<PieceEntry> = entry
            .pieces
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(piece_id, piece_cid)| PieceEntry {
                piece_id: *piece_id,
                piece_cid: *piece_cid,
            })
            .collect();
        let has_more = (offset as usize).saturating_add(pieces.len()) < entry.pieces.len();
        Ok(ActivePieces { pieces, has_more })
    }

    async fn next_client_data_set_id(&self, payer: &str) -> Result<u64> {
        Ok(self.state.ledger.lock().reserve_client_id(payer))
    }

    async fn terminate_data_set(&self, id: DataSetId) -> Result<TxHash> {
        let mut ledger = self.state.ledger.lock();
        let entry = ledger
            .data_sets
            .get_mut(&id)
            .ok_or(StorageError::DataSetNotFound(id))?;
        if entry.info.is_terminated() {
            return Err(StorageError::DataSetTerminated(id));
        }
        entry.info.pdp_end_epoch = CURRENT_EPOCH + 2_880;
        Ok(ledger.record(TxRecord::Other))
    }

    async fn wait_for_receipt(&self, tx_hash: &TxHash) -> Result<Receipt> {
        let ledger = self.state.ledger.lock();
        let (block, _) = ledger
            .txs
            .get(&tx_hash.0)
            .ok_or_else(|| StorageError::Chain(format!("unknown transaction {}", tx_hash)))?;
        Ok(Receipt {
            tx_hash: tx_hash.clone(),
            success: true,
            block_number: *block,
        })
    }

    fn record_keeper(&self) -> &str {
        MEMORY_RECORD_KEEPER
    }
}

// ==================== Signer ====================

/// Wallet stand-in producing JSON payloads
pub struct MemorySigner {
    address: Address,
}

#[async_trait]
impl Signer for MemorySigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign_create_data_set(
        &self,
        client_data_set_id: u64,
        payee: &str,
        metadata: &Metadata,
    ) -> Result<ExtraData> {
        SignedPayload::CreateDataSet {
            payer: self.address.clone(),
            client_data_set_id,
            payee: payee.to_string(),
            metadata: metadata.clone(),
        }
        .encode()
    }

    async fn sign_add_pieces(
        &self,
        client_data_set_id: u64,
        nonce: u64,
        pieces: &[PieceToAdd],
    ) -> Result<ExtraData> {
        SignedPayload::AddPieces {
            payer: self.address.clone(),
            client_data_set_id,
            nonce,
            pieces: pieces.to_vec(),
        }
        .encode()
    }

    async fn sign_create_and_add(
        &self,
        client_data_set_id: u64,
        payee: &str,
        metadata: &Metadata,
        nonce: u64,
        pieces: &[PieceToAdd],
    ) -> Result<ExtraData> {
        SignedPayload::CreateAndAdd {
            payer: self.address.clone(),
            client_data_set_id,
            payee: payee.to_string(),
            metadata: metadata.clone(),
            nonce,
            pieces: pieces.to_vec(),
        }
        .encode()
    }

    async fn sign_schedule_piece_removals(
        &self,
        client_data_set_id: u64,
        piece_ids: &[PieceId],
    ) -> Result<ExtraData> {
        SignedPayload::SchedulePieceRemovals {
            payer: self.address.clone(),
            client_data_set_id,
            piece_ids: piece_ids.to_vec(),
        }
        .encode()
    }
}

// ==================== Providers ====================

/// Connector handing out [`MemoryProvider`]s
pub struct MemoryConnector {
    state: Arc<NetworkState>,
}

impl ProviderConnector for MemoryConnector {
    fn connect(&self, provider: &ProviderInfo) -> Result<Arc<dyn ProviderClient>> {
        if self.state.provider(provider.id).is_none() {
            return Err(StorageError::ProviderNotFound(provider.id.to_string()));
        }
        Ok(Arc::new(MemoryProvider::new(Arc::clone(&self.state), provider)))
    }
}

/// One provider of a [`MemoryNetwork`]
pub struct MemoryProvider {
    state: Arc<NetworkState>,
    provider_id: ProviderId,
    payee: Address,
    service_url: String,
}

impl MemoryProvider {
    fn new(state: Arc<NetworkState>, info: &ProviderInfo) -> Self {
        Self {
            state,
            provider_id: info.id,
            payee: info.payee.clone(),
            service_url: info.pdp.service_url.clone(),
        }
    }

    fn faults(&self) -> Faults {
        self.state.faults(self.provider_id)
    }

    fn counters(&self) -> Arc<CallCounters> {
        self.state.counters(self.provider_id)
    }

    fn check_record_keeper(operation: &str, record_keeper: &str) -> std::result::Result<(), SpError> {
        if !crate::types::same_address(record_keeper, MEMORY_RECORD_KEEPER) {
            return Err(bad_request(operation, format!("unknown record keeper {}", record_keeper)));
        }
        Ok(())
    }

    fn check_parked(&self, operation: &str, pieces: &[PieceCid]) -> std::result::Result<(), SpError> {
        match pieces
            .iter()
            .find(|cid| !self.state.parked.contains_key(&(self.provider_id, **cid)))
        {
            Some(missing) => Err(bad_request(operation, format!("piece {} is not parked", missing))),
            None => Ok(()),
        }
    }

    fn check_signed_pieces(
        operation: &str,
        signed: &[PieceToAdd],
        submitted: &[PieceCid],
    ) -> std::result::Result<(), SpError> {
        let signed: Vec<PieceCid> = signed.iter().map(|p| p.piece_cid).collect();
        if signed != submitted {
            return Err(bad_request(operation, "pieces do not match signature"));
        }
        Ok(())
    }

    fn handle(&self, tx_hash: TxHash, kind: &str) -> TxHandle {
        TxHandle {
            status_url: format!("{}/pdp/{}/{}", self.service_url, kind, tx_hash),
            tx_hash,
        }
    }

    fn confirmed(&self, mut piece_ids: Vec<PieceId>) -> Vec<PieceId> {
        if let Some(limit) = self.faults().confirm_limit {
            piece_ids.truncate(limit);
        }
        piece_ids
    }
}

#[async_trait]
impl ProviderClient for MemoryProvider {
    fn service_url(&self) -> &str {
        &self.service_url
    }

    async fn ping(&self) -> synapse_sp::Result<()> {
        self.counters().ping.fetch_add(1, Ordering::SeqCst);
        if self.faults().ping {
            return Err(SpError::Connection(format!("{} unreachable", self.service_url)));
        }
        Ok(())
    }

    async fn create_data_set(
        &self,
        record_keeper: &str,
        extra_data: &ExtraData,
    ) -> synapse_sp::Result<TxHandle> {
        const OP: &str = "create data set";
        Self::check_record_keeper(OP, record_keeper)?;
        let SignedPayload::CreateDataSet {
            payer,
            client_data_set_id,
            payee,
            metadata,
        } = SignedPayload::decode(OP, extra_data)?
        else {
            return Err(bad_request(OP, "wrong signature kind"));
        };
        if !crate::types::same_address(&payee, &self.payee) {
            return Err(bad_request(OP, "payee does not match provider"));
        }

        let mut ledger = self.state.ledger.lock();
        let data_set_id = ledger.create(
            &payer,
            &payee,
            self.provider_id,
            client_data_set_id,
            metadata,
            record_keeper,
        )?;
        let tx_hash = ledger.record(TxRecord::DataSetCreated {
            data_set_id,
            piece_ids: Vec::new(),
        });
        Ok(self.handle(tx_hash, "data-sets/created"))
    }

    async fn create_and_add_pieces(
        &self,
        record_keeper: &str,
        pieces: &[PieceCid],
        extra_data: &ExtraData,
    ) -> synapse_sp::Result<TxHandle> {
        const OP: &str = "create data set and add pieces";
        self.counters().add_pieces.fetch_add(1, Ordering::SeqCst);
        // Suspend like a network round trip
        tokio::task::yield_now().await;
        if self.faults().add_pieces {
            return Err(injected(OP));
        }
        Self::check_record_keeper(OP, record_keeper)?;
        let SignedPayload::CreateAndAdd {
            payer,
            client_data_set_id,
            payee,
            metadata,
            pieces: signed,
            ..
        } = SignedPayload::decode(OP, extra_data)?
        else {
            return Err(bad_request(OP, "wrong signature kind"));
        };
        Self::check_signed_pieces(OP, &signed, pieces)?;
        self.check_parked(OP, pieces)?;

        let mut ledger = self.state.ledger.lock();
        let data_set_id = ledger.create(
            &payer,
            &payee,
            self.provider_id,
            client_data_set_id,
            metadata,
            record_keeper,
        )?;
        let piece_ids = ledger.add(data_set_id, pieces)?;
        let tx_hash = ledger.record(TxRecord::DataSetCreated {
            data_set_id,
            piece_ids,
        });
        debug!(provider_id = self.provider_id, data_set_id, "memory data set created");
        Ok(self.handle(tx_hash, "data-sets/created"))
    }

    async fn wait_for_data_set_creation(&self, tx: &TxHandle) -> synapse_sp::Result<DataSetCreated> {
        let ledger = self.state.ledger.lock();
        match ledger.txs.get(&tx.tx_hash.0) {
            Some((_, TxRecord::DataSetCreated { data_set_id, .. })) => Ok(DataSetCreated {
                data_set_id: *data_set_id,
                tx_hash: tx.tx_hash.clone(),
            }),
            _ => Err(SpError::Rejected {
                tx_hash: tx.tx_hash.0.clone(),
                reason: "no data set created by this transaction".to_string(),
            }),
        }
    }

    async fn add_pieces(
        &self,
        data_set_id: DataSetId,
        pieces: &[PieceCid],
        extra_data: &ExtraData,
    ) -> synapse_sp::Result<TxHandle> {
        const OP: &str = "add pieces";
        self.counters().add_pieces.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.faults().add_pieces {
            return Err(injected(OP));
        }
        let SignedPayload::AddPieces {
            payer,
            client_data_set_id,
            pieces: signed,
            ..
        } = SignedPayload::decode(OP, extra_data)?
        else {
            return Err(bad_request(OP, "wrong signature kind"));
        };
        Self::check_signed_pieces(OP, &signed, pieces)?;
        self.check_parked(OP, pieces)?;

        let mut ledger = self.state.ledger.lock();
        match ledger.data_sets.get(&data_set_id) {
            Some(entry)
                if entry.info.provider_id == self.provider_id
                    && crate::types::same_address(&entry.info.payer, &payer)
                    && entry.info.client_data_set_id == client_data_set_id => {}
            Some(_) => return Err(bad_request(OP, "signature does not match data set")),
            None => {
                return Err(SpError::Status {
                    operation: OP.to_string(),
                    status: 404,
                    body: format!("data set {} not found", data_set_id),
                })
            }
        }
        let piece_ids = ledger.add(data_set_id, pieces)?;
        let tx_hash = ledger.record(TxRecord::PiecesAdded {
            data_set_id,
            piece_ids,
        });
        Ok(self.handle(tx_hash, "pieces/added"))
    }

    async fn wait_for_pieces_added(
        &self,
        data_set_id: DataSetId,
        tx_hash: &TxHash,
    ) -> synapse_sp::Result<PiecesAdded> {
        let piece_ids = {
            let ledger = self.state.ledger.lock();
            match ledger.txs.get(&tx_hash.0) {
                Some((_, TxRecord::PiecesAdded { data_set_id: ds, piece_ids }))
                | Some((_, TxRecord::DataSetCreated { data_set_id: ds, piece_ids }))
                    if *ds == data_set_id =>
                {
                    piece_ids.clone()
                }
                _ => {
                    return Err(SpError::Rejected {
                        tx_hash: tx_hash.0.clone(),
                        reason: format!("no pieces added to data set {}", data_set_id),
                    })
                }
            }
        };
        Ok(PiecesAdded {
            data_set_id,
            tx_hash: tx_hash.clone(),
            piece_ids: self.confirmed(piece_ids),
        })
    }

    async fn upload_piece(
        &self,
        data: Bytes,
        piece_cid: &PieceCid,
        cancel: Option<&CancellationToken>,
    ) -> synapse_sp::Result<UploadedPiece> {
        self.counters().upload.fetch_add(1, Ordering::SeqCst);
        if cancel.map_or(false, CancellationToken::is_cancelled) {
            return Err(SpError::Aborted);
        }
        tokio::task::yield_now().await;
        if cancel.map_or(false, CancellationToken::is_cancelled) {
            return Err(SpError::Aborted);
        }
        if self.faults().upload {
            return Err(SpError::Connection(format!("{} dropped the upload", self.service_url)));
        }
        if !synapse_piece::verify(&data, piece_cid) {
            return Err(bad_request("upload piece", "payload does not match piece CID"));
        }

        let size = data.len() as u64;
        let already_present = self
            .state
            .parked
            .insert((self.provider_id, *piece_cid), data)
            .is_some();
        Ok(UploadedPiece {
            piece_cid: *piece_cid,
            size,
            already_present,
        })
    }

    async fn find_piece(&self, piece_cid: &PieceCid) -> synapse_sp::Result<()> {
        if self.state.parked.contains_key(&(self.provider_id, *piece_cid)) {
            Ok(())
        } else {
            Err(SpError::PieceNotFound(piece_cid.to_string()))
        }
    }

    async fn pull_pieces(&self, request: &PullRequest) -> synapse_sp::Result<PullStatus> {
        const OP: &str = "pull pieces";
        self.counters().pull.fetch_add(1, Ordering::SeqCst);
        Self::check_record_keeper(OP, &request.record_keeper)?;
        match SignedPayload::decode(OP, &request.extra_data)? {
            SignedPayload::AddPieces { .. } | SignedPayload::CreateAndAdd { .. } => {}
            _ => return Err(bad_request(OP, "wrong signature kind")),
        }

        let fail = self.faults().pull;
        let pieces: Vec<PullPieceStatus> = request
            .pieces
            .iter()
            .map(|piece| {
                let source = if fail {
                    None
                } else {
                    self.state
                        .provider_by_url(&piece.source_url)
                        .and_then(|src| {
                            self.state
                                .parked
                                .get(&(src.id, piece.piece_cid))
                                .map(|bytes| bytes.value().clone())
                        })
                };
                let status = match source {
                    Some(bytes) => {
                        self.state
                            .parked
                            .insert((self.provider_id, piece.piece_cid), bytes);
                        PullState::Complete
                    }
                    None => PullState::Failed,
                };
                PullPieceStatus {
                    piece_cid: piece.piece_cid,
                    status,
                }
            })
            .collect();

        let status = if pieces.iter().all(|p| p.status == PullState::Complete) {
            PullState::Complete
        } else {
            PullState::Failed
        };
        Ok(PullStatus { status, pieces })
    }

    async fn download_piece(&self, piece_cid: &PieceCid) -> synapse_sp::Result<Bytes> {
        self.counters().download.fetch_add(1, Ordering::SeqCst);
        self.state
            .parked
            .get(&(self.provider_id, *piece_cid))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SpError::PieceNotFound(piece_cid.to_string()))
    }

    async fn delete_piece(
        &self,
        data_set_id: DataSetId,
        piece_id: PieceId,
        extra_data: &ExtraData,
    ) -> synapse_sp::Result<TxHash> {
        const OP: &str = "delete piece";
        let SignedPayload::SchedulePieceRemovals {
            payer, piece_ids, ..
        } = SignedPayload::decode(OP, extra_data)?
        else {
            return Err(bad_request(OP, "wrong signature kind"));
        };
        if !piece_ids.contains(&piece_id) {
            return Err(bad_request(OP, "piece id not covered by signature"));
        }

        let mut ledger = self.state.ledger.lock();
        let entry = ledger
            .data_sets
            .get_mut(&data_set_id)
            .filter(|e| crate::types::same_address(&e.info.payer, &payer))
            .ok_or_else(|| bad_request(OP, format!("data set {} not owned by {}", data_set_id, payer)))?;
        if entry.pieces.remove(&piece_id).is_none() {
            return Err(SpError::Status {
                operation: OP.to_string(),
                status: 404,
                body: format!("piece {} not found in data set {}", piece_id, data_set_id),
            });
        }
        Ok(ledger.record(TxRecord::Other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYER: &str = "0x00000000000000000000000000000000000000aa";

    fn payload(seed: u8) -> Bytes {
        Bytes::from(vec![seed; 300])
    }

    #[tokio::test]
    async fn test_signed_create_and_add_round() {
        let network = MemoryNetwork::new();
        let sp = network.add_provider("sp");
        let client = network.provider_client(sp.id).unwrap();
        let signer = network.signer(PAYER);

        let data = payload(1);
        let cid = synapse_piece::calculate(&data);
        client.upload_piece(data, &cid, None).await.unwrap();

        let extra = signer
            .sign_create_and_add(0, &sp.payee, &Metadata::new(), 7, &[PieceToAdd::new(cid)])
            .await
            .unwrap();
        let tx = client
            .create_and_add_pieces(MEMORY_RECORD_KEEPER, &[cid], &extra)
            .await
            .unwrap();
        let created = client.wait_for_data_set_creation(&tx).await.unwrap();
        let added = client
            .wait_for_pieces_added(created.data_set_id, &tx.tx_hash)
            .await
            .unwrap();

        assert_eq!(created.data_set_id, 1);
        assert_eq!(added.piece_ids, vec![0]);
        assert_eq!(network.add_pieces_calls(sp.id), 1);
        let info = network.data_set(1).unwrap();
        assert_eq!(info.payer, PAYER);
        assert!(info.is_live());
    }

    #[tokio::test]
    async fn test_add_requires_parked_and_matching_signature() {
        let network = MemoryNetwork::new();
        let sp = network.add_provider("sp");
        let ds = network.seed_data_set(DataSetSeed::new(PAYER, sp.id));
        let client = network.provider_client(sp.id).unwrap();
        let signer = network.signer(PAYER);
        let client_id = network.data_set(ds).unwrap().client_data_set_id;

        let cid = network.park(sp.id, payload(2));
        let other = synapse_piece::calculate(&payload(3));

        let unparked = signer
            .sign_add_pieces(client_id, 1, &[PieceToAdd::new(other)])
            .await
            .unwrap();
        let err = client.add_pieces(ds, &[other], &unparked).await.unwrap_err();
        assert!(matches!(err, SpError::Status { status: 400, .. }));

        let wrong_nonce = signer
            .sign_add_pieces(client_id + 9, 1, &[PieceToAdd::new(cid)])
            .await
            .unwrap();
        assert!(client.add_pieces(ds, &[cid], &wrong_nonce).await.is_err());

        let good = signer
            .sign_add_pieces(client_id, 1, &[PieceToAdd::new(cid)])
            .await
            .unwrap();
        let tx = client.add_pieces(ds, &[cid], &good).await.unwrap();
        let added = client.wait_for_pieces_added(ds, &tx.tx_hash).await.unwrap();
        assert_eq!(added.piece_ids, vec![0]);
    }

    #[tokio::test]
    async fn test_pull_copies_between_providers() {
        let network = MemoryNetwork::new();
        let a = network.add_provider("a");
        let b = network.add_provider("b");
        let source = network.provider_client(a.id).unwrap();
        let target = network.provider_client(b.id).unwrap();
        let cid = network.park(a.id, payload(4));
        let extra = network
            .signer(PAYER)
            .sign_create_and_add(0, &b.payee, &Metadata::new(), 1, &[PieceToAdd::new(cid)])
            .await
            .unwrap();

        let request = PullRequest {
            record_keeper: MEMORY_RECORD_KEEPER.to_string(),
            extra_data: extra,
            data_set_id: None,
            pieces: vec![synapse_sp::PullPiece {
                piece_cid: cid,
                source_url: source.piece_url(&cid),
            }],
        };
        let status = target.pull_pieces(&request).await.unwrap();
        assert_eq!(status.status, PullState::Complete);
        assert!(network.is_parked(b.id, &cid));

        network.fail_pull(b.id, true);
        let failed = target.pull_pieces(&request).await.unwrap();
        assert_eq!(failed.failed_pieces(), vec![cid]);
        assert_eq!(network.pull_calls(b.id), 2);
    }

    #[tokio::test]
    async fn test_upload_faults_and_cancellation() {
        let network = MemoryNetwork::new();
        let sp = network.add_provider("sp");
        let client = network.provider_client(sp.id).unwrap();
        let data = payload(5);
        let cid = synapse_piece::calculate(&data);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.upload_piece(data.clone(), &cid, Some(&cancel)).await.unwrap_err();
        assert!(matches!(err, SpError::Aborted));

        let wrong = synapse_piece::calculate(&payload(6));
        assert!(client.upload_piece(data.clone(), &wrong, None).await.is_err());

        network.fail_upload(sp.id, true);
        let err = client.upload_piece(data, &cid, None).await.unwrap_err();
        assert!(matches!(err, SpError::Connection(_)));
        assert_eq!(network.upload_calls(sp.id), 3);
        assert_eq!(network.parked_count(sp.id), 0);
    }

    #[tokio::test]
    async fn test_ledger_queries() {
        let network = MemoryNetwork::new();
        let sp = network.add_provider("sp");
        let chain = network.chain();
        let ds = network.seed_data_set(DataSetSeed::new(PAYER, sp.id).with_pieces(5).with_cdn());

        let page = chain.active_pieces(ds, 3, 10).await.unwrap();
        assert_eq!(page.pieces.len(), 2);
        assert!(!page.has_more);
        assert!(chain.active_pieces(ds, 0, 2).await.unwrap().has_more);
        assert!(chain.data_set(ds).await.unwrap().unwrap().with_cdn());

        let first = chain.next_client_data_set_id(PAYER).await.unwrap();
        let second = chain.next_client_data_set_id(PAYER).await.unwrap();
        assert_ne!(first, second);

        let tx = chain.terminate_data_set(ds).await.unwrap();
        assert!(chain.wait_for_receipt(&tx).await.unwrap().success);
        assert!(chain.data_set(ds).await.unwrap().unwrap().is_terminated());
        assert!(matches!(
            chain.terminate_data_set(ds).await.unwrap_err(),
            StorageError::DataSetTerminated(_)
        ));
    }
}
