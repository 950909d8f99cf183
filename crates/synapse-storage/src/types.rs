//! Data model shared by resolution, contexts and the manager

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use synapse_piece::PieceCid;
pub use synapse_sp::{DataSetId, PieceId, TxHash};

/// Registry-assigned provider identifier
pub type ProviderId = u64;

/// Hex encoded account address (`0x...`)
pub type Address = String;

/// Free-form key/value metadata attached to data sets and pieces
pub type Metadata = BTreeMap<String, String>;

/// Metadata key marking a data set as CDN-enabled
pub const METADATA_WITH_CDN: &str = "withCDN";

/// Compare two addresses ignoring hex case
pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Exact equality of the full key/value sets
///
/// A data set carrying `withCDN` only matches a request that also asks for
/// CDN, and vice versa.
pub fn metadata_matches(data_set: &Metadata, requested: &Metadata) -> bool {
    data_set == requested
}

/// PDP product offering of a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpOffering {
    pub service_url: String,
    pub min_piece_size: u64,
    pub max_piece_size: u64,
    /// Price in token base units per TiB per day
    pub storage_price_per_tib_per_day: u128,
    pub min_proving_period_epochs: u64,
    pub location: String,
    pub ipni_piece: bool,
    pub ipni_ipfs: bool,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

/// A registered storage provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub service_provider: Address,
    pub payee: Address,
    pub name: String,
    pub active: bool,
    pub pdp: PdpOffering,
}

/// Ledger view of a data set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetInfo {
    pub data_set_id: DataSetId,
    /// Zero when the data set has no backing payment rail
    pub pdp_rail_id: u64,
    pub cdn_rail_id: u64,
    pub payer: Address,
    pub payee: Address,
    pub provider_id: ProviderId,
    /// Client nonce used when signing additions
    pub client_data_set_id: u64,
    /// Non-zero once termination has been scheduled
    pub pdp_end_epoch: u64,
    /// Contract recording this data set
    pub record_keeper: Address,
}

impl DataSetInfo {
    pub fn is_live(&self) -> bool {
        self.pdp_rail_id != 0
    }

    pub fn is_terminated(&self) -> bool {
        self.pdp_end_epoch > 0
    }

    pub fn with_cdn(&self) -> bool {
        self.cdn_rail_id != 0
    }
}

/// Data set with metadata, piece count and management flag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnhancedDataSet {
    pub info: DataSetInfo,
    pub metadata: Metadata,
    pub active_piece_count: u64,
    /// Recorded by the record keeper this SDK talks to
    pub is_managed: bool,
}

impl EnhancedDataSet {
    pub fn data_set_id(&self) -> DataSetId {
        self.info.data_set_id
    }

    pub fn provider_id(&self) -> ProviderId {
        self.info.provider_id
    }

    /// Live, not terminated and managed by our record keeper
    pub fn is_reusable(&self) -> bool {
        self.is_managed && self.info.is_live() && !self.info.is_terminated()
    }
}

/// Outcome of resolving a (provider, data set) pairing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionResult {
    pub provider: ProviderInfo,
    /// `None` until the first commit creates the data set
    pub data_set_id: Option<DataSetId>,
    pub client_data_set_id: Option<u64>,
    pub is_existing: bool,
    pub metadata: Metadata,
}

impl ResolutionResult {
    /// A fresh data set will be created on first commit
    pub fn new_data_set(provider: ProviderInfo, metadata: Metadata) -> Self {
        Self {
            provider,
            data_set_id: None,
            client_data_set_id: None,
            is_existing: false,
            metadata,
        }
    }

    /// Reuse an existing data set
    pub fn existing(provider: ProviderInfo, info: &DataSetInfo, metadata: Metadata) -> Self {
        Self {
            provider,
            data_set_id: Some(info.data_set_id),
            client_data_set_id: Some(info.client_data_set_id),
            is_existing: true,
            metadata,
        }
    }
}

/// A provider picked by selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedProvider {
    pub provider: ProviderInfo,
    /// Matching data set to reuse, if any
    pub data_set_id: Option<DataSetId>,
    pub endorsed: bool,
}

/// One page of a cursor-paginated listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page, `None` when exhausted
    pub next_cursor: Option<usize>,
}

/// Active piece in a data set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceEntry {
    pub piece_id: PieceId,
    pub piece_cid: PieceCid,
}

/// Piece and its per-piece metadata, as signed for an addition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceToAdd {
    pub piece_cid: PieceCid,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PieceToAdd {
    pub fn new(piece_cid: PieceCid) -> Self {
        Self {
            piece_cid,
            metadata: Metadata::new(),
        }
    }
}

/// Slice of a data set's active pieces
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivePieces {
    pub pieces: Vec<PieceEntry>,
    pub has_more: bool,
}

/// On-chain transaction receipt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub success: bool,
    pub block_number: u64,
}

/// Piece parked on a provider, not yet committed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredPiece {
    pub piece_cid: PieceCid,
    pub size: u64,
    pub provider_id: ProviderId,
}

/// Outcome of a direct commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub tx_hash: TxHash,
    pub data_set_id: DataSetId,
    /// In request order
    pub piece_ids: Vec<PieceId>,
    pub is_new_data_set: bool,
}

/// Outcome of a single-context upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    pub piece_cid: PieceCid,
    pub size: u64,
    pub piece_id: PieceId,
    pub data_set_id: DataSetId,
}

/// Presence of a piece on a context's provider and data set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceStatus {
    pub exists: bool,
    pub piece_id: Option<PieceId>,
    pub data_set_id: Option<DataSetId>,
    pub retrieval_url: Option<String>,
}

/// Cost and feasibility of an upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreflightInfo {
    pub size_ok: bool,
    /// Token base units per day for storing `size` bytes
    pub estimated_cost_per_day: u128,
    pub data_set_exists: bool,
}

/// Address a piece by id or by content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceRef {
    Id(PieceId),
    Cid(PieceCid),
}

impl From<PieceId> for PieceRef {
    fn from(id: PieceId) -> Self {
        PieceRef::Id(id)
    }
}

impl From<PieceCid> for PieceRef {
    fn from(cid: PieceCid) -> Self {
        PieceRef::Cid(cid)
    }
}

/// Role of a provider in a multi-copy upload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyRole {
    Primary,
    Secondary,
}

/// A committed copy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyResult {
    pub provider_id: ProviderId,
    pub data_set_id: DataSetId,
    pub piece_id: PieceId,
    pub role: CopyRole,
    pub retrieval_url: String,
    pub is_new_data_set: bool,
}

/// A provider that did not end up holding a committed copy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyFailure {
    pub provider_id: ProviderId,
    pub role: CopyRole,
    pub reason: String,
    /// Provider was pinned by the caller
    pub explicit: bool,
}

/// Outcome of a multi-copy upload
///
/// `failures` can be non-empty even when the call succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiCopyResult {
    pub piece_cid: PieceCid,
    pub size: u64,
    pub copies: Vec<CopyResult>,
    pub failures: Vec<CopyFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_metadata_match_is_exact() {
        let requested = meta(&[("app", "photos")]);
        assert!(metadata_matches(&meta(&[("app", "photos")]), &requested));
        assert!(!metadata_matches(&meta(&[("app", "videos")]), &requested));
        assert!(!metadata_matches(
            &meta(&[("app", "photos"), (METADATA_WITH_CDN, "")]),
            &requested
        ));
        assert!(!metadata_matches(&Metadata::new(), &requested));
    }

    #[test]
    fn test_data_set_flags() {
        let mut info = DataSetInfo {
            data_set_id: 4,
            pdp_rail_id: 9,
            cdn_rail_id: 0,
            payer: "0xabc".into(),
            payee: "0xdef".into(),
            provider_id: 1,
            client_data_set_id: 0,
            pdp_end_epoch: 0,
            record_keeper: "0xkeeper".into(),
        };
        assert!(info.is_live());
        assert!(!info.is_terminated());
        assert!(!info.with_cdn());

        info.pdp_end_epoch = 100;
        info.pdp_rail_id = 0;
        assert!(info.is_terminated());
        assert!(!info.is_live());
    }

    #[test]
    fn test_address_comparison() {
        assert!(same_address("0xABCdef", "0xabcDEF"));
        assert!(!same_address("0xabc", "0xabd"));
    }
}
