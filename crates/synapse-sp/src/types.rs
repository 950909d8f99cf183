//! Wire types exchanged with a storage provider

use serde::{Deserialize, Serialize};
use std::fmt;
use synapse_piece::PieceCid;

/// On-chain data set identifier
pub type DataSetId = u64;

/// Piece identifier assigned inside a data set
pub type PieceId = u64;

/// Signed authorization blob forwarded to the record-keeper contract
///
/// Always hex encoded with a `0x` prefix.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraData(String);

impl ExtraData {
    /// Encode raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    /// Decode back to raw bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(self.0.trim_start_matches("0x"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExtraData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.0.chars().take(18).collect();
        write!(f, "ExtraData({}..)", shown)
    }
}

/// Transaction hash as reported by the provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A submitted transaction and where to poll for its outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxHandle {
    pub tx_hash: TxHash,
    pub status_url: String,
}

/// Piece entry in an add-pieces request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPieceEntry {
    pub piece_cid: PieceCid,
    pub sub_pieces: Vec<SubPiece>,
}

impl AddPieceEntry {
    /// A piece made of itself as the only sub-piece
    pub fn single(piece_cid: PieceCid) -> Self {
        Self {
            piece_cid,
            sub_pieces: vec![SubPiece {
                sub_piece_cid: piece_cid,
            }],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubPiece {
    pub sub_piece_cid: PieceCid,
}

/// Confirmed data-set creation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSetCreated {
    pub data_set_id: DataSetId,
    pub tx_hash: TxHash,
}

/// Confirmed piece addition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PiecesAdded {
    pub data_set_id: DataSetId,
    pub tx_hash: TxHash,
    /// Server-assigned ids, in request order
    pub piece_ids: Vec<PieceId>,
}

/// Piece accepted by the provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedPiece {
    pub piece_cid: PieceCid,
    pub size: u64,
    /// Provider already held the piece
    pub already_present: bool,
}

/// A piece to pull and where to fetch it from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPiece {
    pub piece_cid: PieceCid,
    pub source_url: String,
}

/// Provider-to-provider pull request
///
/// Identical requests are idempotent on the provider side: re-sending the
/// same body reports progress instead of starting a second transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub record_keeper: String,
    pub extra_data: ExtraData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_set_id: Option<DataSetId>,
    pub pieces: Vec<PullPiece>,
}

/// Progress of a pull
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PullState {
    Pending,
    InProgress,
    Retrying,
    Complete,
    Failed,
}

impl PullState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPieceStatus {
    pub piece_cid: PieceCid,
    pub status: PullState,
}

/// Overall pull status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullStatus {
    pub status: PullState,
    #[serde(default)]
    pub pieces: Vec<PullPieceStatus>,
}

impl PullStatus {
    /// Pieces that did not complete
    pub fn failed_pieces(&self) -> Vec<PieceCid> {
        self.pieces
            .iter()
            .filter(|p| p.status == PullState::Failed)
            .map(|p| p.piece_cid)
            .collect()
    }
}

// ==================== HTTP bodies ====================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateDataSetBody<'a> {
    pub record_keeper: &'a str,
    pub extra_data: &'a ExtraData,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateAndAddBody<'a> {
    pub record_keeper: &'a str,
    pub pieces: Vec<AddPieceEntry>,
    pub extra_data: &'a ExtraData,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddPiecesBody<'a> {
    pub pieces: Vec<AddPieceEntry>,
    pub extra_data: &'a ExtraData,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExtraDataBody<'a> {
    pub extra_data: &'a ExtraData,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PieceUploadBody {
    pub piece_cid: PieceCid,
    pub size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FindPieceResponse {
    pub piece_cid: PieceCid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TxHashResponse {
    pub tx_hash: TxHash,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataSetCreationStatus {
    pub tx_status: String,
    #[serde(default)]
    pub data_set_created: bool,
    pub ok: Option<bool>,
    pub data_set_id: Option<DataSetId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PieceAdditionStatus {
    pub tx_status: String,
    pub add_message_ok: Option<bool>,
    pub confirmed_piece_ids: Option<Vec<PieceId>>,
}
