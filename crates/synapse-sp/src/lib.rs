//! # Synapse SP
//!
//! Client for storage providers running a PDP (proof of data possession)
//! service.
//!
//! This crate provides:
//! - **ProviderClient**: the operations the SDK needs from a provider
//! - **PdpServer**: HTTP implementation of `ProviderClient`
//! - **RetryPolicy**: bounded retry and polling shared by all operations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Storage context / manager        │
//! ├─────────────────────────────────────────┤
//! │          ProviderClient trait           │
//! ├────────────────────┬────────────────────┤
//! │     PdpServer      │  in-memory fakes   │
//! ├────────────────────┴────────────────────┤
//! │        Provider HTTP endpoint           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use synapse_sp::{PdpServer, PdpServerConfig, ProviderClient};
//!
//! let server = PdpServer::new(PdpServerConfig::new("https://sp.example.com"))?;
//! server.ping().await?;
//! let piece = synapse_piece::calculate(&data);
//! server.upload_piece(data.into(), &piece, None).await?;
//! ```

pub mod error;
pub mod retry;
pub mod server;
pub mod types;

pub use error::{Result, SpError};
pub use retry::{poll_until, retry, retry_if, RetryPolicy};
pub use server::{PdpServer, PdpServerConfig};
pub use types::{
    AddPieceEntry, DataSetCreated, DataSetId, ExtraData, PieceId, PiecesAdded, PullPiece,
    PullPieceStatus, PullRequest, PullState, PullStatus, TxHandle, TxHash, UploadedPiece,
};

use async_trait::async_trait;
use bytes::Bytes;
use synapse_piece::PieceCid;
use tokio_util::sync::CancellationToken;

/// Operations offered by a storage provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Base URL of the provider's service
    fn service_url(&self) -> &str;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Submit a data-set creation
    async fn create_data_set(&self, record_keeper: &str, extra_data: &ExtraData)
        -> Result<TxHandle>;

    /// Submit a combined data-set creation and piece addition
    async fn create_and_add_pieces(
        &self,
        record_keeper: &str,
        pieces: &[PieceCid],
        extra_data: &ExtraData,
    ) -> Result<TxHandle>;

    /// Wait until a data-set creation is confirmed
    async fn wait_for_data_set_creation(&self, tx: &TxHandle) -> Result<DataSetCreated>;

    /// Submit a piece addition to an existing data set
    async fn add_pieces(
        &self,
        data_set_id: DataSetId,
        pieces: &[PieceCid],
        extra_data: &ExtraData,
    ) -> Result<TxHandle>;

    /// Wait until a piece addition is confirmed and piece ids are assigned
    async fn wait_for_pieces_added(
        &self,
        data_set_id: DataSetId,
        tx_hash: &TxHash,
    ) -> Result<PiecesAdded>;

    /// Transfer piece bytes to the provider
    async fn upload_piece(
        &self,
        data: Bytes,
        piece_cid: &PieceCid,
        cancel: Option<&CancellationToken>,
    ) -> Result<UploadedPiece>;

    /// Check whether the provider holds a parked piece
    async fn find_piece(&self, piece_cid: &PieceCid) -> Result<()>;

    /// Ask the provider to fetch pieces from another provider
    async fn pull_pieces(&self, request: &PullRequest) -> Result<PullStatus>;

    /// Fetch piece bytes
    async fn download_piece(&self, piece_cid: &PieceCid) -> Result<Bytes>;

    /// Submit a piece removal
    async fn delete_piece(
        &self,
        data_set_id: DataSetId,
        piece_id: PieceId,
        extra_data: &ExtraData,
    ) -> Result<TxHash>;

    /// Public retrieval URL for a piece
    fn piece_url(&self, piece_cid: &PieceCid) -> String {
        format!("{}/piece/{}", self.service_url().trim_end_matches('/'), piece_cid)
    }

    /// Poll `find_piece` until the provider reports the piece parked
    async fn wait_for_piece(
        &self,
        piece_cid: &PieceCid,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        poll_until(policy, "wait for piece", cancel, move || async move {
            match self.find_piece(piece_cid).await {
                Ok(()) => Ok(Some(())),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Re-send a pull request until it reaches a terminal state
    async fn wait_for_pull(
        &self,
        request: &PullRequest,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<PullStatus> {
        let status = poll_until(policy, "wait for pull", cancel, move || async move {
            let status = self.pull_pieces(request).await?;
            Ok(status.status.is_terminal().then_some(status))
        })
        .await?;

        if status.status == PullState::Failed {
            let failed: Vec<String> = status.failed_pieces().iter().map(|p| p.to_string()).collect();
            return Err(SpError::PullFailed(format!(
                "{} rejected pull of [{}]",
                self.service_url(),
                failed.join(", ")
            )));
        }
        Ok(status)
    }
}
