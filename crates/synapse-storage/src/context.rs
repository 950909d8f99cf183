//! Storage context: one provider, at most one data set
//!
//! A context is cheap to clone; clones share the data set binding and the
//! upload batch queue. The data set id is adopted from the first commit
//! when the context was resolved without one.

use crate::batch::{settle, BatchQueue, PendingPiece};
use crate::chain::Services;
use crate::options::{EffectiveOptions, StoreOptions, UploadOptions};
use crate::registry::paginate;
use crate::resolution::Resolver;
use crate::types::{
    CommitResult, DataSetId, Metadata, Page, PieceEntry, PieceId, PieceRef, PieceStatus,
    PieceToAdd, PreflightInfo, ProviderInfo, ResolutionResult, StoredPiece, TxHash, UploadResult,
    METADATA_WITH_CDN,
};
use crate::{Result, StorageError};
use bytes::Bytes;
use futures::stream::{Stream, TryStreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use synapse_piece::{validate_upload_size, PieceCid};
use synapse_sp::{ExtraData, ProviderClient, PullPiece, PullRequest, PullStatus};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Bytes in a tebibyte, the unit providers price storage in
const TIB: u128 = 1 << 40;

/// Page size used when scanning a data set for a piece
const SCAN_PAGE: usize = 100;

#[derive(Clone, Copy, Debug, Default)]
struct DataSetBinding {
    data_set_id: Option<DataSetId>,
    client_data_set_id: Option<u64>,
}

struct ContextInner {
    services: Services,
    provider: ProviderInfo,
    client: Arc<dyn ProviderClient>,
    metadata: Metadata,
    binding: Mutex<DataSetBinding>,
    /// Held across a whole commit so only one can create the data set
    commit_gate: tokio::sync::Mutex<()>,
    /// Create-and-add authorizations handed out and not yet committed
    creation_grants: Mutex<HashSet<ExtraData>>,
    batch: Arc<BatchQueue>,
}

/// Handle binding one provider to one data set
#[derive(Clone)]
pub struct StorageContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("provider_id", &self.inner.provider.id)
            .field("data_set_id", &self.data_set_id())
            .field("with_cdn", &self.with_cdn())
            .finish()
    }
}

impl StorageContext {
    /// Build a context from a resolved pairing
    pub fn from_resolution(services: Services, resolution: ResolutionResult) -> Result<Self> {
        let client = services.connector.connect(&resolution.provider)?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                services,
                provider: resolution.provider,
                client,
                metadata: resolution.metadata,
                binding: Mutex::new(DataSetBinding {
                    data_set_id: resolution.data_set_id,
                    client_data_set_id: resolution.client_data_set_id,
                }),
                commit_gate: tokio::sync::Mutex::new(()),
                creation_grants: Mutex::new(HashSet::new()),
                batch: Arc::new(BatchQueue::default()),
            }),
        })
    }

    /// Resolve and build one context
    pub async fn create(services: &Services, options: &EffectiveOptions) -> Result<Self> {
        let resolution = Resolver::new(services).resolve(options).await?;
        Self::from_resolution(services.clone(), resolution)
    }

    /// Resolve and build up to `options.count` contexts on distinct providers
    pub async fn create_many(services: &Services, options: &EffectiveOptions) -> Result<Vec<Self>> {
        Resolver::new(services)
            .resolve_many(options)
            .await?
            .into_iter()
            .map(|resolution| Self::from_resolution(services.clone(), resolution))
            .collect()
    }

    pub fn provider(&self) -> &ProviderInfo {
        &self.inner.provider
    }

    /// `None` until the first commit creates the data set
    pub fn data_set_id(&self) -> Option<DataSetId> {
        self.inner.binding.lock().data_set_id
    }

    pub fn with_cdn(&self) -> bool {
        self.inner.metadata.contains_key(METADATA_WITH_CDN)
    }

    /// Data set metadata, applied when the data set is created
    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub fn service_url(&self) -> &str {
        self.inner.client.service_url()
    }

    /// Public retrieval URL of a piece on this provider
    pub fn piece_url(&self, piece_cid: &PieceCid) -> String {
        self.inner.client.piece_url(piece_cid)
    }

    /// Transfer bytes to the provider and wait until they are parked
    ///
    /// Nothing is recorded on-chain; see [`commit`](Self::commit).
    #[instrument(skip(self, data, options), fields(provider_id = self.inner.provider.id, size = data.len()))]
    pub async fn store(&self, data: Bytes, options: StoreOptions) -> Result<StoredPiece> {
        let size = data.len() as u64;
        validate_upload_size(size)?;
        let piece_cid = match options.piece_cid {
            Some(cid) => cid,
            None => synapse_piece::calculate(&data),
        };
        let cancel = options.cancel.as_ref();

        let uploaded = self.inner.client.upload_piece(data, &piece_cid, cancel).await?;
        if uploaded.already_present {
            debug!(piece_cid = %piece_cid, "provider already holds piece");
        }
        self.inner
            .client
            .wait_for_piece(&piece_cid, &self.inner.services.settings.park_policy(), cancel)
            .await?;

        let stored = StoredPiece {
            piece_cid,
            size,
            provider_id: self.inner.provider.id,
        };
        if let Some(on_stored) = &options.on_stored {
            on_stored(&stored);
        }
        debug!(piece_cid = %piece_cid, "piece parked");
        Ok(stored)
    }

    /// Sign the next commit of `pieces` to this context
    ///
    /// The result can be handed to a pull and then to [`commit`](Self::commit)
    /// so both carry the same authorization. A create-and-add authorization
    /// is re-signed at commit time if another commit created the data set
    /// in between.
    pub async fn presign_for_commit(&self, pieces: &[PieceToAdd]) -> Result<ExtraData> {
        let signer = &self.inner.services.signer;
        let nonce: u64 = rand::random();
        let binding = *self.inner.binding.lock();
        let client_data_set_id = self.client_data_set_id().await?;

        match binding.data_set_id {
            Some(_) => signer.sign_add_pieces(client_data_set_id, nonce, pieces).await,
            None => {
                let extra = signer
                    .sign_create_and_add(
                        client_data_set_id,
                        &self.inner.provider.payee,
                        &self.inner.metadata,
                        nonce,
                        pieces,
                    )
                    .await?;
                self.inner.creation_grants.lock().insert(extra.clone());
                Ok(extra)
            }
        }
    }

    /// Client nonce of the bound data set, allocated once for a new one
    async fn client_data_set_id(&self) -> Result<u64> {
        let known = self.inner.binding.lock().client_data_set_id;
        if let Some(id) = known {
            return Ok(id);
        }
        let fresh = self
            .inner
            .services
            .chain
            .next_client_data_set_id(self.inner.signer_address())
            .await?;
        let mut binding = self.inner.binding.lock();
        Ok(*binding.client_data_set_id.get_or_insert(fresh))
    }

    /// Ask this provider to fetch `pieces` from `source`
    #[instrument(skip(self, pieces, source, extra_data, cancel), fields(provider_id = self.inner.provider.id, source_id = source.provider().id))]
    pub async fn pull(
        &self,
        pieces: &[PieceCid],
        source: &StorageContext,
        extra_data: &ExtraData,
        cancel: Option<&CancellationToken>,
    ) -> Result<PullStatus> {
        let request = PullRequest {
            record_keeper: self.inner.services.chain.record_keeper().to_string(),
            extra_data: extra_data.clone(),
            data_set_id: self.data_set_id(),
            pieces: pieces
                .iter()
                .map(|cid| PullPiece {
                    piece_cid: *cid,
                    source_url: source.piece_url(cid),
                })
                .collect(),
        };
        let status = self
            .inner
            .client
            .wait_for_pull(&request, &self.inner.services.settings.pull_policy(), cancel)
            .await?;
        debug!(pieces = pieces.len(), "pull complete");
        Ok(status)
    }

    /// Record parked pieces in the data set, creating it if needed
    #[instrument(skip(self, pieces, extra_data), fields(provider_id = self.inner.provider.id, pieces = pieces.len()))]
    pub async fn commit(
        &self,
        pieces: &[PieceToAdd],
        extra_data: Option<ExtraData>,
    ) -> Result<CommitResult> {
        if pieces.is_empty() {
            return Err(StorageError::Validation("nothing to commit".to_string()));
        }
        let _gate = self.inner.commit_gate.lock().await;
        let data_set_id = self.data_set_id();

        let presigned = match extra_data {
            Some(extra) => {
                let for_creation = self.inner.creation_grants.lock().remove(&extra);
                if for_creation && data_set_id.is_some() {
                    debug!("data set created since presign, re-signing as add-pieces");
                    None
                } else {
                    Some(extra)
                }
            }
            None => None,
        };
        let extra_data = match presigned {
            Some(extra) => extra,
            None => {
                let extra = self.presign_for_commit(pieces).await?;
                self.inner.creation_grants.lock().remove(&extra);
                extra
            }
        };
        let cids: Vec<PieceCid> = pieces.iter().map(|p| p.piece_cid).collect();
        let client = &self.inner.client;

        match data_set_id {
            Some(data_set_id) => {
                let handle = client.add_pieces(data_set_id, &cids, &extra_data).await?;
                let added = client.wait_for_pieces_added(data_set_id, &handle.tx_hash).await?;
                Ok(CommitResult {
                    tx_hash: handle.tx_hash,
                    data_set_id,
                    piece_ids: added.piece_ids,
                    is_new_data_set: false,
                })
            }
            None => {
                let record_keeper = self.inner.services.chain.record_keeper();
                let handle = client
                    .create_and_add_pieces(record_keeper, &cids, &extra_data)
                    .await?;
                let created = client.wait_for_data_set_creation(&handle).await?;
                let added = client
                    .wait_for_pieces_added(created.data_set_id, &handle.tx_hash)
                    .await?;

                self.inner.binding.lock().data_set_id = Some(created.data_set_id);
                info!(data_set_id = created.data_set_id, "data set created");
                Ok(CommitResult {
                    tx_hash: handle.tx_hash,
                    data_set_id: created.data_set_id,
                    piece_ids: added.piece_ids,
                    is_new_data_set: true,
                })
            }
        }
    }

    /// Store then commit through the batch queue
    ///
    /// Concurrent uploads on the same context are coalesced into shared
    /// add-pieces calls of at most `upload_batch_size` pieces.
    #[instrument(skip(self, data, options), fields(provider_id = self.inner.provider.id, size = data.len()))]
    pub async fn upload(&self, data: Bytes, options: UploadOptions) -> Result<UploadResult> {
        validate_upload_size(data.len() as u64)?;

        let in_flight = self.inner.batch.begin_upload();
        let stored = self.store(data, options.store).await?;

        let (completion, done) = oneshot::channel();
        in_flight.enqueue(PendingPiece {
            piece: PieceToAdd {
                piece_cid: stored.piece_cid,
                metadata: options.piece_metadata,
            },
            size: stored.size,
            completion,
        });
        self.schedule_flush();

        match done.await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Aborted),
        }
    }

    fn schedule_flush(&self) {
        let context = self.clone();
        tokio::spawn(async move {
            // Let uploads that finished in the same tick join this batch
            tokio::task::yield_now().await;
            context.flush().await;
        });
    }

    async fn flush(&self) {
        let batch = &self.inner.batch;
        let settings = &self.inner.services.settings;
        loop {
            if !batch.try_begin_flush() {
                return;
            }
            batch
                .wait_for_in_flight(
                    settings.upload_batch_size,
                    settings.batch_wait_poll,
                    settings.batch_wait_max,
                )
                .await;

            let entries = batch.take(settings.upload_batch_size);
            if !entries.is_empty() {
                let pieces: Vec<PieceToAdd> = entries.iter().map(|e| e.piece.clone()).collect();
                debug!(pieces = pieces.len(), "committing batch");
                let outcome = self.commit(&pieces, None).await;
                if let Err(e) = &outcome {
                    warn!(error = %e, pieces = pieces.len(), "batch commit failed");
                }
                settle(entries, outcome);
            }

            if !batch.end_flush() {
                return;
            }
        }
    }

    /// Fetch and verify a piece from this provider
    #[instrument(skip(self), fields(provider_id = self.inner.provider.id))]
    pub async fn download(&self, piece_cid: &PieceCid) -> Result<Bytes> {
        let bytes = self.inner.client.download_piece(piece_cid).await?;
        if !synapse_piece::verify(&bytes, piece_cid) {
            return Err(StorageError::InvalidPiece(format!(
                "{} returned bytes that do not match {}",
                self.service_url(),
                piece_cid
            )));
        }
        Ok(bytes)
    }

    /// Whether the provider holds the piece
    pub async fn has_piece(&self, piece_cid: &PieceCid) -> Result<bool> {
        match self.inner.client.find_piece(piece_cid).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Presence and data set membership of a piece
    pub async fn piece_status(&self, piece_cid: &PieceCid) -> Result<PieceStatus> {
        let exists = self.has_piece(piece_cid).await?;
        let piece_id = self.find_piece_id(piece_cid).await?;
        Ok(PieceStatus {
            exists,
            piece_id,
            data_set_id: self.data_set_id(),
            retrieval_url: exists.then(|| self.piece_url(piece_cid)),
        })
    }

    async fn find_piece_id(&self, piece_cid: &PieceCid) -> Result<Option<PieceId>> {
        let pieces = self.pieces_stream(SCAN_PAGE);
        futures::pin_mut!(pieces);
        while let Some(entry) = pieces.try_next().await? {
            if entry.piece_cid == *piece_cid {
                return Ok(Some(entry.piece_id));
            }
        }
        Ok(None)
    }

    /// Schedule removal of a piece from the data set
    #[instrument(skip(self), fields(provider_id = self.inner.provider.id))]
    pub async fn delete_piece(&self, piece: PieceRef) -> Result<TxHash> {
        let data_set_id = self.data_set_id().ok_or_else(|| {
            StorageError::Validation("context has no data set to delete from".to_string())
        })?;
        let piece_id = match piece {
            PieceRef::Id(id) => id,
            PieceRef::Cid(cid) => self
                .find_piece_id(&cid)
                .await?
                .ok_or_else(|| StorageError::PieceNotFound(cid.to_string()))?,
        };
        let client_data_set_id = self.client_data_set_id().await?;
        let extra_data = self
            .inner
            .services
            .signer
            .sign_schedule_piece_removals(client_data_set_id, &[piece_id])
            .await?;
        let tx_hash = self
            .inner
            .client
            .delete_piece(data_set_id, piece_id, &extra_data)
            .await?;
        info!(data_set_id, piece_id, tx = %tx_hash, "piece removal scheduled");
        Ok(tx_hash)
    }

    /// One page of the data set's active pieces
    pub async fn pieces_page(&self, cursor: usize, limit: usize) -> Result<Page<PieceEntry>> {
        let Some(data_set_id) = self.data_set_id() else {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            });
        };
        let limit = limit.max(1);
        let active = self
            .inner
            .services
            .chain
            .active_pieces(data_set_id, cursor as u64, limit as u64)
            .await?;
        let next_cursor = active.has_more.then_some(cursor + active.pieces.len());
        Ok(Page {
            items: active.pieces,
            next_cursor,
        })
    }

    /// Lazily walk the data set's active pieces
    pub fn pieces_stream(&self, limit: usize) -> impl Stream<Item = Result<PieceEntry>> + '_ {
        paginate(0, move |cursor| self.pieces_page(cursor, limit))
    }

    /// Check an upload of `size` bytes against limits and pricing
    pub fn preflight(&self, size: u64) -> PreflightInfo {
        let pdp = &self.inner.provider.pdp;
        let size_ok = validate_upload_size(size).is_ok() && size <= pdp.max_piece_size;
        let cost = pdp.storage_price_per_tib_per_day.saturating_mul(u128::from(size));
        PreflightInfo {
            size_ok,
            estimated_cost_per_day: cost.div_ceil(TIB),
            data_set_exists: self.data_set_id().is_some(),
        }
    }

    /// Terminate the bound data set
    #[instrument(skip(self), fields(provider_id = self.inner.provider.id))]
    pub async fn terminate(&self) -> Result<TxHash> {
        let data_set_id = self.data_set_id().ok_or_else(|| {
            StorageError::Validation("context has no data set to terminate".to_string())
        })?;
        terminate_data_set(&self.inner.services, data_set_id).await
    }
}

impl ContextInner {
    fn signer_address(&self) -> &str {
        self.services.signer.address()
    }
}

/// Terminate a data set and wait for the receipt
pub(crate) async fn terminate_data_set(services: &Services, data_set_id: DataSetId) -> Result<TxHash> {
    let tx_hash = services.chain.terminate_data_set(data_set_id).await?;
    let receipt = services.chain.wait_for_receipt(&tx_hash).await?;
    if !receipt.success {
        return Err(StorageError::Chain(format!(
            "termination of data set {} reverted in {}",
            data_set_id, tx_hash
        )));
    }
    info!(data_set_id, tx = %tx_hash, "data set terminated");
    Ok(tx_hash)
}
