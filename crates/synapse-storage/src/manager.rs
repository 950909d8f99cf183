//! Storage manager: multi-copy uploads and SP-agnostic downloads
//!
//! An upload stores on a primary provider, has secondaries pull from it
//! using authorizations signed up front, then commits every copy in
//! parallel. Failed secondaries are replaced from the approved pool unless
//! the caller pinned providers.

use crate::cache::DefaultContextCache;
use crate::chain::Services;
use crate::context::{terminate_data_set, StorageContext};
use crate::options::{
    resolve_effective_options, DownloadOptions, EffectiveOptions, ManagerUploadOptions,
    StorageOptions,
};
use crate::resolution::Resolver;
use crate::retriever::{
    ChainRetriever, PieceRetriever, ProvidersRetriever, RetrievalOptions, RetrieverChain,
};
use crate::types::{
    CopyFailure, CopyResult, CopyRole, DataSetId, EnhancedDataSet, MultiCopyResult, PieceToAdd,
    ProviderId, TxHash,
};
use crate::{Result, StorageError};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use synapse_piece::{validate_upload_size, PieceCid};
use synapse_sp::ExtraData;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Shared bookkeeping of one multi-copy upload
struct Fanout<'a> {
    options: &'a EffectiveOptions,
    /// Providers used or ruled out so far
    tried: Mutex<BTreeSet<ProviderId>>,
    failures: Mutex<Vec<CopyFailure>>,
}

impl Fanout<'_> {
    fn fail(&self, provider_id: ProviderId, role: CopyRole, explicit: bool, reason: String) {
        self.failures.lock().push(CopyFailure {
            provider_id,
            role,
            reason,
            explicit,
        });
    }
}

/// Entry point for uploads and downloads across providers
pub struct StorageManager {
    services: Services,
    defaults: StorageOptions,
    cache: DefaultContextCache,
    cdn: Option<Arc<dyn PieceRetriever>>,
}

impl StorageManager {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            defaults: StorageOptions::default(),
            cache: DefaultContextCache::new(),
            cdn: None,
        }
    }

    /// Set manager-level option defaults
    pub fn with_defaults(mut self, defaults: StorageOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Retriever tried first when a download asks for CDN
    pub fn with_cdn_retriever(mut self, retriever: Arc<dyn PieceRetriever>) -> Self {
        self.cdn = Some(retriever);
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn defaults(&self) -> &StorageOptions {
        &self.defaults
    }

    /// Resolve one context; default requests are not cached here
    pub async fn create_context(&self, options: &StorageOptions) -> Result<StorageContext> {
        let mut effective = resolve_effective_options(options, &self.defaults);
        effective.count = 1;
        StorageContext::create(&self.services, &effective).await
    }

    /// Resolve contexts on distinct providers
    pub async fn create_contexts(&self, options: &StorageOptions) -> Result<Vec<StorageContext>> {
        let effective = resolve_effective_options(options, &self.defaults);
        self.contexts_for(&effective).await
    }

    /// Contexts for `effective`, served from the default cache when possible
    async fn contexts_for(&self, effective: &EffectiveOptions) -> Result<Vec<StorageContext>> {
        let fingerprint = effective.fingerprint();
        if let Some(fingerprint) = &fingerprint {
            if let Some(contexts) = self.cache.get(fingerprint) {
                debug!(contexts = contexts.len(), "reusing default contexts");
                return Ok(contexts);
            }
        }

        let contexts = StorageContext::create_many(&self.services, effective).await?;
        if contexts.is_empty() {
            return Err(StorageError::NoProvidersAvailable(
                "no provider could be resolved".to_string(),
            ));
        }
        if let Some(fingerprint) = fingerprint {
            self.cache.put(fingerprint, contexts.clone());
        }
        Ok(contexts)
    }

    /// Drop cached default contexts
    pub fn invalidate_default_contexts(&self) {
        self.cache.invalidate();
    }

    /// Store one piece on several providers
    ///
    /// Succeeds when at least one copy is committed; the rest are listed in
    /// `failures`.
    #[instrument(skip(self, data, options), fields(size = data.len()))]
    pub async fn upload(&self, data: Bytes, options: ManagerUploadOptions) -> Result<MultiCopyResult> {
        let size = data.len() as u64;
        validate_upload_size(size)?;

        let effective = resolve_effective_options(&options.storage, &self.defaults);
        let contexts = self.contexts_for(&effective).await?;
        let Some((primary, secondaries)) = contexts.split_first() else {
            return Err(StorageError::NoProvidersAvailable(
                "no provider could be resolved".to_string(),
            ));
        };

        let stored = primary
            .store(data, options.store.clone())
            .await
            .map_err(|e| match e {
                StorageError::Aborted => StorageError::Aborted,
                e => StorageError::Store {
                    provider_id: primary.provider().id,
                    endpoint: primary.service_url().to_string(),
                    reason: e.to_string(),
                },
            })?;
        info!(piece_cid = %stored.piece_cid, provider_id = primary.provider().id, "stored on primary");

        let pieces = vec![PieceToAdd {
            piece_cid: stored.piece_cid,
            metadata: options.piece_metadata.clone(),
        }];
        // Caller-named slots lead the context list
        let pinned = effective.explicit_slots();
        let fanout = Fanout {
            options: &effective,
            tried: Mutex::new(
                contexts
                    .iter()
                    .map(|c| c.provider().id)
                    .chain(effective.exclude_provider_ids.iter().copied())
                    .collect(),
            ),
            failures: Mutex::new(Vec::new()),
        };
        let cancel = options.store.cancel.as_ref();

        let pulled = join_all(secondaries.iter().enumerate().map(|(i, slot)| {
            let explicit = i + 1 < pinned;
            let fanout = &fanout;
            let pieces = &pieces;
            async move {
                self.replicate(slot.clone(), explicit, primary, pieces, fanout, cancel)
                    .await
                    .map(|(context, extra)| (context, explicit, extra))
            }
        }))
        .await;

        let mut jobs: Vec<(StorageContext, CopyRole, bool, Option<ExtraData>)> =
            vec![(primary.clone(), CopyRole::Primary, pinned > 0, None)];
        jobs.extend(
            pulled
                .into_iter()
                .flatten()
                .map(|(context, explicit, extra)| (context, CopyRole::Secondary, explicit, Some(extra))),
        );

        let commits = join_all(jobs.into_iter().map(|(context, role, explicit, extra)| {
            let pieces = &pieces;
            async move {
                let outcome = context.commit(pieces, extra).await;
                (context, role, explicit, outcome)
            }
        }))
        .await;

        let mut copies = Vec::new();
        for (context, role, explicit, outcome) in commits {
            let provider_id = context.provider().id;
            match outcome {
                Ok(commit) => match commit.piece_ids.first() {
                    Some(&piece_id) => {
                        info!(provider_id, data_set_id = commit.data_set_id, piece_id, ?role, "copy committed");
                        copies.push(CopyResult {
                            provider_id,
                            data_set_id: commit.data_set_id,
                            piece_id,
                            role,
                            retrieval_url: context.piece_url(&stored.piece_cid),
                            is_new_data_set: commit.is_new_data_set,
                        });
                    }
                    None => fanout.fail(
                        provider_id,
                        role,
                        explicit,
                        format!("piece not confirmed in data set {}", commit.data_set_id),
                    ),
                },
                Err(e) => {
                    warn!(provider_id, ?role, error = %e, "commit failed");
                    fanout.fail(provider_id, role, explicit, e.to_string());
                }
            }
        }

        let failures = fanout.failures.into_inner();
        if copies.is_empty() {
            return Err(StorageError::Commit { failures });
        }
        Ok(MultiCopyResult {
            piece_cid: stored.piece_cid,
            size,
            copies,
            failures,
        })
    }

    /// Get a copy onto `slot`, replacing it from the pool on failure
    ///
    /// Caller-named slots get a single attempt.
    async fn replicate(
        &self,
        mut slot: StorageContext,
        explicit: bool,
        primary: &StorageContext,
        pieces: &[PieceToAdd],
        fanout: &Fanout<'_>,
        cancel: Option<&CancellationToken>,
    ) -> Option<(StorageContext, ExtraData)> {
        let attempts = if explicit {
            1
        } else {
            self.services.settings.max_replacement_attempts.max(1)
        };

        for attempt in 1..=attempts {
            let provider_id = slot.provider().id;
            match Self::pull_to(&slot, primary, pieces, cancel).await {
                Ok(extra) => {
                    debug!(provider_id, attempt, "secondary pulled piece");
                    return Some((slot, extra));
                }
                Err(e) => {
                    warn!(provider_id, attempt, error = %e, "secondary pull failed");
                    let aborted = matches!(e, StorageError::Aborted);
                    fanout.fail(provider_id, CopyRole::Secondary, explicit, e.to_string());
                    if aborted || attempt == attempts {
                        return None;
                    }
                    slot = self.replacement(fanout).await?;
                }
            }
        }
        None
    }

    async fn pull_to(
        slot: &StorageContext,
        primary: &StorageContext,
        pieces: &[PieceToAdd],
        cancel: Option<&CancellationToken>,
    ) -> Result<ExtraData> {
        let extra = slot.presign_for_commit(pieces).await?;
        let cids: Vec<PieceCid> = pieces.iter().map(|p| p.piece_cid).collect();
        slot.pull(&cids, primary, &extra, cancel).await?;
        Ok(extra)
    }

    /// A healthy provider not yet used by this upload
    async fn replacement(&self, fanout: &Fanout<'_>) -> Option<StorageContext> {
        let resolver = Resolver::new(&self.services);
        loop {
            let excluded = fanout.tried.lock().clone();
            let picked = match resolver.select_healthy(fanout.options, &excluded, 1, false).await {
                Ok(mut picked) if !picked.is_empty() => picked.swap_remove(0),
                Ok(_) => {
                    debug!("no replacement provider left");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "replacement selection failed");
                    return None;
                }
            };
            // Another slot may have claimed it while we were pinging
            if !fanout.tried.lock().insert(picked.provider.id) {
                continue;
            }
            debug!(provider_id = picked.provider.id, "replacing secondary");
            match StorageContext::from_resolution(self.services.clone(), picked) {
                Ok(context) => return Some(context),
                Err(e) => {
                    warn!(error = %e, "cannot connect to replacement");
                    continue;
                }
            }
        }
    }

    /// Fetch a piece from wherever it can be found
    #[instrument(skip(self, options), fields(piece_cid = %options.piece_cid))]
    pub async fn download(&self, options: DownloadOptions) -> Result<Bytes> {
        let piece_cid = options.piece_cid;
        let with_cdn = options.with_cdn.or(self.defaults.with_cdn).unwrap_or(false);

        if !with_cdn && options.provider_address.is_none() {
            if let Some(bytes) = self.download_from_defaults(&piece_cid).await {
                return Ok(bytes);
            }
        }

        let retrieval = RetrievalOptions {
            with_cdn,
            provider_address: options.provider_address.clone(),
        };
        self.retrievers(with_cdn)
            .fetch_piece(&self.services.payer(), &piece_cid, &retrieval)
            .await
    }

    /// Fast path over cached default contexts
    async fn download_from_defaults(&self, piece_cid: &PieceCid) -> Option<Bytes> {
        let contexts = self.cache.current()?;
        let probes = join_all(contexts.iter().map(|c| c.has_piece(piece_cid))).await;
        let holders: Vec<&StorageContext> = contexts
            .iter()
            .zip(probes)
            .filter(|(_, held)| matches!(held, Ok(true)))
            .map(|(context, _)| context)
            .collect();
        let chosen = (*holders.choose(&mut rand::thread_rng())?).clone();

        match chosen.download(piece_cid).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(provider_id = chosen.provider().id, error = %e, "default context download failed");
                None
            }
        }
    }

    fn retrievers(&self, with_cdn: bool) -> RetrieverChain {
        let mut chain = RetrieverChain::default();
        if with_cdn {
            if let Some(cdn) = &self.cdn {
                chain.push(Arc::clone(cdn));
            }
        }
        chain.push(Arc::new(ChainRetriever::new(
            self.services.chain.clone(),
            self.services.connector.clone(),
        )));
        if let Some(contexts) = self.cache.current() {
            let known = contexts.iter().map(|c| c.provider().clone()).collect();
            chain.push(Arc::new(ProvidersRetriever::new(
                known,
                self.services.connector.clone(),
            )));
        }
        chain
    }

    /// Data sets paid for by `payer`, or by this client when `None`
    pub async fn find_data_sets(&self, payer: Option<&str>) -> Result<Vec<EnhancedDataSet>> {
        let payer = payer.map_or_else(|| self.services.payer(), str::to_string);
        Resolver::new(&self.services).find_data_sets(&payer).await
    }

    /// Terminate a data set owned by this client
    #[instrument(skip(self))]
    pub async fn terminate_data_set(&self, data_set_id: DataSetId) -> Result<TxHash> {
        let info = self
            .services
            .chain
            .data_set(data_set_id)
            .await?
            .ok_or(StorageError::DataSetNotFound(data_set_id))?;
        let payer = self.services.payer();
        if !crate::types::same_address(&info.payer, &payer) {
            return Err(StorageError::NotOwner {
                data_set_id,
                owner: info.payer,
                caller: payer,
            });
        }

        let tx_hash = terminate_data_set(&self.services, data_set_id).await?;
        let cached = self
            .cache
            .current()
            .is_some_and(|contexts| contexts.iter().any(|c| c.data_set_id() == Some(data_set_id)));
        if cached {
            self.invalidate_default_contexts();
        }
        Ok(tx_hash)
    }
}
