//! Choosing a (provider, data set) pairing for a context
//!
//! Priority: explicit data set id, then explicit provider, then smart
//! selection over the caller's data sets and the approved provider pool.

use crate::chain::Services;
use crate::options::EffectiveOptions;
use crate::registry::{filter_by_requirements, ProviderRegistry, ProviderRequirements};
use crate::selection::{select_providers, SelectionInput};
use crate::types::{
    metadata_matches, same_address, DataSetId, EnhancedDataSet, Metadata, ProviderId,
    ProviderInfo, ResolutionResult,
};
use crate::{Result, StorageError};
use futures::future::{join_all, try_join};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// Data sets scanned per round when matching against one provider
pub fn scan_batch_size(total: usize) -> usize {
    (total / 3).clamp(50, 200)
}

/// Smart-selection preference: data sets holding pieces first, then oldest
fn reuse_order(data_sets: &mut [EnhancedDataSet]) {
    data_sets.sort_by_key(|ds| (ds.active_piece_count == 0, ds.data_set_id()));
}

fn all_unhealthy(total: usize) -> StorageError {
    StorageError::NoProvidersAvailable(format!("All {} providers failed health check", total))
}

/// Resolves contexts against chain state
pub struct Resolver<'a> {
    services: &'a Services,
    registry: ProviderRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(services: &'a Services) -> Self {
        Self {
            services,
            registry: ProviderRegistry::new(services.chain.clone()),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Caller's data sets with metadata, piece counts and management flag
    #[instrument(skip(self))]
    pub async fn find_data_sets(&self, payer: &str) -> Result<Vec<EnhancedDataSet>> {
        let chain = &self.services.chain;
        let record_keeper = chain.record_keeper().to_string();
        let data_sets = chain.client_data_sets(payer).await?;

        let details = join_all(data_sets.iter().map(|ds| {
            try_join(
                chain.data_set_metadata(ds.data_set_id),
                chain.active_piece_count(ds.data_set_id),
            )
        }))
        .await;

        data_sets
            .into_iter()
            .zip(details)
            .map(|(info, detail)| {
                let (metadata, active_piece_count) = detail?;
                let is_managed = same_address(&info.record_keeper, &record_keeper);
                Ok(EnhancedDataSet {
                    info,
                    metadata,
                    active_piece_count,
                    is_managed,
                })
            })
            .collect()
    }

    /// Resolve one context from effective options
    pub async fn resolve(&self, options: &EffectiveOptions) -> Result<ResolutionResult> {
        if let Some(&data_set_id) = options.data_set_ids.first() {
            return self
                .resolve_by_data_set(
                    data_set_id,
                    options.provider_ids.first().copied(),
                    options.provider_address.as_deref(),
                    options.cdn_requested,
                )
                .await;
        }

        let provider = match (options.provider_ids.first(), &options.provider_address) {
            (Some(&id), _) => Some(self.registry.provider(id).await?),
            (None, Some(address)) => Some(self.registry.provider_by_address(address).await?),
            (None, None) => None,
        };
        if let Some(provider) = provider {
            if let Some(address) = &options.provider_address {
                if !same_address(address, &provider.service_provider) {
                    return Err(StorageError::Validation(format!(
                        "provider {} has address {}, not {}",
                        provider.id, provider.service_provider, address
                    )));
                }
            }
            return self
                .resolve_by_provider(provider, &options.metadata, options.force_create_data_sets)
                .await;
        }

        self.resolve_smart(
            &options.metadata,
            &options.exclude_provider_ids,
            &options.requirements,
            options.force_create_data_sets,
        )
        .await
    }

    /// Use a caller-named data set, checking it against every explicit option
    #[instrument(skip(self))]
    pub async fn resolve_by_data_set(
        &self,
        data_set_id: DataSetId,
        provider_id: Option<ProviderId>,
        provider_address: Option<&str>,
        with_cdn: Option<bool>,
    ) -> Result<ResolutionResult> {
        let chain = &self.services.chain;
        let payer = self.services.payer();

        let info = match chain.data_set(data_set_id).await? {
            Some(info) if info.is_live() => info,
            _ => return Err(StorageError::DataSetNotFound(data_set_id)),
        };
        if !same_address(&info.payer, &payer) {
            return Err(StorageError::NotOwner {
                data_set_id,
                owner: info.payer,
                caller: payer,
            });
        }
        if info.is_terminated() {
            return Err(StorageError::DataSetTerminated(data_set_id));
        }
        if let Some(requested) = provider_id.filter(|id| *id != info.provider_id) {
            return Err(StorageError::ProviderMismatch {
                data_set_id,
                actual: info.provider_id.to_string(),
                requested: requested.to_string(),
            });
        }

        let provider = self.registry.provider(info.provider_id).await?;
        if let Some(address) = provider_address {
            if !same_address(address, &provider.service_provider) {
                return Err(StorageError::ProviderMismatch {
                    data_set_id,
                    actual: provider.service_provider,
                    requested: address.to_string(),
                });
            }
        }

        let metadata = chain.data_set_metadata(data_set_id).await?;
        let actual_cdn = info.with_cdn() || metadata.contains_key(crate::types::METADATA_WITH_CDN);
        if let Some(requested) = with_cdn.filter(|cdn| *cdn != actual_cdn) {
            return Err(StorageError::CdnMismatch {
                data_set_id,
                actual: actual_cdn,
                requested,
            });
        }

        debug!(provider_id = provider.id, "using explicit data set");
        Ok(ResolutionResult::existing(provider, &info, metadata))
    }

    /// Find the best data set of the caller on one provider
    ///
    /// Oldest non-empty match wins; an empty match is kept as fallback.
    #[instrument(skip(self, provider, metadata), fields(provider_id = provider.id))]
    pub async fn resolve_by_provider(
        &self,
        provider: ProviderInfo,
        metadata: &Metadata,
        force_create: bool,
    ) -> Result<ResolutionResult> {
        if force_create {
            return Ok(ResolutionResult::new_data_set(provider, metadata.clone()));
        }

        let chain = &self.services.chain;
        let mut candidates: Vec<_> = chain
            .client_data_sets(&self.services.payer())
            .await?
            .into_iter()
            .filter(|ds| ds.provider_id == provider.id && ds.is_live() && !ds.is_terminated())
            .collect();
        candidates.sort_by_key(|ds| ds.data_set_id);

        let batch = scan_batch_size(candidates.len());
        let mut empty_match = None;
        for chunk in candidates.chunks(batch) {
            let checks = join_all(chunk.iter().map(|ds| {
                try_join(
                    chain.data_set_metadata(ds.data_set_id),
                    chain.active_piece_count(ds.data_set_id),
                )
            }))
            .await;

            for (info, check) in chunk.iter().zip(checks) {
                let (found, pieces) = check?;
                if !metadata_matches(&found, metadata) {
                    continue;
                }
                if pieces > 0 {
                    debug!(data_set_id = info.data_set_id, pieces, "reusing data set");
                    return Ok(ResolutionResult::existing(provider, info, found));
                }
                if empty_match.is_none() {
                    empty_match = Some((info.clone(), found));
                }
            }
        }

        Ok(match empty_match {
            Some((info, found)) => ResolutionResult::existing(provider, &info, found),
            None => ResolutionResult::new_data_set(provider, metadata.clone()),
        })
    }

    /// Pick a context without caller-named providers or data sets
    #[instrument(skip(self, metadata, requirements))]
    pub async fn resolve_smart(
        &self,
        metadata: &Metadata,
        excluded: &BTreeSet<ProviderId>,
        requirements: &ProviderRequirements,
        force_create: bool,
    ) -> Result<ResolutionResult> {
        let mut tried: BTreeSet<ProviderId> = BTreeSet::new();

        if !force_create {
            let mut reusable: Vec<EnhancedDataSet> = self
                .find_data_sets(&self.services.payer())
                .await?
                .into_iter()
                .filter(|ds| ds.is_reusable())
                .filter(|ds| !excluded.contains(&ds.provider_id()))
                .filter(|ds| metadata_matches(&ds.metadata, metadata))
                .collect();
            reuse_order(&mut reusable);

            for ds in &reusable {
                if !tried.insert(ds.provider_id()) {
                    continue;
                }
                let provider = match self.services.chain.provider(ds.provider_id()).await? {
                    Some(p) if p.active => p,
                    _ => continue,
                };
                if self.ping(&provider).await {
                    info!(provider_id = provider.id, data_set_id = ds.data_set_id(), "reusing data set");
                    return Ok(ResolutionResult::existing(provider, &ds.info, ds.metadata.clone()));
                }
            }
        }

        let approved = filter_by_requirements(self.registry.approved_providers().await?, requirements);
        let pool: Vec<ProviderInfo> = approved
            .into_iter()
            .filter(|p| !excluded.contains(&p.id) && !tried.contains(&p.id))
            .collect();
        if pool.is_empty() {
            return Err(StorageError::NoProvidersAvailable(
                "no approved providers match the requirements".to_string(),
            ));
        }

        let endorsed: BTreeSet<ProviderId> = self.registry.endorsed_ids().await?.into_iter().collect();
        let (mut preferred, mut others): (Vec<_>, Vec<_>) =
            pool.into_iter().partition(|p| endorsed.contains(&p.id));
        {
            let mut rng = rand::thread_rng();
            preferred.shuffle(&mut rng);
            others.shuffle(&mut rng);
        }

        let total = preferred.len() + others.len();
        for provider in preferred.into_iter().chain(others) {
            if self.ping(&provider).await {
                info!(provider_id = provider.id, "selected provider for new data set");
                return Ok(ResolutionResult::new_data_set(provider, metadata.clone()));
            }
        }
        Err(all_unhealthy(total))
    }

    /// Resolve up to `options.count` contexts on distinct providers
    ///
    /// Explicit data sets first, then explicit providers, then selection.
    /// Returns fewer than requested when the pool runs dry.
    #[instrument(skip(self, options), fields(count = options.count))]
    pub async fn resolve_many(&self, options: &EffectiveOptions) -> Result<Vec<ResolutionResult>> {
        let mut resolved: Vec<ResolutionResult> = Vec::new();
        let mut used: BTreeSet<ProviderId> = BTreeSet::new();

        let mut claim = |result: ResolutionResult, resolved: &mut Vec<ResolutionResult>| {
            if !used.insert(result.provider.id) {
                return Err(StorageError::Validation(format!(
                    "provider {} requested more than once",
                    result.provider.id
                )));
            }
            resolved.push(result);
            Ok(())
        };

        for &data_set_id in &options.data_set_ids {
            let result = self
                .resolve_by_data_set(data_set_id, None, None, options.cdn_requested)
                .await?;
            claim(result, &mut resolved)?;
        }

        let mut explicit_providers = Vec::new();
        for &id in &options.provider_ids {
            explicit_providers.push(self.registry.provider(id).await?);
        }
        if let Some(address) = &options.provider_address {
            explicit_providers.push(self.registry.provider_by_address(address).await?);
        }
        for provider in explicit_providers {
            let result = self
                .resolve_by_provider(provider, &options.metadata, options.force_create_data_sets)
                .await?;
            claim(result, &mut resolved)?;
        }

        if resolved.len() < options.count {
            let mut excluded = options.exclude_provider_ids.clone();
            excluded.extend(resolved.iter().map(|r| r.provider.id));
            let extra = self
                .select_healthy(options, &excluded, options.count - resolved.len(), resolved.is_empty())
                .await?;
            for result in extra {
                claim(result, &mut resolved)?;
            }
        }

        if resolved.is_empty() {
            let candidates =
                filter_by_requirements(self.registry.approved_providers().await?, &options.requirements)
                    .into_iter()
                    .filter(|p| !options.exclude_provider_ids.contains(&p.id))
                    .count();
            if candidates == 0 {
                return Err(StorageError::NoProvidersAvailable(
                    "no approved providers match the requirements".to_string(),
                ));
            }
            return Err(all_unhealthy(candidates));
        }
        Ok(resolved)
    }

    /// Fill `wanted` slots from the approved pool, pinging each pick
    ///
    /// With `primary` set and endorsed providers present, the first slot is
    /// restricted to endorsed providers.
    pub async fn select_healthy(
        &self,
        options: &EffectiveOptions,
        excluded: &BTreeSet<ProviderId>,
        wanted: usize,
        primary: bool,
    ) -> Result<Vec<ResolutionResult>> {
        let mut pool = filter_by_requirements(self.registry.approved_providers().await?, &options.requirements);
        pool.shuffle(&mut rand::thread_rng());

        let mut data_sets: Vec<EnhancedDataSet> = if options.force_create_data_sets {
            Vec::new()
        } else {
            self.find_data_sets(&self.services.payer())
                .await?
                .into_iter()
                .filter(|ds| ds.is_reusable())
                .collect()
        };
        reuse_order(&mut data_sets);

        let endorsed: BTreeSet<ProviderId> = if primary {
            self.registry.endorsed_ids().await?.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        let no_endorsement = BTreeSet::new();

        let mut excluded = excluded.clone();
        let mut results = Vec::new();
        while results.len() < wanted {
            let restrict = results.is_empty() && !endorsed.is_empty();
            let slots = if restrict { 1 } else { wanted - results.len() };
            let picks = select_providers(
                SelectionInput {
                    candidates: &pool,
                    data_sets: &data_sets,
                    endorsed: if restrict { &endorsed } else { &no_endorsement },
                    metadata: &options.metadata,
                    excluded: &excluded,
                },
                slots,
            );

            if picks.is_empty() {
                if restrict {
                    // No healthy endorsed provider; open the pool to everyone
                    warn!("no endorsed provider available, falling back to the full pool");
                    let widened = Box::pin(self.select_healthy(options, &excluded, wanted, false)).await?;
                    results.extend(widened);
                }
                break;
            }

            for pick in picks {
                excluded.insert(pick.provider.id);
                if !self.ping(&pick.provider).await {
                    continue;
                }
                let result = match pick.data_set_id {
                    Some(id) => match data_sets.iter().find(|ds| ds.data_set_id() == id) {
                        Some(ds) => ResolutionResult::existing(pick.provider, &ds.info, ds.metadata.clone()),
                        None => ResolutionResult::new_data_set(pick.provider, options.metadata.clone()),
                    },
                    None => ResolutionResult::new_data_set(pick.provider, options.metadata.clone()),
                };
                results.push(result);
            }
        }
        Ok(results)
    }

    async fn ping(&self, provider: &ProviderInfo) -> bool {
        let client = match self.services.connector.connect(provider) {
            Ok(client) => client,
            Err(e) => {
                warn!(provider_id = provider.id, error = %e, "cannot connect to provider");
                return false;
            }
        };
        match client.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(provider_id = provider.id, error = %e, "provider failed health check");
                false
            }
        }
    }
}
