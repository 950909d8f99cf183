//! Provider registry queries and pagination

use crate::chain::ChainAccess;
use crate::types::{Page, ProviderId, ProviderInfo};
use crate::{Result, StorageError};
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tracing::instrument;

/// Capabilities a provider must offer to be considered
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderRequirements {
    /// Provider must announce pieces to IPNI
    pub with_ipni: bool,
    /// Capability keys the provider must advertise
    pub capabilities: Vec<String>,
    /// Piece size that must fit the provider's bounds
    pub piece_size: Option<u64>,
}

impl ProviderRequirements {
    pub fn is_met_by(&self, provider: &ProviderInfo) -> bool {
        let pdp = &provider.pdp;
        if self.with_ipni && !pdp.ipni_piece {
            return false;
        }
        if !self
            .capabilities
            .iter()
            .all(|key| pdp.capabilities.contains_key(key))
        {
            return false;
        }
        match self.piece_size {
            Some(size) => size >= pdp.min_piece_size && size <= pdp.max_piece_size,
            None => true,
        }
    }
}

/// Keep only providers meeting `requirements`, preserving order
pub fn filter_by_requirements(
    providers: Vec<ProviderInfo>,
    requirements: &ProviderRequirements,
) -> Vec<ProviderInfo> {
    providers
        .into_iter()
        .filter(|p| requirements.is_met_by(p))
        .collect()
}

/// Read access to approved providers
#[derive(Clone)]
pub struct ProviderRegistry {
    chain: Arc<dyn ChainAccess>,
}

impl ProviderRegistry {
    pub fn new(chain: Arc<dyn ChainAccess>) -> Self {
        Self { chain }
    }

    /// All approved, active providers in registry order
    #[instrument(skip(self))]
    pub async fn approved_providers(&self) -> Result<Vec<ProviderInfo>> {
        let ids = self.chain.approved_provider_ids().await?;
        self.providers_by_ids(&ids).await
    }

    /// Look up one provider
    pub async fn provider(&self, id: ProviderId) -> Result<ProviderInfo> {
        self.chain
            .provider(id)
            .await?
            .ok_or_else(|| StorageError::ProviderNotFound(id.to_string()))
    }

    /// Look up a provider by its service provider address
    pub async fn provider_by_address(&self, address: &str) -> Result<ProviderInfo> {
        self.chain
            .provider_by_address(address)
            .await?
            .ok_or_else(|| StorageError::ProviderNotFound(address.to_string()))
    }

    /// Batched lookup; missing and inactive entries are dropped
    pub async fn providers_by_ids(&self, ids: &[ProviderId]) -> Result<Vec<ProviderInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .chain
            .providers_by_ids(ids)
            .await?
            .into_iter()
            .flatten()
            .filter(|p| p.active)
            .collect())
    }

    /// Endorsed provider ids
    pub async fn endorsed_ids(&self) -> Result<Vec<ProviderId>> {
        self.chain.endorsed_provider_ids().await
    }

    /// One page of approved providers starting at `cursor`
    pub async fn providers_page(&self, cursor: usize, limit: usize) -> Result<Page<ProviderInfo>> {
        let limit = limit.max(1);
        let ids = self.chain.approved_provider_ids().await?;
        let end = ids.len().min(cursor.saturating_add(limit));
        let window = ids.get(cursor..end).unwrap_or(&[]);
        let items = self.providers_by_ids(window).await?;
        let next_cursor = (end < ids.len()).then_some(end);
        Ok(Page { items, next_cursor })
    }

    /// Lazily walk approved providers page by page
    pub fn provider_stream(&self, limit: usize) -> impl Stream<Item = Result<ProviderInfo>> + '_ {
        self.provider_stream_from(0, limit)
    }

    /// Same as [`provider_stream`](Self::provider_stream), resuming at `cursor`
    pub fn provider_stream_from(
        &self,
        cursor: usize,
        limit: usize,
    ) -> impl Stream<Item = Result<ProviderInfo>> + '_ {
        paginate(cursor, move |cursor| self.providers_page(cursor, limit))
    }
}

/// Turn a fetch-page function into a flat stream of items
///
/// The stream ends after the page without a next cursor, or after the
/// first error.
pub(crate) fn paginate<'a, T, F, Fut>(start: usize, fetch: F) -> impl Stream<Item = Result<T>> + 'a
where
    T: 'a,
    F: Fn(usize) -> Fut + 'a,
    Fut: std::future::Future<Output = Result<Page<T>>> + 'a,
{
    stream::unfold(Some(start), move |cursor| {
        let next = cursor.map(&fetch);
        async move {
            let page = next?.await;
            Some(match page {
                Ok(page) => (
                    stream::iter(page.items.into_iter().map(Ok)).left_stream(),
                    page.next_cursor,
                ),
                Err(e) => (stream::iter(vec![Err(e)]).right_stream(), None),
            })
        }
    })
    .flatten()
}
