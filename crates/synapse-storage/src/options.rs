//! Layered option resolution
//!
//! Precedence: call options, then manager defaults, then built-in
//! defaults. Metadata maps merge key-wise with call keys winning and
//! exclusion sets are unioned.

use crate::registry::ProviderRequirements;
use crate::types::{Address, DataSetId, Metadata, ProviderId, METADATA_WITH_CDN};
use std::collections::BTreeSet;
use synapse_piece::PieceCid;
use tokio_util::sync::CancellationToken;

/// Built-in copy count
pub const DEFAULT_COPIES: usize = 2;

/// Options for resolving contexts, at call or manager-default level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageOptions {
    /// Number of copies / contexts
    pub count: Option<usize>,
    /// Explicit providers, in slot order
    pub provider_ids: Vec<ProviderId>,
    /// Explicit provider by service provider address
    pub provider_address: Option<Address>,
    /// Explicit data sets, in slot order
    pub data_set_ids: Vec<DataSetId>,
    pub with_cdn: Option<bool>,
    pub with_ipni: Option<bool>,
    /// Never reuse an existing data set
    pub force_create_data_sets: Option<bool>,
    /// Data set metadata
    pub metadata: Metadata,
    pub exclude_provider_ids: BTreeSet<ProviderId>,
}

impl StorageOptions {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_provider_ids(mut self, ids: impl IntoIterator<Item = ProviderId>) -> Self {
        self.provider_ids = ids.into_iter().collect();
        self
    }

    pub fn with_provider_address(mut self, address: impl Into<Address>) -> Self {
        self.provider_address = Some(address.into());
        self
    }

    pub fn with_data_set_ids(mut self, ids: impl IntoIterator<Item = DataSetId>) -> Self {
        self.data_set_ids = ids.into_iter().collect();
        self
    }

    pub fn with_cdn(mut self, enabled: bool) -> Self {
        self.with_cdn = Some(enabled);
        self
    }

    pub fn with_ipni(mut self, enabled: bool) -> Self {
        self.with_ipni = Some(enabled);
        self
    }

    pub fn force_create(mut self) -> Self {
        self.force_create_data_sets = Some(true);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = ProviderId>) -> Self {
        self.exclude_provider_ids.extend(ids);
        self
    }
}

/// Fully resolved options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveOptions {
    pub count: usize,
    pub provider_ids: Vec<ProviderId>,
    pub provider_address: Option<Address>,
    pub data_set_ids: Vec<DataSetId>,
    pub with_cdn: bool,
    /// CDN flag as set by the caller or defaults, before inference
    pub cdn_requested: Option<bool>,
    pub force_create_data_sets: bool,
    /// Requested data set metadata, `withCDN` included when enabled
    pub metadata: Metadata,
    pub exclude_provider_ids: BTreeSet<ProviderId>,
    pub requirements: ProviderRequirements,
}

impl EffectiveOptions {
    /// Caller pinned providers or data sets
    pub fn is_explicit(&self) -> bool {
        !self.provider_ids.is_empty()
            || !self.data_set_ids.is_empty()
            || self.provider_address.is_some()
    }

    /// Contexts the caller named, resolved ahead of any selected ones
    pub fn explicit_slots(&self) -> usize {
        self.data_set_ids.len() + self.provider_ids.len() + usize::from(self.provider_address.is_some())
    }

    /// Cache key, `None` when the request must not use cached contexts
    pub fn fingerprint(&self) -> Option<ContextFingerprint> {
        if self.is_explicit() || self.force_create_data_sets {
            return None;
        }
        Some(ContextFingerprint {
            count: self.count,
            metadata: self.metadata.clone(),
            with_cdn: self.with_cdn,
            excluded: self.exclude_provider_ids.clone(),
        })
    }
}

/// Normalized shape of a default-context request
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextFingerprint {
    pub count: usize,
    pub metadata: Metadata,
    pub with_cdn: bool,
    pub excluded: BTreeSet<ProviderId>,
}

/// Merge call options over manager defaults
pub fn resolve_effective_options(call: &StorageOptions, defaults: &StorageOptions) -> EffectiveOptions {
    let mut metadata = defaults.metadata.clone();
    metadata.extend(call.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

    let cdn_requested = call.with_cdn.or(defaults.with_cdn);
    let with_cdn = match cdn_requested {
        Some(enabled) => enabled,
        None => metadata.contains_key(METADATA_WITH_CDN),
    };
    if with_cdn {
        metadata
            .entry(METADATA_WITH_CDN.to_string())
            .or_insert_with(String::new);
    } else {
        metadata.remove(METADATA_WITH_CDN);
    }

    let pick = |call: &Vec<u64>, defaults: &Vec<u64>| {
        if call.is_empty() {
            defaults.clone()
        } else {
            call.clone()
        }
    };
    let provider_ids = pick(&call.provider_ids, &defaults.provider_ids);
    let data_set_ids = pick(&call.data_set_ids, &defaults.data_set_ids);
    let provider_address = call
        .provider_address
        .clone()
        .or_else(|| defaults.provider_address.clone());

    let explicit = provider_ids.len() + data_set_ids.len() + usize::from(provider_address.is_some());
    let count = call
        .count
        .or(defaults.count)
        .unwrap_or_else(|| DEFAULT_COPIES.max(explicit))
        .max(1);

    EffectiveOptions {
        count,
        provider_ids,
        provider_address,
        data_set_ids,
        with_cdn,
        cdn_requested,
        force_create_data_sets: call
            .force_create_data_sets
            .or(defaults.force_create_data_sets)
            .unwrap_or(false),
        metadata,
        exclude_provider_ids: defaults
            .exclude_provider_ids
            .union(&call.exclude_provider_ids)
            .copied()
            .collect(),
        requirements: ProviderRequirements {
            with_ipni: call.with_ipni.or(defaults.with_ipni).unwrap_or(false),
            ..Default::default()
        },
    }
}

/// Called once a piece is parked on the primary provider
pub type StoredCallback = std::sync::Arc<dyn Fn(&crate::types::StoredPiece) + Send + Sync>;

/// Per-call options for storing a piece on one context
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Skip hashing and trust this content address
    pub piece_cid: Option<PieceCid>,
    pub cancel: Option<CancellationToken>,
    pub on_stored: Option<StoredCallback>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("piece_cid", &self.piece_cid)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Per-call options for a single-context upload
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    pub store: StoreOptions,
    /// Per-piece metadata recorded with the addition
    pub piece_metadata: Metadata,
}

/// Per-call options for a multi-copy upload
#[derive(Clone, Debug, Default)]
pub struct ManagerUploadOptions {
    pub storage: StorageOptions,
    pub store: StoreOptions,
    pub piece_metadata: Metadata,
}

/// Options for an SP-agnostic download
#[derive(Clone, Debug)]
pub struct DownloadOptions {
    pub piece_cid: PieceCid,
    pub with_cdn: Option<bool>,
    /// Fetch from this provider only
    pub provider_address: Option<Address>,
}

impl DownloadOptions {
    pub fn new(piece_cid: PieceCid) -> Self {
        Self {
            piece_cid,
            with_cdn: None,
            provider_address: None,
        }
    }
}
