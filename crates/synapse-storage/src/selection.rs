//! Provider selection over a candidate pool
//!
//! Pure ranking, no I/O: callers health-check what comes back and call
//! again with the failed providers excluded.

use crate::types::{metadata_matches, EnhancedDataSet, Metadata, ProviderId, ProviderInfo, SelectedProvider};
use std::collections::BTreeSet;

/// Inputs to [`select_providers`]
#[derive(Clone, Copy, Debug)]
pub struct SelectionInput<'a> {
    pub candidates: &'a [ProviderInfo],
    pub data_sets: &'a [EnhancedDataSet],
    /// When non-empty, only these providers are eligible
    pub endorsed: &'a BTreeSet<ProviderId>,
    pub metadata: &'a Metadata,
    pub excluded: &'a BTreeSet<ProviderId>,
}

/// Pick up to `count` distinct providers
///
/// Providers with a metadata-matching data set come first, in data set
/// order; the rest are filled from the candidate order.
pub fn select_providers(input: SelectionInput<'_>, count: usize) -> Vec<SelectedProvider> {
    let eligible: Vec<&ProviderInfo> = input
        .candidates
        .iter()
        .filter(|p| !input.excluded.contains(&p.id))
        .filter(|p| input.endorsed.is_empty() || input.endorsed.contains(&p.id))
        .collect();

    let matching: Vec<&EnhancedDataSet> = input
        .data_sets
        .iter()
        .filter(|ds| eligible.iter().any(|p| p.id == ds.provider_id()))
        .filter(|ds| metadata_matches(&ds.metadata, input.metadata))
        .collect();

    let mut chosen: Vec<SelectedProvider> = Vec::with_capacity(count);
    let mut used: BTreeSet<ProviderId> = BTreeSet::new();

    while chosen.len() < count {
        let reuse = matching
            .iter()
            .find(|ds| !used.contains(&ds.provider_id()))
            .and_then(|ds| {
                eligible
                    .iter()
                    .find(|p| p.id == ds.provider_id())
                    .map(|p| (*p, Some(ds.data_set_id())))
            });

        let next = reuse.or_else(|| {
            eligible
                .iter()
                .find(|p| !used.contains(&p.id))
                .map(|p| (*p, None))
        });

        let Some((provider, data_set_id)) = next else {
            break;
        };
        used.insert(provider.id);
        chosen.push(SelectedProvider {
            provider: provider.clone(),
            data_set_id,
            endorsed: input.endorsed.contains(&provider.id),
        });
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataSetInfo, PdpOffering};
    use proptest::prelude::*;

    fn provider(id: ProviderId) -> ProviderInfo {
        ProviderInfo {
            id,
            service_provider: format!("0x{:040x}", id),
            payee: format!("0x{:040x}", id),
            name: format!("sp-{}", id),
            active: true,
            pdp: PdpOffering {
                service_url: format!("https://sp{}.example.com", id),
                min_piece_size: 127,
                max_piece_size: 1 << 30,
                storage_price_per_tib_per_day: 10,
                min_proving_period_epochs: 30,
                location: "us".into(),
                ipni_piece: false,
                ipni_ipfs: false,
                capabilities: Default::default(),
            },
        }
    }

    fn data_set(id: u64, provider_id: ProviderId, metadata: Metadata) -> EnhancedDataSet {
        EnhancedDataSet {
            info: DataSetInfo {
                data_set_id: id,
                pdp_rail_id: id,
                cdn_rail_id: 0,
                payer: "0xpayer".into(),
                payee: format!("0x{:040x}", provider_id),
                provider_id,
                client_data_set_id: id,
                pdp_end_epoch: 0,
                record_keeper: "0xkeeper".into(),
            },
            metadata,
            active_piece_count: 1,
            is_managed: true,
        }
    }

    fn app(value: &str) -> Metadata {
        [("app".to_string(), value.to_string())].into_iter().collect()
    }

    #[test]
    fn test_prefers_matching_data_sets() {
        let candidates: Vec<_> = (1..=4).map(provider).collect();
        let data_sets = vec![data_set(10, 3, app("a")), data_set(11, 2, app("b"))];
        let none = BTreeSet::new();
        let metadata = app("a");

        let picked = select_providers(
            SelectionInput {
                candidates: &candidates,
                data_sets: &data_sets,
                endorsed: &none,
                metadata: &metadata,
                excluded: &none,
            },
            2,
        );

        assert_eq!(picked[0].provider.id, 3);
        assert_eq!(picked[0].data_set_id, Some(10));
        assert_eq!(picked[1].provider.id, 1);
        assert_eq!(picked[1].data_set_id, None);
    }

    #[test]
    fn test_exclusions_and_exhaustion() {
        let candidates: Vec<_> = (1..=3).map(provider).collect();
        let excluded: BTreeSet<_> = [1, 3].into_iter().collect();
        let none = BTreeSet::new();
        let metadata = Metadata::new();

        let picked = select_providers(
            SelectionInput {
                candidates: &candidates,
                data_sets: &[],
                endorsed: &none,
                metadata: &metadata,
                excluded: &excluded,
            },
            3,
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].provider.id, 2);
    }

    #[test]
    fn test_endorsed_restricts_pool() {
        let candidates: Vec<_> = (1..=4).map(provider).collect();
        let endorsed: BTreeSet<_> = [4].into_iter().collect();
        let none = BTreeSet::new();
        let metadata = Metadata::new();
        let data_sets = vec![data_set(20, 1, Metadata::new())];

        let picked = select_providers(
            SelectionInput {
                candidates: &candidates,
                data_sets: &data_sets,
                endorsed: &endorsed,
                metadata: &metadata,
                excluded: &none,
            },
            2,
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].provider.id, 4);
        assert!(picked[0].endorsed);
    }

    #[test]
    fn test_one_data_set_per_provider() {
        let candidates: Vec<_> = (1..=2).map(provider).collect();
        let data_sets = vec![
            data_set(30, 1, Metadata::new()),
            data_set(31, 1, Metadata::new()),
        ];
        let none = BTreeSet::new();
        let metadata = Metadata::new();

        let picked = select_providers(
            SelectionInput {
                candidates: &candidates,
                data_sets: &data_sets,
                endorsed: &none,
                metadata: &metadata,
                excluded: &none,
            },
            2,
        );
        assert_eq!(picked[0].data_set_id, Some(30));
        assert_eq!(picked[1].provider.id, 2);
        assert_eq!(picked[1].data_set_id, None);
    }

    proptest! {
        #[test]
        fn prop_distinct_and_bounded(pool in 0usize..12, count in 0usize..15, ds_owners in proptest::collection::vec(1u64..12, 0..10)) {
            let candidates: Vec<_> = (1..=pool as u64).map(provider).collect();
            let data_sets: Vec<_> = ds_owners
                .iter()
                .enumerate()
                .map(|(i, owner)| data_set(100 + i as u64, *owner, Metadata::new()))
                .collect();
            let none = BTreeSet::new();
            let metadata = Metadata::new();

            let picked = select_providers(
                SelectionInput {
                    candidates: &candidates,
                    data_sets: &data_sets,
                    endorsed: &none,
                    metadata: &metadata,
                    excluded: &none,
                },
                count,
            );

            prop_assert_eq!(picked.len(), pool.min(count));
            let ids: BTreeSet<_> = picked.iter().map(|s| s.provider.id).collect();
            prop_assert_eq!(ids.len(), picked.len());
        }

        #[test]
        fn prop_never_returns_unendorsed(pool in 1usize..12, count in 1usize..15, endorsed in proptest::collection::btree_set(1u64..12, 1..5)) {
            let candidates: Vec<_> = (1..=pool as u64).map(provider).collect();
            let none = BTreeSet::new();
            let metadata = Metadata::new();

            let picked = select_providers(
                SelectionInput {
                    candidates: &candidates,
                    data_sets: &[],
                    endorsed: &endorsed,
                    metadata: &metadata,
                    excluded: &none,
                },
                count,
            );

            for selected in &picked {
                prop_assert!(endorsed.contains(&selected.provider.id));
                prop_assert!(selected.endorsed);
            }
        }
    }
}
