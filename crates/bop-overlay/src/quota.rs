use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::StreamId;

/// Per-stream shared-log budgets for one container.
///
/// When the nominal sizes fit in the shared log each stream gets its own
/// size. Otherwise every size is scaled by `capacity / Σsizes`, rounded
/// down, so the quotas never add up to more than the capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaTable {
    capacity: u64,
    total_nominal: u128,
    quotas: BTreeMap<StreamId, u64>,
}

/// The live table, replaced wholesale on every recomputation.
pub type SharedQuotas = Arc<ArcSwap<QuotaTable>>;

impl QuotaTable {
    pub fn compute<I>(capacity: u64, sizes: I) -> Self
    where
        I: IntoIterator<Item = (StreamId, u64)>,
    {
        let sizes: BTreeMap<StreamId, u64> = sizes.into_iter().collect();
        let total_nominal: u128 = sizes.values().map(|size| *size as u128).sum();
        let quotas = if total_nominal <= capacity as u128 {
            sizes
        } else {
            sizes
                .into_iter()
                .map(|(id, size)| {
                    let scaled = size as u128 * capacity as u128 / total_nominal;
                    (id, scaled as u64)
                })
                .collect()
        };
        Self {
            capacity,
            total_nominal,
            quotas,
        }
    }

    pub fn shared(table: QuotaTable) -> SharedQuotas {
        Arc::new(ArcSwap::from_pointee(table))
    }

    pub fn quota_for(&self, stream_id: StreamId) -> Option<u64> {
        self.quotas.get(&stream_id).copied()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn total_nominal(&self) -> u128 {
        self.total_nominal
    }

    pub fn is_oversubscribed(&self) -> bool {
        self.total_nominal > self.capacity as u128
    }

    pub fn total_quota(&self) -> u128 {
        self.quotas.values().map(|quota| *quota as u128).sum()
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, u64)> + '_ {
        self.quotas.iter().map(|(id, quota)| (*id, *quota))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn undersubscribed_streams_keep_their_size() {
        let table = QuotaTable::compute(
            1000,
            [(StreamId::new(1), 100), (StreamId::new(2), 300)],
        );
        assert!(!table.is_oversubscribed());
        assert_eq!(table.quota_for(StreamId::new(1)), Some(100));
        assert_eq!(table.quota_for(StreamId::new(2)), Some(300));
        assert_eq!(table.quota_for(StreamId::new(3)), None);
    }

    #[test]
    fn four_times_oversubscribed_quarters_each_quota() {
        let size = 1 << 30;
        let table = QuotaTable::compute(
            size,
            (1..=4).map(|id| (StreamId::new(id), size)),
        );
        assert!(table.is_oversubscribed());
        for id in 1..=4 {
            assert_eq!(table.quota_for(StreamId::new(id)), Some(size / 4));
        }
        assert_eq!(table.total_quota(), size as u128);
    }

    #[test]
    fn swapped_table_is_seen_whole() {
        let shared = QuotaTable::shared(QuotaTable::compute(100, [(StreamId::new(1), 50)]));
        let before = shared.load_full();
        shared.store(Arc::new(QuotaTable::compute(
            100,
            [(StreamId::new(1), 100), (StreamId::new(2), 100)],
        )));
        assert_eq!(before.quota_for(StreamId::new(1)), Some(50));
        assert_eq!(shared.load().quota_for(StreamId::new(1)), Some(50));
        assert_eq!(shared.load().len(), 2);
    }

    proptest! {
        #[test]
        fn quotas_are_proportional_and_bounded(
            sizes in prop::collection::vec(1u64..(1 << 40), 1..16),
            capacity in 1u64..(1 << 40),
        ) {
            let table = QuotaTable::compute(
                capacity,
                sizes.iter().enumerate().map(|(i, size)| (StreamId::new(i as u64), *size)),
            );
            let total: u128 = sizes.iter().map(|size| *size as u128).sum();
            if total > capacity as u128 {
                prop_assert!(table.total_quota() <= capacity as u128);
                for (i, size) in sizes.iter().enumerate() {
                    let exact = *size as f64 * capacity as f64 / total as f64;
                    let quota = table.quota_for(StreamId::new(i as u64)).unwrap_or_default();
                    prop_assert!((exact - quota as f64).abs() <= 1.0 + exact * 1e-9);
                }
            } else {
                for (i, size) in sizes.iter().enumerate() {
                    prop_assert_eq!(table.quota_for(StreamId::new(i as u64)), Some(*size));
                }
            }
        }
    }
}
