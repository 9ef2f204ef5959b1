mod common;

use std::collections::BTreeMap;

use common::{ctx, gaia, V};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use too::constants::{CatalogId, SdssId, TooId};
use too::mock::{create_mock_too_batch, MockParams};
use too::pipeline::{PipelineParams, TooPipeline};
use too::store::{MemoryStore, TooStore};
use too::RawBatch;

/// Targets and catalog entries packed in a few arcminutes so cones overlap.
fn crowded_field(seed: u64, n_targets: usize, n_catalog: usize) -> (RawBatch, MemoryStore) {
    let mut rng = StdRng::seed_from_u64(seed);
    let params = MockParams::builder()
        .ra_range(150.0..150.002)
        .dec_range(2.0..2.002)
        .build()
        .unwrap();
    let batch = create_mock_too_batch(n_targets, &mut rng, &params);

    let entries = (1..=n_catalog as CatalogId).map(|cid| {
        gaia(
            cid,
            rng.random_range(150.0..150.002),
            rng.random_range(2.0..2.002),
        )
    });
    (batch, MemoryStore::with_catalog(entries).unwrap())
}

fn too_ids(store: &MemoryStore) -> Vec<TooId> {
    let mut ids: Vec<TooId> = store.targets().iter().map(|t| t.too_id()).collect();
    ids.sort_unstable();
    ids
}

/// too_id -> (best catalogids, sdss_id of each)
fn identity_map(store: &MemoryStore) -> BTreeMap<TooId, Vec<(CatalogId, Option<SdssId>)>> {
    too_ids(store)
        .into_iter()
        .map(|id| {
            let mut best: Vec<_> = store
                .links_for_target(id, V)
                .into_iter()
                .filter(|l| l.best)
                .map(|l| (l.catalogid, store.sdss_id_of(l.catalogid)))
                .collect();
            best.sort_unstable();
            (id, best)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_catalogid_belongs_to_exactly_one_live_class(
        seed in any::<u64>(),
        n_targets in 1usize..30,
        n_catalog in 0usize..15,
    ) {
        let (batch, store) = crowded_field(seed, n_targets, n_catalog);
        let mut pipeline = TooPipeline::new(store, PipelineParams::default());
        pipeline.run(&batch, &ctx()).unwrap();
        let store = pipeline.store();

        let live = store.sdss_ids();
        let mut seen: BTreeMap<CatalogId, SdssId> = BTreeMap::new();
        for &sdss_id in &live {
            prop_assert_eq!(store.resolve_sdss_id(sdss_id), Some(sdss_id));
            for cid in store.class_members(sdss_id) {
                prop_assert!(seen.insert(cid, sdss_id).is_none(), "catalogid {} in two classes", cid);
                prop_assert_eq!(store.sdss_id_of(cid), Some(sdss_id));
            }
        }

        for (too_id, best) in identity_map(store) {
            prop_assert!(!best.is_empty(), "target {} has no best match", too_id);
            for (cid, sdss_id) in best {
                prop_assert!(sdss_id.is_some(), "catalogid {} has no identity", cid);
                prop_assert_eq!(seen.get(&cid).copied(), sdss_id);
            }
        }
    }

    #[test]
    fn merging_never_grows_the_partition(
        seed in any::<u64>(),
        n_targets in 1usize..30,
        n_catalog in 1usize..15,
    ) {
        let (first, store) = crowded_field(seed, n_targets, n_catalog);
        let mut pipeline = TooPipeline::new(store, PipelineParams::default());
        pipeline.run(&first, &ctx()).unwrap();

        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let params = MockParams::builder()
            .first_too_id(1_000)
            .ra_range(150.0..150.002)
            .dec_range(2.0..2.002)
            .build()
            .unwrap();
        let second = create_mock_too_batch(n_targets, &mut rng, &params);
        let before = pipeline.store().sdss_ids().len();
        let summary = pipeline.run(&second, &ctx()).unwrap();
        let ids = &summary.identities;

        prop_assert_eq!(ids.n_classes_before, before);
        prop_assert_eq!(ids.n_classes_after, pipeline.store().sdss_ids().len());
        prop_assert!(ids.n_classes_after <= ids.n_classes_before + ids.n_minted);
        prop_assert_eq!(
            ids.n_classes_after + ids.n_absorbed,
            ids.n_classes_before + ids.n_minted
        );
    }

    #[test]
    fn cross_match_is_deterministic(
        seed in any::<u64>(),
        n_targets in 1usize..30,
        n_catalog in 0usize..15,
    ) {
        let (batch, store) = crowded_field(seed, n_targets, n_catalog);
        let (_, twin) = crowded_field(seed, n_targets, n_catalog);

        let mut a = TooPipeline::new(store, PipelineParams::default());
        let mut b = TooPipeline::new(twin, PipelineParams::default());
        a.run(&batch, &ctx()).unwrap();
        b.run(&batch, &ctx()).unwrap();

        prop_assert_eq!(identity_map(a.store()), identity_map(b.store()));
        prop_assert_eq!(a.drain_diff(), b.drain_diff());
    }

    #[test]
    fn rerunning_a_batch_changes_nothing(
        seed in any::<u64>(),
        n_targets in 1usize..30,
        n_catalog in 0usize..15,
    ) {
        let (batch, store) = crowded_field(seed, n_targets, n_catalog);
        let mut pipeline = TooPipeline::new(store, PipelineParams::default());
        pipeline.run(&batch, &ctx()).unwrap();
        pipeline.drain_diff();

        let snapshot = identity_map(pipeline.store());
        let n_links = pipeline.store().n_links();
        let summary = pipeline.run(&batch, &ctx()).unwrap();

        prop_assert_eq!(summary.n_inserted, 0);
        prop_assert_eq!(summary.n_minted_catalogids, 0);
        prop_assert_eq!(summary.identities.n_changes(), 0);
        prop_assert_eq!(pipeline.store().n_links(), n_links);
        prop_assert_eq!(identity_map(pipeline.store()), snapshot);
        prop_assert!(pipeline.drain_diff().is_empty());
    }
}
