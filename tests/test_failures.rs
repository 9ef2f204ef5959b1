mod common;

use std::time::Duration;

use common::{apogee_batch, ctx, gaia, FlakyStore, V};
use too::export::DiffJournal;
use too::identity::{resolve_identities, ResolverParams};
use too::pipeline::{PipelineParams, TooPipeline};
use too::store::{MemoryStore, TooStore};
use too::datamodel::Lifecycle;
use too::mock::sample_record;
use too::upsert::UpsertMode;
use too::xmatch::{cross_match, XMatchParams};
use too::TooError;

fn no_backoff() -> ResolverParams {
    ResolverParams::builder()
        .merge_retry_backoff(Duration::ZERO)
        .build()
        .unwrap()
}

fn stored(rows: &[(i64, f64, f64)]) -> MemoryStore {
    let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());
    pipeline.ingest(&apogee_batch(rows), &ctx()).unwrap();
    pipeline.into_store()
}

#[test]
fn timed_out_lookup_is_retried() {
    let mut inner = stored(&[(1, 10.0, 10.0)]);
    inner.insert_catalog(gaia(42, 10.0, 10.0)).unwrap();
    let mut store = FlakyStore::new(inner, 2, 0);

    let report = cross_match(&mut store, V, &XMatchParams::default()).unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.units[0].best.as_slice(), &[42]);
}

#[test]
fn exhausted_retries_fail_the_record_not_the_batch() {
    let mut inner = stored(&[(1, 10.0, 10.0)]);
    inner.insert_catalog(gaia(42, 10.0, 10.0)).unwrap();
    let mut store = FlakyStore::new(inner, 3, 0);

    let report = cross_match(&mut store, V, &XMatchParams::default()).unwrap();
    assert!(report.units.is_empty());
    assert_eq!(
        report.failures,
        vec![(1, TooError::LookupTimeout { too_id: 1, attempts: 3 })]
    );
    // a timeout is never turned into a "no match" mint
    assert_eq!(report.n_minted, 0);
    assert!(store.links_for_target(1, V).is_empty());
}

#[test]
fn failure_rate_aborts_the_stage() {
    // enough timeouts for every attempt of both targets
    let inner = stored(&[(1, 10.0, 10.0), (2, 20.0, 10.0)]);
    let store = FlakyStore::new(inner, 6, 0);
    let mut pipeline = TooPipeline::new(store, PipelineParams::default());

    let err = pipeline.cross_match(&ctx()).unwrap_err();
    assert_eq!(
        err,
        TooError::FailureRateExceeded {
            stage: "cross-match",
            failed: 2,
            total: 2,
            threshold: 0.1
        }
    );
}

// polls: 1 before ingest, 2 before cross-match, 3 before identity resolution, then one
// before each cluster commit
fn cancel_at(poll: u32) -> impl FnMut() -> bool {
    let mut polls = 0;
    move || {
        polls += 1;
        polls == poll
    }
}

#[test]
fn identities_cancelled_before_resolution_are_assigned_by_the_next_run() {
    let batch = apogee_batch(&[(1, 10.0, 10.0), (2, 20.0, 10.0)]);
    let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());

    let err = pipeline.run_with_cancel(&batch, &ctx(), cancel_at(3)).unwrap_err();
    assert_eq!(err, TooError::Cancelled("identity resolution"));
    assert_eq!(pipeline.lifecycle(1, &ctx()), Lifecycle::MatchedNoIdentity);
    assert_eq!(pipeline.lifecycle(2, &ctx()), Lifecycle::MatchedNoIdentity);

    let summary = pipeline.run(&batch, &ctx()).unwrap();
    assert_eq!(summary.n_skipped, 2);
    assert_eq!(summary.n_resumed, 2);
    assert_eq!(summary.identities.n_minted, 2);
    assert_eq!(pipeline.lifecycle(1, &ctx()), Lifecycle::IdentityAssigned);
    assert_eq!(pipeline.lifecycle(2, &ctx()), Lifecycle::IdentityAssigned);
}

#[test]
fn identities_cancelled_between_commits_are_completed_by_the_next_run() {
    let batch = apogee_batch(&[(1, 10.0, 10.0), (2, 20.0, 10.0)]);
    let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());

    let err = pipeline.run_with_cancel(&batch, &ctx(), cancel_at(5)).unwrap_err();
    assert_eq!(err, TooError::Cancelled("identity resolution"));
    assert_eq!(pipeline.lifecycle(1, &ctx()), Lifecycle::IdentityAssigned);
    assert_eq!(pipeline.lifecycle(2, &ctx()), Lifecycle::MatchedNoIdentity);
    assert_eq!(pipeline.drain_diff().clusters.len(), 1);

    // a different batch still picks up the unfinished target
    let summary = pipeline.run(&apogee_batch(&[(3, 30.0, 10.0)]), &ctx()).unwrap();
    assert_eq!(summary.n_resumed, 1);
    assert_eq!(summary.identities.n_minted, 2);
    for too_id in 1..=3 {
        assert_eq!(pipeline.lifecycle(too_id, &ctx()), Lifecycle::IdentityAssigned);
    }
    assert_eq!(pipeline.store().sdss_ids().len(), 3);
}

#[test]
fn links_written_before_a_failure_rate_abort_are_resolved_later() {
    let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());
    let mut unknown = sample_record(2);
    unknown.core.catalogid = Some(999);
    pipeline.store_mut().insert_target(sample_record(1)).unwrap();
    pipeline.store_mut().insert_target(unknown).unwrap();

    let err = pipeline.cross_match(&ctx()).unwrap_err();
    assert!(matches!(err, TooError::FailureRateExceeded { failed: 1, total: 2, .. }));
    assert_eq!(pipeline.lifecycle(1, &ctx()), Lifecycle::MatchedNoIdentity);

    pipeline.store_mut().insert_catalog(gaia(999, 20.0, 10.0)).unwrap();
    let summary = pipeline.run(&apogee_batch(&[(3, 30.0, 10.0)]), &ctx()).unwrap();
    assert_eq!(summary.n_resumed, 1);
    assert_eq!(summary.n_matched, 2);
    for too_id in 1..=3 {
        assert_eq!(pipeline.lifecycle(too_id, &ctx()), Lifecycle::IdentityAssigned);
    }
}

#[test]
fn merge_conflict_is_retried_once() {
    let inner = MemoryStore::with_catalog([gaia(1, 10.0, 10.0)]).unwrap();
    let mut store = FlakyStore::new(inner, 0, 1);
    let mut units_store = stored(&[(1, 10.0, 10.0)]);
    units_store.insert_catalog(gaia(1, 10.0, 10.0)).unwrap();
    let units = cross_match(&mut units_store, V, &XMatchParams::default())
        .unwrap()
        .units;

    let mut journal = DiffJournal::new();
    let report = resolve_identities(&mut store, &units, V, &no_backoff(), &mut journal, || false).unwrap();
    assert_eq!(report.n_minted, 1);
    assert_eq!(report.n_retried, 1);
    assert_eq!(store.commit_attempts, 2);
    assert_eq!(store.sdss_id_of(1), Some(1));
}

#[test]
fn second_merge_conflict_aborts_without_partial_write() {
    let inner = MemoryStore::with_catalog([gaia(1, 10.0, 10.0)]).unwrap();
    let mut store = FlakyStore::new(inner, 0, 2);
    let mut units_store = stored(&[(1, 10.0, 10.0)]);
    units_store.insert_catalog(gaia(1, 10.0, 10.0)).unwrap();
    let units = cross_match(&mut units_store, V, &XMatchParams::default())
        .unwrap()
        .units;

    let mut journal = DiffJournal::new();
    let err = resolve_identities(&mut store, &units, V, &no_backoff(), &mut journal, || false).unwrap_err();
    assert_eq!(err, TooError::MergeConflict { sdss_id: 1 });
    assert_eq!(store.sdss_id_of(1), None);
    assert!(journal.is_empty());
}

#[test]
fn strict_upsert_rejects_changed_duplicates() {
    let params = PipelineParams::builder()
        .strict_upsert(true)
        .build()
        .unwrap();
    let mut pipeline = TooPipeline::new(MemoryStore::new(), params);
    pipeline.ingest(&apogee_batch(&[(1, 10.0, 10.0)]), &ctx()).unwrap();

    let err = pipeline
        .ingest(&apogee_batch(&[(2, 30.0, 10.0), (1, 11.0, 10.0)]), &ctx())
        .unwrap_err();
    assert_eq!(err, TooError::DuplicateIdentity { too_id: 1 });
    assert_eq!(pipeline.store().n_targets(), 1);
}

#[test]
fn refresh_mode_ignores_core_changes() {
    let params = PipelineParams::builder()
        .upsert_mode(UpsertMode::RefreshMetadata)
        .build()
        .unwrap();
    let mut pipeline = TooPipeline::new(MemoryStore::new(), params);
    pipeline.ingest(&apogee_batch(&[(1, 10.0, 10.0)]), &ctx()).unwrap();

    let report = pipeline
        .ingest(&apogee_batch(&[(1, 11.0, 10.0)]), &ctx())
        .unwrap();
    assert_eq!(report.upsert.unchanged, vec![1]);
    assert_eq!(pipeline.store().get_target(1).unwrap().core.ra, 10.0);
}
