//! # Target upsert
//!
//! Inserts new targets and refreshes the metadata of known ones.
//!
//! ## Overview
//!
//! For every validated record:
//!
//! * unseen `too_id` → the target is inserted, stamped with the modification time;
//! * known `too_id`, identical content → [`UpsertOutcome::Unchanged`] (re-running the same
//!   input is a no-op);
//! * known `too_id`, different content →
//!   - [`UpsertMode::CreateOnly`]: the record fails with [`TooError::DuplicateIdentity`];
//!   - [`UpsertMode::RefreshMetadata`]: the metadata is replaced in place and stamped. The
//!     core (identity and astrometry) is immutable: a differing core is ignored with a
//!     warning.
//!
//! Terminal lifecycle states are sticky through a refresh: an observed target stays
//! observed, a deactivated target is not re-activated, and an expired window is not
//! extended.
//!
//! With `strict = true` every record is checked before the first write and any duplicate
//! aborts the batch without touching the store.

use std::fmt;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::constants::{TooId, MJD};
use crate::datamodel::{Lifecycle, TargetMetadata, TooRecord};
use crate::store::TooStore;
use crate::too_errors::TooError;

/// How a known `too_id` is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// A known id with different content is a duplicate-identity error.
    #[default]
    CreateOnly,
    /// A known id gets its metadata refreshed.
    RefreshMetadata,
}

impl fmt::Display for UpsertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertMode::CreateOnly => write!(f, "create-only"),
            UpsertMode::RefreshMetadata => write!(f, "refresh-metadata"),
        }
    }
}

/// Result of upserting one record.
#[derive(Debug, PartialEq)]
pub enum UpsertOutcome {
    Inserted,
    Unchanged,
    Refreshed,
    Failed(TooError),
}

/// Per-batch upsert accounting.
#[derive(Debug, Default, PartialEq)]
pub struct UpsertSummary {
    pub inserted: Vec<TooId>,
    pub refreshed: Vec<TooId>,
    pub unchanged: Vec<TooId>,
    pub failures: Vec<(TooId, TooError)>,
}

impl UpsertSummary {
    pub fn n_processed(&self) -> usize {
        self.inserted.len() + self.refreshed.len() + self.unchanged.len() + self.failures.len()
    }

    fn record(&mut self, too_id: TooId, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted.push(too_id),
            UpsertOutcome::Refreshed => self.refreshed.push(too_id),
            UpsertOutcome::Unchanged => self.unchanged.push(too_id),
            UpsertOutcome::Failed(err) => self.failures.push((too_id, err)),
        }
    }
}

impl fmt::Display for UpsertSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} refreshed={} unchanged={} failed={}",
            self.inserted.len(),
            self.refreshed.len(),
            self.unchanged.len(),
            self.failures.len()
        )
    }
}

/// Merge incoming metadata into the stored one, keeping terminal states.
///
/// Return
/// ----------
/// * the metadata to store and the terminal states the incoming record tried to leave.
pub fn sticky_merge(
    existing: &TargetMetadata,
    incoming: TargetMetadata,
    today: i32,
) -> (TargetMetadata, Vec<Lifecycle>) {
    let mut merged = incoming;
    let mut blocked = Vec::new();

    if existing.observed && !merged.observed {
        merged.observed = true;
        blocked.push(Lifecycle::Observed);
    }
    if existing.is_expired(today) && !merged.is_expired(today) {
        merged.observe_until_mjd = existing.observe_until_mjd;
        blocked.push(Lifecycle::Expired);
    }
    if !existing.active && merged.active {
        merged.active = false;
        blocked.push(Lifecycle::Deactivated);
    }
    (merged, blocked)
}

fn classify<S: TooStore>(
    store: &S,
    record: &TooRecord,
    mode: UpsertMode,
    today: i32,
) -> Planned {
    let Some(existing) = store.get_target(record.too_id()) else {
        return Planned::Insert;
    };

    let core_changed = existing.core != record.core;
    let (merged, blocked) = sticky_merge(&existing.metadata, record.metadata.clone(), today);
    if !blocked.is_empty() {
        warn!(
            too_id = record.too_id(),
            blocked = ?blocked,
            "refresh cannot leave a terminal state"
        );
    }
    let metadata_changed = !merged.same_content(&existing.metadata);

    match (core_changed, metadata_changed, mode) {
        (false, false, _) => Planned::Unchanged,
        (_, _, UpsertMode::CreateOnly) => Planned::Duplicate,
        (true, false, UpsertMode::RefreshMetadata) => {
            warn!(too_id = record.too_id(), "ignoring change to immutable target fields");
            Planned::Unchanged
        }
        (core_changed, true, UpsertMode::RefreshMetadata) => {
            if core_changed {
                warn!(too_id = record.too_id(), "ignoring change to immutable target fields");
            }
            Planned::Refresh(merged)
        }
    }
}

enum Planned {
    Insert,
    Unchanged,
    Refresh(TargetMetadata),
    Duplicate,
}

/// Upsert a batch of validated records.
///
/// Arguments
/// -----------------
/// * `store`: the target store.
/// * `records`: validated records with unique ids.
/// * `mode`: handling of known ids.
/// * `strict`: check every record before writing; any duplicate aborts the batch.
/// * `now`: modification stamp (MJD).
/// * `today`: reference day for the expiry check.
///
/// Return
/// ----------
/// * the per-record outcomes. In strict mode, `Err(TooError::DuplicateIdentity)` for the
///   first duplicate, with nothing written.
#[instrument(skip(store, records), fields(records = records.len(), mode = %mode))]
pub fn upsert_records<S: TooStore>(
    store: &mut S,
    records: &[TooRecord],
    mode: UpsertMode,
    strict: bool,
    now: MJD,
    today: i32,
) -> Result<UpsertSummary, TooError> {
    let plans: Vec<Planned> = records
        .iter()
        .map(|r| classify(store, r, mode, today))
        .collect();

    if strict {
        if let Some((record, _)) = records
            .iter()
            .zip(&plans)
            .find(|(_, p)| matches!(p, Planned::Duplicate))
        {
            warn!(too_id = record.too_id(), "strict upsert aborted on duplicate identity");
            return Err(TooError::DuplicateIdentity {
                too_id: record.too_id(),
            });
        }
    }

    let mut summary = UpsertSummary::default();
    for (record, plan) in records.iter().zip(plans) {
        let too_id = record.too_id();
        let outcome = match plan {
            Planned::Insert => {
                let mut stamped = record.clone();
                stamped.metadata.last_modified_date = Some(now);
                match store.insert_target(stamped) {
                    Ok(()) => UpsertOutcome::Inserted,
                    Err(err) => UpsertOutcome::Failed(err),
                }
            }
            Planned::Unchanged => UpsertOutcome::Unchanged,
            Planned::Refresh(mut metadata) => {
                metadata.last_modified_date = Some(now);
                match store.update_metadata(too_id, metadata) {
                    Ok(()) => UpsertOutcome::Refreshed,
                    Err(err) => UpsertOutcome::Failed(err),
                }
            }
            Planned::Duplicate => UpsertOutcome::Failed(TooError::DuplicateIdentity { too_id }),
        };
        summary.record(too_id, outcome);
    }

    info!(%summary, "upsert done");
    Ok(summary)
}

#[cfg(test)]
mod upsert_test {
    use super::*;
    use crate::mock::sample_record;
    use crate::store::MemoryStore;

    const NOW: MJD = 60000.25;
    const TODAY: i32 = 60000;

    #[test]
    fn test_insert_then_unchanged() {
        let mut store = MemoryStore::new();
        let records = vec![sample_record(1), sample_record(2)];

        let first = upsert_records(&mut store, &records, UpsertMode::CreateOnly, false, NOW, TODAY)
            .unwrap();
        assert_eq!(first.inserted, vec![1, 2]);
        assert_eq!(
            store.get_target(1).unwrap().metadata.last_modified_date,
            Some(NOW)
        );

        let second =
            upsert_records(&mut store, &records, UpsertMode::CreateOnly, true, NOW + 1.0, TODAY)
                .unwrap();
        assert_eq!(second.unchanged, vec![1, 2]);
        assert_eq!(
            store.get_target(1).unwrap().metadata.last_modified_date,
            Some(NOW)
        );
    }

    #[test]
    fn test_create_only_duplicate() {
        let mut store = MemoryStore::new();
        upsert_records(&mut store, &[sample_record(1)], UpsertMode::CreateOnly, false, NOW, TODAY)
            .unwrap();

        let mut changed = sample_record(1);
        changed.metadata.priority = 9;
        let fresh = sample_record(2);

        let summary = upsert_records(
            &mut store,
            &[changed.clone(), fresh.clone()],
            UpsertMode::CreateOnly,
            false,
            NOW,
            TODAY,
        )
        .unwrap();
        assert_eq!(summary.failures, vec![(1, TooError::DuplicateIdentity { too_id: 1 })]);
        assert_eq!(summary.inserted, vec![2]);

        // strict: nothing is written
        let mut store = MemoryStore::new();
        upsert_records(&mut store, &[sample_record(1)], UpsertMode::CreateOnly, false, NOW, TODAY)
            .unwrap();
        let err = upsert_records(
            &mut store,
            &[fresh, changed],
            UpsertMode::CreateOnly,
            true,
            NOW,
            TODAY,
        )
        .unwrap_err();
        assert_eq!(err, TooError::DuplicateIdentity { too_id: 1 });
        assert_eq!(store.n_targets(), 1);
    }

    #[test]
    fn test_refresh_metadata_keeps_core() {
        let mut store = MemoryStore::new();
        upsert_records(&mut store, &[sample_record(1)], UpsertMode::CreateOnly, false, NOW, TODAY)
            .unwrap();

        let mut changed = sample_record(1);
        changed.metadata.priority = 9;
        changed.core.ra += 1.0;
        let summary = upsert_records(
            &mut store,
            &[changed],
            UpsertMode::RefreshMetadata,
            false,
            NOW + 1.0,
            TODAY,
        )
        .unwrap();
        assert_eq!(summary.refreshed, vec![1]);

        let stored = store.get_target(1).unwrap();
        assert_eq!(stored.metadata.priority, 9);
        assert_eq!(stored.metadata.last_modified_date, Some(NOW + 1.0));
        assert_eq!(stored.core, sample_record(1).core);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut store = MemoryStore::new();
        let mut observed = sample_record(1);
        observed.metadata.observed = true;
        let mut expired = sample_record(2);
        expired.metadata.observe_until_mjd = Some(TODAY - 1);
        let mut deactivated = sample_record(3);
        deactivated.metadata.active = false;
        upsert_records(
            &mut store,
            &[observed, expired, deactivated],
            UpsertMode::CreateOnly,
            false,
            NOW,
            TODAY,
        )
        .unwrap();

        let mut revived = vec![sample_record(1), sample_record(2), sample_record(3)];
        revived[1].metadata.observe_until_mjd = Some(TODAY + 30);
        let summary = upsert_records(
            &mut store,
            &revived,
            UpsertMode::RefreshMetadata,
            false,
            NOW,
            TODAY,
        )
        .unwrap();
        assert_eq!(summary.unchanged, vec![1, 2, 3]);

        assert!(store.get_target(1).unwrap().metadata.observed);
        assert_eq!(
            store.get_target(2).unwrap().metadata.observe_until_mjd,
            Some(TODAY - 1)
        );
        assert!(!store.get_target(3).unwrap().metadata.active);
    }
}
