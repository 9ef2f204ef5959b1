#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use too::constants::{ArcSec, CatalogId, Degree, SdssId, TooId, VersionId, DEFAULT_VERSION_ID};
use too::datamodel::{RawBatch, RawValue, TargetMetadata, TooRecord};
use too::field::{Field, FieldList};
use too::mask::Observatory;
use too::pipeline::RunContext;
use too::store::{CatalogEntry, ClusterChange, ConeHit, CrossMatchLink, MemoryStore, TooStore};
use too::TooError;

pub const V: VersionId = DEFAULT_VERSION_ID;

/// 2023-02-25, mid-day.
pub fn ctx() -> RunContext {
    RunContext::new(V, 60000.5)
}

pub fn ctx_on(today: i32) -> RunContext {
    RunContext::new(V, f64::from(today) + 0.5)
}

pub fn gaia(catalogid: CatalogId, ra: Degree, dec: Degree) -> CatalogEntry {
    CatalogEntry {
        catalogid,
        ra,
        dec,
        lead: "gaia_dr3_source".into(),
        version_id: V,
    }
}

/// One APO field centred on the test targets around (150, 2).
pub fn apo_field() -> FieldList {
    FieldList::new(vec![Field {
        field_id: 1,
        ra: 150.0,
        dec: 2.0,
        observatory: Observatory::Apo,
    }])
    .unwrap()
}

pub const BATCH_COLUMNS: [&str; 9] = [
    "too_id",
    "fiber_type",
    "ra",
    "dec",
    "h_mag",
    "can_offset",
    "n_exposures",
    "active",
    "observe_until_mjd",
];

/// A minimal valid APOGEE row.
pub fn apogee_row(too_id: TooId, ra: Degree, dec: Degree) -> Vec<RawValue> {
    vec![
        RawValue::Int(too_id),
        RawValue::Str("APOGEE".into()),
        RawValue::Float(ra),
        RawValue::Float(dec),
        RawValue::Float(11.0),
        RawValue::Bool(false),
        RawValue::Int(1),
        RawValue::Bool(true),
        RawValue::Null,
    ]
}

pub fn apogee_batch(rows: &[(TooId, Degree, Degree)]) -> RawBatch {
    let mut batch = RawBatch::new(&BATCH_COLUMNS);
    for &(too_id, ra, dec) in rows {
        batch.push_row(apogee_row(too_id, ra, dec));
    }
    batch
}

/// Store wrapper injecting cone-search timeouts and commit conflicts.
pub struct FlakyStore {
    pub inner: MemoryStore,
    timeouts_left: AtomicU32,
    conflicts_left: u32,
    pub commit_attempts: u32,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore, timeouts: u32, conflicts: u32) -> Self {
        FlakyStore {
            inner,
            timeouts_left: AtomicU32::new(timeouts),
            conflicts_left: conflicts,
            commit_attempts: 0,
        }
    }
}

impl TooStore for FlakyStore {
    fn get_target(&self, too_id: TooId) -> Option<TooRecord> {
        self.inner.get_target(too_id)
    }

    fn insert_target(&mut self, record: TooRecord) -> Result<(), TooError> {
        self.inner.insert_target(record)
    }

    fn update_metadata(&mut self, too_id: TooId, metadata: TargetMetadata) -> Result<(), TooError> {
        self.inner.update_metadata(too_id, metadata)
    }

    fn targets(&self) -> Vec<TooRecord> {
        self.inner.targets()
    }

    fn n_targets(&self) -> usize {
        self.inner.n_targets()
    }

    fn insert_catalog(&mut self, entry: CatalogEntry) -> Result<(), TooError> {
        self.inner.insert_catalog(entry)
    }

    fn catalog_entry(&self, catalogid: CatalogId) -> Option<CatalogEntry> {
        self.inner.catalog_entry(catalogid)
    }

    fn cone_search(
        &self,
        ra: Degree,
        dec: Degree,
        radius: ArcSec,
        version: VersionId,
        timeout: Duration,
    ) -> Result<Vec<ConeHit>, TooError> {
        let fail = self
            .timeouts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TooError::Deadline(timeout));
        }
        self.inner.cone_search(ra, dec, radius, version, timeout)
    }

    fn max_catalogid_in_range(&self, min: CatalogId, max: CatalogId) -> Option<CatalogId> {
        self.inner.max_catalogid_in_range(min, max)
    }

    fn n_catalog(&self) -> usize {
        self.inner.n_catalog()
    }

    fn links_for_target(&self, too_id: TooId, version: VersionId) -> Vec<CrossMatchLink> {
        self.inner.links_for_target(too_id, version)
    }

    fn mint_and_link(&mut self, entry: CatalogEntry, link: CrossMatchLink) -> Result<usize, TooError> {
        self.inner.mint_and_link(entry, link)
    }

    fn insert_links(&mut self, links: &[CrossMatchLink]) -> Result<usize, TooError> {
        self.inner.insert_links(links)
    }

    fn retire_links(&mut self, too_id: TooId, version: VersionId) -> usize {
        self.inner.retire_links(too_id, version)
    }

    fn n_links(&self) -> usize {
        self.inner.n_links()
    }

    fn sdss_id_of(&self, catalogid: CatalogId) -> Option<SdssId> {
        self.inner.sdss_id_of(catalogid)
    }

    fn class_members(&self, sdss_id: SdssId) -> Vec<CatalogId> {
        self.inner.class_members(sdss_id)
    }

    fn sdss_ids(&self) -> Vec<SdssId> {
        self.inner.sdss_ids()
    }

    fn max_sdss_id(&self) -> Option<SdssId> {
        self.inner.max_sdss_id()
    }

    fn resolve_sdss_id(&self, sdss_id: SdssId) -> Option<SdssId> {
        self.inner.resolve_sdss_id(sdss_id)
    }

    fn commit_cluster(&mut self, change: &ClusterChange) -> Result<(), TooError> {
        self.commit_attempts += 1;
        if self.conflicts_left > 0 {
            self.conflicts_left -= 1;
            return Err(TooError::MergeConflict {
                sdss_id: change.sdss_id,
            });
        }
        self.inner.commit_cluster(change)
    }
}
