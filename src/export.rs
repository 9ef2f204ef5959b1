//! # Exports
//!
//! ## Identity diff
//!
//! The identity resolver appends every committed [`ClusterChange`] to a [`DiffJournal`].
//! [`DiffJournal::drain`] turns the journal into an [`IdentityDiff`] with two ordered sets:
//!
//! * **members** ([`SdssIdFlatRow`]): one row per catalogid → sdss_id row written by the
//!   run, sorted by `(sdss_id, catalogid)`;
//! * **clusters** ([`SdssIdStackedRow`]): one row per sdss_id created or changed by the run,
//!   sorted by `sdss_id`; absorbed ids carry `merged_into`.
//!
//! Draining empties the journal, so a second export without an intervening resolver run is
//! empty. [`write_identity_diff`] appends both sets to `<root>/<run_date>/` CSV files.
//!
//! ## Active targets
//!
//! [`write_active_targets`] writes the output of
//! [`select_active_targets`](crate::select::select_active_targets) as CSV.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::constants::{CatalogId, Degree, SdssId, VersionId};
use crate::select::ActiveTarget;
use crate::store::{ClusterChange, TooStore};
use crate::too_errors::TooError;

pub const FLAT_FILE_NAME: &str = "sdss_id_flat.csv";
pub const STACKED_FILE_NAME: &str = "sdss_id_stacked.csv";

/// A catalogid → sdss_id row written by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdssIdFlatRow {
    pub sdss_id: SdssId,
    pub catalogid: CatalogId,
    pub version_id: VersionId,
    pub ra_catalogid: Degree,
    pub dec_catalogid: Degree,
}

/// A cluster representative row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdssIdStackedRow {
    pub sdss_id: SdssId,
    /// Smallest member, `None` for an absorbed id.
    pub catalogid: Option<CatalogId>,
    pub n_members: usize,
    pub ra_sdss_id: Option<Degree>,
    pub dec_sdss_id: Option<Degree>,
    /// Surviving sdss_id when this id was absorbed by a merge.
    pub merged_into: Option<SdssId>,
}

/// Ordered diff of one or more resolver runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityDiff {
    pub members: Vec<SdssIdFlatRow>,
    pub clusters: Vec<SdssIdStackedRow>,
}

impl IdentityDiff {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.clusters.is_empty()
    }
}

/// Rows committed since the last drain, keyed so later changes supersede earlier ones.
#[derive(Debug, Clone, Default)]
pub struct DiffJournal {
    members: BTreeMap<(SdssId, CatalogId), SdssIdFlatRow>,
    clusters: BTreeMap<SdssId, SdssIdStackedRow>,
}

impl DiffJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.clusters.is_empty()
    }

    /// Record a committed change, reading the post-commit state from `store`.
    pub fn record<S: TooStore>(&mut self, store: &S, change: &ClusterChange, version: VersionId) {
        let survivor = change.sdss_id;

        // Rows of a previous change keyed on an id that is now absorbed are superseded.
        self.members
            .retain(|(sdss_id, _), _| !change.absorbed.contains(sdss_id));

        for &catalogid in change.new_members.iter().chain(&change.rewritten) {
            let (ra, dec) = store
                .catalog_entry(catalogid)
                .map_or((f64::NAN, f64::NAN), |e| (e.ra, e.dec));
            self.members.insert(
                (survivor, catalogid),
                SdssIdFlatRow {
                    sdss_id: survivor,
                    catalogid,
                    version_id: version,
                    ra_catalogid: ra,
                    dec_catalogid: dec,
                },
            );
        }

        let members = store.class_members(survivor);
        let representative = members.first().copied();
        let position = representative.and_then(|c| store.catalog_entry(c));
        self.clusters.insert(
            survivor,
            SdssIdStackedRow {
                sdss_id: survivor,
                catalogid: representative,
                n_members: members.len(),
                ra_sdss_id: position.as_ref().map(|e| e.ra),
                dec_sdss_id: position.as_ref().map(|e| e.dec),
                merged_into: None,
            },
        );
        for &absorbed in &change.absorbed {
            self.clusters.insert(
                absorbed,
                SdssIdStackedRow {
                    sdss_id: absorbed,
                    catalogid: None,
                    n_members: 0,
                    ra_sdss_id: None,
                    dec_sdss_id: None,
                    merged_into: Some(survivor),
                },
            );
        }
    }

    /// Take every recorded row, leaving the journal empty.
    pub fn drain(&mut self) -> IdentityDiff {
        IdentityDiff {
            members: std::mem::take(&mut self.members).into_values().collect(),
            clusters: std::mem::take(&mut self.clusters).into_values().collect(),
        }
    }
}

/// Drain a journal into an ordered diff. A second call without new commits is empty.
pub fn drain_diff(journal: &mut DiffJournal) -> IdentityDiff {
    journal.drain()
}

fn append_csv<T: Serialize>(path: &Utf8Path, rows: &[T]) -> Result<(), TooError> {
    let needs_header = fs::metadata(path).map_or(true, |m| m.len() == 0);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Append an identity diff to `<root>/<run_date>/sdss_id_flat.csv` and
/// `<root>/<run_date>/sdss_id_stacked.csv`.
///
/// The header is written when a file is created. An empty diff writes nothing.
///
/// Return
/// ----------
/// * the paths of the flat and stacked files.
pub fn write_identity_diff(
    diff: &IdentityDiff,
    root: &Utf8Path,
    run_date: &str,
) -> Result<(Utf8PathBuf, Utf8PathBuf), TooError> {
    let dir = root.join(run_date);
    let flat = dir.join(FLAT_FILE_NAME);
    let stacked = dir.join(STACKED_FILE_NAME);
    if diff.is_empty() {
        return Ok((flat, stacked));
    }

    fs::create_dir_all(&dir)?;
    append_csv(&flat, &diff.members)?;
    append_csv(&stacked, &diff.clusters)?;

    info!(
        dir = %dir,
        members = diff.members.len(),
        clusters = diff.clusters.len(),
        "identity diff exported"
    );
    Ok((flat, stacked))
}

/// Write the selected targets as CSV.
///
/// Arguments
/// -----------------
/// * `rows`: output of the active-target selection.
/// * `path`: destination file.
/// * `overwrite`: replace an existing file instead of failing with `TooError::FileExists`.
pub fn write_active_targets(
    rows: &[ActiveTarget],
    path: &Utf8Path,
    overwrite: bool,
) -> Result<(), TooError> {
    if path.exists() && !overwrite {
        return Err(TooError::FileExists(path.to_string()));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!(path = %path, rows = rows.len(), "active targets exported");
    Ok(())
}
