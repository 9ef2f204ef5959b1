//! # Target, catalog and identity store
//!
//! The pipeline runs against a transactional store reached through the query primitives
//! of [`TooStore`]. Reads take `&self` so cone searches can be fanned out over a worker
//! pool; every write takes `&mut self`, which makes the identity stage single-writer.
//!
//! ## Overview
//!
//! * **Targets**: point lookup by `too_id`, insert, metadata update.
//! * **Catalog**: catalog identities ([`CatalogEntry`]) with a cone search bounded by a
//!   caller-supplied timeout.
//! * **Cross-match links**: [`CrossMatchLink`] rows per (target, version), insert and
//!   retire. A catalog identity minted for a target is written with its link in one
//!   [`TooStore::mint_and_link`] call.
//! * **Stable identities**: the catalogid → sdss_id mapping, its monotonic counter, alias
//!   resolution, and [`TooStore::commit_cluster`], which applies one [`ClusterChange`]
//!   atomically or not at all.
//!
//! [`MemoryStore`] is the in-process implementation used by the tests and by callers
//! without a database.

pub mod memory;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{ArcSec, CatalogId, Degree, SdssId, TooId, VersionId};
use crate::datamodel::{TargetMetadata, TooRecord};
use crate::too_errors::TooError;

pub use memory::MemoryStore;

/// One master-catalog identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub catalogid: CatalogId,
    pub ra: Degree,
    pub dec: Degree,
    /// Provenance tag of the parent survey (e.g. `gaia_dr3_source`, `too_target`).
    pub lead: String,
    pub version_id: VersionId,
}

/// A catalog identity found by a cone search, with its separation from the query centre.
#[derive(Debug, Clone, PartialEq)]
pub struct ConeHit {
    pub entry: CatalogEntry,
    pub distance_arcsec: ArcSec,
}

/// A target matched to a catalog identity at a processing version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossMatchLink {
    pub catalogid: CatalogId,
    pub too_id: TooId,
    pub version_id: VersionId,
    pub best: bool,
    pub distance_arcsec: ArcSec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterChangeKind {
    /// A new sdss_id for catalog identities without one.
    Minted,
    /// New members added to one existing sdss_id.
    Extended,
    /// Several sdss_ids unified into the smallest one.
    Merged,
}

impl fmt::Display for ClusterChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterChangeKind::Minted => write!(f, "minted"),
            ClusterChangeKind::Extended => write!(f, "extended"),
            ClusterChangeKind::Merged => write!(f, "merged"),
        }
    }
}

/// Full rewrite of one identity cluster, committed atomically.
///
/// The change also states what it expects to find (unmapped `new_members`, live
/// `absorbed` classes whose members are exactly `rewritten`); a store that finds
/// anything else rejects the whole change with [`TooError::MergeConflict`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterChange {
    /// The surviving (or newly minted) sdss_id.
    pub sdss_id: SdssId,
    pub kind: ClusterChangeKind,
    /// Catalog identities without an sdss_id that join the cluster.
    pub new_members: Vec<CatalogId>,
    /// sdss_ids merged into `sdss_id`; each becomes an alias.
    pub absorbed: Vec<SdssId>,
    /// Members of the absorbed classes, re-pointed to `sdss_id`.
    pub rewritten: Vec<CatalogId>,
}

impl ClusterChange {
    /// Number of catalogid → sdss_id rows the change writes.
    pub fn n_rows(&self) -> usize {
        self.new_members.len() + self.rewritten.len()
    }
}

/// Query primitives the pipeline needs from its backing store.
///
/// Implementations must be `Sync`: cone searches are issued concurrently through `&self`.
pub trait TooStore: Sync {
    // --- targets ---

    fn get_target(&self, too_id: TooId) -> Option<TooRecord>;

    /// Insert a new target; `TooError::DuplicateIdentity` if the id exists.
    fn insert_target(&mut self, record: TooRecord) -> Result<(), TooError>;

    /// Replace the metadata of an existing target; `TooError::UnknownTarget` otherwise.
    fn update_metadata(&mut self, too_id: TooId, metadata: TargetMetadata) -> Result<(), TooError>;

    /// Snapshot of every target, by ascending `too_id`.
    fn targets(&self) -> Vec<TooRecord>;

    fn n_targets(&self) -> usize;

    // --- catalog ---

    /// Insert a catalog identity; inserting the identical entry twice is a no-op.
    fn insert_catalog(&mut self, entry: CatalogEntry) -> Result<(), TooError>;

    fn catalog_entry(&self, catalogid: CatalogId) -> Option<CatalogEntry>;

    /// All catalog identities of `version` within `radius` arcsec of `(ra, dec)`
    /// (great-circle distance), sorted by `(distance, catalogid)`. A negative or non-finite
    /// radius matches nothing.
    ///
    /// Return
    /// ----------
    /// * `Err(TooError::Deadline)` if the query does not complete within `timeout`.
    fn cone_search(
        &self,
        ra: Degree,
        dec: Degree,
        radius: ArcSec,
        version: VersionId,
        timeout: Duration,
    ) -> Result<Vec<ConeHit>, TooError>;

    /// Largest catalogid in `[min, max]`.
    fn max_catalogid_in_range(&self, min: CatalogId, max: CatalogId) -> Option<CatalogId>;

    fn n_catalog(&self) -> usize;

    // --- cross-match links ---

    /// Links of a target at a version, by ascending catalogid.
    fn links_for_target(&self, too_id: TooId, version: VersionId) -> Vec<CrossMatchLink>;

    /// Insert a newly minted catalog identity together with its first link, both or neither.
    ///
    /// Return
    /// ----------
    /// * the number of links inserted (0 if the link was already stored).
    /// * `Err(TooError::InvalidParameter)` if the link does not point at `entry` or the
    ///   catalogid exists with different content; nothing is written in that case.
    fn mint_and_link(&mut self, entry: CatalogEntry, link: CrossMatchLink) -> Result<usize, TooError>;

    /// Insert links, ignoring those already stored for the same
    /// (catalogid, too_id, version). Returns the number actually inserted.
    fn insert_links(&mut self, links: &[CrossMatchLink]) -> Result<usize, TooError>;

    /// Remove every link of a target at a version. Returns the number removed.
    fn retire_links(&mut self, too_id: TooId, version: VersionId) -> usize;

    fn n_links(&self) -> usize;

    /// `true` if the target has a best link at the version.
    fn has_best_link(&self, too_id: TooId, version: VersionId) -> bool {
        self.links_for_target(too_id, version)
            .iter()
            .any(|l| l.best)
    }

    // --- stable identities ---

    fn sdss_id_of(&self, catalogid: CatalogId) -> Option<SdssId>;

    /// Members of a live class, ascending.
    fn class_members(&self, sdss_id: SdssId) -> Vec<CatalogId>;

    /// Every live (non-absorbed) sdss_id, ascending.
    fn sdss_ids(&self) -> Vec<SdssId>;

    /// Largest sdss_id ever minted, aliases included.
    fn max_sdss_id(&self) -> Option<SdssId>;

    /// Follow the alias chain of a possibly absorbed sdss_id to its live class.
    fn resolve_sdss_id(&self, sdss_id: SdssId) -> Option<SdssId>;

    /// Apply a cluster change atomically.
    ///
    /// Return
    /// ----------
    /// * `Err(TooError::MergeConflict)` if the current mapping differs from what the change
    ///   expects; nothing is written in that case.
    /// * `Err(TooError::UnknownCatalogId)` if a member is not in the catalog.
    fn commit_cluster(&mut self, change: &ClusterChange) -> Result<(), TooError>;
}
