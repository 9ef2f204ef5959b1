//! In-memory [`TooStore`].
//!
//! Catalog identities are indexed by declination; a cone search scans the declination
//! band of the cone, prefilters on the unit-vector dot product and keeps the entries
//! whose haversine distance is within the radius.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use nalgebra::Vector3;
use ordered_float::OrderedFloat;

use crate::constants::{
    ArcSec, CatalogId, Degree, FastHashMap, SdssId, TooId, VersionId, ARCSEC_PER_DEG, RADSEC,
};
use crate::conversion::{angular_separation, radec_to_unit_vector};
use crate::datamodel::{TargetMetadata, TooRecord};
use crate::too_errors::TooError;

use super::{CatalogEntry, ClusterChange, ClusterChangeKind, ConeHit, CrossMatchLink, TooStore};

/// Scanned entries between two deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    targets: BTreeMap<TooId, TooRecord>,

    catalog: FastHashMap<CatalogId, CatalogEntry>,
    unit_vectors: FastHashMap<CatalogId, Vector3<f64>>,
    dec_index: BTreeSet<(OrderedFloat<f64>, CatalogId)>,

    links: BTreeMap<(TooId, VersionId), Vec<CrossMatchLink>>,

    sdss_of: FastHashMap<CatalogId, SdssId>,
    classes: BTreeMap<SdssId, BTreeSet<CatalogId>>,
    aliases: FastHashMap<SdssId, SdssId>,
    sdss_counter: Option<SdssId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with catalog identities.
    pub fn with_catalog<I: IntoIterator<Item = CatalogEntry>>(entries: I) -> Result<Self, TooError> {
        let mut store = Self::new();
        for entry in entries {
            store.insert_catalog(entry)?;
        }
        Ok(store)
    }

    /// `Ok(true)` if the identical entry is already stored.
    fn check_catalog(&self, entry: &CatalogEntry) -> Result<bool, TooError> {
        match self.catalog.get(&entry.catalogid) {
            Some(existing) if existing == entry => Ok(true),
            Some(_) => Err(TooError::InvalidParameter(format!(
                "catalogid {} already exists with different content",
                entry.catalogid
            ))),
            None => Ok(false),
        }
    }

    fn is_live(&self, sdss_id: SdssId) -> bool {
        self.classes.contains_key(&sdss_id)
    }

    /// Check a change against the current mapping without writing anything.
    fn check_change(&self, change: &ClusterChange) -> Result<(), TooError> {
        let conflict = || TooError::MergeConflict {
            sdss_id: change.sdss_id,
        };

        for cid in change.new_members.iter().chain(&change.rewritten) {
            if !self.catalog.contains_key(cid) {
                return Err(TooError::UnknownCatalogId(*cid));
            }
        }
        if change.new_members.iter().any(|c| self.sdss_of.contains_key(c)) {
            return Err(conflict());
        }

        match change.kind {
            ClusterChangeKind::Minted => {
                if self.is_live(change.sdss_id)
                    || self.aliases.contains_key(&change.sdss_id)
                    || !change.absorbed.is_empty()
                    || !change.rewritten.is_empty()
                {
                    return Err(conflict());
                }
            }
            ClusterChangeKind::Extended => {
                if !self.is_live(change.sdss_id) || !change.absorbed.is_empty() {
                    return Err(conflict());
                }
            }
            ClusterChangeKind::Merged => {
                if !self.is_live(change.sdss_id) {
                    return Err(conflict());
                }
                let mut expected = BTreeSet::new();
                for absorbed in &change.absorbed {
                    if *absorbed == change.sdss_id || !self.is_live(*absorbed) {
                        return Err(conflict());
                    }
                    if let Some(members) = self.classes.get(absorbed) {
                        expected.extend(members.iter().copied());
                    }
                }
                let rewritten: BTreeSet<CatalogId> = change.rewritten.iter().copied().collect();
                if rewritten != expected {
                    return Err(conflict());
                }
            }
        }
        Ok(())
    }
}

impl TooStore for MemoryStore {
    fn get_target(&self, too_id: TooId) -> Option<TooRecord> {
        self.targets.get(&too_id).cloned()
    }

    fn insert_target(&mut self, record: TooRecord) -> Result<(), TooError> {
        let too_id = record.too_id();
        if self.targets.contains_key(&too_id) {
            return Err(TooError::DuplicateIdentity { too_id });
        }
        self.targets.insert(too_id, record);
        Ok(())
    }

    fn update_metadata(&mut self, too_id: TooId, metadata: TargetMetadata) -> Result<(), TooError> {
        let target = self
            .targets
            .get_mut(&too_id)
            .ok_or(TooError::UnknownTarget(too_id))?;
        target.metadata = metadata;
        Ok(())
    }

    fn targets(&self) -> Vec<TooRecord> {
        self.targets.values().cloned().collect()
    }

    fn n_targets(&self) -> usize {
        self.targets.len()
    }

    fn insert_catalog(&mut self, entry: CatalogEntry) -> Result<(), TooError> {
        if self.check_catalog(&entry)? {
            return Ok(());
        }
        self.unit_vectors
            .insert(entry.catalogid, radec_to_unit_vector(entry.ra, entry.dec));
        self.dec_index
            .insert((OrderedFloat(entry.dec), entry.catalogid));
        self.catalog.insert(entry.catalogid, entry);
        Ok(())
    }

    fn catalog_entry(&self, catalogid: CatalogId) -> Option<CatalogEntry> {
        self.catalog.get(&catalogid).cloned()
    }

    fn cone_search(
        &self,
        ra: Degree,
        dec: Degree,
        radius: ArcSec,
        version: VersionId,
        timeout: Duration,
    ) -> Result<Vec<ConeHit>, TooError> {
        if !(radius.is_finite() && radius >= 0.0) {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let radius_deg = radius / ARCSEC_PER_DEG;
        let lo = (OrderedFloat(dec - radius_deg), CatalogId::MIN);
        let hi = (OrderedFloat(dec + radius_deg), CatalogId::MAX);

        let centre = radec_to_unit_vector(ra, dec);
        // slack absorbs rounding of the dot product for very small radii
        let min_dot = (radius * RADSEC).cos() - 1e-12;

        let mut hits = Vec::new();
        for (n, (_, cid)) in self.dec_index.range(lo..=hi).enumerate() {
            if n % DEADLINE_CHECK_INTERVAL == 0 && start.elapsed() > timeout {
                return Err(TooError::Deadline(timeout));
            }
            let (Some(entry), Some(v)) = (self.catalog.get(cid), self.unit_vectors.get(cid)) else {
                continue;
            };
            if entry.version_id != version || centre.dot(v) < min_dot {
                continue;
            }
            let distance = angular_separation(ra, dec, entry.ra, entry.dec);
            if distance <= radius {
                hits.push(ConeHit {
                    entry: entry.clone(),
                    distance_arcsec: distance,
                });
            }
        }

        hits.sort_by_key(|h| (OrderedFloat(h.distance_arcsec), h.entry.catalogid));
        Ok(hits)
    }

    fn max_catalogid_in_range(&self, min: CatalogId, max: CatalogId) -> Option<CatalogId> {
        self.catalog
            .keys()
            .copied()
            .filter(|c| (min..=max).contains(c))
            .max()
    }

    fn n_catalog(&self) -> usize {
        self.catalog.len()
    }

    fn links_for_target(&self, too_id: TooId, version: VersionId) -> Vec<CrossMatchLink> {
        self.links
            .get(&(too_id, version))
            .cloned()
            .unwrap_or_default()
    }

    fn mint_and_link(&mut self, entry: CatalogEntry, link: CrossMatchLink) -> Result<usize, TooError> {
        if link.catalogid != entry.catalogid {
            return Err(TooError::InvalidParameter(format!(
                "link to catalogid {} cannot introduce catalogid {}",
                link.catalogid, entry.catalogid
            )));
        }
        self.check_catalog(&entry)?;
        // both writes below are infallible once the entry is checked
        self.insert_catalog(entry)?;
        self.insert_links(std::slice::from_ref(&link))
    }

    fn insert_links(&mut self, links: &[CrossMatchLink]) -> Result<usize, TooError> {
        for link in links {
            if !self.catalog.contains_key(&link.catalogid) {
                return Err(TooError::UnknownCatalogId(link.catalogid));
            }
        }
        let mut inserted = 0;
        for link in links {
            let rows = self.links.entry((link.too_id, link.version_id)).or_default();
            if rows.iter().any(|l| l.catalogid == link.catalogid) {
                continue;
            }
            rows.push(link.clone());
            rows.sort_by_key(|l| l.catalogid);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn retire_links(&mut self, too_id: TooId, version: VersionId) -> usize {
        self.links
            .remove(&(too_id, version))
            .map_or(0, |rows| rows.len())
    }

    fn n_links(&self) -> usize {
        self.links.values().map(Vec::len).sum()
    }

    fn sdss_id_of(&self, catalogid: CatalogId) -> Option<SdssId> {
        self.sdss_of.get(&catalogid).copied()
    }

    fn class_members(&self, sdss_id: SdssId) -> Vec<CatalogId> {
        self.classes
            .get(&sdss_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    fn sdss_ids(&self) -> Vec<SdssId> {
        self.classes.keys().copied().collect()
    }

    fn max_sdss_id(&self) -> Option<SdssId> {
        self.sdss_counter
    }

    fn resolve_sdss_id(&self, sdss_id: SdssId) -> Option<SdssId> {
        let mut current = sdss_id;
        // alias chains are acyclic: every alias points to a smaller id
        while let Some(next) = self.aliases.get(&current) {
            current = *next;
        }
        self.is_live(current).then_some(current)
    }

    fn commit_cluster(&mut self, change: &ClusterChange) -> Result<(), TooError> {
        self.check_change(change)?;

        let survivor = change.sdss_id;
        for absorbed in &change.absorbed {
            self.classes.remove(absorbed);
            self.aliases.insert(*absorbed, survivor);
        }
        let members = self.classes.entry(survivor).or_default();
        for cid in change.rewritten.iter().chain(&change.new_members) {
            members.insert(*cid);
            self.sdss_of.insert(*cid, survivor);
        }
        if change.kind == ClusterChangeKind::Minted {
            self.sdss_counter = Some(self.sdss_counter.map_or(survivor, |c| c.max(survivor)));
        }
        Ok(())
    }
}
