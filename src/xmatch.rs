//! # Spatial cross-match
//!
//! Links every target without a best match at a processing version to the master catalog.
//!
//! ## Overview
//!
//! 1. **Selection**: targets with a best link at `version` are skipped; use
//!    [`retire_matches`] to re-match them.
//! 2. **Pre-assigned targets**: a target carrying a `catalogid` is linked to it directly; one
//!    carrying only an `sdss_id` is linked to the smallest catalogid of that class.
//! 3. **Lookups**: the other targets run a cone search of radius
//!    [`XMatchParams::query_radius_arcsec`] (great-circle distance) on a rayon worker pool.
//!    A timed-out search is retried [`XMatchParams::lookup_retries`] times and then reported
//!    as a failed record, never as "no match".
//! 4. **Single writer**: results are consumed in `too_id` order. Candidates from the store
//!    are completed with the catalog identities minted earlier in the same run, sorted by
//!    `(distance, catalogid)`:
//!    - no candidate → a new catalog identity is minted at the target position in the ToO
//!      catalogid block, written together with its link by [`TooStore::mint_and_link`];
//!    - otherwise the nearest candidate is best. With
//!      [`XMatchParams::allow_multiple_bests`] every candidate within
//!      [`XMatchParams::best_tie_epsilon_arcsec`] of the nearest is best; without it a tie
//!      keeps the smallest catalogid and is reported as a
//!      [`TooError::CrossMatchAmbiguity`] (logged, never fatal).
//!
//!    Every candidate gets a link row; only the best set is flagged `best`.
//!
//! Given identical catalog state and parameters the best assignment is identical.

use std::fmt;
use std::time::Duration;

use itertools::Itertools;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::Deserialize;
use smallvec::SmallVec;
use tracing::{debug, info, instrument, warn};

use crate::constants::{
    catalogid_block, ArcSec, CatalogId, TooId, VersionId, DEFAULT_BEST_TIE_EPSILON_ARCSEC,
    DEFAULT_QUERY_RADIUS_ARCSEC, TOO_PROVENANCE, TOO_RUN_ID,
};
use crate::conversion::angular_separation;
use crate::datamodel::TooRecord;
use crate::store::{CatalogEntry, ConeHit, CrossMatchLink, TooStore};
use crate::too_errors::TooError;

/// Configuration of [`cross_match`].
///
/// Defaults
/// -----------------
/// * `query_radius_arcsec`: 1.0
/// * `allow_multiple_bests`: false
/// * `best_tie_epsilon_arcsec`: 1e-3
/// * `lookup_timeout`: 5 s
/// * `lookup_retries`: 2
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct XMatchParams {
    /// Cone-search radius (arcsec).
    pub query_radius_arcsec: ArcSec,
    /// Flag every candidate tied with the nearest as best.
    pub allow_multiple_bests: bool,
    /// Distance window above the nearest candidate within which candidates tie (arcsec).
    pub best_tie_epsilon_arcsec: ArcSec,
    /// Deadline of one cone search.
    pub lookup_timeout: Duration,
    /// Retries after a timed-out cone search.
    pub lookup_retries: u32,
}

impl Default for XMatchParams {
    fn default() -> Self {
        XMatchParams {
            query_radius_arcsec: DEFAULT_QUERY_RADIUS_ARCSEC,
            allow_multiple_bests: false,
            best_tie_epsilon_arcsec: DEFAULT_BEST_TIE_EPSILON_ARCSEC,
            lookup_timeout: Duration::from_secs(5),
            lookup_retries: 2,
        }
    }
}

impl XMatchParams {
    pub fn builder() -> XMatchParamsBuilder {
        XMatchParamsBuilder::default()
    }

    /// Check parameters built or deserialized without the builder.
    ///
    /// Validation rules
    /// -----------------
    /// * `query_radius_arcsec` finite and `> 0`
    /// * `best_tie_epsilon_arcsec >= 0` and smaller than the radius
    /// * `lookup_timeout > 0`
    pub fn validate(&self) -> Result<(), TooError> {
        if !(self.query_radius_arcsec.is_finite() && self.query_radius_arcsec > 0.0) {
            return Err(TooError::InvalidParameter(format!(
                "query_radius_arcsec must be finite and > 0, got {}",
                self.query_radius_arcsec
            )));
        }
        if !(self.best_tie_epsilon_arcsec >= 0.0
            && self.best_tie_epsilon_arcsec < self.query_radius_arcsec)
        {
            return Err(TooError::InvalidParameter(
                "best_tie_epsilon_arcsec must be in [0, query_radius_arcsec)".into(),
            ));
        }
        if self.lookup_timeout.is_zero() {
            return Err(TooError::InvalidParameter(
                "lookup_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`XMatchParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct XMatchParamsBuilder {
    params: XMatchParams,
}

impl XMatchParamsBuilder {
    pub fn query_radius_arcsec(mut self, v: ArcSec) -> Self {
        self.params.query_radius_arcsec = v;
        self
    }
    pub fn allow_multiple_bests(mut self, v: bool) -> Self {
        self.params.allow_multiple_bests = v;
        self
    }
    pub fn best_tie_epsilon_arcsec(mut self, v: ArcSec) -> Self {
        self.params.best_tie_epsilon_arcsec = v;
        self
    }
    pub fn lookup_timeout(mut self, v: Duration) -> Self {
        self.params.lookup_timeout = v;
        self
    }
    pub fn lookup_retries(mut self, v: u32) -> Self {
        self.params.lookup_retries = v;
        self
    }

    /// Finalize the builder; see [`XMatchParams::validate`].
    pub fn build(self) -> Result<XMatchParams, TooError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for XMatchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Cross-match Parameters")?;
            writeln!(f, "----------------------")?;
            writeln!(f, "  query_radius_arcsec     = {:.3}\"", self.query_radius_arcsec)?;
            writeln!(f, "  allow_multiple_bests    = {}", self.allow_multiple_bests)?;
            writeln!(
                f,
                "  best_tie_epsilon_arcsec = {:.1e}\"",
                self.best_tie_epsilon_arcsec
            )?;
            writeln!(f, "  lookup_timeout          = {:?}", self.lookup_timeout)?;
            writeln!(f, "  lookup_retries          = {}", self.lookup_retries)
        } else {
            write!(
                f,
                "XMatchParams(radius={:.3}\", multiple_bests={}, tie_eps={:.1e}\", timeout={:?}, retries={})",
                self.query_radius_arcsec,
                self.allow_multiple_bests,
                self.best_tie_epsilon_arcsec,
                self.lookup_timeout,
                self.lookup_retries
            )
        }
    }
}

/// Cross-match outcome of one target.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchUnit {
    pub too_id: TooId,
    /// Best catalogid(s), ascending distance.
    pub best: SmallVec<[CatalogId; 2]>,
    /// Other candidates within the radius, ascending distance.
    pub others: SmallVec<[CatalogId; 4]>,
    /// The best catalog identity was minted by this run.
    pub minted: bool,
}

impl MatchUnit {
    /// Every catalogid linked to the target.
    pub fn catalogids(&self) -> impl Iterator<Item = CatalogId> + '_ {
        self.best.iter().chain(&self.others).copied()
    }
}

/// Result of a cross-match run.
#[derive(Debug, Default, PartialEq)]
pub struct CrossMatchReport {
    pub units: Vec<MatchUnit>,
    pub failures: Vec<(TooId, TooError)>,
    /// [`TooError::CrossMatchAmbiguity`] records, resolved by the catalogid tiebreak.
    pub ambiguities: Vec<TooError>,
    /// Targets already matched at this version.
    pub n_skipped: usize,
    pub n_minted: usize,
    pub n_links: usize,
}

impl CrossMatchReport {
    pub fn n_attempted(&self) -> usize {
        self.units.len() + self.failures.len()
    }
}

impl fmt::Display for CrossMatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matched={} minted={} links={} ambiguous={} failed={} skipped={}",
            self.units.len(),
            self.n_minted,
            self.n_links,
            self.ambiguities.len(),
            self.failures.len(),
            self.n_skipped
        )
    }
}

/// Cone search with retries on timeout.
fn lookup_with_retry<S: TooStore>(
    store: &S,
    target: &TooRecord,
    version: VersionId,
    params: &XMatchParams,
) -> Result<Vec<ConeHit>, TooError> {
    let attempts = params.lookup_retries + 1;
    for attempt in 1..=attempts {
        match store.cone_search(
            target.core.ra,
            target.core.dec,
            params.query_radius_arcsec,
            version,
            params.lookup_timeout,
        ) {
            Err(TooError::Deadline(_)) => {
                debug!(too_id = target.too_id(), attempt, "cone search timed out");
            }
            other => return other,
        }
    }
    Err(TooError::LookupTimeout {
        too_id: target.too_id(),
        attempts,
    })
}

/// Link a target carrying its own catalogid or sdss_id.
fn link_assigned<S: TooStore>(
    store: &mut S,
    target: &TooRecord,
    version: VersionId,
) -> Result<(MatchUnit, usize), TooError> {
    let catalogid = match (target.core.catalogid, target.core.sdss_id) {
        (Some(cid), _) => cid,
        (None, Some(sdss_id)) => {
            let live = store
                .resolve_sdss_id(sdss_id)
                .ok_or(TooError::UnknownSdssId(sdss_id))?;
            store
                .class_members(live)
                .first()
                .copied()
                .ok_or(TooError::UnknownSdssId(sdss_id))?
        }
        (None, None) => {
            return Err(TooError::InvalidParameter(format!(
                "target {} carries no identity",
                target.too_id()
            )))
        }
    };
    let entry = store
        .catalog_entry(catalogid)
        .ok_or(TooError::UnknownCatalogId(catalogid))?;

    let link = CrossMatchLink {
        catalogid,
        too_id: target.too_id(),
        version_id: version,
        best: true,
        distance_arcsec: angular_separation(target.core.ra, target.core.dec, entry.ra, entry.dec),
    };
    let n_links = store.insert_links(&[link])?;
    let unit = MatchUnit {
        too_id: target.too_id(),
        best: SmallVec::from_slice(&[catalogid]),
        others: SmallVec::new(),
        minted: false,
    };
    Ok((unit, n_links))
}

/// Writer-side state carried across the targets of one run.
struct MatchWriter<'p> {
    version: VersionId,
    params: &'p XMatchParams,
    next_catalogid: CatalogId,
    max_catalogid: CatalogId,
    minted: Vec<CatalogEntry>,
    report: CrossMatchReport,
}

impl MatchWriter<'_> {
    /// Mint a catalog identity at the target position and link the target to it.
    fn mint<S: TooStore>(&mut self, store: &mut S, target: &TooRecord) -> Result<CatalogId, TooError> {
        if self.next_catalogid > self.max_catalogid {
            return Err(TooError::InvalidParameter(
                "ToO catalogid block is exhausted".into(),
            ));
        }
        let catalogid = self.next_catalogid;
        let entry = CatalogEntry {
            catalogid,
            ra: target.core.ra,
            dec: target.core.dec,
            lead: TOO_PROVENANCE.to_string(),
            version_id: self.version,
        };
        let link = CrossMatchLink {
            catalogid,
            too_id: target.too_id(),
            version_id: self.version,
            best: true,
            distance_arcsec: 0.0,
        };
        self.report.n_links += store.mint_and_link(entry.clone(), link)?;
        self.next_catalogid += 1;
        self.report.n_minted += 1;
        self.minted.push(entry);
        Ok(catalogid)
    }

    fn link_positional<S: TooStore>(
        &mut self,
        store: &mut S,
        target: &TooRecord,
        hits: Vec<ConeHit>,
    ) -> Result<MatchUnit, TooError> {
        let (ra, dec) = (target.core.ra, target.core.dec);
        let radius = self.params.query_radius_arcsec;

        let from_run = self.minted.iter().filter_map(|e| {
            let d = angular_separation(ra, dec, e.ra, e.dec);
            (d <= radius).then_some((d, e.catalogid))
        });
        let candidates: Vec<(ArcSec, CatalogId)> = hits
            .iter()
            .map(|h| (h.distance_arcsec, h.entry.catalogid))
            .chain(from_run)
            .sorted_by_key(|(d, c)| (OrderedFloat(*d), *c))
            .unique_by(|(_, c)| *c)
            .collect();

        let too_id = target.too_id();
        let Some(&(nearest, kept)) = candidates.first() else {
            let catalogid = self.mint(store, target)?;
            debug!(too_id, catalogid, "minted catalog identity");
            return Ok(MatchUnit {
                too_id,
                best: SmallVec::from_slice(&[catalogid]),
                others: SmallVec::new(),
                minted: true,
            });
        };

        let n_tied = candidates
            .iter()
            .take_while(|(d, _)| d - nearest <= self.params.best_tie_epsilon_arcsec)
            .count();
        let n_best = if self.params.allow_multiple_bests {
            n_tied
        } else {
            if n_tied > 1 {
                warn!(too_id, n_tied, nearest, kept, "ambiguous cross-match, keeping smallest catalogid");
                self.report.ambiguities.push(TooError::CrossMatchAmbiguity {
                    too_id,
                    n_tied,
                    distance_arcsec: nearest,
                    kept,
                });
            }
            1
        };

        let links: Vec<CrossMatchLink> = candidates
            .iter()
            .enumerate()
            .map(|(i, &(distance_arcsec, catalogid))| CrossMatchLink {
                catalogid,
                too_id,
                version_id: self.version,
                best: i < n_best,
                distance_arcsec,
            })
            .collect();
        self.report.n_links += store.insert_links(&links)?;

        Ok(MatchUnit {
            too_id,
            best: candidates[..n_best].iter().map(|(_, c)| *c).collect(),
            others: candidates[n_best..].iter().map(|(_, c)| *c).collect(),
            minted: false,
        })
    }
}

/// Cross-match every target lacking a best link at `version`.
///
/// Arguments
/// -----------------
/// * `store`: the store; read concurrently for the lookups, written by a single writer.
/// * `version`: the processing version the links are recorded under.
/// * `params`: radius, best policy, timeouts.
///
/// Return
/// ----------
/// * a [`CrossMatchReport`] with one [`MatchUnit`] per matched target and the failed
///   records. Fails as a whole on invalid `params` (before any read), on store write errors
///   or when the ToO catalogid block is exhausted.
///
/// See also
/// ------------
/// * [`retire_matches`] – allow targets to be matched again.
#[instrument(skip(store, params), fields(params = %params))]
pub fn cross_match<S: TooStore>(
    store: &mut S,
    version: VersionId,
    params: &XMatchParams,
) -> Result<CrossMatchReport, TooError> {
    params.validate()?;
    let targets = store.targets();
    let n_total = targets.len();
    let (pending, matched): (Vec<TooRecord>, Vec<TooRecord>) = targets
        .into_iter()
        .partition(|t| !store.has_best_link(t.too_id(), version));
    let (assigned, positional): (Vec<TooRecord>, Vec<TooRecord>) = pending
        .into_iter()
        .partition(|t| t.core.catalogid.is_some() || t.core.sdss_id.is_some());

    let lookups: Vec<(TooRecord, Result<Vec<ConeHit>, TooError>)> = {
        let reader: &S = store;
        positional
            .into_par_iter()
            .map(|t| {
                let hits = lookup_with_retry(reader, &t, version, params);
                (t, hits)
            })
            .collect()
    };

    let (block_min, block_max) = catalogid_block(TOO_RUN_ID);
    let mut writer = MatchWriter {
        version,
        params,
        next_catalogid: store
            .max_catalogid_in_range(block_min, block_max)
            .map_or(block_min, |m| m + 1),
        max_catalogid: block_max,
        minted: Vec::new(),
        report: CrossMatchReport {
            n_skipped: matched.len(),
            ..Default::default()
        },
    };

    for target in &assigned {
        match link_assigned(store, target, version) {
            Ok((unit, n_links)) => {
                writer.report.n_links += n_links;
                writer.report.units.push(unit);
            }
            Err(err) if err.is_record_level() => {
                warn!(too_id = target.too_id(), error = %err, "pre-assigned identity rejected");
                writer.report.failures.push((target.too_id(), err));
            }
            Err(err) => return Err(err),
        }
    }

    for (target, hits) in lookups {
        let outcome = hits.and_then(|hits| writer.link_positional(store, &target, hits));
        match outcome {
            Ok(unit) => writer.report.units.push(unit),
            Err(err) if err.is_record_level() => {
                warn!(too_id = target.too_id(), error = %err, "cross-match failed");
                writer.report.failures.push((target.too_id(), err));
            }
            Err(err) => return Err(err),
        }
    }

    let report = writer.report;
    info!(total = n_total, %report, "cross-match done");
    Ok(report)
}

/// Remove the links of targets at a version so the next run matches them again.
///
/// Return
/// ----------
/// * the number of links removed.
pub fn retire_matches<S: TooStore>(store: &mut S, too_ids: &[TooId], version: VersionId) -> usize {
    let removed = too_ids
        .iter()
        .map(|id| store.retire_links(*id, version))
        .sum();
    info!(targets = too_ids.len(), removed, "retired cross-match links");
    removed
}
