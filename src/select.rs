//! # Active-target selection
//!
//! Computes the targets that can be handed to the scheduler on a given night.
//!
//! ## Overview
//!
//! Selection is a pure function of a store snapshot, the reference MJD, the field list of
//! the tiling plan, the observatory, a [`BrightNeighborMask`] and the [`DesignModeLimits`];
//! nothing is written.
//!
//! 1. **Predicate**: `active && !observed && priority > 0 && observe_from_mjd <= today`
//!    and an open (or absent) `observe_until_mjd`.
//! 2. **Propagation**: targets with a proper motion are moved to the reference date.
//! 3. **Field**: the target is assigned its nearest field centre and kept only if that
//!    field belongs to [`SelectorParams::observatory`]. With
//!    [`SelectorParams::check_field_separation`] it must also lie within the focal-plane
//!    radius of the observatory. An optional [`SelectorParams::min_altitude_deg`] further
//!    requires the target to culminate above that altitude.
//! 4. **Decision**: with `flagged` the mask lookup, `passes` the magnitude check of the
//!    target's design mode, and `offsettable = can_offset && !inertial`:
//!
//! | flagged | offsettable | passes | result                                     |
//! |---------|-------------|--------|--------------------------------------------|
//! | yes     | no          | any    | excluded                                   |
//! | yes     | yes         | yes    | excluded                                   |
//! | any     | yes         | no     | offset; kept if the offset position is clean |
//! | no      | no          | no     | excluded                                   |
//! | no      | any         | yes    | kept at the nominal position               |
//!
//! Targets are evaluated in parallel; output order is ascending `too_id`.

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::constants::{CatalogId, Degree, SdssId, TooId, VersionId, MJD};
use crate::conversion::{offset_radec, propagate_position};
use crate::datamodel::{FiberType, SkyBrightnessMode, TooRecord};
use crate::field::FieldList;
use crate::mask::{check_mag_limits, BrightNeighborMask, DesignModeLimits, Observatory};
use crate::store::TooStore;
use crate::too_errors::TooError;

/// Configuration of [`select_active_targets`].
///
/// Defaults
/// -----------------
/// * `observatory`: APO
/// * `check_field_separation`: false
/// * `min_altitude_deg`: none
/// * `limits`: [`DesignModeLimits::default`]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SelectorParams {
    pub observatory: Observatory,
    /// Exclude targets farther from their field centre than the focal-plane radius.
    pub check_field_separation: bool,
    /// Minimum culmination altitude for a target to be observable (degrees).
    pub min_altitude_deg: Option<Degree>,
    pub limits: DesignModeLimits,
}

impl Default for SelectorParams {
    fn default() -> Self {
        SelectorParams {
            observatory: Observatory::Apo,
            check_field_separation: false,
            min_altitude_deg: None,
            limits: DesignModeLimits::default(),
        }
    }
}

impl SelectorParams {
    pub fn builder() -> SelectorParamsBuilder {
        SelectorParamsBuilder::default()
    }

    /// Check parameters built or deserialized without the builder: `min_altitude_deg`,
    /// when set, must lie in `[0, 90]`.
    pub fn validate(&self) -> Result<(), TooError> {
        if let Some(alt) = self.min_altitude_deg {
            if !(0.0..=90.0).contains(&alt) {
                return Err(TooError::InvalidParameter(
                    "min_altitude_deg must be in [0, 90]".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectorParamsBuilder {
    params: SelectorParams,
}

impl SelectorParamsBuilder {
    pub fn observatory(mut self, v: Observatory) -> Self {
        self.params.observatory = v;
        self
    }
    pub fn check_field_separation(mut self, v: bool) -> Self {
        self.params.check_field_separation = v;
        self
    }
    pub fn min_altitude_deg(mut self, v: Degree) -> Self {
        self.params.min_altitude_deg = Some(v);
        self
    }
    pub fn limits(mut self, v: DesignModeLimits) -> Self {
        self.params.limits = v;
        self
    }

    /// Finalize the builder; see [`SelectorParams::validate`].
    pub fn build(self) -> Result<SelectorParams, TooError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for SelectorParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_altitude = match self.min_altitude_deg {
            Some(alt) => format!("{alt:.1}°"),
            None => "none".to_string(),
        };
        if f.alternate() {
            writeln!(f, "Selector Parameters")?;
            writeln!(f, "-------------------")?;
            writeln!(f, "  observatory            = {}", self.observatory)?;
            writeln!(f, "  check_field_separation = {}", self.check_field_separation)?;
            writeln!(f, "  min_altitude_deg       = {min_altitude}")
        } else {
            write!(
                f,
                "SelectorParams(observatory={}, check_separation={}, min_altitude={min_altitude})",
                self.observatory, self.check_field_separation
            )
        }
    }
}

/// One selected target, as exported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTarget {
    pub too_id: TooId,
    pub fiber_type: FiberType,
    pub catalogid: Option<CatalogId>,
    pub sdss_id: Option<SdssId>,
    /// Position to observe, offset applied.
    pub ra: Degree,
    pub dec: Degree,
    /// Position at the reference date, before any offset.
    pub ra_nominal: Degree,
    pub dec_nominal: Degree,
    /// Nearest field of the observatory and its distance from the nominal position.
    pub field_id: i32,
    pub field_separation: Degree,
    pub offset_applied: bool,
    pub delta_ra: f32,
    pub delta_dec: f32,
    pub sky_brightness_mode: SkyBrightnessMode,
    pub can_offset: bool,
    pub inertial: bool,
    pub n_exposures: i16,
    pub priority: i16,
    pub observe_from_mjd: i32,
    pub observe_until_mjd: Option<i32>,
}

/// Why an eligible target was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exclusion {
    /// The nearest field belongs to the other observatory.
    OtherObservatory,
    /// Farther from the nearest field centre than the focal-plane radius.
    OutsideField,
    /// Never rises above the minimum altitude.
    NotVisible,
    /// Flagged by the mask and no offset is allowed or useful.
    BrightNeighbor,
    /// Too bright for the design mode and cannot be offset.
    MagnitudeLimit,
    /// The offset position is flagged by the mask.
    OffsetFlagged,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Exclusion::OtherObservatory => "other observatory",
            Exclusion::OutsideField => "outside field",
            Exclusion::NotVisible => "not visible",
            Exclusion::BrightNeighbor => "bright neighbour",
            Exclusion::MagnitudeLimit => "magnitude limit",
            Exclusion::OffsetFlagged => "offset position flagged",
        };
        write!(f, "{reason}")
    }
}

/// Result of a selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub targets: Vec<ActiveTarget>,
    /// Targets passing the predicate but rejected by the astrophysical checks.
    pub excluded: Vec<(TooId, Exclusion)>,
}

/// Scheduling predicate on the stored state.
pub fn is_schedulable(record: &TooRecord, today: i32) -> bool {
    let m = &record.metadata;
    m.active
        && !m.observed
        && m.priority > 0
        && m.observe_from_mjd <= today
        && m.observe_until_mjd.map_or(true, |until| until >= today)
}

/// Catalog and stable identity reported for a target: its best link at `version`, or what
/// the submitter supplied.
fn resolved_identity<S: TooStore>(
    store: &S,
    record: &TooRecord,
    version: VersionId,
) -> (Option<CatalogId>, Option<SdssId>) {
    let catalogid = store
        .links_for_target(record.too_id(), version)
        .iter()
        .filter(|l| l.best)
        .map(|l| l.catalogid)
        .min()
        .or(record.core.catalogid);
    let sdss_id = catalogid
        .and_then(|c| store.sdss_id_of(c))
        .or_else(|| record.core.sdss_id.and_then(|s| store.resolve_sdss_id(s)))
        .or(record.core.sdss_id);
    (catalogid, sdss_id)
}

/// Position-level decision for one target.
fn place<M: BrightNeighborMask + ?Sized>(
    record: &TooRecord,
    ra: Degree,
    dec: Degree,
    mask: &M,
    limits: &DesignModeLimits,
) -> Result<Option<(Degree, Degree)>, Exclusion> {
    let (fiber, m) = (record.core.fiber_type, &record.metadata);
    let mode = m.sky_brightness_mode;
    let flagged = mask.is_flagged(ra, dec, fiber, mode);
    let passes = check_mag_limits(&m.magnitudes, limits.get(mode, fiber));
    let offsettable = m.can_offset && !m.inertial;

    match (flagged, offsettable, passes) {
        (true, false, _) | (true, true, true) => Err(Exclusion::BrightNeighbor),
        (_, true, false) => {
            let (ora, odec) = offset_radec(ra, dec, f64::from(m.delta_ra), f64::from(m.delta_dec));
            if mask.is_flagged(ora, odec, fiber, mode) {
                Err(Exclusion::OffsetFlagged)
            } else {
                Ok(Some((ora, odec)))
            }
        }
        (false, false, false) => Err(Exclusion::MagnitudeLimit),
        (false, _, true) => Ok(None),
    }
}

fn evaluate<S: TooStore, M: BrightNeighborMask + ?Sized>(
    store: &S,
    record: &TooRecord,
    today: i32,
    version: VersionId,
    fields: &FieldList,
    mask: &M,
    params: &SelectorParams,
) -> Result<ActiveTarget, Exclusion> {
    let core = &record.core;
    let (ra_nominal, dec_nominal) = match core.proper_motion {
        Some(pm) => propagate_position(
            core.ra,
            core.dec,
            f64::from(pm.pmra),
            f64::from(pm.pmdec),
            f64::from(pm.epoch),
            MJD::from(today),
        ),
        None => (core.ra, core.dec),
    };

    let field = fields.nearest(ra_nominal, dec_nominal);
    if field.observatory != params.observatory {
        return Err(Exclusion::OtherObservatory);
    }
    if params.check_field_separation && !field.within_field() {
        return Err(Exclusion::OutsideField);
    }
    if params
        .min_altitude_deg
        .is_some_and(|min| params.observatory.max_altitude(dec_nominal) < min)
    {
        return Err(Exclusion::NotVisible);
    }

    let offset = place(record, ra_nominal, dec_nominal, mask, &params.limits)?;
    let (ra, dec) = offset.unwrap_or((ra_nominal, dec_nominal));
    let (catalogid, sdss_id) = resolved_identity(store, record, version);

    let m = &record.metadata;
    Ok(ActiveTarget {
        too_id: core.too_id,
        fiber_type: core.fiber_type,
        catalogid,
        sdss_id,
        ra,
        dec,
        ra_nominal,
        dec_nominal,
        field_id: field.field_id,
        field_separation: field.separation,
        offset_applied: offset.is_some(),
        delta_ra: m.delta_ra,
        delta_dec: m.delta_dec,
        sky_brightness_mode: m.sky_brightness_mode,
        can_offset: m.can_offset,
        inertial: m.inertial,
        n_exposures: m.n_exposures,
        priority: m.priority,
        observe_from_mjd: m.observe_from_mjd,
        observe_until_mjd: m.observe_until_mjd,
    })
}

/// Select the targets observable on `today`.
///
/// Arguments
/// -----------------
/// * `store`: store snapshot, read only.
/// * `today`: reference MJD (integer day).
/// * `version`: processing version whose best links give the reported catalogid.
/// * `fields`: field centres of the tiling plan, which decide the observatory.
/// * `mask`: bright-neighbour mask.
/// * `params`: observatory, field and visibility checks, magnitude limits.
///
/// Return
/// ----------
/// * the kept targets by ascending `too_id`, and the excluded ones with their reason.
#[instrument(skip_all, fields(observatory = %params.observatory))]
pub fn select_active_targets<S, M>(
    store: &S,
    today: i32,
    version: VersionId,
    fields: &FieldList,
    mask: &M,
    params: &SelectorParams,
) -> Selection
where
    S: TooStore,
    M: BrightNeighborMask + ?Sized,
{
    let eligible: Vec<TooRecord> = store
        .targets()
        .into_iter()
        .filter(|t| is_schedulable(t, today))
        .collect();
    let n_eligible = eligible.len();

    let outcomes: Vec<(TooId, Result<ActiveTarget, Exclusion>)> = eligible
        .par_iter()
        .map(|t| (t.too_id(), evaluate(store, t, today, version, fields, mask, params)))
        .collect();

    let mut selection = Selection::default();
    for (too_id, outcome) in outcomes {
        match outcome {
            Ok(target) => selection.targets.push(target),
            Err(reason) => {
                debug!(too_id, %reason, "target excluded");
                selection.excluded.push((too_id, reason));
            }
        }
    }

    info!(
        eligible = n_eligible,
        selected = selection.targets.len(),
        excluded = selection.excluded.len(),
        "active targets selected"
    );
    selection
}
