//! # Mock ToO data
//!
//! Synthetic inputs for tests and dry runs.
//!
//! * [`sample_record`]: one deterministic, valid, schedulable [`TooRecord`].
//! * [`create_mock_too_batch`]: a random but valid [`RawBatch`] drawn from a seeded RNG,
//!   with mixed fiber types, sky modes, photometry and optional proper motions. Every
//!   `f32` column is drawn as `f32`, so the batch also passes strict validation.

use std::fmt;
use std::ops::Range;

use rand::Rng;
use serde::Deserialize;

use crate::constants::{Degree, TooId};
use crate::datamodel::{
    FiberType, Magnitudes, RawBatch, RawValue, SkyBrightnessMode, TargetCore, TargetMetadata,
    TooRecord,
};
use crate::too_errors::TooError;

/// A valid APOGEE target, active and schedulable from MJD 59000 on, with an H magnitude
/// and priority 5. The position is derived from `too_id`.
pub fn sample_record(too_id: TooId) -> TooRecord {
    let ra = (too_id as f64 * 7.31).rem_euclid(360.0);
    let dec = (too_id as f64 * 3.17).rem_euclid(120.0) - 60.0;
    TooRecord {
        core: TargetCore {
            too_id,
            fiber_type: FiberType::Apogee,
            ra,
            dec,
            proper_motion: None,
            parallax: None,
            catalogid: None,
            sdss_id: None,
        },
        metadata: TargetMetadata {
            sky_brightness_mode: SkyBrightnessMode::Bright,
            lambda_eff: None,
            magnitudes: Magnitudes {
                h: Some(11.0),
                ..Default::default()
            },
            optical_prov: None,
            gaia_dr3_source_id: None,
            twomass_pts_key: None,
            delta_ra: 0.0,
            delta_dec: 0.0,
            can_offset: false,
            inertial: false,
            n_exposures: 1,
            priority: 5,
            active: true,
            observe_from_mjd: 59000,
            observe_until_mjd: None,
            observed: false,
            last_modified_date: None,
        },
    }
}

/// Shape of a mock batch.
///
/// Defaults
/// -----------------
/// * `first_too_id`: 1
/// * `ra_range`: [0, 360), `dec_range`: [-60, 60)
/// * `fraction_boss`: 0.5, `fraction_dark`: 0.5
/// * `fraction_proper_motion`: 0.3, `fraction_ugriz`: 0.2, `fraction_can_offset`: 0.2
/// * `today`: 60000
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MockParams {
    pub first_too_id: TooId,
    pub ra_range: Range<Degree>,
    pub dec_range: Range<Degree>,
    pub fraction_boss: f64,
    pub fraction_dark: f64,
    pub fraction_proper_motion: f64,
    pub fraction_ugriz: f64,
    pub fraction_can_offset: f64,
    /// Observation windows open around this MJD.
    pub today: i32,
}

impl Default for MockParams {
    fn default() -> Self {
        MockParams {
            first_too_id: 1,
            ra_range: 0.0..360.0,
            dec_range: -60.0..60.0,
            fraction_boss: 0.5,
            fraction_dark: 0.5,
            fraction_proper_motion: 0.3,
            fraction_ugriz: 0.2,
            fraction_can_offset: 0.2,
            today: 60000,
        }
    }
}

impl MockParams {
    pub fn builder() -> MockParamsBuilder {
        MockParamsBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockParamsBuilder {
    params: MockParams,
}

impl MockParamsBuilder {
    pub fn first_too_id(mut self, v: TooId) -> Self {
        self.params.first_too_id = v;
        self
    }
    pub fn ra_range(mut self, v: Range<Degree>) -> Self {
        self.params.ra_range = v;
        self
    }
    pub fn dec_range(mut self, v: Range<Degree>) -> Self {
        self.params.dec_range = v;
        self
    }
    pub fn fraction_boss(mut self, v: f64) -> Self {
        self.params.fraction_boss = v;
        self
    }
    pub fn fraction_dark(mut self, v: f64) -> Self {
        self.params.fraction_dark = v;
        self
    }
    pub fn fraction_proper_motion(mut self, v: f64) -> Self {
        self.params.fraction_proper_motion = v;
        self
    }
    pub fn fraction_ugriz(mut self, v: f64) -> Self {
        self.params.fraction_ugriz = v;
        self
    }
    pub fn fraction_can_offset(mut self, v: f64) -> Self {
        self.params.fraction_can_offset = v;
        self
    }
    pub fn today(mut self, v: i32) -> Self {
        self.params.today = v;
        self
    }

    /// Finalize the builder.
    ///
    /// Validation rules
    /// -----------------
    /// * every fraction in `[0, 1]`
    /// * non-empty position ranges inside `ra ∈ [0, 360)`, `dec ∈ [-90, 90]`
    pub fn build(self) -> Result<MockParams, TooError> {
        let p = &self.params;
        let fractions = [
            ("fraction_boss", p.fraction_boss),
            ("fraction_dark", p.fraction_dark),
            ("fraction_proper_motion", p.fraction_proper_motion),
            ("fraction_ugriz", p.fraction_ugriz),
            ("fraction_can_offset", p.fraction_can_offset),
        ];
        if let Some((name, _)) = fractions.iter().find(|(_, f)| !(0.0..=1.0).contains(f)) {
            return Err(TooError::InvalidParameter(format!("{name} must be in [0, 1]")));
        }
        if p.ra_range.is_empty() || p.ra_range.start < 0.0 || p.ra_range.end > 360.0 {
            return Err(TooError::InvalidParameter(
                "ra_range must be a non-empty range inside [0, 360)".into(),
            ));
        }
        if p.dec_range.is_empty() || p.dec_range.start < -90.0 || p.dec_range.end > 90.0 {
            return Err(TooError::InvalidParameter(
                "dec_range must be a non-empty range inside [-90, 90]".into(),
            ));
        }
        Ok(self.params)
    }
}

impl fmt::Display for MockParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MockParams(first_too_id={}, ra={:?}, dec={:?}, boss={:.2}, dark={:.2}, pm={:.2}, ugriz={:.2}, offset={:.2})",
            self.first_too_id,
            self.ra_range,
            self.dec_range,
            self.fraction_boss,
            self.fraction_dark,
            self.fraction_proper_motion,
            self.fraction_ugriz,
            self.fraction_can_offset
        )
    }
}

const MOCK_COLUMNS: [&str; 25] = [
    "too_id",
    "fiber_type",
    "sky_brightness_mode",
    "ra",
    "dec",
    "pmra",
    "pmdec",
    "epoch",
    "parallax",
    "u_mag",
    "g_mag",
    "r_mag",
    "i_mag",
    "z_mag",
    "gaia_bp_mag",
    "gaia_rp_mag",
    "gaia_g_mag",
    "h_mag",
    "delta_ra",
    "delta_dec",
    "can_offset",
    "n_exposures",
    "priority",
    "active",
    "observe_until_mjd",
];

fn mag<R: Rng + ?Sized>(rng: &mut R, range: Range<f32>) -> RawValue {
    RawValue::Float(f64::from(rng.random_range(range)))
}

fn maybe<R: Rng + ?Sized>(rng: &mut R, p: f64, value: impl FnOnce(&mut R) -> RawValue) -> RawValue {
    if rng.random_bool(p) {
        value(rng)
    } else {
        RawValue::Null
    }
}

/// Build a random, valid ToO batch of `n` rows with consecutive ids.
///
/// Arguments
/// -----------------
/// * `n`: number of rows.
/// * `rng`: random source; a seeded `StdRng` gives a reproducible batch.
/// * `params`: batch shape.
///
/// Return
/// ----------
/// * the raw batch, ready for [`validate_batch`](crate::validation::validate_batch).
pub fn create_mock_too_batch<R: Rng + ?Sized>(n: usize, rng: &mut R, params: &MockParams) -> RawBatch {
    let mut batch = RawBatch::new(&MOCK_COLUMNS);
    for k in 0..n {
        let too_id = params.first_too_id + k as TooId;
        let fiber = if rng.random_bool(params.fraction_boss) {
            FiberType::Boss
        } else {
            FiberType::Apogee
        };
        let sky = if rng.random_bool(params.fraction_dark) {
            SkyBrightnessMode::Dark
        } else {
            SkyBrightnessMode::Bright
        };

        let has_pm = rng.random_bool(params.fraction_proper_motion);
        let (pmra, pmdec, epoch, parallax) = if has_pm {
            (
                mag(rng, -50.0..50.0),
                mag(rng, -50.0..50.0),
                RawValue::Float(2016.0),
                mag(rng, 0.0..5.0),
            )
        } else {
            (RawValue::Null, RawValue::Null, RawValue::Null, RawValue::Null)
        };

        let has_ugriz = rng.random_bool(params.fraction_ugriz);
        let ugriz: Vec<RawValue> = (0..5)
            .map(|_| {
                if has_ugriz {
                    mag(rng, 14.0..20.0)
                } else {
                    RawValue::Null
                }
            })
            .collect();
        let (bp, rp, g) = (
            maybe(rng, 0.7, |r| mag(r, 14.0..19.0)),
            maybe(rng, 0.7, |r| mag(r, 14.0..19.0)),
            maybe(rng, 0.7, |r| mag(r, 14.0..19.0)),
        );
        let mut h = maybe(rng, 0.5, |r| mag(r, 8.0..14.0));
        let no_mag = !has_ugriz && [&bp, &rp, &g, &h].iter().all(|v| v.is_null());
        if fiber == FiberType::Apogee || no_mag {
            h = mag(rng, 8.0..14.0);
        }

        let can_offset = rng.random_bool(params.fraction_can_offset);
        let (delta_ra, delta_dec) = if can_offset {
            (mag(rng, -10.0..10.0), mag(rng, -10.0..10.0))
        } else {
            (RawValue::Float(0.0), RawValue::Float(0.0))
        };

        let until = maybe(rng, 0.5, |r| {
            RawValue::Int(i64::from(params.today) + r.random_range(1..60))
        });

        let mut row = vec![
            RawValue::Int(too_id),
            RawValue::Str(fiber.to_string()),
            RawValue::Str(sky.to_string()),
            RawValue::Float(rng.random_range(params.ra_range.clone())),
            RawValue::Float(rng.random_range(params.dec_range.clone())),
            pmra,
            pmdec,
            epoch,
            parallax,
        ];
        row.extend(ugriz);
        row.extend([bp, rp, g, h, delta_ra, delta_dec]);
        row.extend([
            RawValue::Bool(can_offset),
            RawValue::Int(rng.random_range(1..4)),
            RawValue::Int(rng.random_range(1..=10)),
            RawValue::Bool(true),
            until,
        ]);
        batch.push_row(row);
    }
    batch
}
