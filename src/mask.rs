//! # Bright-neighbour mask and magnitude limits
//!
//! Astrophysical checks applied by the active-target selector.
//!
//! ## Overview
//!
//! * [`BrightNeighborMask`]: `true` when a position is too close to a bright source for a
//!   given fiber type and sky brightness mode. [`StarMask`] implements it from a list of
//!   bright stars, with the exclusion radius
//!
//!   ```text
//!   r = R0 * (lim - mag)^beta   [arcsec]
//!   ```
//!
//!   where `mag` is the star's Gaia G magnitude for BOSS and its H magnitude for APOGEE.
//!   Stars fainter than `lim` do not exclude anything. [`NoMask`] never flags.
//! * [`DesignModeLimits`]: bright-end magnitude limits per sky brightness mode and fiber
//!   type, over the bands `g, r, i, z, bp, gaia_g, rp, J, H, K`. A limit of −999 is unset;
//!   a null or sentinel magnitude always passes.
//! * [`Observatory`]: site latitude for the optional visibility check and focal-plane
//!   radius for the field match.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::constants::{
    ArcSec, Degree, APO_MAX_FIELD_R, LCO_MAX_FIELD_R, NULL_MAG_SENTINELS, UNSET_MAG_LIMIT,
};
use crate::conversion::angular_separation;
use crate::datamodel::{FiberType, Magnitudes, SkyBrightnessMode};
use crate::too_errors::TooError;

/// Number of bands in a [`BandLimits`] row.
pub const N_LIMIT_BANDS: usize = 10;

/// Band names of a [`BandLimits`] row, in order.
pub const LIMIT_BANDS: [&str; N_LIMIT_BANDS] =
    ["g", "r", "i", "z", "bp", "gaia_g", "rp", "J", "H", "K"];

// -------------------------------------------------------------------------------------------------
// Observatory
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Observatory {
    #[default]
    Apo,
    Lco,
}

impl Observatory {
    /// Geodetic latitude of the site (degrees).
    pub fn latitude(self) -> Degree {
        match self {
            Observatory::Apo => 32.7803,
            Observatory::Lco => -29.0146,
        }
    }

    /// Radius of the focal-plane field of view (degrees).
    pub fn max_field_radius(self) -> Degree {
        match self {
            Observatory::Apo => APO_MAX_FIELD_R,
            Observatory::Lco => LCO_MAX_FIELD_R,
        }
    }

    /// Altitude of a source of declination `dec` at upper culmination (degrees).
    pub fn max_altitude(self, dec: Degree) -> Degree {
        90.0 - (self.latitude() - dec).abs()
    }
}

impl FromStr for Observatory {
    type Err = TooError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APO" => Ok(Observatory::Apo),
            "LCO" => Ok(Observatory::Lco),
            other => Err(TooError::InvalidParameter(format!(
                "unknown observatory '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Observatory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observatory::Apo => write!(f, "APO"),
            Observatory::Lco => write!(f, "LCO"),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Magnitude limits
// -------------------------------------------------------------------------------------------------

/// `true` for a magnitude that stands for "no measurement".
pub fn is_null_magnitude(mag: Option<f32>) -> bool {
    match mag {
        None => true,
        Some(m) => m.is_nan() || NULL_MAG_SENTINELS.contains(&m),
    }
}

/// Bright/faint limit of one band. [`UNSET_MAG_LIMIT`] disables a side.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MagLimit {
    pub min: f64,
    pub max: f64,
}

impl MagLimit {
    pub const UNSET: MagLimit = MagLimit {
        min: UNSET_MAG_LIMIT,
        max: UNSET_MAG_LIMIT,
    };

    /// Only a bright-end limit: the magnitude must be larger than `min`.
    pub const fn brighter_than(min: f64) -> MagLimit {
        MagLimit {
            min,
            max: UNSET_MAG_LIMIT,
        }
    }

    pub fn is_unset(&self) -> bool {
        self.min == UNSET_MAG_LIMIT && self.max == UNSET_MAG_LIMIT
    }

    /// Check one magnitude against the limit.
    ///
    /// Null and sentinel magnitudes pass. Otherwise:
    /// * both sides set: `min < mag < max`;
    /// * only `min` set: `mag > min`;
    /// * only `max` set: `mag < max`.
    pub fn accepts(&self, mag: Option<f32>) -> bool {
        if self.is_unset() || is_null_magnitude(mag) {
            return true;
        }
        let mag = mag.map_or(f64::NAN, f64::from);
        match (self.min != UNSET_MAG_LIMIT, self.max != UNSET_MAG_LIMIT) {
            (true, true) => self.min < mag && mag < self.max,
            (true, false) => mag > self.min,
            _ => mag < self.max,
        }
    }
}

/// One [`MagLimit`] per band of [`LIMIT_BANDS`].
pub type BandLimits = [MagLimit; N_LIMIT_BANDS];

/// Magnitudes of a target in [`LIMIT_BANDS`] order. J and K are not carried by ToO records.
pub fn limit_bands(m: &Magnitudes) -> [Option<f32>; N_LIMIT_BANDS] {
    [
        m.g, m.r, m.i, m.z, m.gaia_bp, m.gaia_g, m.gaia_rp, None, m.h, None,
    ]
}

/// `true` if every band passes its limit.
pub fn check_mag_limits(magnitudes: &Magnitudes, limits: &BandLimits) -> bool {
    limit_bands(magnitudes)
        .into_iter()
        .zip(limits)
        .all(|(mag, limit)| limit.accepts(mag))
}

/// Bright limits of the observing design modes.
///
/// Defaults
/// -----------------
/// * bright BOSS: optical bands (`g`..`rp`) brighter than 13
/// * bright APOGEE: H brighter than 7
/// * dark BOSS: optical bands brighter than 15
/// * dark APOGEE: H brighter than 7
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DesignModeLimits {
    pub bright_boss: BandLimits,
    pub bright_apogee: BandLimits,
    pub dark_boss: BandLimits,
    pub dark_apogee: BandLimits,
}

fn optical_limits(min: f64) -> BandLimits {
    let mut limits = [MagLimit::UNSET; N_LIMIT_BANDS];
    limits[..7].fill(MagLimit::brighter_than(min));
    limits
}

fn h_limit(min: f64) -> BandLimits {
    let mut limits = [MagLimit::UNSET; N_LIMIT_BANDS];
    limits[8] = MagLimit::brighter_than(min);
    limits
}

impl Default for DesignModeLimits {
    fn default() -> Self {
        DesignModeLimits {
            bright_boss: optical_limits(13.0),
            bright_apogee: h_limit(7.0),
            dark_boss: optical_limits(15.0),
            dark_apogee: h_limit(7.0),
        }
    }
}

impl DesignModeLimits {
    /// No limit on any band.
    pub fn unset() -> Self {
        let none = [MagLimit::UNSET; N_LIMIT_BANDS];
        DesignModeLimits {
            bright_boss: none,
            bright_apogee: none,
            dark_boss: none,
            dark_apogee: none,
        }
    }

    pub fn get(&self, mode: SkyBrightnessMode, fiber: FiberType) -> &BandLimits {
        match (mode, fiber) {
            (SkyBrightnessMode::Bright, FiberType::Boss) => &self.bright_boss,
            (SkyBrightnessMode::Bright, FiberType::Apogee) => &self.bright_apogee,
            (SkyBrightnessMode::Dark, FiberType::Boss) => &self.dark_boss,
            (SkyBrightnessMode::Dark, FiberType::Apogee) => &self.dark_apogee,
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Bright-neighbour masks
// -------------------------------------------------------------------------------------------------

/// Bright-neighbour lookup used by the selector.
///
/// Implementations must be `Sync`: targets are evaluated in parallel.
pub trait BrightNeighborMask: Sync {
    /// `true` if `(ra, dec)` is excluded for `fiber` in `mode`.
    fn is_flagged(&self, ra: Degree, dec: Degree, fiber: FiberType, mode: SkyBrightnessMode) -> bool;
}

/// A mask that flags nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMask;

impl BrightNeighborMask for NoMask {
    fn is_flagged(&self, _: Degree, _: Degree, _: FiberType, _: SkyBrightnessMode) -> bool {
        false
    }
}

/// Exclusion-radius law `r = r0 * (lim - mag)^beta`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct NeighborRule {
    pub r0: ArcSec,
    pub beta: f64,
    pub lim: f64,
}

impl NeighborRule {
    /// Exclusion radius around a source of magnitude `mag`; zero when it is fainter than `lim`.
    pub fn radius(&self, mag: f64) -> ArcSec {
        if mag.is_nan() || mag >= self.lim {
            0.0
        } else {
            self.r0 * (self.lim - mag).powf(self.beta)
        }
    }
}

/// A bright source of the mask.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BrightStar {
    pub ra: Degree,
    pub dec: Degree,
    /// Gaia G magnitude, used for BOSS fibers.
    pub gaia_g: Option<f32>,
    /// 2MASS H magnitude, used for APOGEE fibers.
    pub h: Option<f32>,
}

/// Bright-neighbour mask built from a star list.
///
/// The same radius law applies in both sky brightness modes.
#[derive(Debug, Clone)]
pub struct StarMask {
    /// Sorted by declination.
    stars: Vec<BrightStar>,
    boss: NeighborRule,
    apogee: NeighborRule,
    /// Largest exclusion radius over the list (degrees).
    max_radius_deg: Degree,
}

impl StarMask {
    pub const DEFAULT_BOSS_RULE: NeighborRule = NeighborRule {
        r0: 2.0,
        beta: 1.0,
        lim: 17.0,
    };
    pub const DEFAULT_APOGEE_RULE: NeighborRule = NeighborRule {
        r0: 2.0,
        beta: 1.0,
        lim: 12.0,
    };

    pub fn new(stars: Vec<BrightStar>) -> Self {
        Self::with_rules(stars, Self::DEFAULT_BOSS_RULE, Self::DEFAULT_APOGEE_RULE)
    }

    pub fn with_rules(mut stars: Vec<BrightStar>, boss: NeighborRule, apogee: NeighborRule) -> Self {
        stars.sort_by(|a, b| a.dec.total_cmp(&b.dec));
        let max_radius = stars
            .iter()
            .flat_map(|s| {
                [
                    boss.radius(s.gaia_g.map_or(f64::NAN, f64::from)),
                    apogee.radius(s.h.map_or(f64::NAN, f64::from)),
                ]
            })
            .fold(0.0, f64::max);
        StarMask {
            stars,
            boss,
            apogee,
            max_radius_deg: max_radius / 3600.0,
        }
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    fn radius_for(&self, star: &BrightStar, fiber: FiberType) -> ArcSec {
        match fiber {
            FiberType::Boss => self.boss.radius(star.gaia_g.map_or(f64::NAN, f64::from)),
            FiberType::Apogee => self.apogee.radius(star.h.map_or(f64::NAN, f64::from)),
        }
    }
}

impl BrightNeighborMask for StarMask {
    fn is_flagged(&self, ra: Degree, dec: Degree, fiber: FiberType, _: SkyBrightnessMode) -> bool {
        let lo = self
            .stars
            .partition_point(|s| s.dec < dec - self.max_radius_deg);
        let hi = self
            .stars
            .partition_point(|s| s.dec <= dec + self.max_radius_deg);
        self.stars[lo..hi].iter().any(|star| {
            let radius = self.radius_for(star, fiber);
            radius > 0.0 && angular_separation(ra, dec, star.ra, star.dec) <= radius
        })
    }
}

#[cfg(test)]
mod mask_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mag_limit_rules() {
        let both = MagLimit { min: 10.0, max: 20.0 };
        assert!(both.accepts(Some(15.0)));
        assert!(!both.accepts(Some(10.0)));
        assert!(!both.accepts(Some(21.0)));

        let min_only = MagLimit::brighter_than(13.0);
        assert!(min_only.accepts(Some(13.5)));
        assert!(!min_only.accepts(Some(12.0)));

        let max_only = MagLimit {
            min: UNSET_MAG_LIMIT,
            max: 8.0,
        };
        assert!(max_only.accepts(Some(7.0)));
        assert!(!max_only.accepts(Some(9.0)));

        // nulls and sentinels pass
        for null in [None, Some(f32::NAN), Some(-999.0), Some(99.9), Some(0.0)] {
            assert!(min_only.accepts(null));
        }
        assert!(MagLimit::UNSET.accepts(Some(1.0)));
    }

    #[test]
    fn test_check_mag_limits_per_design_mode() {
        let limits = DesignModeLimits::default();
        let bright = Magnitudes {
            g: Some(12.0),
            h: Some(11.0),
            ..Default::default()
        };
        assert!(!check_mag_limits(&bright, limits.get(SkyBrightnessMode::Bright, FiberType::Boss)));
        assert!(check_mag_limits(&bright, limits.get(SkyBrightnessMode::Bright, FiberType::Apogee)));

        let faint = Magnitudes {
            g: Some(14.0),
            ..Default::default()
        };
        assert!(check_mag_limits(&faint, limits.get(SkyBrightnessMode::Bright, FiberType::Boss)));
        assert!(!check_mag_limits(&faint, limits.get(SkyBrightnessMode::Dark, FiberType::Boss)));
        assert!(check_mag_limits(&faint, DesignModeLimits::unset().get(SkyBrightnessMode::Dark, FiberType::Boss)));
    }

    #[test]
    fn test_neighbor_rule_radius() {
        let rule = StarMask::DEFAULT_BOSS_RULE;
        assert_relative_eq!(rule.radius(7.0), 20.0);
        assert_eq!(rule.radius(17.0), 0.0);
        assert_eq!(rule.radius(f64::NAN), 0.0);
    }

    #[test]
    fn test_star_mask_flags_by_fiber() {
        // G = 7 → 20" for BOSS; H = 10 → 4" for APOGEE
        let mask = StarMask::new(vec![
            BrightStar {
                ra: 100.0,
                dec: 20.0,
                gaia_g: Some(7.0),
                h: Some(10.0),
            },
            BrightStar {
                ra: 200.0,
                dec: -40.0,
                gaia_g: None,
                h: None,
            },
        ]);
        assert_eq!(mask.len(), 2);
        let ten_arcsec = 20.0 + 10.0 / 3600.0;
        let mode = SkyBrightnessMode::Bright;
        assert!(mask.is_flagged(100.0, ten_arcsec, FiberType::Boss, mode));
        assert!(!mask.is_flagged(100.0, ten_arcsec, FiberType::Apogee, mode));
        assert!(mask.is_flagged(100.0, 20.0 + 3.0 / 3600.0, FiberType::Apogee, mode));
        assert!(!mask.is_flagged(100.0, 20.0 + 30.0 / 3600.0, FiberType::Boss, mode));
        assert!(!mask.is_flagged(200.0, -40.0, FiberType::Boss, mode));
        assert!(!NoMask.is_flagged(100.0, 20.0, FiberType::Boss, mode));
    }

    #[test]
    fn test_observatory() {
        assert_eq!("lco".parse::<Observatory>().unwrap(), Observatory::Lco);
        assert!("xyz".parse::<Observatory>().is_err());
        assert_relative_eq!(Observatory::Apo.max_altitude(32.7803), 90.0);
        assert!(Observatory::Apo.max_altitude(-70.0) < 30.0);
        assert!(Observatory::Lco.max_altitude(-70.0) > 30.0);
    }
}
