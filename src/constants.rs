//! # Constants and type definitions for the ToO pipeline
//!
//! This module centralizes the **angular conversion factors**, the **catalog identifier
//! layout** and the **common type aliases** used throughout the crate.
//!
//! ## Overview
//!
//! - Unit conversions (degrees ↔ radians, arcseconds ↔ degrees, mas/yr)
//! - Identifier aliases (`TooId`, `CatalogId`, `SdssId`, `VersionId`)
//! - The catalogid block reserved for ToO-minted catalog identities
//! - Default cross-match tolerances
//! - Null sentinels used by the photometric tables
//!
//! These definitions are shared by the validator, the cross-matcher, the identity
//! resolver and the active-target selector.

use std::collections::HashMap;

use ahash::RandomState;

// -------------------------------------------------------------------------------------------------
// Unit conversions
// -------------------------------------------------------------------------------------------------

/// Degrees → radians
pub const RADEG: f64 = std::f64::consts::PI / 180.0;

/// Arcseconds → radians
pub const RADSEC: f64 = std::f64::consts::PI / 648000.0;

/// Arcseconds per degree
pub const ARCSEC_PER_DEG: f64 = 3600.0;

/// Milliarcseconds per degree
pub const MAS_PER_DEG: f64 = 3_600_000.0;

/// Days in a Julian year, used for proper-motion propagation
pub const DAYS_PER_JULIAN_YEAR: f64 = 365.25;

/// MJD of the J2000.0 epoch (2000-01-01 12:00:00)
pub const T2000: f64 = 51544.5;

// -------------------------------------------------------------------------------------------------
// Catalog identifiers
// -------------------------------------------------------------------------------------------------

/// Cross-match run identifier reserved for ToO-minted catalog identities.
pub const TOO_RUN_ID: i64 = 10;

/// Number of low bits of a catalogid available inside one run block
/// (the upper 11 bits hold the run identifier).
pub const CATALOGID_RUN_SHIFT: u32 = 64 - 11;

/// Cross-match version used when none is given explicitly.
pub const DEFAULT_VERSION_ID: VersionId = 31;

/// Provenance tag of catalog identities minted from ToO positions.
pub const TOO_PROVENANCE: &str = "too_target";

/// Inclusive catalogid range `[min, max]` reserved for a given run id.
///
/// Arguments
/// -----------------
/// * `run_id`: The cross-match run identifier.
///
/// Return
/// ----------
/// * `(min, max)` catalogid bounds of the run block.
pub fn catalogid_block(run_id: i64) -> (CatalogId, CatalogId) {
    let min = run_id << CATALOGID_RUN_SHIFT;
    let max = ((run_id + 1) << CATALOGID_RUN_SHIFT) - 1;
    (min, max)
}

// -------------------------------------------------------------------------------------------------
// Tolerances
// -------------------------------------------------------------------------------------------------

/// Largest target to field-centre separation inside the APO focal plane (degrees)
pub const APO_MAX_FIELD_R: Degree = 1.5;

/// Largest target to field-centre separation inside the LCO focal plane (degrees)
pub const LCO_MAX_FIELD_R: Degree = 0.95;

/// Default cone-search radius for the cross-match (arcsec)
pub const DEFAULT_QUERY_RADIUS_ARCSEC: ArcSec = 1.0;

/// Default distance window (arcsec) within which candidates tie for "best"
pub const DEFAULT_BEST_TIE_EPSILON_ARCSEC: ArcSec = 1e-3;

/// Magnitude values that the photometric tables use to encode "no measurement".
pub const NULL_MAG_SENTINELS: [f32; 5] = [-999.0, -9999.0, 999.0, 0.0, 99.9];

/// Magnitude limit value meaning "no limit in this direction".
pub const UNSET_MAG_LIMIT: f64 = -999.0;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Angle in degrees
pub type Degree = f64;
/// Angle in arcseconds
pub type ArcSec = f64;
/// Modified Julian Date (days)
pub type MJD = f64;

/// Externally supplied, immutable ToO identifier
pub type TooId = i64;
/// Master-catalog identity
pub type CatalogId = i64;
/// Stable cross-survey identity
pub type SdssId = i64;
/// Cross-match processing version
pub type VersionId = i16;

/// Hash map with the fast `ahash` hasher, used on hot lookup paths.
pub type FastHashMap<K, V> = HashMap<K, V, RandomState>;

#[cfg(test)]
mod constants_test {
    use super::*;

    #[test]
    fn test_catalogid_block() {
        let (min, max) = catalogid_block(TOO_RUN_ID);
        assert_eq!(min, 10 << 53);
        assert_eq!(max, (11 << 53) - 1);
        assert!(min < max);
    }
}
