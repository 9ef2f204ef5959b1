//! Angular helpers on the celestial sphere.
//!
//! Positions are ICRS `(ra, dec)` in **degrees**; separations are returned in
//! **arcseconds**. Distances use the haversine form of the great-circle distance, which
//! stays well conditioned for the sub-arcsecond separations of a cross-match and near
//! the poles.

use nalgebra::Vector3;

use crate::constants::{ArcSec, Degree, ARCSEC_PER_DEG, MAS_PER_DEG, MJD, RADEG};
use crate::time::mjd_to_decimal_year;

/// Great-circle separation between two sky positions (haversine formula).
///
/// Arguments
/// ---------
/// * `ra1`, `dec1`: first position in degrees
/// * `ra2`, `dec2`: second position in degrees
///
/// Return
/// ------
/// * the angular separation in arcseconds
pub fn angular_separation(ra1: Degree, dec1: Degree, ra2: Degree, dec2: Degree) -> ArcSec {
    let (phi1, phi2) = (dec1 * RADEG, dec2 * RADEG);
    let dphi = phi2 - phi1;
    let dlambda = (ra2 - ra1) * RADEG;

    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let sep = 2.0 * h.sqrt().min(1.0).asin();

    sep.to_degrees() * ARCSEC_PER_DEG
}

/// Unit vector pointing at `(ra, dec)`.
pub fn radec_to_unit_vector(ra: Degree, dec: Degree) -> Vector3<f64> {
    let (ra, dec) = (ra * RADEG, dec * RADEG);
    Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
}

/// Wrap a right ascension into `[0, 360)`.
pub fn normalize_ra(ra: Degree) -> Degree {
    let wrapped = ra.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// `true` if the position is a valid ICRS coordinate.
pub fn is_valid_position(ra: Degree, dec: Degree) -> bool {
    ra.is_finite() && dec.is_finite() && (0.0..360.0).contains(&ra) && (-90.0..=90.0).contains(&dec)
}

/// Apply a fixed offset to a position.
///
/// `delta_ra` is a **true angle** (the cos δ factor is already applied), as in the ToO
/// datamodel; both offsets are in arcseconds.
///
/// Arguments
/// ---------
/// * `ra`, `dec`: nominal position in degrees
/// * `delta_ra`, `delta_dec`: offsets in arcseconds
///
/// Return
/// ------
/// * the offset position `(ra, dec)` in degrees
pub fn offset_radec(ra: Degree, dec: Degree, delta_ra: ArcSec, delta_dec: ArcSec) -> (Degree, Degree) {
    let new_dec = (dec + delta_dec / ARCSEC_PER_DEG).clamp(-90.0, 90.0);
    let cos_dec = (dec * RADEG).cos();
    let new_ra = if cos_dec.abs() < 1e-12 {
        ra
    } else {
        ra + delta_ra / ARCSEC_PER_DEG / cos_dec
    };
    (normalize_ra(new_ra), new_dec)
}

/// Propagate a position with its proper motion to a target date (linear space motion).
///
/// Arguments
/// ---------
/// * `ra`, `dec`: position at `epoch` in degrees
/// * `pmra`: proper motion in RA, mas/yr, true angle
/// * `pmdec`: proper motion in Dec, mas/yr
/// * `epoch`: reference epoch of the position as a decimal year
/// * `target_mjd`: date to propagate to
///
/// Return
/// ------
/// * the propagated `(ra, dec)` in degrees
pub fn propagate_position(
    ra: Degree,
    dec: Degree,
    pmra: f64,
    pmdec: f64,
    epoch: f64,
    target_mjd: MJD,
) -> (Degree, Degree) {
    let dt_years = mjd_to_decimal_year(target_mjd) - epoch;
    let delta_ra = pmra * dt_years / MAS_PER_DEG * ARCSEC_PER_DEG;
    let delta_dec = pmdec * dt_years / MAS_PER_DEG * ARCSEC_PER_DEG;
    offset_radec(ra, dec, delta_ra, delta_dec)
}
