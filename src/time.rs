use hifitime::{Epoch, TimeScale};
use std::str::FromStr;

use crate::constants::{DAYS_PER_JULIAN_YEAR, MJD, T2000};

/// Current instant as a fractional Modified Julian Date (UTC).
pub fn now_mjd() -> MJD {
    Epoch::now()
        .map(|now| now.to_mjd_utc_days())
        .unwrap_or(T2000)
}

/// Transformation from date in the format YYYY-MM-ddTHH:mm:ss to modified julian date (MJD)
///
/// Argument
/// --------
/// * `date`: a date string understood by hifitime
///
/// Return
/// ------
/// * the MJD (UTC) of the date, or `None` if the string cannot be parsed
pub fn date_to_mjd(date: &str) -> Option<MJD> {
    Epoch::from_str(date).ok().map(|e| e.to_mjd_utc_days())
}

/// Convert a modified julian date (UTC) to a decimal Julian year.
///
/// Argument
/// --------
/// * `mjd`: the date as MJD
///
/// Return
/// ------
/// * the decimal year, e.g. `2000.0` at J2000
pub fn mjd_to_decimal_year(mjd: MJD) -> f64 {
    2000.0 + (mjd - T2000) / DAYS_PER_JULIAN_YEAR
}

/// Calendar date `YYYY-MM-DD` of an MJD, used to partition exported files by run date.
///
/// Argument
/// --------
/// * `mjd`: the date as MJD (UTC)
///
/// Return
/// ------
/// * the Gregorian date string
pub fn run_date_string(mjd: MJD) -> String {
    let epoch = Epoch::from_mjd_in_time_scale(mjd, TimeScale::UTC);
    let (y, m, d, _, _, _, _) = epoch.to_gregorian_utc();
    format!("{y:04}-{m:02}-{d:02}")
}

#[cfg(test)]
mod time_test {
    use super::*;

    #[test]
    fn test_date_to_mjd() {
        assert_eq!(date_to_mjd("2021-01-01T00:00:00"), Some(59215.0));
        assert_eq!(date_to_mjd("not a date"), None);
    }

    #[test]
    fn test_mjd_to_decimal_year() {
        assert_eq!(mjd_to_decimal_year(T2000), 2000.0);
        assert!((mjd_to_decimal_year(T2000 + 365.25) - 2001.0).abs() < 1e-12);
    }

    #[test]
    fn test_run_date_string() {
        assert_eq!(run_date_string(59215.0), "2021-01-01");
        assert_eq!(run_date_string(59215.75), "2021-01-01");
    }

    #[test]
    fn test_now_is_recent() {
        // 2020-01-01
        assert!(now_mjd() > 58849.0);
    }
}
