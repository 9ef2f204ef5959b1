//! # ToO datamodel
//!
//! Statically typed representation of a target of opportunity, plus the dynamically typed
//! [`RawBatch`] accepted at the ingestion boundary.
//!
//! ## Overview
//!
//! - [`RawValue`] / [`RawBatch`]: heterogeneous tabular input (column names + rows of
//!   loosely typed cells), as produced by a CSV reader or built by the caller.
//! - [`TOO_COLUMNS`]: the fixed column table (type + presence policy) the validator
//!   enforces.
//! - [`TooRecord`]: a fully populated target, split into the immutable [`TargetCore`] and
//!   the refreshable [`TargetMetadata`].
//! - [`Lifecycle`]: the per-target state machine across runs.
//!
//! Once a batch has crossed [`validate_batch`](crate::validation::validate_batch), every
//! downstream stage works on [`TooRecord`] only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{CatalogId, Degree, SdssId, TooId, MJD};

// -------------------------------------------------------------------------------------------------
// Enumerations
// -------------------------------------------------------------------------------------------------

/// Spectrograph fiber used to observe the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FiberType {
    Apogee,
    Boss,
}

impl FromStr for FiberType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APOGEE" => Ok(FiberType::Apogee),
            "BOSS" => Ok(FiberType::Boss),
            other => Err(format!("unknown fiber type '{other}'")),
        }
    }
}

impl fmt::Display for FiberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberType::Apogee => write!(f, "APOGEE"),
            FiberType::Boss => write!(f, "BOSS"),
        }
    }
}

/// Sky brightness mode requested for the observation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SkyBrightnessMode {
    #[default]
    Bright,
    Dark,
}

impl FromStr for SkyBrightnessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bright" => Ok(SkyBrightnessMode::Bright),
            "dark" => Ok(SkyBrightnessMode::Dark),
            other => Err(format!("unknown sky brightness mode '{other}'")),
        }
    }
}

impl fmt::Display for SkyBrightnessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkyBrightnessMode::Bright => write!(f, "bright"),
            SkyBrightnessMode::Dark => write!(f, "dark"),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Typed record
// -------------------------------------------------------------------------------------------------

/// Proper motion triple. `pmra` is a true angle (cos δ applied), both in mas/yr.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProperMotion {
    pub pmra: f32,
    pub pmdec: f32,
    /// Epoch of the catalog position, decimal year.
    pub epoch: f32,
}

/// Photometry attached to a target. Every band is optional.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Magnitudes {
    pub u: Option<f32>,
    pub g: Option<f32>,
    pub r: Option<f32>,
    pub i: Option<f32>,
    pub z: Option<f32>,
    pub gaia_bp: Option<f32>,
    pub gaia_rp: Option<f32>,
    pub gaia_g: Option<f32>,
    pub h: Option<f32>,
}

impl Magnitudes {
    /// `true` if at least one band carries a value.
    pub fn has_any(&self) -> bool {
        [
            self.u,
            self.g,
            self.r,
            self.i,
            self.z,
            self.gaia_bp,
            self.gaia_rp,
            self.gaia_g,
            self.h,
        ]
        .iter()
        .any(Option::is_some)
    }
}

/// Immutable part of a target: identity, fiber and astrometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCore {
    pub too_id: TooId,
    pub fiber_type: FiberType,
    pub ra: Degree,
    pub dec: Degree,
    pub proper_motion: Option<ProperMotion>,
    pub parallax: Option<f32>,
    /// Catalog identity supplied by the submitter.
    pub catalogid: Option<CatalogId>,
    /// Stable identity supplied by the submitter.
    pub sdss_id: Option<SdssId>,
}

/// Refreshable part of a target: photometry, offsets and scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub sky_brightness_mode: SkyBrightnessMode,
    pub lambda_eff: Option<f32>,
    pub magnitudes: Magnitudes,
    pub optical_prov: Option<String>,
    pub gaia_dr3_source_id: Option<i64>,
    pub twomass_pts_key: Option<i32>,
    /// Fixed RA offset, true angle, arcsec.
    pub delta_ra: f32,
    /// Fixed Dec offset, arcsec.
    pub delta_dec: f32,
    pub can_offset: bool,
    pub inertial: bool,
    pub n_exposures: i16,
    pub priority: i16,
    pub active: bool,
    pub observe_from_mjd: i32,
    pub observe_until_mjd: Option<i32>,
    pub observed: bool,
    pub last_modified_date: Option<MJD>,
}

impl TargetMetadata {
    /// Field-by-field equality ignoring the modification stamp.
    pub fn same_content(&self, other: &TargetMetadata) -> bool {
        let mut a = self.clone();
        a.last_modified_date = other.last_modified_date;
        a == *other
    }

    /// `true` once the observation window has closed.
    pub fn is_expired(&self, today: i32) -> bool {
        self.observe_until_mjd.is_some_and(|until| until < today)
    }

    /// Terminal lifecycle state of the metadata, if any.
    pub fn terminal_state(&self, today: i32) -> Option<Lifecycle> {
        if self.observed {
            Some(Lifecycle::Observed)
        } else if self.is_expired(today) {
            Some(Lifecycle::Expired)
        } else if !self.active {
            Some(Lifecycle::Deactivated)
        } else {
            None
        }
    }
}

/// One validated target of opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TooRecord {
    pub core: TargetCore,
    pub metadata: TargetMetadata,
}

impl TooRecord {
    pub fn too_id(&self) -> TooId {
        self.core.too_id
    }
}

/// State of a target id across runs.
///
/// `Unseen → NoMatch → MatchedNoIdentity → IdentityAssigned → Deactivated|Expired|Observed`.
/// Terminal states are sticky: a metadata refresh never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Unseen,
    NoMatch,
    MatchedNoIdentity,
    IdentityAssigned,
    Deactivated,
    Expired,
    Observed,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Deactivated | Lifecycle::Expired | Lifecycle::Observed
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Unseen => "unseen",
            Lifecycle::NoMatch => "ingested(no-match)",
            Lifecycle::MatchedNoIdentity => "ingested(matched, no-identity)",
            Lifecycle::IdentityAssigned => "ingested(matched, identity-assigned)",
            Lifecycle::Deactivated => "deactivated",
            Lifecycle::Expired => "expired",
            Lifecycle::Observed => "observed",
        };
        write!(f, "{s}")
    }
}

// -------------------------------------------------------------------------------------------------
// Raw input
// -------------------------------------------------------------------------------------------------

/// A loosely typed input cell.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl RawValue {
    /// Null cells, including the `NaN` a dataframe uses for missing floats.
    pub fn is_null(&self) -> bool {
        match self {
            RawValue::Null => true,
            RawValue::Float(x) => x.is_nan(),
            _ => false,
        }
    }

    /// Infer the most specific value from a text cell (empty → null).
    pub fn infer(cell: &str) -> RawValue {
        let s = cell.trim();
        if s.is_empty() {
            return RawValue::Null;
        }
        if let Ok(i) = s.parse::<i64>() {
            return RawValue::Int(i);
        }
        if let Ok(x) = s.parse::<f64>() {
            return RawValue::Float(x);
        }
        match s.to_ascii_lowercase().as_str() {
            "true" => RawValue::Bool(true),
            "false" => RawValue::Bool(false),
            _ => RawValue::Str(s.to_string()),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => write!(f, "null"),
            RawValue::Bool(b) => write!(f, "{b}"),
            RawValue::Int(i) => write!(f, "{i}"),
            RawValue::Float(x) => write!(f, "{x}"),
            RawValue::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Bool(v)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self {
        RawValue::Int(v.into())
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Str(v.to_string())
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(RawValue::Null, Into::into)
    }
}

/// A batch of raw rows sharing one column layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawValue>>,
}

impl RawBatch {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        RawBatch {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row; short rows are padded with nulls, extra cells are dropped.
    pub fn push_row(&mut self, mut row: Vec<RawValue>) {
        row.resize(self.columns.len(), RawValue::Null);
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell at (`row`, `column`), `None` if the column is absent.
    pub fn get(&self, row: usize, column: &str) -> Option<&RawValue> {
        let col = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }

    /// Overwrite a cell, adding the column (null-filled) if needed.
    pub fn set(&mut self, row: usize, column: &str, value: RawValue) {
        let col = match self.column_index(column) {
            Some(c) => c,
            None => {
                self.columns.push(column.to_string());
                self.rows.iter_mut().for_each(|r| r.push(RawValue::Null));
                self.columns.len() - 1
            }
        };
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            *cell = value;
        }
    }

    /// Remove a column, returning `true` if it existed.
    pub fn drop_column(&mut self, column: &str) -> bool {
        let Some(col) = self.column_index(column) else {
            return false;
        };
        self.columns.remove(col);
        self.rows.iter_mut().for_each(|r| {
            r.remove(col);
        });
        true
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// -------------------------------------------------------------------------------------------------
// Column table
// -------------------------------------------------------------------------------------------------

/// Target type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Int32,
    Int16,
    Float64,
    Float32,
    Bool,
    Text,
    Fiber,
    SkyBrightness,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Int64 => "int64",
            ColumnType::Int32 => "int32",
            ColumnType::Int16 => "int16",
            ColumnType::Float64 => "float64",
            ColumnType::Float32 => "float32",
            ColumnType::Bool => "bool",
            ColumnType::Text => "string",
            ColumnType::Fiber => "APOGEE|BOSS",
            ColumnType::SkyBrightness => "bright|dark",
        };
        write!(f, "{s}")
    }
}

/// Value filled in when a defaulted column is absent or null.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Sky(SkyBrightnessMode),
    /// The reference MJD passed to the validator.
    Today,
}

/// Presence policy of a column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnPolicy {
    /// Column must exist and every value must be non-null.
    Required,
    /// Column may be absent; nulls are kept.
    Optional,
    /// Column may be absent; nulls are replaced by the default.
    Default(DefaultValue),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub policy: ColumnPolicy,
    /// Legacy column name accepted in place of `name`.
    pub alias: Option<&'static str>,
}

const fn col(name: &'static str, ty: ColumnType, policy: ColumnPolicy) -> ColumnSpec {
    ColumnSpec {
        name,
        ty,
        policy,
        alias: None,
    }
}

use ColumnPolicy::{Default as Dflt, Optional as Opt, Required as Req};
use ColumnType as T;

/// The ToO input columns.
pub const TOO_COLUMNS: &[ColumnSpec] = &[
    col("too_id", T::Int64, Req),
    col("fiber_type", T::Fiber, Req),
    col("catalogid", T::Int64, Opt),
    col("sdss_id", T::Int64, Opt),
    col("gaia_dr3_source_id", T::Int64, Opt),
    col("twomass_pts_key", T::Int32, Opt),
    col(
        "sky_brightness_mode",
        T::SkyBrightness,
        Dflt(DefaultValue::Sky(SkyBrightnessMode::Bright)),
    ),
    col("ra", T::Float64, Req),
    col("dec", T::Float64, Req),
    col("pmra", T::Float32, Opt),
    col("pmdec", T::Float32, Opt),
    col("epoch", T::Float32, Opt),
    col("parallax", T::Float32, Opt),
    col("lambda_eff", T::Float32, Opt),
    col("u_mag", T::Float32, Opt),
    col("g_mag", T::Float32, Opt),
    col("r_mag", T::Float32, Opt),
    col("i_mag", T::Float32, Opt),
    col("z_mag", T::Float32, Opt),
    col("optical_prov", T::Text, Opt),
    col("gaia_bp_mag", T::Float32, Opt),
    col("gaia_rp_mag", T::Float32, Opt),
    col("gaia_g_mag", T::Float32, Opt),
    col("h_mag", T::Float32, Opt),
    col("delta_ra", T::Float32, Dflt(DefaultValue::Float(0.0))),
    col("delta_dec", T::Float32, Dflt(DefaultValue::Float(0.0))),
    col("can_offset", T::Bool, Req),
    col("inertial", T::Bool, Dflt(DefaultValue::Bool(false))),
    col("n_exposures", T::Int16, Req),
    col("priority", T::Int16, Dflt(DefaultValue::Int(5))),
    col("active", T::Bool, Req),
    col("observe_from_mjd", T::Int32, Dflt(DefaultValue::Today)),
    ColumnSpec {
        name: "observe_until_mjd",
        ty: T::Int32,
        policy: Opt,
        alias: Some("expiration_date"),
    },
    col("observed", T::Bool, Dflt(DefaultValue::Bool(false))),
    col("last_modified_date", T::Float64, Opt),
];

/// Ugriz quintet: all or nothing.
pub const UGRIZ_COLUMNS: [&str; 5] = ["u_mag", "g_mag", "r_mag", "i_mag", "z_mag"];

/// Proper-motion triple: all three as soon as `pmra` or `pmdec` is given.
pub const PROPER_MOTION_COLUMNS: [&str; 3] = ["pmra", "pmdec", "epoch"];

/// Every magnitude column; at least one must be set.
pub const MAG_COLUMNS: [&str; 9] = [
    "u_mag",
    "g_mag",
    "r_mag",
    "i_mag",
    "z_mag",
    "gaia_bp_mag",
    "gaia_rp_mag",
    "gaia_g_mag",
    "h_mag",
];

/// Look up a column by its name (not its alias).
pub fn column_spec(name: &str) -> Option<&'static ColumnSpec> {
    TOO_COLUMNS.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod datamodel_test {
    use super::*;

    #[test]
    fn test_fiber_type_parse_display() {
        assert_eq!("boss".parse::<FiberType>(), Ok(FiberType::Boss));
        assert_eq!(" APOGEE ".parse::<FiberType>(), Ok(FiberType::Apogee));
        assert!("MaNGA".parse::<FiberType>().is_err());
        assert_eq!(FiberType::Apogee.to_string(), "APOGEE");
    }

    #[test]
    fn test_sky_brightness_default() {
        assert_eq!(SkyBrightnessMode::default(), SkyBrightnessMode::Bright);
        assert_eq!("DARK".parse::<SkyBrightnessMode>(), Ok(SkyBrightnessMode::Dark));
    }

    #[test]
    fn test_raw_value_infer() {
        assert_eq!(RawValue::infer(""), RawValue::Null);
        assert_eq!(RawValue::infer("42"), RawValue::Int(42));
        assert_eq!(RawValue::infer("1.5"), RawValue::Float(1.5));
        assert_eq!(RawValue::infer("True"), RawValue::Bool(true));
        assert_eq!(RawValue::infer("BOSS"), RawValue::Str("BOSS".into()));
        assert!(RawValue::Float(f64::NAN).is_null());
    }

    #[test]
    fn test_raw_batch_set_and_drop() {
        let mut batch = RawBatch::new(&["too_id", "ra"]);
        batch.push_row(vec![RawValue::Int(1)]);
        assert_eq!(batch.get(0, "ra"), Some(&RawValue::Null));

        batch.set(0, "dec", RawValue::Float(2.0));
        assert_eq!(batch.columns.len(), 3);
        assert_eq!(batch.get(0, "dec"), Some(&RawValue::Float(2.0)));

        assert!(batch.drop_column("ra"));
        assert!(!batch.drop_column("ra"));
        assert_eq!(batch.rows[0].len(), 2);
    }

    #[test]
    fn test_column_table() {
        let until = column_spec("observe_until_mjd").unwrap();
        assert_eq!(until.alias, Some("expiration_date"));
        assert_eq!(column_spec("priority").unwrap().policy, Dflt(DefaultValue::Int(5)));
        assert!(TOO_COLUMNS
            .iter()
            .filter(|c| c.policy == Req)
            .map(|c| c.name)
            .eq(["too_id", "fiber_type", "ra", "dec", "can_offset", "n_exposures", "active"]));
    }

    #[test]
    fn test_terminal_state() {
        let meta = TargetMetadata {
            sky_brightness_mode: SkyBrightnessMode::Bright,
            lambda_eff: None,
            magnitudes: Magnitudes {
                h: Some(12.0),
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
            observe_from_mjd: 59990,
            observe_until_mjd: Some(60000),
            observed: false,
            last_modified_date: None,
        };
        assert_eq!(meta.terminal_state(59999), None);
        assert_eq!(meta.terminal_state(60001), Some(Lifecycle::Expired));

        let observed = TargetMetadata {
            observed: true,
            ..meta.clone()
        };
        assert_eq!(observed.terminal_state(59999), Some(Lifecycle::Observed));
        assert!(Lifecycle::Observed.is_terminal());

        let stamped = TargetMetadata {
            last_modified_date: Some(60000.5),
            ..meta.clone()
        };
        assert!(meta.same_content(&stamped));
    }
}
