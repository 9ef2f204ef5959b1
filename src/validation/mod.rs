//! # Schema validation
//!
//! Boundary between the loosely typed input ([`RawBatch`]) and the typed pipeline
//! ([`TooRecord`]).
//!
//! ## Overview
//!
//! [`validate_batch`] checks a batch against [`TOO_COLUMNS`]:
//!
//! 1. every required column is present (a missing one fails the batch in any mode),
//! 2. each cell is cast to its column type (see [`coerce`]),
//! 3. defaults are filled (`observe_from_mjd` = the reference MJD, `priority` = 5, ...),
//! 4. value domains are checked (position range, priority range, observation window),
//! 5. all-or-nothing groups are enforced (proper-motion triple, ugriz quintet) and at
//!    least one magnitude must be present,
//! 6. `too_id` must be unique in the batch; every row sharing a repeated id is invalid.
//!
//! In [`ValidationMode::Strict`] any issue rejects the whole batch. In
//! [`ValidationMode::Coercive`] invalid rows are dropped and reported, and the batch fails
//! only when the invalid fraction exceeds [`ValidationParams::max_invalid_fraction`].
//!
//! Validation is a pure function of its inputs; rows are checked in parallel.

pub mod coerce;

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::constants::{FastHashMap, TooId};
use crate::conversion::is_valid_position;
use crate::datamodel::{
    ColumnPolicy, ColumnSpec, ColumnType, DefaultValue, FiberType, Magnitudes, ProperMotion,
    RawBatch, RawValue, SkyBrightnessMode, TargetCore, TargetMetadata, TooRecord, MAG_COLUMNS,
    PROPER_MOTION_COLUMNS, TOO_COLUMNS, UGRIZ_COLUMNS,
};
use crate::too_errors::TooError;

use coerce::{cast_value, TypedValue};

static NULL_CELL: RawValue = RawValue::Null;

// -------------------------------------------------------------------------------------------------
// Parameters
// -------------------------------------------------------------------------------------------------

/// How strictly raw cells are cast to the column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Kinds must match exactly; any issue rejects the batch.
    Strict,
    /// Best-effort casting; invalid rows are dropped up to a threshold.
    #[default]
    Coercive,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMode::Strict => write!(f, "strict"),
            ValidationMode::Coercive => write!(f, "coercive"),
        }
    }
}

/// Configuration of [`validate_batch`].
///
/// Defaults
/// -----------------
/// * `mode`: [`ValidationMode::Coercive`]
/// * `max_invalid_fraction`: 0.1
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    pub mode: ValidationMode,
    /// Largest tolerated fraction of invalid rows in coercive mode, in `[0, 1]`.
    pub max_invalid_fraction: f64,
}

impl Default for ValidationParams {
    fn default() -> Self {
        ValidationParams {
            mode: ValidationMode::Coercive,
            max_invalid_fraction: 0.1,
        }
    }
}

impl ValidationParams {
    pub fn builder() -> ValidationParamsBuilder {
        ValidationParamsBuilder::default()
    }

    /// Strict validation with default thresholds.
    pub fn strict() -> Self {
        ValidationParams {
            mode: ValidationMode::Strict,
            ..Default::default()
        }
    }
}

/// Builder for [`ValidationParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationParamsBuilder {
    params: ValidationParams,
}

impl ValidationParamsBuilder {
    pub fn mode(mut self, v: ValidationMode) -> Self {
        self.params.mode = v;
        self
    }
    pub fn max_invalid_fraction(mut self, v: f64) -> Self {
        self.params.max_invalid_fraction = v;
        self
    }

    /// Finalize the builder.
    ///
    /// Return
    /// ----------
    /// * `Err(TooError::InvalidParameter)` if `max_invalid_fraction` is not in `[0, 1]`.
    pub fn build(self) -> Result<ValidationParams, TooError> {
        if !(0.0..=1.0).contains(&self.params.max_invalid_fraction) {
            return Err(TooError::InvalidParameter(
                "max_invalid_fraction must be in [0, 1]".into(),
            ));
        }
        Ok(self.params)
    }
}

impl fmt::Display for ValidationParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Validation Parameters")?;
            writeln!(f, "---------------------")?;
            writeln!(f, "  mode                 = {}", self.mode)?;
            writeln!(
                f,
                "  max_invalid_fraction = {:.3}",
                self.max_invalid_fraction
            )
        } else {
            write!(
                f,
                "ValidationParams(mode={}, max_invalid={:.3})",
                self.mode, self.max_invalid_fraction
            )
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Report
// -------------------------------------------------------------------------------------------------

/// Reason a field was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum IssueKind {
    MissingColumn,
    MissingValue,
    TypeMismatch { expected: ColumnType, found: String },
    InvalidValue { expected: ColumnType, found: String },
    Overflow { ty: ColumnType, value: String },
    PrecisionLoss { ty: ColumnType, value: String },
    Unparsable(String),
    OutOfRange(String),
    IncompleteGroup(&'static str),
    NoMagnitude,
    WindowOrder { from: i32, until: i32 },
    DuplicateId,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::MissingColumn => write!(f, "required column is missing"),
            IssueKind::MissingValue => write!(f, "required value is null"),
            IssueKind::TypeMismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            IssueKind::InvalidValue { expected, found } => {
                write!(f, "invalid value '{found}' (expected {expected})")
            }
            IssueKind::Overflow { ty, value } => write!(f, "{value} overflows {ty}"),
            IssueKind::PrecisionLoss { ty, value } => {
                write!(f, "{value} is not exactly representable as {ty}")
            }
            IssueKind::Unparsable(s) => write!(f, "cannot parse '{s}'"),
            IssueKind::OutOfRange(msg) => write!(f, "out of range: {msg}"),
            IssueKind::IncompleteGroup(group) => {
                write!(f, "{group} columns must be given all together")
            }
            IssueKind::NoMagnitude => write!(f, "at least one magnitude is required"),
            IssueKind::WindowOrder { from, until } => {
                write!(f, "observe_until_mjd {until} is before observe_from_mjd {from}")
            }
            IssueKind::DuplicateId => write!(f, "too_id appears more than once in the batch"),
        }
    }
}

/// One offending field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIssue {
    /// Row index in the input batch; `None` for batch-level issues.
    pub row: Option<usize>,
    pub too_id: Option<TooId>,
    pub field: String,
    pub kind: IssueKind,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.row, self.too_id) {
            (Some(row), Some(id)) => write!(f, "row {row} (too_id {id})")?,
            (Some(row), None) => write!(f, "row {row}")?,
            (None, _) => write!(f, "batch")?,
        }
        write!(f, " field '{}': {}", self.field, self.kind)
    }
}

/// Every issue found in a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub n_rows: usize,
    pub issues: Vec<FieldIssue>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Row indices with at least one issue.
    pub fn invalid_rows(&self) -> BTreeSet<usize> {
        self.issues.iter().filter_map(|i| i.row).collect()
    }

    pub fn invalid_fraction(&self) -> f64 {
        if self.n_rows == 0 {
            0.0
        } else {
            self.invalid_rows().len() as f64 / self.n_rows as f64
        }
    }

    /// Issues concerning one field, in row order.
    pub fn issues_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FieldIssue> + 'a {
        self.issues.iter().filter(move |i| i.field == field)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} issue(s) in {} of {} row(s)",
            self.issues.len(),
            self.invalid_rows().len(),
            self.n_rows
        )?;
        if f.alternate() {
            for issue in &self.issues {
                write!(f, "\n  - {issue}")?;
            }
        }
        Ok(())
    }
}

/// Output of a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    /// Valid records in input order.
    pub records: Vec<TooRecord>,
    /// Issues of the rows dropped in coercive mode (empty in strict mode).
    pub rejected: ValidationReport,
}

// -------------------------------------------------------------------------------------------------
// Validation
// -------------------------------------------------------------------------------------------------

struct ColumnBinding {
    spec: &'static ColumnSpec,
    index: Option<usize>,
}

fn bind_columns(batch: &RawBatch) -> (Vec<ColumnBinding>, Vec<FieldIssue>) {
    let mut issues = Vec::new();
    let bindings = TOO_COLUMNS
        .iter()
        .map(|spec| {
            let index = batch
                .column_index(spec.name)
                .or_else(|| spec.alias.and_then(|a| batch.column_index(a)));
            if index.is_none() && spec.policy == ColumnPolicy::Required {
                issues.push(FieldIssue {
                    row: None,
                    too_id: None,
                    field: spec.name.to_string(),
                    kind: IssueKind::MissingColumn,
                });
            }
            ColumnBinding { spec, index }
        })
        .collect();
    (bindings, issues)
}

/// Validate and type a raw batch.
///
/// Arguments
/// -----------------
/// * `batch`: the raw rows.
/// * `params`: mode and invalid-row threshold.
/// * `today`: reference MJD used for the `observe_from_mjd` default.
///
/// Return
/// ----------
/// * `Ok(ValidatedBatch)` with the valid records (and, in coercive mode, the rejected rows).
/// * `Err(TooError::Validation(report))` listing every offending (row, too_id, field, kind)
///   when a required column is missing, when any issue exists in strict mode, or when the
///   invalid fraction exceeds the threshold in coercive mode.
#[instrument(skip(batch, params), fields(rows = batch.len(), mode = %params.mode))]
pub fn validate_batch(
    batch: &RawBatch,
    params: &ValidationParams,
    today: i32,
) -> Result<ValidatedBatch, TooError> {
    let (bindings, column_issues) = bind_columns(batch);
    if !column_issues.is_empty() {
        return Err(TooError::Validation(ValidationReport {
            n_rows: batch.len(),
            issues: column_issues,
        }));
    }

    let unknown = batch
        .columns
        .iter()
        .filter(|c| {
            !TOO_COLUMNS
                .iter()
                .any(|s| s.name == c.as_str() || s.alias == Some(c.as_str()))
        })
        .join(", ");
    if !unknown.is_empty() {
        debug!(columns = %unknown, "ignoring unknown columns");
    }

    let mode = params.mode;
    let mut results: Vec<Result<TooRecord, Vec<FieldIssue>>> = batch
        .rows
        .par_iter()
        .enumerate()
        .map(|(row_no, row)| validate_row(row_no, row, &bindings, mode, today))
        .collect();

    flag_duplicates(batch, &bindings, mode, &mut results);

    let mut records = Vec::with_capacity(results.len());
    let mut issues = Vec::new();
    for result in results {
        match result {
            Ok(record) => records.push(record),
            Err(row_issues) => issues.extend(row_issues),
        }
    }
    let report = ValidationReport {
        n_rows: batch.len(),
        issues,
    };

    if report.is_empty() {
        info!(accepted = records.len(), "batch validated");
        return Ok(ValidatedBatch {
            records,
            rejected: report,
        });
    }

    match mode {
        ValidationMode::Strict => {
            warn!(issues = report.issues.len(), "strict validation rejected the batch");
            Err(TooError::Validation(report))
        }
        ValidationMode::Coercive if report.invalid_fraction() > params.max_invalid_fraction => {
            warn!(
                invalid_fraction = report.invalid_fraction(),
                threshold = params.max_invalid_fraction,
                "too many invalid rows"
            );
            Err(TooError::Validation(report))
        }
        ValidationMode::Coercive => {
            info!(
                accepted = records.len(),
                rejected = report.invalid_rows().len(),
                "batch validated with dropped rows"
            );
            Ok(ValidatedBatch {
                records,
                rejected: report,
            })
        }
    }
}

/// Mark every row whose `too_id` occurs more than once.
fn flag_duplicates(
    batch: &RawBatch,
    bindings: &[ColumnBinding],
    mode: ValidationMode,
    results: &mut [Result<TooRecord, Vec<FieldIssue>>],
) {
    let Some(id_col) = bindings
        .iter()
        .find(|b| b.spec.name == "too_id")
        .and_then(|b| b.index)
    else {
        return;
    };

    let ids: Vec<Option<TooId>> = batch
        .rows
        .iter()
        .map(|row| match row.get(id_col).map(|v| cast_value(v, ColumnType::Int64, mode)) {
            Some(Ok(Some(TypedValue::Int(id)))) => Some(id),
            _ => None,
        })
        .collect();

    let counts = ids.iter().flatten().counts();
    for (row_no, id) in ids.iter().enumerate() {
        let Some(id) = id else { continue };
        if counts.get(id).copied().unwrap_or(0) < 2 {
            continue;
        }
        let issue = FieldIssue {
            row: Some(row_no),
            too_id: Some(*id),
            field: "too_id".into(),
            kind: IssueKind::DuplicateId,
        };
        match &mut results[row_no] {
            Err(row_issues) => row_issues.push(issue),
            ok => *ok = Err(vec![issue]),
        }
    }
}

/// Typed, defaulted values of one row, keyed by column name.
struct TypedRow {
    values: FastHashMap<&'static str, TypedValue>,
}

impl TypedRow {
    fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(TypedValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    fn float(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(TypedValue::Float(x)) => Some(*x),
            _ => None,
        }
    }

    /// Float32 columns are rounded during the cast, so narrowing back is exact.
    fn float32(&self, name: &str) -> Option<f32> {
        self.float(name).map(|x| x as f32)
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(TypedValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    fn text(&self, name: &str) -> Option<String> {
        match self.values.get(name) {
            Some(TypedValue::Text(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn fiber(&self) -> Option<FiberType> {
        match self.values.get("fiber_type") {
            Some(TypedValue::Fiber(f)) => Some(*f),
            _ => None,
        }
    }

    fn sky(&self) -> Option<SkyBrightnessMode> {
        match self.values.get("sky_brightness_mode") {
            Some(TypedValue::Sky(s)) => Some(*s),
            _ => None,
        }
    }

    fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn i16(&self, name: &str) -> Option<i16> {
        self.int(name).and_then(|v| i16::try_from(v).ok())
    }

    fn i32(&self, name: &str) -> Option<i32> {
        self.int(name).and_then(|v| i32::try_from(v).ok())
    }
}

fn default_value(default: DefaultValue, today: i32) -> TypedValue {
    match default {
        DefaultValue::Int(i) => TypedValue::Int(i),
        DefaultValue::Float(x) => TypedValue::Float(x),
        DefaultValue::Bool(b) => TypedValue::Bool(b),
        DefaultValue::Sky(s) => TypedValue::Sky(s),
        DefaultValue::Today => TypedValue::Int(today.into()),
    }
}

fn validate_row(
    row_no: usize,
    row: &[RawValue],
    bindings: &[ColumnBinding],
    mode: ValidationMode,
    today: i32,
) -> Result<TooRecord, Vec<FieldIssue>> {
    let too_id = bindings
        .iter()
        .find(|b| b.spec.name == "too_id")
        .and_then(|b| b.index)
        .and_then(|i| row.get(i))
        .and_then(|v| match cast_value(v, ColumnType::Int64, mode) {
            Ok(Some(TypedValue::Int(id))) => Some(id),
            _ => None,
        });

    let mut issues = Vec::new();
    let mut issue = |field: &str, kind: IssueKind| {
        issues.push(FieldIssue {
            row: Some(row_no),
            too_id,
            field: field.to_string(),
            kind,
        })
    };

    // Cast and fill defaults.
    let mut values = FastHashMap::default();
    for binding in bindings {
        let raw = binding
            .index
            .and_then(|i| row.get(i))
            .unwrap_or(&NULL_CELL);
        match cast_value(raw, binding.spec.ty, mode) {
            Ok(Some(v)) => {
                values.insert(binding.spec.name, v);
            }
            Ok(None) => match binding.spec.policy {
                ColumnPolicy::Required => issue(binding.spec.name, IssueKind::MissingValue),
                ColumnPolicy::Default(d) => {
                    values.insert(binding.spec.name, default_value(d, today));
                }
                ColumnPolicy::Optional => {}
            },
            Err(kind) => issue(binding.spec.name, kind),
        }
    }
    let typed = TypedRow { values };

    // Value domains.
    if let Some(ra) = typed.float("ra") {
        if !is_valid_position(ra, 0.0) {
            issue("ra", IssueKind::OutOfRange(format!("ra={ra} not in [0, 360)")));
        }
    }
    if let Some(dec) = typed.float("dec") {
        if !is_valid_position(0.0, dec) {
            issue("dec", IssueKind::OutOfRange(format!("dec={dec} not in [-90, 90]")));
        }
    }
    if let Some(priority) = typed.int("priority") {
        if !(0..=10).contains(&priority) {
            issue(
                "priority",
                IssueKind::OutOfRange(format!("priority={priority} not in [0, 10]")),
            );
        }
    }
    if let Some(n) = typed.int("n_exposures") {
        if n < 0 {
            issue(
                "n_exposures",
                IssueKind::OutOfRange(format!("n_exposures={n} is negative")),
            );
        }
    }
    if let (Some(from), Some(until)) = (typed.int("observe_from_mjd"), typed.int("observe_until_mjd"))
    {
        if until < from {
            issue(
                "observe_until_mjd",
                IssueKind::WindowOrder {
                    from: i32::try_from(from).unwrap_or(i32::MAX),
                    until: i32::try_from(until).unwrap_or(i32::MIN),
                },
            );
        }
    }

    // Dependent groups.
    if typed.has("pmra") || typed.has("pmdec") {
        for name in PROPER_MOTION_COLUMNS.iter().filter(|c| !typed.has(c)) {
            issue(name, IssueKind::IncompleteGroup("proper motion (pmra, pmdec, epoch)"));
        }
    }
    let n_ugriz = UGRIZ_COLUMNS.iter().filter(|c| typed.has(c)).count();
    if n_ugriz > 0 && n_ugriz < UGRIZ_COLUMNS.len() {
        for name in UGRIZ_COLUMNS.iter().filter(|c| !typed.has(c)) {
            issue(name, IssueKind::IncompleteGroup("ugriz magnitude"));
        }
    }
    if !MAG_COLUMNS.iter().any(|c| typed.has(c)) {
        issue("magnitudes", IssueKind::NoMagnitude);
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    assemble(&typed).ok_or_else(|| {
        vec![FieldIssue {
            row: Some(row_no),
            too_id,
            field: "too_id".into(),
            kind: IssueKind::MissingValue,
        }]
    })
}

fn assemble(row: &TypedRow) -> Option<TooRecord> {
    let proper_motion = match (
        row.float32("pmra"),
        row.float32("pmdec"),
        row.float32("epoch"),
    ) {
        (Some(pmra), Some(pmdec), Some(epoch)) => Some(ProperMotion { pmra, pmdec, epoch }),
        _ => None,
    };

    let core = TargetCore {
        too_id: row.int("too_id")?,
        fiber_type: row.fiber()?,
        ra: row.float("ra")?,
        dec: row.float("dec")?,
        proper_motion,
        parallax: row.float32("parallax"),
        catalogid: row.int("catalogid"),
        sdss_id: row.int("sdss_id"),
    };

    let metadata = TargetMetadata {
        sky_brightness_mode: row.sky()?,
        lambda_eff: row.float32("lambda_eff"),
        magnitudes: Magnitudes {
            u: row.float32("u_mag"),
            g: row.float32("g_mag"),
            r: row.float32("r_mag"),
            i: row.float32("i_mag"),
            z: row.float32("z_mag"),
            gaia_bp: row.float32("gaia_bp_mag"),
            gaia_rp: row.float32("gaia_rp_mag"),
            gaia_g: row.float32("gaia_g_mag"),
            h: row.float32("h_mag"),
        },
        optical_prov: row.text("optical_prov"),
        gaia_dr3_source_id: row.int("gaia_dr3_source_id"),
        twomass_pts_key: row.i32("twomass_pts_key"),
        delta_ra: row.float32("delta_ra")?,
        delta_dec: row.float32("delta_dec")?,
        can_offset: row.boolean("can_offset")?,
        inertial: row.boolean("inertial")?,
        n_exposures: row.i16("n_exposures")?,
        priority: row.i16("priority")?,
        active: row.boolean("active")?,
        observe_from_mjd: row.i32("observe_from_mjd")?,
        observe_until_mjd: row.i32("observe_until_mjd"),
        observed: row.boolean("observed")?,
        last_modified_date: row.float("last_modified_date"),
    };

    Some(TooRecord { core, metadata })
}
