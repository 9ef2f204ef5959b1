//! Tabular input adapters producing a [`RawBatch`].
//!
//! The CSV reader keeps cells loosely typed ([`RawValue::infer`]); the schema check and
//! casting happen later in [`validate_batch`](crate::validation::validate_batch).

use std::fs::File;

use camino::Utf8Path;
use tracing::{debug, info};

use crate::constants::{FastHashMap, TooId};
use crate::datamodel::{RawBatch, RawValue};
use crate::time::date_to_mjd;
use crate::too_errors::TooError;

/// Read a CSV file of ToO targets.
///
/// The first line holds the column names. Empty cells are nulls; other cells are inferred
/// as integer, float, boolean or string.
///
/// Arguments
/// -----------------
/// * `path`: the CSV file.
///
/// Return
/// ----------
/// * the raw batch, or a `TooError::IoError`/`TooError::CsvError`.
pub fn read_too_csv(path: &Utf8Path) -> Result<RawBatch, TooError> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(file);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut batch = RawBatch::new(&headers);
    for record in reader.records() {
        let record = record?;
        batch.push_row(record.iter().map(RawValue::infer).collect());
    }

    info!(path = %path, rows = batch.len(), columns = batch.columns.len(), "read ToO file");
    Ok(batch)
}

fn as_too_id(value: &RawValue) -> Option<TooId> {
    match value {
        RawValue::Int(i) => Some(*i),
        RawValue::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_mjd(value: &RawValue) -> f64 {
    match value {
        RawValue::Int(i) => *i as f64,
        RawValue::Float(x) if !x.is_nan() => *x,
        RawValue::Str(s) => s
            .trim()
            .parse()
            .ok()
            .or_else(|| date_to_mjd(s.trim()))
            .unwrap_or(f64::NEG_INFINITY),
        _ => f64::NEG_INFINITY,
    }
}

/// Keep one row per `too_id`, preferring the latest `last_modified_date`.
///
/// Dates are MJDs or ISO timestamps (`2023-02-25T10:00:00`).
///
/// Rows without a readable `too_id` are kept untouched so the validator can report them.
/// On equal dates the row appearing last in the batch wins. Row order is otherwise
/// preserved.
pub fn deduplicate_batch(batch: &RawBatch) -> RawBatch {
    let Some(id_col) = batch.column_index("too_id") else {
        return batch.clone();
    };
    let date_col = batch.column_index("last_modified_date");

    // too_id -> (row index, date) of the current winner
    let mut winners: FastHashMap<TooId, (usize, f64)> = FastHashMap::default();
    for (i, row) in batch.rows.iter().enumerate() {
        let Some(id) = row.get(id_col).and_then(as_too_id) else {
            continue;
        };
        let date = date_col
            .and_then(|c| row.get(c))
            .map_or(f64::NEG_INFINITY, as_mjd);
        winners
            .entry(id)
            .and_modify(|w| {
                if date >= w.1 {
                    *w = (i, date);
                }
            })
            .or_insert((i, date));
    }

    let mut out = RawBatch::new(&batch.columns);
    for (i, row) in batch.rows.iter().enumerate() {
        let keep = match row.get(id_col).and_then(as_too_id) {
            Some(id) => winners.get(&id).is_some_and(|w| w.0 == i),
            None => true,
        };
        if keep {
            out.push_row(row.clone());
        }
    }

    let dropped = batch.len() - out.len();
    if dropped > 0 {
        debug!(dropped, "dropped superseded duplicate rows");
    }
    out
}
