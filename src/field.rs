//! # Survey fields
//!
//! The observatory a target is observed from is the one of the nearest field centre of the
//! active tiling plan. A [`FieldList`] holds those centres and answers nearest-field
//! queries by great-circle distance.
//!
//! The list is read from a CSV export of the plan with the columns
//! `field_id,field_ra,field_dec,observatory`.

use std::fs::File;

use camino::Utf8Path;
use nalgebra::Vector3;
use serde::Deserialize;
use tracing::info;

use crate::constants::{Degree, ARCSEC_PER_DEG};
use crate::conversion::{angular_separation, radec_to_unit_vector};
use crate::mask::Observatory;
use crate::too_errors::TooError;

/// One field centre of a tiling plan.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Field {
    pub field_id: i32,
    #[serde(rename = "field_ra")]
    pub ra: Degree,
    #[serde(rename = "field_dec")]
    pub dec: Degree,
    pub observatory: Observatory,
}

/// The field nearest to a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldMatch {
    pub field_id: i32,
    pub observatory: Observatory,
    /// Distance from the field centre (degrees).
    pub separation: Degree,
}

impl FieldMatch {
    /// `true` if the position falls inside the focal plane of the field's observatory.
    pub fn within_field(&self) -> bool {
        self.separation <= self.observatory.max_field_radius()
    }
}

/// Field centres with a nearest-field lookup.
#[derive(Debug, Clone)]
pub struct FieldList {
    fields: Vec<Field>,
    unit_vectors: Vec<Vector3<f64>>,
}

impl FieldList {
    /// Build a list sorted by `field_id`.
    ///
    /// Return
    /// ----------
    /// * `Err(TooError::InvalidParameter)` if `fields` is empty or holds a non-finite
    ///   centre.
    pub fn new(mut fields: Vec<Field>) -> Result<Self, TooError> {
        if fields.is_empty() {
            return Err(TooError::InvalidParameter("no fields found".into()));
        }
        if let Some(f) = fields
            .iter()
            .find(|f| !(f.ra.is_finite() && f.dec.is_finite()))
        {
            return Err(TooError::InvalidParameter(format!(
                "field {} has no valid centre",
                f.field_id
            )));
        }
        fields.sort_by_key(|f| f.field_id);
        let unit_vectors = fields
            .iter()
            .map(|f| radec_to_unit_vector(f.ra, f.dec))
            .collect();
        Ok(FieldList {
            fields,
            unit_vectors,
        })
    }

    /// Read a field list from CSV.
    pub fn read_csv(path: &Utf8Path) -> Result<Self, TooError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(File::open(path)?);
        let fields = reader
            .deserialize()
            .collect::<Result<Vec<Field>, csv::Error>>()?;
        info!(path = %path, fields = fields.len(), "read field list");
        Self::new(fields)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Nearest field centre to `(ra, dec)`; equidistant fields resolve to the smallest
    /// `field_id`.
    pub fn nearest(&self, ra: Degree, dec: Degree) -> FieldMatch {
        let target = radec_to_unit_vector(ra, dec);
        let mut best = 0;
        let mut best_dot = f64::NEG_INFINITY;
        for (i, v) in self.unit_vectors.iter().enumerate() {
            let dot = target.dot(v);
            if dot > best_dot {
                best = i;
                best_dot = dot;
            }
        }
        let field = &self.fields[best];
        FieldMatch {
            field_id: field.field_id,
            observatory: field.observatory,
            separation: angular_separation(ra, dec, field.ra, field.dec) / ARCSEC_PER_DEG,
        }
    }
}
