use thiserror::Error;

use crate::{
    constants::{CatalogId, SdssId, TooId},
    validation::ValidationReport,
};

#[derive(Error, Debug)]
pub enum TooError {
    #[error("Schema validation failed: {0}")]
    Validation(ValidationReport),

    #[error("Target {too_id} already exists and cannot be created again")]
    DuplicateIdentity { too_id: TooId },

    #[error(
        "Target {too_id} has {n_tied} candidates tied at {distance_arcsec:.6}\" (kept catalogid {kept})"
    )]
    CrossMatchAmbiguity {
        too_id: TooId,
        n_tied: usize,
        distance_arcsec: f64,
        kept: CatalogId,
    },

    #[error("Merge touching sdss_id {sdss_id} conflicts with a concurrent rewrite")]
    MergeConflict { sdss_id: SdssId },

    #[error("Lookup for target {too_id} timed out after {attempts} attempt(s)")]
    LookupTimeout { too_id: TooId, attempts: u32 },

    #[error("Store query exceeded its deadline of {0:?}")]
    Deadline(std::time::Duration),

    #[error("Unknown catalogid: {0}")]
    UnknownCatalogId(CatalogId),

    #[error("Unknown sdss_id: {0}")]
    UnknownSdssId(SdssId),

    #[error("Unknown target: {0}")]
    UnknownTarget(TooId),

    #[error("Stage '{stage}' failed for {failed}/{total} records (threshold {threshold})")]
    FailureRateExceeded {
        stage: &'static str,
        failed: usize,
        total: usize,
        threshold: f64,
    },

    #[error("Identity mapping is not a partition: {0}")]
    PartitionViolation(String),

    #[error("Run cancelled during stage '{0}'")]
    Cancelled(&'static str),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Output file already exists: {0}")]
    FileExists(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Logging initialisation failed: {0}")]
    LoggingInit(String),
}

impl PartialEq for TooError {
    fn eq(&self, other: &Self) -> bool {
        use TooError::*;
        match (self, other) {
            (Validation(a), Validation(b)) => a == b,
            (DuplicateIdentity { too_id: a }, DuplicateIdentity { too_id: b }) => a == b,
            (
                CrossMatchAmbiguity {
                    too_id: a,
                    n_tied: na,
                    kept: ka,
                    ..
                },
                CrossMatchAmbiguity {
                    too_id: b,
                    n_tied: nb,
                    kept: kb,
                    ..
                },
            ) => a == b && na == nb && ka == kb,
            (MergeConflict { sdss_id: a }, MergeConflict { sdss_id: b }) => a == b,
            (
                LookupTimeout {
                    too_id: a,
                    attempts: x,
                },
                LookupTimeout {
                    too_id: b,
                    attempts: y,
                },
            ) => a == b && x == y,
            (Deadline(a), Deadline(b)) => a == b,
            (UnknownCatalogId(a), UnknownCatalogId(b)) => a == b,
            (UnknownSdssId(a), UnknownSdssId(b)) => a == b,
            (UnknownTarget(a), UnknownTarget(b)) => a == b,
            (
                FailureRateExceeded {
                    stage: sa,
                    failed: fa,
                    total: ta,
                    ..
                },
                FailureRateExceeded {
                    stage: sb,
                    failed: fb,
                    total: tb,
                    ..
                },
            ) => sa == sb && fa == fb && ta == tb,
            (PartitionViolation(a), PartitionViolation(b)) => a == b,
            (Cancelled(a), Cancelled(b)) => a == b,
            (InvalidParameter(a), InvalidParameter(b)) => a == b,
            (FileExists(a), FileExists(b)) => a == b,
            (LoggingInit(a), LoggingInit(b)) => a == b,

            // not comparable: same variant is enough
            (IoError(_), IoError(_)) => true,
            (CsvError(_), CsvError(_)) => true,

            _ => false,
        }
    }
}

impl TooError {
    /// `true` for errors that only affect one record and are counted against the
    /// failure-rate threshold instead of aborting the stage.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            TooError::DuplicateIdentity { .. }
                | TooError::LookupTimeout { .. }
                | TooError::UnknownCatalogId(_)
                | TooError::UnknownSdssId(_)
                | TooError::CrossMatchAmbiguity { .. }
        )
    }
}
