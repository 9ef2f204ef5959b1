//! # ToO pipeline
//!
//! [`TooPipeline`] owns a store and chains the stages of a run:
//!
//! ```text
//! RawBatch ─ deduplicate ─ validate ─ upsert ─ cross-match ─ resolve identities
//!                                                                   │
//!                                              DiffJournal ◄────────┘
//! ```
//!
//! plus the on-demand operations: active-target selection, identity-diff export, link
//! retirement and lifecycle lookup.
//!
//! ## Run context
//!
//! Every stage receives a [`RunContext`]: the processing version the links and identity
//! rows are recorded under, the reference day used for defaults and expiry, and the
//! modification stamp of the run.
//!
//! ## Failures
//!
//! Record-level failures (duplicates, timed-out lookups, unknown pre-assigned identities)
//! are collected in the stage reports. A stage fails as a whole with
//! [`TooError::FailureRateExceeded`] when its failed fraction is above
//! [`PipelineParams::max_failure_fraction`].
//!
//! ## Cancellation
//!
//! [`TooPipeline::run_with_cancel`] polls its callback before each stage and before each
//! identity commit. A cancelled run returns [`TooError::Cancelled`]; committed clusters are
//! complete and stay in the journal. Targets whose links were written but whose identities
//! were not are resolved by the next run, whatever its batch.
//!
//! ## Example
//!
//! ```rust,no_run
//! use too::pipeline::{PipelineParams, RunContext, TooPipeline};
//! use too::store::MemoryStore;
//!
//! let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());
//! let batch = too::reader::read_too_csv(camino::Utf8Path::new("targets.csv")).unwrap();
//! let summary = pipeline.run(&batch, &RunContext::current(31)).unwrap();
//! println!("{summary:#}");
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::constants::{TooId, VersionId, MJD};
use crate::datamodel::{Lifecycle, RawBatch};
use crate::export::{drain_diff, write_identity_diff, DiffJournal, IdentityDiff};
use crate::field::FieldList;
use crate::identity::{pending_units, resolve_identities, ResolutionReport, ResolverParams};
use crate::mask::BrightNeighborMask;
use crate::reader::deduplicate_batch;
use crate::select::{select_active_targets, Selection, SelectorParams};
use crate::store::TooStore;
use crate::time::{now_mjd, run_date_string};
use crate::too_errors::TooError;
use crate::upsert::{upsert_records, UpsertMode, UpsertSummary};
use crate::validation::{validate_batch, ValidationParams, ValidationReport};
use crate::xmatch::{cross_match, retire_matches, CrossMatchReport, MatchUnit, XMatchParams};

// -------------------------------------------------------------------------------------------------
// Parameters
// -------------------------------------------------------------------------------------------------

/// Configuration of a [`TooPipeline`].
///
/// Defaults
/// -----------------
/// * `validation`: coercive, 10 % invalid rows tolerated
/// * `upsert_mode`: create-only, `strict_upsert`: false
/// * `deduplicate_input`: false (in-batch duplicate ids are validation errors)
/// * `xmatch`, `resolver`, `selector`: their own defaults
/// * `max_failure_fraction`: 0.1
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub validation: ValidationParams,
    pub upsert_mode: UpsertMode,
    /// Abort the upsert on the first duplicate, before any write.
    pub strict_upsert: bool,
    /// Keep only the latest row per `too_id` before validation.
    pub deduplicate_input: bool,
    pub xmatch: XMatchParams,
    pub resolver: ResolverParams,
    pub selector: SelectorParams,
    /// Largest tolerated fraction of failed records per stage.
    pub max_failure_fraction: f64,
}

impl Default for PipelineParams {
    fn default() -> Self {
        PipelineParams {
            validation: ValidationParams::default(),
            upsert_mode: UpsertMode::default(),
            strict_upsert: false,
            deduplicate_input: false,
            xmatch: XMatchParams::default(),
            resolver: ResolverParams::default(),
            selector: SelectorParams::default(),
            max_failure_fraction: 0.1,
        }
    }
}

impl PipelineParams {
    pub fn builder() -> PipelineParamsBuilder {
        PipelineParamsBuilder::default()
    }

    /// Deadline of one store lookup.
    pub fn lookup_timeout(&self) -> Duration {
        self.xmatch.lookup_timeout
    }

    /// Check parameters built or deserialized without the builder.
    ///
    /// Validation rules
    /// -----------------
    /// * `max_failure_fraction` in `[0, 1]`
    /// * `xmatch` and `selector` valid on their own
    pub fn validate(&self) -> Result<(), TooError> {
        if !(0.0..=1.0).contains(&self.max_failure_fraction) {
            return Err(TooError::InvalidParameter(
                "max_failure_fraction must be in [0, 1]".into(),
            ));
        }
        self.xmatch.validate()?;
        self.selector.validate()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineParamsBuilder {
    params: PipelineParams,
}

impl PipelineParamsBuilder {
    pub fn validation(mut self, v: ValidationParams) -> Self {
        self.params.validation = v;
        self
    }
    pub fn upsert_mode(mut self, v: UpsertMode) -> Self {
        self.params.upsert_mode = v;
        self
    }
    pub fn strict_upsert(mut self, v: bool) -> Self {
        self.params.strict_upsert = v;
        self
    }
    pub fn deduplicate_input(mut self, v: bool) -> Self {
        self.params.deduplicate_input = v;
        self
    }
    pub fn xmatch(mut self, v: XMatchParams) -> Self {
        self.params.xmatch = v;
        self
    }
    pub fn resolver(mut self, v: ResolverParams) -> Self {
        self.params.resolver = v;
        self
    }
    pub fn selector(mut self, v: SelectorParams) -> Self {
        self.params.selector = v;
        self
    }
    /// Sets the cone-search deadline of the cross-match parameters.
    pub fn lookup_timeout(mut self, v: Duration) -> Self {
        self.params.xmatch.lookup_timeout = v;
        self
    }
    pub fn max_failure_fraction(mut self, v: f64) -> Self {
        self.params.max_failure_fraction = v;
        self
    }

    /// Finalize the builder; see [`PipelineParams::validate`].
    pub fn build(self) -> Result<PipelineParams, TooError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for PipelineParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Pipeline Parameters")?;
            writeln!(f, "-------------------")?;
            writeln!(f, "  validation           = {}", self.validation)?;
            writeln!(f, "  upsert_mode          = {}", self.upsert_mode)?;
            writeln!(f, "  strict_upsert        = {}", self.strict_upsert)?;
            writeln!(f, "  deduplicate_input    = {}", self.deduplicate_input)?;
            writeln!(f, "  max_failure_fraction = {:.3}", self.max_failure_fraction)?;
            writeln!(f, "  resolver             = {}", self.resolver)?;
            writeln!(f, "  selector             = {}", self.selector)?;
            write!(f, "{:#}", self.xmatch)
        } else {
            write!(
                f,
                "PipelineParams(upsert={}, strict_upsert={}, dedup={}, max_failure={:.3}, {})",
                self.upsert_mode,
                self.strict_upsert,
                self.deduplicate_input,
                self.max_failure_fraction,
                self.xmatch
            )
        }
    }
}

/// Per-run inputs shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunContext {
    /// Processing version of the links and identity rows.
    pub version_id: VersionId,
    /// Reference day (integer MJD) for defaults, expiry and selection.
    pub today: i32,
    /// Modification stamp written on upserted targets (MJD).
    pub now: MJD,
}

impl RunContext {
    /// Context at the instant `now`.
    pub fn new(version_id: VersionId, now: MJD) -> Self {
        RunContext {
            version_id,
            today: now.floor() as i32,
            now,
        }
    }

    /// Context at the current time.
    pub fn current(version_id: VersionId) -> Self {
        Self::new(version_id, now_mjd())
    }

    /// `YYYY-MM-DD` partition of the exported files.
    pub fn run_date(&self) -> String {
        run_date_string(self.now)
    }
}

// -------------------------------------------------------------------------------------------------
// Reports
// -------------------------------------------------------------------------------------------------

/// Outcome of [`TooPipeline::ingest`].
#[derive(Debug, Default, PartialEq)]
pub struct IngestReport {
    pub n_input: usize,
    /// Rows dropped because a later row carried the same `too_id`.
    pub n_superseded: usize,
    /// Rows dropped by coercive validation.
    pub rejected: ValidationReport,
    pub upsert: UpsertSummary,
}

/// Counts of a full run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub version_id: VersionId,
    pub n_input: usize,
    pub n_superseded: usize,
    pub n_accepted: usize,
    pub n_rejected: usize,
    pub n_inserted: usize,
    pub n_refreshed: usize,
    pub n_unchanged: usize,
    pub n_upsert_failed: usize,
    pub n_matched: usize,
    pub n_skipped: usize,
    pub n_minted_catalogids: usize,
    pub n_ambiguous: usize,
    pub n_match_failed: usize,
    /// Targets matched by an earlier interrupted run whose identities this run resolved.
    pub n_resumed: usize,
    pub identities: ResolutionReport,
}

impl RunSummary {
    fn from_stages(
        version_id: VersionId,
        ingest: &IngestReport,
        xmatch: &CrossMatchReport,
        n_resumed: usize,
        identities: ResolutionReport,
    ) -> Self {
        let upsert = &ingest.upsert;
        RunSummary {
            version_id,
            n_input: ingest.n_input,
            n_superseded: ingest.n_superseded,
            n_accepted: upsert.n_processed(),
            n_rejected: ingest.rejected.invalid_rows().len(),
            n_inserted: upsert.inserted.len(),
            n_refreshed: upsert.refreshed.len(),
            n_unchanged: upsert.unchanged.len(),
            n_upsert_failed: upsert.failures.len(),
            n_matched: xmatch.units.len(),
            n_skipped: xmatch.n_skipped,
            n_minted_catalogids: xmatch.n_minted,
            n_ambiguous: xmatch.ambiguities.len(),
            n_match_failed: xmatch.failures.len(),
            n_resumed,
            identities,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Run summary (version {})", self.version_id)?;
            writeln!(f, "------------------------")?;
            writeln!(
                f,
                "  input      : {} rows ({} superseded, {} rejected, {} accepted)",
                self.n_input, self.n_superseded, self.n_rejected, self.n_accepted
            )?;
            writeln!(
                f,
                "  upsert     : {} inserted, {} refreshed, {} unchanged, {} failed",
                self.n_inserted, self.n_refreshed, self.n_unchanged, self.n_upsert_failed
            )?;
            writeln!(
                f,
                "  cross-match: {} matched, {} skipped, {} minted, {} ambiguous, {} failed",
                self.n_matched,
                self.n_skipped,
                self.n_minted_catalogids,
                self.n_ambiguous,
                self.n_match_failed
            )?;
            if self.n_resumed > 0 {
                writeln!(f, "  resumed    : {} targets from an interrupted run", self.n_resumed)?;
            }
            write!(f, "  identities : {}", self.identities)
        } else {
            write!(
                f,
                "version={} accepted={} rejected={} ambiguous={} failed={} minted_sdss_ids={} merged={}",
                self.version_id,
                self.n_accepted,
                self.n_rejected,
                self.n_ambiguous,
                self.n_upsert_failed + self.n_match_failed,
                self.identities.n_minted,
                self.identities.n_merged
            )
        }
    }
}

fn check_failure_rate(
    stage: &'static str,
    failed: usize,
    total: usize,
    threshold: f64,
) -> Result<(), TooError> {
    if total > 0 && failed as f64 / total as f64 > threshold {
        warn!(stage, failed, total, threshold, "failure rate exceeded");
        return Err(TooError::FailureRateExceeded {
            stage,
            failed,
            total,
            threshold,
        });
    }
    Ok(())
}

// -------------------------------------------------------------------------------------------------
// Pipeline
// -------------------------------------------------------------------------------------------------

/// Store-owning facade over the pipeline stages.
#[derive(Debug)]
pub struct TooPipeline<S: TooStore> {
    store: S,
    params: PipelineParams,
    journal: DiffJournal,
}

impl<S: TooStore> TooPipeline<S> {
    pub fn new(store: S, params: PipelineParams) -> Self {
        TooPipeline {
            store,
            params,
            journal: DiffJournal::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    /// Deduplicate, validate and upsert a raw batch.
    ///
    /// Return
    /// ----------
    /// * the ingest report; `Err(TooError::Validation)` when validation rejects the batch,
    ///   `Err(TooError::DuplicateIdentity)` in strict upsert mode, or
    ///   `Err(TooError::FailureRateExceeded)` when too many upserts fail.
    pub fn ingest(&mut self, batch: &RawBatch, ctx: &RunContext) -> Result<IngestReport, TooError> {
        let n_input = batch.len();
        let deduplicated;
        let batch = if self.params.deduplicate_input {
            deduplicated = deduplicate_batch(batch);
            &deduplicated
        } else {
            batch
        };
        let n_superseded = n_input - batch.len();

        let validated = validate_batch(batch, &self.params.validation, ctx.today)?;
        let upsert = upsert_records(
            &mut self.store,
            &validated.records,
            self.params.upsert_mode,
            self.params.strict_upsert,
            ctx.now,
            ctx.today,
        )?;
        check_failure_rate(
            "upsert",
            upsert.failures.len(),
            upsert.n_processed(),
            self.params.max_failure_fraction,
        )?;

        Ok(IngestReport {
            n_input,
            n_superseded,
            rejected: validated.rejected,
            upsert,
        })
    }

    /// Cross-match every target lacking a best link at the run's version.
    pub fn cross_match(&mut self, ctx: &RunContext) -> Result<CrossMatchReport, TooError> {
        let report = cross_match(&mut self.store, ctx.version_id, &self.params.xmatch)?;
        check_failure_rate(
            "cross-match",
            report.failures.len(),
            report.n_attempted(),
            self.params.max_failure_fraction,
        )?;
        Ok(report)
    }

    /// Resolve the stable identities of cross-match results, recording the diff.
    pub fn resolve<F: FnMut() -> bool>(
        &mut self,
        units: &[MatchUnit],
        ctx: &RunContext,
        should_cancel: F,
    ) -> Result<ResolutionReport, TooError> {
        resolve_identities(
            &mut self.store,
            units,
            ctx.version_id,
            &self.params.resolver,
            &mut self.journal,
            should_cancel,
        )
    }

    /// This run's units plus those left unresolved by an interrupted run, by `too_id`.
    fn units_to_resolve(&self, units: &[MatchUnit], ctx: &RunContext) -> (Vec<MatchUnit>, usize) {
        let this_run: BTreeSet<TooId> = units.iter().map(|u| u.too_id).collect();
        let resumed: Vec<MatchUnit> = pending_units(&self.store, ctx.version_id)
            .into_iter()
            .filter(|u| !this_run.contains(&u.too_id))
            .collect();
        let n_resumed = resumed.len();
        if n_resumed > 0 {
            info!(n_resumed, "resuming identity resolution of earlier matches");
        }
        let mut all: Vec<MatchUnit> = units.iter().cloned().chain(resumed).collect();
        all.sort_by_key(|u| u.too_id);
        (all, n_resumed)
    }

    /// Full run: ingest, cross-match and identity resolution.
    pub fn run(&mut self, batch: &RawBatch, ctx: &RunContext) -> Result<RunSummary, TooError> {
        self.run_with_cancel(batch, ctx, || false)
    }

    /// Full run polling `should_cancel` between stages and identity commits.
    ///
    /// Invalid parameters fail the run with `TooError::InvalidParameter` before anything is
    /// read or written.
    #[instrument(skip_all, fields(rows = batch.len(), version = ctx.version_id))]
    pub fn run_with_cancel<F: FnMut() -> bool>(
        &mut self,
        batch: &RawBatch,
        ctx: &RunContext,
        mut should_cancel: F,
    ) -> Result<RunSummary, TooError> {
        self.params.validate()?;
        if should_cancel() {
            return Err(TooError::Cancelled("ingest"));
        }
        let ingest = self.ingest(batch, ctx)?;

        if should_cancel() {
            return Err(TooError::Cancelled("cross-match"));
        }
        let xmatch = self.cross_match(ctx)?;

        if should_cancel() {
            return Err(TooError::Cancelled("identity resolution"));
        }
        let (units, n_resumed) = self.units_to_resolve(&xmatch.units, ctx);
        let identities = self.resolve(&units, ctx, &mut should_cancel)?;

        let summary =
            RunSummary::from_stages(ctx.version_id, &ingest, &xmatch, n_resumed, identities);
        info!(%summary, "run complete");
        Ok(summary)
    }

    /// Targets observable on the run's reference day from the configured observatory.
    pub fn select_active<M: BrightNeighborMask + ?Sized>(
        &self,
        ctx: &RunContext,
        fields: &FieldList,
        mask: &M,
    ) -> Selection {
        select_active_targets(
            &self.store,
            ctx.today,
            ctx.version_id,
            fields,
            mask,
            &self.params.selector,
        )
    }

    /// Take the identity rows committed since the last drain.
    pub fn drain_diff(&mut self) -> IdentityDiff {
        drain_diff(&mut self.journal)
    }

    /// Drain the journal and append it under `<root>/<run_date>/`.
    pub fn export_identity_diff(
        &mut self,
        root: &Utf8Path,
        ctx: &RunContext,
    ) -> Result<(Utf8PathBuf, Utf8PathBuf), TooError> {
        let diff = self.drain_diff();
        write_identity_diff(&diff, root, &ctx.run_date())
    }

    /// Remove the links of `too_ids` at the run's version so the next run re-matches them.
    pub fn retire_matches(&mut self, too_ids: &[TooId], ctx: &RunContext) -> usize {
        retire_matches(&mut self.store, too_ids, ctx.version_id)
    }

    /// Lifecycle state of a target at the run's version and day.
    pub fn lifecycle(&self, too_id: TooId, ctx: &RunContext) -> Lifecycle {
        let Some(target) = self.store.get_target(too_id) else {
            return Lifecycle::Unseen;
        };
        if let Some(terminal) = target.metadata.terminal_state(ctx.today) {
            return terminal;
        }
        let best: Vec<_> = self
            .store
            .links_for_target(too_id, ctx.version_id)
            .into_iter()
            .filter(|l| l.best)
            .collect();
        if best.is_empty() {
            Lifecycle::NoMatch
        } else if best.iter().all(|l| self.store.sdss_id_of(l.catalogid).is_some()) {
            Lifecycle::IdentityAssigned
        } else {
            Lifecycle::MatchedNoIdentity
        }
    }
}

#[cfg(test)]
mod pipeline_test {
    use super::*;
    use crate::constants::DEFAULT_VERSION_ID;
    use crate::datamodel::RawValue;
    use crate::store::MemoryStore;

    fn ctx() -> RunContext {
        RunContext::new(DEFAULT_VERSION_ID, 60000.5)
    }

    fn batch(rows: &[(i64, f64, f64)]) -> RawBatch {
        let mut batch = RawBatch::new(&[
            "too_id",
            "fiber_type",
            "ra",
            "dec",
            "h_mag",
            "can_offset",
            "n_exposures",
            "active",
        ]);
        for &(too_id, ra, dec) in rows {
            batch.push_row(vec![
                RawValue::Int(too_id),
                RawValue::Str("APOGEE".into()),
                RawValue::Float(ra),
                RawValue::Float(dec),
                RawValue::Float(11.0),
                RawValue::Bool(false),
                RawValue::Int(1),
                RawValue::Bool(true),
            ]);
        }
        batch
    }

    #[test]
    fn test_run_context() {
        let ctx = ctx();
        assert_eq!(ctx.today, 60000);
        assert_eq!(ctx.run_date(), "2023-02-25");
    }

    #[test]
    fn test_run_and_lifecycle() {
        let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());
        let ctx = ctx();
        assert_eq!(pipeline.lifecycle(1, &ctx), Lifecycle::Unseen);

        let summary = pipeline
            .run(&batch(&[(1, 150.0, 2.0), (2, 151.0, 2.0)]), &ctx)
            .unwrap();
        assert_eq!(summary.n_inserted, 2);
        assert_eq!(summary.n_minted_catalogids, 2);
        assert_eq!(summary.identities.n_minted, 2);
        assert_eq!(pipeline.lifecycle(1, &ctx), Lifecycle::IdentityAssigned);

        // a second identical run is a no-op
        let again = pipeline
            .run(&batch(&[(1, 150.0, 2.0), (2, 151.0, 2.0)]), &ctx)
            .unwrap();
        assert_eq!(again.n_unchanged, 2);
        assert_eq!(again.n_skipped, 2);
        assert_eq!(again.identities.n_changes(), 0);

        assert_eq!(pipeline.retire_matches(&[1], &ctx), 1);
        assert_eq!(pipeline.lifecycle(1, &ctx), Lifecycle::NoMatch);
    }

    #[test]
    fn test_cancel_before_cross_match() {
        let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());
        let mut polls = 0;
        let err = pipeline
            .run_with_cancel(&batch(&[(1, 150.0, 2.0)]), &ctx(), || {
                polls += 1;
                polls > 1
            })
            .unwrap_err();
        assert_eq!(err, TooError::Cancelled("cross-match"));
        assert_eq!(pipeline.store().n_targets(), 1);
        assert_eq!(pipeline.store().n_links(), 0);
    }

    #[test]
    fn test_failure_rate() {
        assert!(check_failure_rate("upsert", 1, 10, 0.1).is_ok());
        assert_eq!(
            check_failure_rate("upsert", 2, 10, 0.1),
            Err(TooError::FailureRateExceeded {
                stage: "upsert",
                failed: 2,
                total: 10,
                threshold: 0.1
            })
        );
        assert!(check_failure_rate("upsert", 0, 0, 0.0).is_ok());
    }

    #[test]
    fn test_params_builder() {
        assert!(PipelineParams::builder()
            .max_failure_fraction(2.0)
            .build()
            .is_err());
        let params = PipelineParams::builder()
            .lookup_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        assert_eq!(params.lookup_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_deserialized_params_are_checked_by_run() {
        let mut params = PipelineParams::default();
        params.xmatch.query_radius_arcsec = -1.0;
        let mut pipeline = TooPipeline::new(MemoryStore::new(), params);

        let err = pipeline.run(&batch(&[(1, 150.0, 2.0)]), &ctx()).unwrap_err();
        assert!(matches!(err, TooError::InvalidParameter(_)));
        assert_eq!(pipeline.store().n_targets(), 0);
    }
}
