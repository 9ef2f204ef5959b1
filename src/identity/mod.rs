//! # Identity resolution
//!
//! Assigns, extends and merges stable identities (`sdss_id`) over the catalog identities
//! touched by a cross-match run.
//!
//! ## Overview
//!
//! The resolver is an incremental union-find over catalog identities:
//!
//! 1. **Nodes**: every catalogid linked by a [`MatchUnit`] plus every member of the
//!    existing classes those catalogids belong to, indexed densely in ascending catalogid
//!    order.
//! 2. **Unions**: members of each existing class are pre-unioned. Each unit unions its best
//!    set and, with [`ResolverParams::merge_neighbours`], its other within-radius
//!    candidates (they share the target's physical position).
//! 3. **Plan**: each connected component becomes at most one [`ClusterChange`]:
//!    - no existing class → a new sdss_id from the monotonic counter;
//!    - one existing class → extended with its new members;
//!    - several classes → merged into the smallest sdss_id, the others become aliases.
//!
//!    Components are processed by ascending smallest catalogid, so minting is
//!    deterministic. The plan is checked to be a proper partition in memory before
//!    anything is written.
//! 4. **Commit**: each change is one atomic [`TooStore::commit_cluster`] call. A
//!    [`TooError::MergeConflict`] is retried once after
//!    [`ResolverParams::merge_retry_backoff`]; a second failure aborts the run, leaving the
//!    earlier commits in place and later clusters untouched. Committed changes are appended
//!    to the [`DiffJournal`].
//!
//! Targets left with an unresolved best match by an interrupted run are found again by
//! [`pending_units`] and resolved together with the next run's units.
//!
//! Classes are only ever created, extended or merged: the number of classes touched by a
//! run never grows through a merge and no catalogid is ever split from its class.

pub mod disjoint_set;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use ordered_float::OrderedFloat;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::constants::{CatalogId, FastHashMap, SdssId, VersionId};
use crate::export::DiffJournal;
use crate::store::{ClusterChange, ClusterChangeKind, TooStore};
use crate::too_errors::TooError;
use crate::xmatch::MatchUnit;

use disjoint_set::DisjointSet;

/// Configuration of [`resolve_identities`].
///
/// Defaults
/// -----------------
/// * `merge_neighbours`: true
/// * `merge_retry_backoff`: 50 ms
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResolverParams {
    /// Union the non-best within-radius candidates of a target with its best match.
    pub merge_neighbours: bool,
    /// Wait before retrying a commit that hit a merge conflict.
    pub merge_retry_backoff: Duration,
}

impl Default for ResolverParams {
    fn default() -> Self {
        ResolverParams {
            merge_neighbours: true,
            merge_retry_backoff: Duration::from_millis(50),
        }
    }
}

impl ResolverParams {
    pub fn builder() -> ResolverParamsBuilder {
        ResolverParamsBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolverParamsBuilder {
    params: ResolverParams,
}

impl ResolverParamsBuilder {
    pub fn merge_neighbours(mut self, v: bool) -> Self {
        self.params.merge_neighbours = v;
        self
    }
    pub fn merge_retry_backoff(mut self, v: Duration) -> Self {
        self.params.merge_retry_backoff = v;
        self
    }

    /// Finalize the builder. The backoff is capped at one minute.
    pub fn build(self) -> Result<ResolverParams, TooError> {
        if self.params.merge_retry_backoff > Duration::from_secs(60) {
            return Err(TooError::InvalidParameter(
                "merge_retry_backoff must be at most 60 s".into(),
            ));
        }
        Ok(self.params)
    }
}

impl fmt::Display for ResolverParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResolverParams(merge_neighbours={}, merge_retry_backoff={:?})",
            self.merge_neighbours, self.merge_retry_backoff
        )
    }
}

/// Outcome of a resolver run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionReport {
    pub n_minted: usize,
    pub n_extended: usize,
    pub n_merged: usize,
    /// sdss_ids turned into aliases.
    pub n_absorbed: usize,
    /// catalogid → sdss_id rows written.
    pub n_rows: usize,
    /// Commits that succeeded on retry.
    pub n_retried: usize,
    pub n_classes_before: usize,
    pub n_classes_after: usize,
}

impl ResolutionReport {
    pub fn n_changes(&self) -> usize {
        self.n_minted + self.n_extended + self.n_merged
    }
}

impl fmt::Display for ResolutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "minted={} extended={} merged={} absorbed={} rows={} classes={}→{}",
            self.n_minted,
            self.n_extended,
            self.n_merged,
            self.n_absorbed,
            self.n_rows,
            self.n_classes_before,
            self.n_classes_after
        )
    }
}

/// Dense catalogid ↔ index arena.
struct NodeArena {
    ids: Vec<CatalogId>,
    index: FastHashMap<CatalogId, usize>,
}

impl NodeArena {
    fn new(ids: BTreeSet<CatalogId>) -> Self {
        let ids: Vec<CatalogId> = ids.into_iter().collect();
        let index = ids.iter().enumerate().map(|(i, c)| (*c, i)).collect();
        NodeArena { ids, index }
    }

    fn indices<'a, I>(&'a self, ids: I) -> impl Iterator<Item = usize> + 'a
    where
        I: IntoIterator<Item = CatalogId>,
        I::IntoIter: 'a,
    {
        ids.into_iter().filter_map(|c| self.index.get(&c).copied())
    }
}

/// Match units rebuilt from the stored links of targets whose best match at `version`
/// still has no sdss_id.
///
/// A run interrupted after its links were written (cancelled, or aborted by a commit or
/// failure-rate error) leaves such targets behind; the cross-match skips them on the next
/// run, so the resolver picks them up from here.
///
/// Return
/// ----------
/// * one unit per such target by ascending `too_id`, best and other candidates ordered by
///   `(distance, catalogid)`. `minted` is always `false`.
pub fn pending_units<S: TooStore>(store: &S, version: VersionId) -> Vec<MatchUnit> {
    store
        .targets()
        .iter()
        .filter_map(|target| {
            let mut links = store.links_for_target(target.too_id(), version);
            let unresolved = links
                .iter()
                .any(|l| l.best && store.sdss_id_of(l.catalogid).is_none());
            if !unresolved {
                return None;
            }
            links.sort_by_key(|l| (OrderedFloat(l.distance_arcsec), l.catalogid));
            let (best, others): (Vec<_>, Vec<_>) = links.iter().partition(|l| l.best);
            Some(MatchUnit {
                too_id: target.too_id(),
                best: best.iter().map(|l| l.catalogid).collect(),
                others: others.iter().map(|l| l.catalogid).collect(),
                minted: false,
            })
        })
        .collect()
}

/// Build the cluster changes implied by a set of match units, without writing.
///
/// Return
/// ----------
/// * the changes ordered by smallest member catalogid, or
///   `Err(TooError::PartitionViolation)` if the plan would not leave a proper partition.
pub fn plan_resolution<S: TooStore>(
    store: &S,
    units: &[MatchUnit],
    params: &ResolverParams,
) -> Result<Vec<ClusterChange>, TooError> {
    let linked = |unit: &MatchUnit| -> Vec<CatalogId> {
        if params.merge_neighbours {
            unit.catalogids().collect()
        } else {
            unit.best.to_vec()
        }
    };

    let touched: BTreeSet<CatalogId> = units.iter().flat_map(linked).collect();
    let classes: BTreeSet<SdssId> = touched.iter().filter_map(|c| store.sdss_id_of(*c)).collect();
    let class_members: BTreeMap<SdssId, Vec<CatalogId>> = classes
        .iter()
        .map(|s| (*s, store.class_members(*s)))
        .collect();

    let mut nodes = touched;
    nodes.extend(class_members.values().flatten().copied());
    let arena = NodeArena::new(nodes);

    let mut dsu = DisjointSet::new(arena.ids.len());
    for members in class_members.values() {
        dsu.union_all(arena.indices(members.iter().copied()));
    }
    for unit in units {
        dsu.union_all(arena.indices(linked(unit)));
    }

    let mut next_sdss_id = store.max_sdss_id().map_or(1, |m| m + 1);
    let mut changes = Vec::new();
    for group in dsu.groups() {
        let members: Vec<CatalogId> = group.iter().map(|&i| arena.ids[i]).collect();
        let group_classes: BTreeSet<SdssId> =
            members.iter().filter_map(|c| store.sdss_id_of(*c)).collect();
        let new_members: Vec<CatalogId> = members
            .iter()
            .copied()
            .filter(|c| store.sdss_id_of(*c).is_none())
            .collect();

        let mut group_classes = group_classes.into_iter();
        let change = match (group_classes.next(), group_classes.len()) {
            (None, _) => {
                let sdss_id = next_sdss_id;
                next_sdss_id += 1;
                ClusterChange {
                    sdss_id,
                    kind: ClusterChangeKind::Minted,
                    new_members,
                    absorbed: vec![],
                    rewritten: vec![],
                }
            }
            (Some(_), 0) if new_members.is_empty() => continue,
            (Some(sdss_id), 0) => ClusterChange {
                sdss_id,
                kind: ClusterChangeKind::Extended,
                new_members,
                absorbed: vec![],
                rewritten: vec![],
            },
            (Some(survivor), _) => {
                let absorbed: Vec<SdssId> = group_classes.collect();
                let rewritten = absorbed
                    .iter()
                    .flat_map(|s| class_members.get(s).into_iter().flatten().copied())
                    .collect();
                ClusterChange {
                    sdss_id: survivor,
                    kind: ClusterChangeKind::Merged,
                    new_members,
                    absorbed,
                    rewritten,
                }
            }
        };
        changes.push(change);
    }

    check_partition(store, &arena.ids, &changes)?;
    Ok(changes)
}

/// Apply `changes` to the current mapping in memory and verify the result.
///
/// Checks that every node ends in exactly one class, that no catalogid is written twice,
/// that minted ids are fresh and that merges never increase the class count.
pub fn check_partition<S: TooStore>(
    store: &S,
    nodes: &[CatalogId],
    changes: &[ClusterChange],
) -> Result<(), TooError> {
    let mut mapping: FastHashMap<CatalogId, SdssId> = nodes
        .iter()
        .filter_map(|c| store.sdss_id_of(*c).map(|s| (*c, s)))
        .collect();
    let classes_before: BTreeSet<SdssId> = mapping.values().copied().collect();

    let mut written: BTreeSet<CatalogId> = BTreeSet::new();
    let mut absorbed_all: BTreeSet<SdssId> = BTreeSet::new();
    let mut n_minted = 0;
    let max_existing = store.max_sdss_id();

    for change in changes {
        for cid in change.new_members.iter().chain(&change.rewritten) {
            if !written.insert(*cid) {
                return Err(TooError::PartitionViolation(format!(
                    "catalogid {cid} is written by two cluster changes"
                )));
            }
            mapping.insert(*cid, change.sdss_id);
        }
        if change.kind == ClusterChangeKind::Minted {
            if max_existing.is_some_and(|m| change.sdss_id <= m) {
                return Err(TooError::PartitionViolation(format!(
                    "minted sdss_id {} is not above the counter",
                    change.sdss_id
                )));
            }
            n_minted += 1;
        }
        for absorbed in &change.absorbed {
            if *absorbed <= change.sdss_id || !absorbed_all.insert(*absorbed) {
                return Err(TooError::PartitionViolation(format!(
                    "sdss_id {absorbed} cannot be absorbed into {}",
                    change.sdss_id
                )));
            }
        }
    }

    if let Some(cid) = nodes.iter().find(|c| !mapping.contains_key(c)) {
        return Err(TooError::PartitionViolation(format!(
            "catalogid {cid} is left without an sdss_id"
        )));
    }
    if let Some((cid, sdss_id)) = mapping.iter().find(|(_, s)| absorbed_all.contains(s)) {
        return Err(TooError::PartitionViolation(format!(
            "catalogid {cid} still maps to absorbed sdss_id {sdss_id}"
        )));
    }

    let classes_after: BTreeSet<SdssId> = mapping.values().copied().collect();
    if classes_after.len() > classes_before.len() + n_minted {
        return Err(TooError::PartitionViolation(format!(
            "class count grew from {} to {} with {} minted",
            classes_before.len(),
            classes_after.len(),
            n_minted
        )));
    }
    Ok(())
}

fn commit_with_retry<S: TooStore>(
    store: &mut S,
    change: &ClusterChange,
    backoff: Duration,
) -> Result<bool, TooError> {
    match store.commit_cluster(change) {
        Ok(()) => Ok(false),
        Err(TooError::MergeConflict { sdss_id }) => {
            warn!(sdss_id, ?backoff, "merge conflict, retrying once");
            std::thread::sleep(backoff);
            store.commit_cluster(change).map(|()| true)
        }
        Err(err) => Err(err),
    }
}

/// Resolve the stable identities of the catalog identities linked by `units`.
///
/// Arguments
/// -----------------
/// * `store`: the store, written by this single writer.
/// * `units`: cross-match results of the run.
/// * `version`: processing version recorded in the diff.
/// * `params`: resolver configuration.
/// * `journal`: receives every committed change.
/// * `should_cancel`: polled before each commit; returning `true` stops the run with
///   `TooError::Cancelled` between two complete commits.
///
/// Return
/// ----------
/// * a [`ResolutionReport`], or the first error that aborted the run.
#[instrument(skip_all, fields(units = units.len(), version))]
pub fn resolve_identities<S, F>(
    store: &mut S,
    units: &[MatchUnit],
    version: VersionId,
    params: &ResolverParams,
    journal: &mut DiffJournal,
    mut should_cancel: F,
) -> Result<ResolutionReport, TooError>
where
    S: TooStore,
    F: FnMut() -> bool,
{
    let changes = plan_resolution(store, units, params)?;
    let mut report = ResolutionReport {
        n_classes_before: store.sdss_ids().len(),
        ..Default::default()
    };

    for change in &changes {
        if should_cancel() {
            warn!(committed = report.n_changes(), "identity resolution cancelled");
            return Err(TooError::Cancelled("identity resolution"));
        }
        let retried = commit_with_retry(store, change, params.merge_retry_backoff)?;
        journal.record(&*store, change, version);

        debug!(sdss_id = change.sdss_id, kind = %change.kind, rows = change.n_rows(), "cluster committed");
        match change.kind {
            ClusterChangeKind::Minted => report.n_minted += 1,
            ClusterChangeKind::Extended => report.n_extended += 1,
            ClusterChangeKind::Merged => report.n_merged += 1,
        }
        report.n_absorbed += change.absorbed.len();
        report.n_rows += change.n_rows();
        report.n_retried += usize::from(retried);
    }

    report.n_classes_after = store.sdss_ids().len();
    info!(%report, "identity resolution done");
    Ok(report)
}
