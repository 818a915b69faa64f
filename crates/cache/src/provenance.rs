//! Provenance snapshots and cohort-wide consistency checks
//!
//! Every cache entry records the versions of the tools and libraries that
//! produced it. The ledger compares those snapshots:
//!
//! - within one computation, two entries carrying the same dependency at
//!   different versions are an **error** (part of the cohort was computed
//!   under a materially different environment);
//! - a dependency recorded by only some entries of a computation is a
//!   **warning**;
//! - disagreement between different computations is at most a **warning**,
//!   since they legitimately depend on different tool sets.
//!
//! Findings are returned as data; nothing here fails or mutates the cache.
//! Entry files that could not be read are carried on the report and make it
//! a warning at least, since their provenance is unknown.

use crate::store::EntryRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Dependency name to version string, captured when a value is computed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvenanceSnapshot(BTreeMap<String, String>);

impl ProvenanceSnapshot {
    /// Create an empty snapshot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, dependency: impl Into<String>, version: impl Into<String>) -> Self {
        self.0.insert(dependency.into(), version.into());
        self
    }

    /// Snapshot naming this crate and its version
    #[must_use]
    pub fn current_crate() -> Self {
        Self::new().with(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    /// Version recorded for a dependency
    #[must_use]
    pub fn get(&self, dependency: &str) -> Option<&str> {
        self.0.get(dependency).map(String::as_str)
    }

    /// Iterate dependencies in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of recorded dependencies
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of the underlying mapping
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProvenanceSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for ProvenanceSnapshot {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Source of the current environment's provenance
///
/// Implemented by the analysis layer, which knows which tool versions are in
/// play (annotation releases, predictor versions, ...).
pub trait EnvironmentProbe {
    /// Versions in effect right now
    fn snapshot(&self) -> ProvenanceSnapshot;
}

impl EnvironmentProbe for ProvenanceSnapshot {
    fn snapshot(&self) -> ProvenanceSnapshot {
        self.clone()
    }
}

impl<F> EnvironmentProbe for F
where
    F: Fn() -> ProvenanceSnapshot,
{
    fn snapshot(&self) -> ProvenanceSnapshot {
        self()
    }
}

/// Two-way difference between the current environment and a cached snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvenanceDiff {
    /// Dependencies known now but not recorded in the cache
    pub only_current: BTreeMap<String, String>,
    /// Dependencies recorded in the cache but unknown now
    pub only_cached: BTreeMap<String, String>,
    /// Dependencies whose version changed, as (current, cached)
    pub changed: BTreeMap<String, (String, String)>,
}

impl ProvenanceDiff {
    /// Number of pins present on one side but not the other
    ///
    /// A changed version counts twice: the current pin is missing from the
    /// cache and the cached pin is missing from the current environment.
    #[must_use]
    pub fn discrepancies(&self) -> usize {
        self.only_current.len() + self.only_cached.len() + 2 * self.changed.len()
    }

    /// Whether the two snapshots agree
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.discrepancies() == 0
    }
}

impl fmt::Display for ProvenanceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.only_current.is_empty() {
            parts.push(format!(
                "in current environment but not cached: {}",
                join_pins(&self.only_current)
            ));
        }
        if !self.only_cached.is_empty() {
            parts.push(format!(
                "cached but not in current environment: {}",
                join_pins(&self.only_cached)
            ));
        }
        if !self.changed.is_empty() {
            let changed = self
                .changed
                .iter()
                .map(|(dep, (now, then))| format!("{dep} {then} -> {now}"))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("changed: {changed}"));
        }
        f.write_str(&parts.join("; "))
    }
}

fn join_pins(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}=={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compare the current environment against a cached snapshot
///
/// An empty snapshot on either side means nothing was recorded, which is not
/// treated as a discrepancy.
#[must_use]
pub fn compare(current: &ProvenanceSnapshot, cached: &ProvenanceSnapshot) -> ProvenanceDiff {
    let mut diff = ProvenanceDiff::default();
    if current.is_empty() || cached.is_empty() {
        return diff;
    }

    for (dep, now) in current.iter() {
        match cached.get(dep) {
            None => {
                diff.only_current.insert(dep.to_string(), now.to_string());
            }
            Some(then) if then != now => {
                diff.changed
                    .insert(dep.to_string(), (now.to_string(), then.to_string()));
            }
            Some(_) => {}
        }
    }
    for (dep, then) in cached.iter() {
        if current.get(dep).is_none() {
            diff.only_cached.insert(dep.to_string(), then.to_string());
        }
    }
    diff
}

/// Severity of a consistency finding, ordered from best to worst
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// All compared snapshots agree
    #[default]
    Consistent,
    /// Snapshots differ only in which dependencies they record, or some
    /// entries could not be read
    Warning,
    /// Snapshots record different versions of the same dependency
    Error,
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Consistent => "consistent",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// One dependency that does not line up across entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// How serious the disagreement is
    pub severity: Consistency,
    /// Computation the finding belongs to; `None` for cross-computation findings
    pub computation: Option<String>,
    /// Dependency name
    pub dependency: String,
    /// Each observed version with the patients (or computations) that carry it
    pub versions: BTreeMap<String, Vec<String>>,
    /// Patients (or computations) that do not record the dependency at all
    pub missing_from: Vec<String>,
}

/// Consistency of all entries of one computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    /// Computation name
    pub computation: String,
    /// Number of entries compared
    pub entries: usize,
    /// Worst finding severity in this group
    pub status: Consistency,
    /// The shared snapshot, present only when the group is consistent
    pub consensus: Option<ProvenanceSnapshot>,
    /// Per-dependency disagreements
    pub findings: Vec<Finding>,
    /// Dependencies that carry a single version across the group
    #[serde(skip)]
    agreed: BTreeMap<String, String>,
}

/// Summary of provenance consistency across a set of cache entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Worst severity over all groups and cross-group findings
    pub status: Consistency,
    /// Per-computation reports
    pub groups: BTreeMap<String, GroupReport>,
    /// Disagreements between computations (never worse than a warning)
    pub cross_group: Vec<Finding>,
    /// Entry files left out because they could not be read
    pub unreadable: Vec<UnreadableEntry>,
}

/// An entry file whose provenance could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableEntry {
    /// Path of the entry file
    pub path: PathBuf,
    /// Why it could not be read
    pub reason: String,
}

impl ConsistencyReport {
    /// Attach entries that were skipped; any of them raises the status to a warning
    #[must_use]
    pub fn with_unreadable<I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = UnreadableEntry>,
    {
        self.unreadable.extend(entries);
        if !self.unreadable.is_empty() {
            self.status = self.status.max(Consistency::Warning);
        }
        self
    }

    /// Whether every entry agrees with every other
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.status == Consistency::Consistent
    }

    /// Report for one computation
    #[must_use]
    pub fn group(&self, computation: &str) -> Option<&GroupReport> {
        self.groups.get(computation)
    }

    /// All findings, group findings first
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.groups
            .values()
            .flat_map(|g| g.findings.iter())
            .chain(self.cross_group.iter())
    }

    /// The one snapshot shared by every computation, if there is one
    #[must_use]
    pub fn cohort_provenance(&self) -> Option<ProvenanceSnapshot> {
        let mut consensus = self.groups.values().map(|g| g.consensus.as_ref());
        let first = consensus.next()??;
        consensus
            .all(|c| c == Some(first))
            .then(|| first.clone())
    }
}

/// Compare the provenance of a set of entries
#[must_use]
pub fn summarize<'a, I>(entries: I) -> ConsistencyReport
where
    I: IntoIterator<Item = &'a EntryRecord>,
{
    let mut by_computation: BTreeMap<&str, Vec<&EntryRecord>> = BTreeMap::new();
    for entry in entries {
        by_computation
            .entry(entry.key.computation())
            .or_default()
            .push(entry);
    }

    let groups: BTreeMap<String, GroupReport> = by_computation
        .into_iter()
        .map(|(name, members)| (name.to_string(), summarize_group(name, &members)))
        .collect();

    let cross_group = compare_groups(&groups);

    let status = groups
        .values()
        .map(|g| g.status)
        .chain(cross_group.iter().map(|f| f.severity))
        .max()
        .unwrap_or_default();

    ConsistencyReport {
        status,
        groups,
        cross_group,
        unreadable: Vec::new(),
    }
}

fn summarize_group(computation: &str, members: &[&EntryRecord]) -> GroupReport {
    let dependencies: BTreeSet<&str> = members
        .iter()
        .flat_map(|e| e.provenance.iter().map(|(dep, _)| dep))
        .collect();

    let mut findings = Vec::new();
    let mut agreed = BTreeMap::new();

    for dep in dependencies {
        let mut versions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut missing_from = Vec::new();
        for entry in members {
            let patient = entry.key.patient_id().to_string();
            match entry.provenance.get(dep) {
                Some(v) => versions.entry(v.to_string()).or_default().push(patient),
                None => missing_from.push(patient),
            }
        }

        // Any two entries that both record the dependency must agree on it
        let severity = if versions.len() > 1 {
            Consistency::Error
        } else if !missing_from.is_empty() {
            Consistency::Warning
        } else {
            Consistency::Consistent
        };

        if versions.len() == 1 {
            if let Some(version) = versions.keys().next() {
                agreed.insert(dep.to_string(), version.clone());
            }
        }

        if severity != Consistency::Consistent {
            findings.push(Finding {
                severity,
                computation: Some(computation.to_string()),
                dependency: dep.to_string(),
                versions,
                missing_from,
            });
        }
    }

    let status = findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or_default();
    let consensus =
        (status == Consistency::Consistent).then(|| ProvenanceSnapshot::from(agreed.clone()));

    GroupReport {
        computation: computation.to_string(),
        entries: members.len(),
        status,
        consensus,
        findings,
        agreed,
    }
}

fn compare_groups(groups: &BTreeMap<String, GroupReport>) -> Vec<Finding> {
    let mut by_dependency: BTreeMap<&str, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for group in groups.values() {
        for (dep, version) in &group.agreed {
            by_dependency
                .entry(dep.as_str())
                .or_default()
                .entry(version.clone())
                .or_default()
                .push(group.computation.clone());
        }
    }

    by_dependency
        .into_iter()
        .filter(|(_, versions)| versions.len() > 1)
        .map(|(dep, versions)| Finding {
            severity: Consistency::Warning,
            computation: None,
            dependency: dep.to_string(),
            versions,
            missing_from: Vec::new(),
        })
        .collect()
}
