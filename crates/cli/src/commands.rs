//! Command execution

use crate::cli::{Cli, Commands};
use cohorts_cache::{
    CacheConfig, CacheKey, CacheStore, Consistency, ConsistencyReport, EntryScan, Finding,
    Fingerprint, UnreadableEntry,
};
use miette::IntoDiagnostic;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

/// Exit code when the provenance summary contains errors
pub const EXIT_INCONSISTENT: i32 = 2;

/// Resolve the cache configuration from flags, config file and environment
pub fn load_config(cli: &Cli) -> miette::Result<CacheConfig> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        config.root = Some(dir.clone());
    }
    Ok(config)
}

/// Run the parsed command, writing results to `out`; returns the exit code
pub fn execute(cli: Cli, out: &mut impl Write) -> miette::Result<i32> {
    let config = load_config(&cli)?;
    let store = CacheStore::new(config.resolve_root()?);
    tracing::debug!(root = %store.root().display(), "using cache root");

    match cli.command {
        Commands::List { computation, json } => {
            let scan = store.entries(computation.as_deref())?;
            if json {
                write_json(out, &ScanView::from(&scan))?;
            } else {
                render_list(out, &scan).into_diagnostic()?;
            }
            Ok(0)
        }
        Commands::Summarize { computation, json } => {
            let report = store.entries(computation.as_deref())?.summarize();
            if json {
                write_json(out, &report)?;
            } else {
                render_report(out, &report).into_diagnostic()?;
            }
            Ok(if report.status == Consistency::Error {
                EXIT_INCONSISTENT
            } else {
                0
            })
        }
        Commands::Delete {
            computation,
            patient,
            fingerprint,
        } => {
            let key = CacheKey::new(computation, patient, Fingerprint::parse(&fingerprint)?)?;
            if store.delete(&key)? {
                writeln!(out, "deleted {key}").into_diagnostic()?;
            } else {
                writeln!(out, "no entry for {key}").into_diagnostic()?;
            }
            Ok(0)
        }
        Commands::Clear { computation, all } => {
            if all {
                store.clear_all()?;
                writeln!(out, "cleared {}", store.root().display()).into_diagnostic()?;
            } else if let Some(name) = computation {
                if store.clear_computation(&name)? {
                    writeln!(out, "cleared {name}").into_diagnostic()?;
                } else {
                    writeln!(out, "nothing cached for {name}").into_diagnostic()?;
                }
            }
            Ok(0)
        }
    }
}

#[derive(Serialize)]
struct ScanView<'a> {
    entries: &'a [cohorts_cache::EntryRecord],
    unreadable: Vec<UnreadableEntry>,
}

impl<'a> From<&'a EntryScan> for ScanView<'a> {
    fn from(scan: &'a EntryScan) -> Self {
        Self {
            entries: &scan.records,
            unreadable: scan.unreadable_entries().collect(),
        }
    }
}

fn write_json<T: Serialize>(out: &mut impl Write, value: &T) -> miette::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).into_diagnostic()?;
    writeln!(out).into_diagnostic()
}

fn render_list(out: &mut impl Write, scan: &EntryScan) -> std::io::Result<()> {
    for record in &scan.records {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{} dependencies",
            record.key.computation(),
            record.key.patient_id(),
            record.key.fingerprint().short(),
            record.created_at.to_rfc3339(),
            record.provenance.len()
        )?;
    }
    render_unreadable(out, &scan.unreadable_entries().collect::<Vec<_>>())
}

fn render_unreadable(
    out: &mut impl Write,
    unreadable: &[UnreadableEntry],
) -> std::io::Result<()> {
    if unreadable.is_empty() {
        return Ok(());
    }
    writeln!(out, "unreadable entries: {}", unreadable.len())?;
    for entry in unreadable {
        writeln!(out, "  {} ({})", entry.path.display(), entry.reason)?;
    }
    Ok(())
}

fn render_versions(versions: &BTreeMap<String, Vec<String>>) -> String {
    versions
        .iter()
        .map(|(version, holders)| format!("{version} [{}]", holders.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

fn render_finding(out: &mut impl Write, finding: &Finding) -> std::io::Result<()> {
    write!(
        out,
        "  {} {}: {}",
        finding.severity,
        finding.dependency,
        render_versions(&finding.versions)
    )?;
    if !finding.missing_from.is_empty() {
        write!(out, "; missing from [{}]", finding.missing_from.join(", "))?;
    }
    writeln!(out)
}

/// Human-readable provenance summary
pub fn render_report(out: &mut impl Write, report: &ConsistencyReport) -> std::io::Result<()> {
    for group in report.groups.values() {
        writeln!(
            out,
            "{}: {} ({} entries)",
            group.computation, group.status, group.entries
        )?;
        if let Some(consensus) = &group.consensus {
            let pins = consensus
                .iter()
                .map(|(dep, version)| format!("{dep}=={version}"))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "  {pins}")?;
        }
        for finding in &group.findings {
            render_finding(out, finding)?;
        }
    }
    if !report.cross_group.is_empty() {
        writeln!(out, "across computations:")?;
        for finding in &report.cross_group {
            render_finding(out, finding)?;
        }
    }
    writeln!(out, "overall: {}", report.status)?;
    render_unreadable(out, &report.unreadable)
}
