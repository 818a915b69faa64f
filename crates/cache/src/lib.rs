//! Provenance-aware result caching for cohort analyses
//!
//! Derived per-patient features (variant effects, neoantigen calls, mutation
//! counts) are expensive to compute. This crate memoizes them on disk:
//! - Deterministic cache keys from a computation name, a patient id and the
//!   computation's named parameters
//! - Atomic, per-patient entry files under a cache root
//! - A provenance snapshot (tool and library versions) stored with every entry
//! - Cohort-wide consistency reports over those snapshots
//!
//! # Overview
//!
//! ```no_run
//! use cohorts_cache::{Cache, CacheConfig, Params, ProvenanceSnapshot};
//!
//! # fn main() -> cohorts_cache::Result<()> {
//! let env = ProvenanceSnapshot::new().with("varcode", "0.5.10");
//! let cache = Cache::new(CacheConfig::with_root("/tmp/cohort-cache"), env)?;
//!
//! let jobs = ["p1", "p2"].map(|id| (id, Params::new().with("vcf", format!("{id}.vcf"))));
//! let outcome = cache.populate("snv-count", jobs, |_patient| Ok::<_, String>(12_u32));
//! assert!(outcome.failures.is_empty());
//!
//! let report = cache.summarize(Some("snv-count"))?;
//! assert!(report.is_consistent());
//! # Ok(())
//! # }
//! ```
//!
//! # Invalidation
//!
//! Entries never expire. Delete an entry, a computation namespace, or the
//! whole cache root to force recomputation.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

mod batch;
mod config;
mod error;
mod finite;
pub mod key;
pub mod provenance;
pub mod store;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use batch::{BatchOutcome, Cache, PatientFailure};
pub use config::{CACHE_DIR_ENV, CacheConfig, default_cache_root};
pub use key::{CacheKey, Fingerprint, ParamValue, Params, derive_key};
pub use provenance::{
    Consistency, ConsistencyReport, EnvironmentProbe, Finding, GroupReport, ProvenanceDiff,
    ProvenanceSnapshot, UnreadableEntry, compare, summarize,
};
pub use store::{CacheStore, CachedValue, EntryRecord, EntryScan};
