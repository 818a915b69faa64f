//! Cache facade and per-patient batch population

use crate::config::CacheConfig;
use crate::key::{CacheKey, Params, derive_key};
use crate::provenance::{ConsistencyReport, EnvironmentProbe, compare};
use crate::store::{CacheStore, CachedValue};
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;

/// A patient whose value could not be produced
#[derive(Debug)]
pub struct PatientFailure {
    /// Patient the failure belongs to
    pub patient_id: String,
    /// What went wrong
    pub error: Error,
}

/// Result of a batch call over many patients
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Values by patient id
    pub values: BTreeMap<String, T>,
    /// Patients that failed; the rest of the batch is unaffected
    pub failures: Vec<PatientFailure>,
    /// Patients with nothing cached (read-only batches only)
    pub missing: Vec<String>,
    /// Patients whose corrupt entry was discarded and recomputed
    pub recovered: Vec<String>,
    /// Number of values served from the cache
    pub hits: usize,
    /// Number of values computed by the caller's function
    pub computed: usize,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            failures: Vec::new(),
            missing: Vec::new(),
            recovered: Vec::new(),
            hits: 0,
            computed: 0,
        }
    }
}

impl<T> BatchOutcome<T> {
    /// Whether every patient produced a value
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.missing.is_empty()
    }

    /// Ids of the failed patients
    pub fn failed_patients(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.patient_id.as_str())
    }
}

/// Where a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Hit,
    Computed,
    Recovered,
}

/// Provenance-aware result cache for one cache root
///
/// `P` supplies the provenance recorded with every write and compared on
/// reads when `check_provenance` is on.
pub struct Cache<P> {
    store: CacheStore,
    config: CacheConfig,
    probe: P,
}

impl<P> fmt::Debug for Cache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: EnvironmentProbe> Cache<P> {
    /// Open a cache, resolving its root from `config`
    pub fn new(config: CacheConfig, probe: P) -> Result<Self> {
        let root = config.resolve_root()?;
        tracing::debug!(
            root = %root.display(),
            enabled = config.enabled,
            check_provenance = config.check_provenance,
            "opened cohort cache"
        );
        Ok(Self {
            store: CacheStore::new(root),
            config,
            probe,
        })
    }

    /// The underlying entry store
    #[must_use]
    pub const fn store(&self) -> &CacheStore {
        &self.store
    }

    /// The active configuration
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Derive the key for one computation over one patient
    pub fn key(&self, computation: &str, patient_id: &str, params: &Params) -> Result<CacheKey> {
        derive_key(computation, patient_id, params)
    }

    /// Whether a value is cached for `key`
    #[must_use]
    pub fn has(&self, key: &CacheKey) -> bool {
        self.config.enabled && self.store.has(key)
    }

    /// Read a cached value, warning when its provenance differs from now
    pub fn fetch<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<CachedValue<T>> {
        if !self.config.enabled {
            return Err(Error::cache_miss(key.to_string()));
        }
        let cached = self.store.get(key)?;
        if self.config.check_provenance {
            let diff = compare(&self.probe.snapshot(), &cached.provenance);
            if !diff.is_empty() {
                tracing::warn!(
                    key = %key,
                    discrepancies = diff.discrepancies(),
                    "cached provenance differs from current environment: {diff}"
                );
            }
        }
        Ok(cached)
    }

    /// Store a value together with the current environment's provenance
    pub fn put<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.store.put(key, value, &self.probe.snapshot())
    }

    /// Remove one entry
    pub fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.store.delete(key)
    }

    /// Remove all entries of one computation
    pub fn clear_computation(&self, computation: &str) -> Result<bool> {
        self.store.clear_computation(computation)
    }

    /// Remove the whole cache root
    pub fn clear_all(&self) -> Result<()> {
        self.store.clear_all()
    }

    /// Return the cached value, or compute, store and return it
    ///
    /// A corrupt entry is logged and replaced by a fresh computation.
    pub fn get_or_compute<T, E, F>(
        &self,
        computation: &str,
        patient_id: &str,
        params: &Params,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        self.resolve(computation, patient_id, params, compute)
            .map(|(value, _)| value)
    }

    fn resolve<T, E, F>(
        &self,
        computation: &str,
        patient_id: &str,
        params: &Params,
        compute: F,
    ) -> Result<(T, Source)>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let key = derive_key(computation, patient_id, params)?;

        let mut source = Source::Computed;
        match self.fetch::<T>(&key) {
            Ok(cached) => return Ok((cached.value, Source::Hit)),
            Err(err) if err.is_miss() => {}
            Err(err) if err.is_corrupt() => {
                tracing::warn!(
                    computation,
                    patient_id,
                    error = %err,
                    "discarding corrupt cache entry and recomputing"
                );
                source = Source::Recovered;
            }
            Err(err) => return Err(err),
        }

        let value = compute()
            .map_err(|e| Error::computation(computation, patient_id, e.to_string()))?;
        self.put(&key, &value)?;
        Ok((value, source))
    }

    /// Fill the cache for many patients, computing what is missing
    ///
    /// Each job is a patient id with that patient's parameters. A failure for
    /// one patient (bad parameters, unwritable entry, failed computation) is
    /// recorded in the outcome and the remaining patients still run.
    pub fn populate<T, E, F, I, S>(
        &self,
        computation: &str,
        jobs: I,
        mut compute: F,
    ) -> BatchOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnMut(&str) -> std::result::Result<T, E>,
        I: IntoIterator<Item = (S, Params)>,
        S: AsRef<str>,
    {
        let mut outcome = BatchOutcome::default();
        for (patient, params) in jobs {
            let patient_id = patient.as_ref();
            match self.resolve(computation, patient_id, &params, || compute(patient_id)) {
                Ok((value, source)) => {
                    match source {
                        Source::Hit => outcome.hits += 1,
                        Source::Computed => outcome.computed += 1,
                        Source::Recovered => {
                            outcome.computed += 1;
                            outcome.recovered.push(patient_id.to_string());
                        }
                    }
                    outcome.values.insert(patient_id.to_string(), value);
                }
                Err(error) => {
                    tracing::warn!(
                        computation,
                        patient_id,
                        error = %error,
                        "patient failed during cache population"
                    );
                    outcome.failures.push(PatientFailure {
                        patient_id: patient_id.to_string(),
                        error,
                    });
                }
            }
        }
        log_outcome(computation, &outcome);
        outcome
    }

    /// Read cached values for many patients without computing anything
    ///
    /// Misses are listed in [`BatchOutcome::missing`]; corrupt entries and
    /// other errors are recorded as failures.
    pub fn load<T, I, S>(&self, computation: &str, jobs: I) -> BatchOutcome<T>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = (S, Params)>,
        S: AsRef<str>,
    {
        let mut outcome = BatchOutcome::default();
        for (patient, params) in jobs {
            let patient_id = patient.as_ref();
            let fetched = derive_key(computation, patient_id, &params)
                .and_then(|key| self.fetch::<T>(&key));
            match fetched {
                Ok(cached) => {
                    outcome.hits += 1;
                    outcome.values.insert(patient_id.to_string(), cached.value);
                }
                Err(err) if err.is_miss() => outcome.missing.push(patient_id.to_string()),
                Err(error) => {
                    tracing::warn!(
                        computation,
                        patient_id,
                        error = %error,
                        "failed to load cached value"
                    );
                    outcome.failures.push(PatientFailure {
                        patient_id: patient_id.to_string(),
                        error,
                    });
                }
            }
        }
        log_outcome(computation, &outcome);
        outcome
    }

    /// Compare the provenance of stored entries, optionally for one computation
    ///
    /// Entry files that cannot be read are listed in
    /// [`ConsistencyReport::unreadable`].
    pub fn summarize(&self, computation: Option<&str>) -> Result<ConsistencyReport> {
        let scan = self.store.entries(computation)?;
        if !scan.unreadable.is_empty() {
            tracing::warn!(
                unreadable = scan.unreadable.len(),
                "some cache entries were left out of the provenance summary"
            );
        }
        Ok(scan.summarize())
    }
}

fn log_outcome<T>(computation: &str, outcome: &BatchOutcome<T>) {
    tracing::info!(
        computation,
        values = outcome.values.len(),
        hits = outcome.hits,
        computed = outcome.computed,
        recovered = outcome.recovered.len(),
        missing = outcome.missing.len(),
        failures = outcome.failures.len(),
        "batch finished"
    );
}
