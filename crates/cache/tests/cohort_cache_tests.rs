//! End-to-end tests for cohort cache population and provenance summaries

use cohorts_cache::{
    Cache, CacheConfig, CacheStore, CachedValue, Consistency, Error, Params, ProvenanceSnapshot,
    derive_key,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NeoantigenSummary {
    total: u32,
    strong_binders: u32,
    alleles: Vec<String>,
}

const PATIENTS: [&str; 5] = ["p1", "p2", "p3", "p4", "p5"];

fn environment() -> ProvenanceSnapshot {
    ProvenanceSnapshot::new()
        .with("cohorts", "0.4.0")
        .with("pyensembl", "1.0.3")
        .with("varcode", "0.5.10")
        .with("topiary", "0.1.0")
}

fn patient_params(patient: &str) -> Params {
    Params::new()
        .with("merge_type", "union")
        .with(
            "variant_files",
            vec![
                format!("/data/{patient}/snv.vcf"),
                format!("/data/{patient}/indel.vcf"),
            ],
        )
        .with(
            "filter",
            Params::new()
                .with("name", "variant_qc_filter")
                .with("min_tumor_depth", 7)
                .with("min_tumor_vaf", 0.05),
        )
}

fn jobs() -> Vec<(&'static str, Params)> {
    PATIENTS.iter().map(|p| (*p, patient_params(p))).collect()
}

fn summary_for(patient: &str) -> NeoantigenSummary {
    NeoantigenSummary {
        total: patient.len() as u32 * 10,
        strong_binders: 3,
        alleles: vec!["HLA-A*02:01".into(), "HLA-B*07:02".into()],
    }
}

fn open(temp: &TempDir) -> Cache<ProvenanceSnapshot> {
    Cache::new(CacheConfig::with_root(temp.path()), environment()).unwrap()
}

#[test]
fn batch_load_isolates_corrupt_patient() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);

    let filled = cache.populate("neoantigens", jobs(), |p| {
        Ok::<_, String>(summary_for(p))
    });
    assert_eq!(filled.computed, 5);

    let broken = derive_key("neoantigens", "p3", &patient_params("p3")).unwrap();
    fs::write(cache.store().entry_path(&broken), b"{\"format_version\":1,\"val").unwrap();

    let outcome = cache.load::<NeoantigenSummary, _, _>("neoantigens", jobs());

    assert_eq!(outcome.values.len(), 4);
    assert!(!outcome.values.contains_key("p3"));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].patient_id, "p3");
    assert!(outcome.failures[0].error.is_corrupt());
    assert!(outcome.missing.is_empty());
    assert!(!outcome.is_complete());
}

#[test]
fn batch_populate_isolates_failing_computation() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);

    let outcome = cache.populate("neoantigens", jobs(), |p| {
        if p == "p3" {
            Err(format!("no HLA typing for {p}"))
        } else {
            Ok(summary_for(p))
        }
    });

    assert_eq!(outcome.values.len(), 4);
    assert_eq!(outcome.failed_patients().collect::<Vec<_>>(), vec!["p3"]);
    assert!(matches!(
        &outcome.failures[0].error,
        Error::Computation { message, .. } if message.contains("HLA typing")
    ));

    // The failed patient is retried on the next run; the others are hits
    let retry = cache.populate("neoantigens", jobs(), |p| Ok::<_, String>(summary_for(p)));
    assert_eq!((retry.hits, retry.computed), (4, 1));
    assert!(retry.is_complete());
}

#[test]
fn batch_populate_recomputes_corrupt_entries_and_reports_them() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);
    cache.populate("neoantigens", jobs(), |p| Ok::<_, String>(summary_for(p)));

    let broken = derive_key("neoantigens", "p3", &patient_params("p3")).unwrap();
    fs::write(cache.store().entry_path(&broken), b"garbage").unwrap();

    let computed_for = RefCell::new(Vec::new());
    let outcome = cache.populate("neoantigens", jobs(), |p| {
        computed_for.borrow_mut().push(p.to_string());
        Ok::<_, String>(summary_for(p))
    });

    assert_eq!(outcome.values.len(), 5);
    assert_eq!(outcome.hits, 4);
    assert_eq!(outcome.recovered, vec!["p3".to_string()]);
    assert_eq!(computed_for.into_inner(), vec!["p3".to_string()]);
    let repaired: CachedValue<NeoantigenSummary> = cache.fetch(&broken).unwrap();
    assert_eq!(repaired.value, summary_for("p3"));
}

#[test]
fn batch_load_lists_misses_separately() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);
    cache.populate("neoantigens", jobs().into_iter().take(2), |p| {
        Ok::<_, String>(summary_for(p))
    });

    let outcome = cache.load::<NeoantigenSummary, _, _>("neoantigens", jobs());
    assert_eq!(outcome.values.len(), 2);
    assert_eq!(outcome.missing, vec!["p3", "p4", "p5"]);
    assert!(outcome.failures.is_empty());
}

#[test]
fn entry_lifecycle() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::new(temp.path());
    let key = derive_key("effects", "p1", &patient_params("p1")).unwrap();

    // ABSENT
    assert!(!store.has(&key));
    assert!(matches!(
        store.get::<u32>(&key),
        Err(Error::CacheMiss { .. })
    ));

    // PRESENT
    store.put(&key, &1_u32, &environment()).unwrap();
    assert!(store.has(&key));

    // PRESENT(new value)
    store.put(&key, &2_u32, &environment()).unwrap();
    assert_eq!(store.get::<u32>(&key).unwrap().value, 2);

    // ABSENT again
    assert!(store.delete(&key).unwrap());
    assert!(!store.has(&key));
    assert!(matches!(
        store.get::<u32>(&key),
        Err(Error::CacheMiss { .. })
    ));
}

#[test]
fn cohort_split_across_tool_versions_is_an_error() {
    let temp = TempDir::new().unwrap();
    let old = open(&temp);
    let new = Cache::new(
        CacheConfig::with_root(temp.path()),
        environment().with("varcode", "0.6.0"),
    )
    .unwrap();

    old.populate("effects", jobs().into_iter().take(3), |_| Ok::<_, String>(1_u32));
    new.populate("effects", jobs().into_iter().skip(3), |_| Ok::<_, String>(1_u32));
    old.populate("neoantigens", jobs(), |p| Ok::<_, String>(summary_for(p)));

    let report = new.summarize(None).unwrap();
    assert_eq!(report.status, Consistency::Error);

    let effects = report.group("effects").unwrap();
    assert_eq!(effects.status, Consistency::Error);
    let finding = &effects.findings[0];
    assert_eq!(finding.dependency, "varcode");
    assert_eq!(finding.versions["0.5.10"], vec!["p1", "p2", "p3"]);
    assert_eq!(finding.versions["0.6.0"], vec!["p4", "p5"]);

    let neo = report.group("neoantigens").unwrap();
    assert_eq!(neo.status, Consistency::Consistent);
    assert_eq!(neo.consensus.as_ref(), Some(&environment()));
}

#[test]
fn summarize_does_not_touch_the_cache() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);
    cache.populate("neoantigens", jobs(), |p| Ok::<_, String>(summary_for(p)));

    let before = cache.store().entries(None).unwrap().records;
    let first = cache.summarize(None).unwrap();
    let second = cache.summarize(None).unwrap();
    let after = cache.store().entries(None).unwrap().records;

    assert_eq!(first, second);
    assert_eq!(before, after);
    assert_eq!(first.cohort_provenance(), Some(environment()));
}

#[test]
fn summarize_lists_unreadable_entries() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);
    cache.populate("neoantigens", jobs(), |p| Ok::<_, String>(summary_for(p)));
    let broken = derive_key("neoantigens", "p2", &patient_params("p2")).unwrap();
    fs::write(cache.store().entry_path(&broken), b"").unwrap();

    let report = cache.summarize(Some("neoantigens")).unwrap();
    assert_eq!(report.group("neoantigens").unwrap().entries, 4);
    assert_eq!(report.group("neoantigens").unwrap().status, Consistency::Consistent);
    assert_eq!(report.unreadable.len(), 1);
    assert_eq!(report.unreadable[0].path, cache.store().entry_path(&broken));
    assert_eq!(report.status, Consistency::Warning);
    assert!(!report.is_consistent());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ExpressionFeatures {
    gene: String,
    tpm: f64,
    log_fold_change: Option<f64>,
}

#[test]
fn populate_reports_values_json_cannot_hold() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);
    let features = |p: &str| {
        Ok::<_, String>(ExpressionFeatures {
            gene: "CD8A".into(),
            tpm: 41.7,
            log_fold_change: (p == "p1").then_some(f64::NAN).or(Some(-0.37)),
        })
    };

    for _ in 0..2 {
        let outcome = cache.populate("expression", jobs(), features);
        assert_eq!(outcome.values.len(), 4);
        assert_eq!(outcome.failed_patients().collect::<Vec<_>>(), vec!["p1"]);
        assert!(matches!(
            outcome.failures[0].error,
            Error::Serialization { .. }
        ));
        assert!(outcome.recovered.is_empty());
    }

    let key = derive_key("expression", "p1", &patient_params("p1")).unwrap();
    assert!(!cache.store().has(&key));
    let loaded = cache.load::<ExpressionFeatures, _, _>("expression", jobs());
    assert_eq!(loaded.values.len(), 4);
    assert_eq!(loaded.missing, vec!["p1"]);
    assert!(loaded.failures.is_empty());
}

#[test]
fn clearing_one_computation_keeps_others() {
    let temp = TempDir::new().unwrap();
    let cache = open(&temp);
    cache.populate("effects", jobs(), |_| Ok::<_, String>(1_u32));
    cache.populate("neoantigens", jobs(), |p| Ok::<_, String>(summary_for(p)));

    assert!(cache.clear_computation("effects").unwrap());

    let effects = cache.load::<u32, _, _>("effects", jobs());
    assert_eq!(effects.missing.len(), 5);
    let neo = cache.load::<NeoantigenSummary, _, _>("neoantigens", jobs());
    assert_eq!(neo.values.len(), 5);

    cache.clear_all().unwrap();
    let neo = cache.load::<NeoantigenSummary, _, _>("neoantigens", jobs());
    assert_eq!(neo.missing.len(), 5);
}
