//! Deterministic cache keys derived from computation inputs
//!
//! A key is the triple (computation name, patient id, parameter fingerprint).
//! The fingerprint is the SHA-256 of a canonical JSON envelope in which every
//! mapping is sorted by name, so callers that build the same logical
//! parameters in a different order collide on the same key.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Length of a hex-encoded SHA-256 digest
const FINGERPRINT_LEN: usize = 64;

/// A single digestible parameter value
///
/// The set of kinds is closed: anything that cannot be expressed here has no
/// canonical textual form and is rejected during key derivation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// UTF-8 string (file paths, content identifiers, filter names)
    Str(String),
    /// Signed integer
    Int(i64),
    /// Finite floating point number
    Float(f64),
    /// Boolean flag
    Bool(bool),
    /// Ordered sequence; element order is significant
    List(Vec<ParamValue>),
    /// Nested named parameters; normalized by name before digesting
    Map(Params),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&Path> for ParamValue {
    fn from(value: &Path) -> Self {
        Self::Str(value.to_string_lossy().into_owned())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Params> for ParamValue {
    fn from(value: Params) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl ParamValue {
    /// Convert an arbitrary JSON value into a parameter value
    pub fn from_json(name: &str, value: serde_json::Value) -> Result<Self> {
        use serde_json::Value;
        match value {
            Value::Null => Err(Error::invalid_parameter(
                name,
                "null has no canonical representation",
            )),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::String(s) => Ok(Self::Str(s)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if n.is_u64() {
                    Err(Error::invalid_parameter(
                        name,
                        format!("integer {n} does not fit in i64"),
                    ))
                } else {
                    n.as_f64().map(Self::Float).ok_or_else(|| {
                        Error::invalid_parameter(name, format!("unrepresentable number {n}"))
                    })
                }
            }
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| Self::from_json(&format!("{name}[{i}]"), item))
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            Value::Object(map) => {
                let mut params = Params::new();
                for (k, v) in map {
                    let child = Self::from_json(&format!("{name}.{k}"), v)?;
                    params.insert(k, child);
                }
                Ok(Self::Map(params))
            }
        }
    }

    fn canonical(&self, path: &str) -> Result<serde_json::Value> {
        use serde_json::Value;
        match self {
            Self::Str(s) => Ok(Value::String(s.clone())),
            Self::Int(i) => Ok(Value::from(*i)),
            Self::Bool(b) => Ok(Value::Bool(*b)),
            Self::Float(f) => {
                if !f.is_finite() {
                    return Err(Error::invalid_parameter(path, "float is not finite"));
                }
                // -0.0 and 0.0 compare equal and must digest equally
                let normalized = if *f == 0.0 { 0.0 } else { *f };
                serde_json::Number::from_f64(normalized)
                    .map(Value::Number)
                    .ok_or_else(|| Error::invalid_parameter(path, "float is not finite"))
            }
            Self::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| item.canonical(&format!("{path}[{i}]")))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Self::Map(params) => params.canonical(Some(path)),
        }
    }
}

/// Named parameters of a computation
///
/// Construction order is preserved for display, but is irrelevant to the
/// fingerprint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    /// Create an empty parameter set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Append a named value
    ///
    /// Duplicate names are accepted here and rejected by [`derive_key`].
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Append any serializable value, converting it through JSON
    ///
    /// Sequences keep their serialized order, so unordered collections such
    /// as `HashSet` must be sorted by the caller first.
    pub fn insert_serialized<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        let name = name.into();
        let json = serde_json::to_value(value).map_err(|e| {
            Error::invalid_parameter(&name, format!("value is not serializable: {e}"))
        })?;
        let value = ParamValue::from_json(&name, json)?;
        self.entries.push((name, value));
        Ok(())
    }

    /// Number of top-level parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no parameters are set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate parameters in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn canonical(&self, parent: Option<&str>) -> Result<serde_json::Value> {
        let mut sorted: Vec<&(String, ParamValue)> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut map = serde_json::Map::new();
        for (name, value) in sorted {
            let path = parent.map_or_else(|| name.clone(), |p| format!("{p}.{name}"));
            if name.is_empty() {
                return Err(Error::invalid_parameter(path, "parameter name is empty"));
            }
            if map.contains_key(name) {
                return Err(Error::invalid_parameter(path, "parameter given more than once"));
            }
            map.insert(name.clone(), value.canonical(&path)?);
        }
        Ok(serde_json::Value::Object(map))
    }
}

/// Hex-encoded SHA-256 digest of a canonical key envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a fingerprint from its hex form
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == FINGERPRINT_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::invalid_parameter(
                "fingerprint",
                format!("`{s}` is not a lowercase hex SHA-256 digest"),
            ))
        }
    }

    /// The hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex characters, for log output
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    computation: String,
    patient_id: String,
    fingerprint: Fingerprint,
}

impl CacheKey {
    /// Reassemble a key from its parts, validating the identifiers
    pub fn new(
        computation: impl Into<String>,
        patient_id: impl Into<String>,
        fingerprint: Fingerprint,
    ) -> Result<Self> {
        let computation = computation.into();
        let patient_id = patient_id.into();
        validate_identifier("computation_name", &computation)?;
        validate_identifier("patient_id", &patient_id)?;
        Ok(Self {
            computation,
            patient_id,
            fingerprint,
        })
    }

    /// Name of the computation that produced the value
    #[must_use]
    pub fn computation(&self) -> &str {
        &self.computation
    }

    /// Patient the value belongs to
    #[must_use]
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Digest of the computation inputs
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.computation, self.patient_id, self.fingerprint
        )
    }
}

/// Canonical envelope that is hashed into the fingerprint
#[derive(Serialize)]
struct KeyEnvelope<'a> {
    computation: &'a str,
    patient_id: &'a str,
    params: serde_json::Value,
}

/// Derive the cache key for one computation over one patient
pub fn derive_key(computation: &str, patient_id: &str, params: &Params) -> Result<CacheKey> {
    validate_identifier("computation_name", computation)?;
    validate_identifier("patient_id", patient_id)?;

    let envelope = KeyEnvelope {
        computation,
        patient_id,
        params: params.canonical(None)?,
    };
    let bytes = serde_json::to_vec(&envelope)
        .map_err(|e| Error::serialization(format!("Failed to serialize key envelope: {e}")))?;
    let digest = Sha256::digest(bytes);

    Ok(CacheKey {
        computation: computation.to_string(),
        patient_id: patient_id.to_string(),
        fingerprint: Fingerprint(hex::encode(digest)),
    })
}

/// Identifiers become directory names, so they must be one safe path component
pub(crate) fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_parameter(kind, "must not be empty"));
    }
    if value == "." || value == ".." {
        return Err(Error::invalid_parameter(
            kind,
            format!("`{value}` is not a usable directory name"),
        ));
    }
    if value.starts_with('.') {
        return Err(Error::invalid_parameter(
            kind,
            format!("`{value}` must not start with '.'"),
        ));
    }
    if value.chars().any(|c| matches!(c, '/' | '\\' | '\0')) {
        return Err(Error::invalid_parameter(
            kind,
            format!("`{value}` contains a path separator or NUL"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    fn baseline() -> Params {
        Params::new()
            .with("variant_file", "/data/p1/somatic.vcf")
            .with("merge_type", "union")
            .with("min_depth", 10)
            .with("only_nonsynonymous", true)
    }

    #[test]
    fn key_is_deterministic_and_order_invariant() {
        let forward = baseline();
        let reversed = Params::new()
            .with("only_nonsynonymous", true)
            .with("min_depth", 10)
            .with("merge_type", "union")
            .with("variant_file", "/data/p1/somatic.vcf");

        let k1 = derive_key("neoantigens", "p1", &forward).unwrap();
        let k2 = derive_key("neoantigens", "p1", &reversed).unwrap();
        let k3 = derive_key("neoantigens", "p1", &forward).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1, k3);
        assert_eq!(k1.fingerprint().as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn nested_maps_are_normalized() {
        let a = Params::new().with(
            "filter",
            Params::new().with("min_vaf", 0.05).with("name", "vaf"),
        );
        let b = Params::new().with(
            "filter",
            Params::new().with("name", "vaf").with("min_vaf", 0.05),
        );
        assert_eq!(
            derive_key("variants", "p1", &a).unwrap(),
            derive_key("variants", "p1", &b).unwrap()
        );
    }

    #[test]
    fn key_changes_when_any_input_changes() {
        let base = derive_key("neoantigens", "p1", &baseline()).unwrap();

        let other_patient = derive_key("neoantigens", "p2", &baseline()).unwrap();
        let other_computation = derive_key("effects", "p1", &baseline()).unwrap();
        let changed_value =
            derive_key("neoantigens", "p1", &baseline().with("extra", 1)).unwrap();
        let mut edited = Params::new()
            .with("variant_file", "/data/p1/somatic.vcf")
            .with("merge_type", "intersection")
            .with("min_depth", 10);
        edited.insert("only_nonsynonymous", true);
        let changed_merge = derive_key("neoantigens", "p1", &edited).unwrap();

        for other in [other_patient, other_computation, changed_value, changed_merge] {
            assert_ne!(base.fingerprint(), other.fingerprint());
        }
    }

    #[test]
    fn list_order_is_significant() {
        let a = Params::new().with("files", vec!["a.vcf", "b.vcf"]);
        let b = Params::new().with("files", vec!["b.vcf", "a.vcf"]);
        assert_ne!(
            derive_key("variants", "p1", &a).unwrap(),
            derive_key("variants", "p1", &b).unwrap()
        );
    }

    #[test]
    fn value_kinds_are_distinguished() {
        let int = Params::new().with("n", 1);
        let float = Params::new().with("n", 1.0);
        let string = Params::new().with("n", "1");
        let k_int = derive_key("c", "p", &int).unwrap();
        let k_float = derive_key("c", "p", &float).unwrap();
        let k_string = derive_key("c", "p", &string).unwrap();
        assert_ne!(k_int, k_float);
        assert_ne!(k_int, k_string);
        assert_ne!(k_float, k_string);
    }

    #[test]
    fn negative_zero_digests_like_zero() {
        let a = Params::new().with("offset", 0.0);
        let b = Params::new().with("offset", -0.0);
        assert_eq!(
            derive_key("c", "p", &a).unwrap(),
            derive_key("c", "p", &b).unwrap()
        );
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let params = Params::new().with("threshold", bad);
            let err = derive_key("c", "p", &params).unwrap_err();
            assert!(matches!(err, Error::InvalidParameter { .. }), "{err}");
        }
    }

    #[test]
    fn nested_failure_reports_path() {
        let params = Params::new().with("filter", Params::new().with("cutoff", f64::NAN));
        match derive_key("c", "p", &params).unwrap_err() {
            Error::InvalidParameter { name, .. } => assert_eq!(name, "filter.cutoff"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() {
        let dup = Params::new().with("a", 1).with("a", 2);
        assert!(matches!(
            derive_key("c", "p", &dup),
            Err(Error::InvalidParameter { .. })
        ));

        let empty = Params::new().with("", 1);
        assert!(matches!(
            derive_key("c", "p", &empty),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn identifiers_must_be_single_path_components() {
        let params = Params::new();
        for bad in ["", ".", "..", ".hidden", "a/b", "a\\b", "a\0b"] {
            assert!(derive_key(bad, "p1", &params).is_err(), "computation {bad:?}");
            assert!(derive_key("c", bad, &params).is_err(), "patient {bad:?}");
        }
        assert!(derive_key("cached-variants", "patient_01", &params).is_ok());
    }

    #[test]
    fn serialized_maps_are_order_insensitive() {
        let mut hashed = HashMap::new();
        hashed.insert("b", 2);
        hashed.insert("a", 1);
        let mut ordered = BTreeMap::new();
        ordered.insert("a", 1);
        ordered.insert("b", 2);

        let mut p1 = Params::new();
        p1.insert_serialized("kwargs", &hashed).unwrap();
        let mut p2 = Params::new();
        p2.insert_serialized("kwargs", &ordered).unwrap();

        assert_eq!(
            derive_key("c", "p", &p1).unwrap(),
            derive_key("c", "p", &p2).unwrap()
        );
    }

    #[test]
    fn serialized_null_is_rejected() {
        let mut params = Params::new();
        let err = params
            .insert_serialized("normal_sample", &Option::<String>::None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
        assert!(params.is_empty());
    }

    #[test]
    fn serialized_out_of_range_integer_is_rejected() {
        let mut params = Params::new();
        assert!(params.insert_serialized("big", &u64::MAX).is_err());
    }

    #[test]
    fn fingerprint_parse_roundtrip() {
        let key = derive_key("c", "p", &Params::new()).unwrap();
        let parsed = Fingerprint::parse(key.fingerprint().as_str()).unwrap();
        assert_eq!(&parsed, key.fingerprint());
        assert_eq!(parsed.short().len(), 12);

        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"G".repeat(FINGERPRINT_LEN)).is_err());
    }

    #[test]
    fn key_display_is_path_like() {
        let key = derive_key("effects", "p7", &Params::new()).unwrap();
        let shown = key.to_string();
        assert!(shown.starts_with("effects/p7/"));
        assert!(shown.ends_with(key.fingerprint().as_str()));
    }
}
