//! On-disk entry storage
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<computation>/<patient_id>/<fingerprint>.json
//! ```
//!
//! Each entry is a single JSON document holding the value and the provenance
//! snapshot it was computed under. Writes go to a hidden temp file in the
//! destination directory and are renamed into place, so readers observe
//! either the previous entry or the new one.

use crate::finite::ensure_finite;
use crate::key::{CacheKey, Fingerprint, validate_identifier};
use crate::provenance::{ConsistencyReport, ProvenanceSnapshot, UnreadableEntry, summarize};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Version of the entry document layout
const FORMAT_VERSION: u32 = 1;

/// Extension of committed entry files
const ENTRY_EXTENSION: &str = "json";

/// Entry document as written
#[derive(Serialize)]
struct EntryDocument<'a, T: ?Sized> {
    format_version: u32,
    computation: &'a str,
    patient_id: &'a str,
    fingerprint: &'a Fingerprint,
    created_at: DateTime<Utc>,
    provenance: &'a ProvenanceSnapshot,
    value: &'a T,
}

/// Entry document as read back
#[derive(Deserialize)]
struct StoredEntry<T> {
    format_version: u32,
    computation: String,
    patient_id: String,
    fingerprint: Fingerprint,
    created_at: DateTime<Utc>,
    provenance: ProvenanceSnapshot,
    value: T,
}

/// Entry document without its value, for scans
#[derive(Deserialize)]
struct StoredHeader {
    format_version: u32,
    computation: String,
    patient_id: String,
    fingerprint: Fingerprint,
    created_at: DateTime<Utc>,
    provenance: ProvenanceSnapshot,
}

/// A value read back from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    /// The stored value
    pub value: T,
    /// Environment the value was computed under
    pub provenance: ProvenanceSnapshot,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
}

/// Metadata of a stored entry, without its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecord {
    /// Identity of the entry
    pub key: CacheKey,
    /// Environment the value was computed under
    pub provenance: ProvenanceSnapshot,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
}

/// Result of scanning the store
#[derive(Debug, Default)]
pub struct EntryScan {
    /// Readable entries, ordered by key
    pub records: Vec<EntryRecord>,
    /// Entry files that could not be read, with the reason
    pub unreadable: Vec<(PathBuf, Error)>,
}

impl EntryScan {
    /// Unreadable files in the form carried by consistency reports
    pub fn unreadable_entries(&self) -> impl Iterator<Item = UnreadableEntry> + '_ {
        self.unreadable.iter().map(|(path, err)| UnreadableEntry {
            path: path.clone(),
            reason: err.to_string(),
        })
    }

    /// Consistency report over the readable entries, listing the unreadable ones
    #[must_use]
    pub fn summarize(&self) -> ConsistencyReport {
        summarize(&self.records).with_unreadable(self.unreadable_entries())
    }
}

/// Filesystem-backed entry store rooted at one directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `root`; nothing is created until the first write
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `key`
    #[must_use]
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.computation())
            .join(key.patient_id())
            .join(format!("{}.{ENTRY_EXTENSION}", key.fingerprint()))
    }

    /// Whether an entry exists for `key`; the entry is not read
    #[must_use]
    pub fn has(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    /// Read the value and provenance stored for `key`
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<CachedValue<T>> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(key = %key, "cache miss");
                return Err(Error::cache_miss(key.to_string()));
            }
            Err(e) => return Err(Error::io(e, &path, "read")),
        };

        let stored: StoredEntry<T> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::corrupt(&path, format!("unreadable entry: {e}")))?;

        check_format(&path, stored.format_version)?;
        if stored.computation != key.computation()
            || stored.patient_id != key.patient_id()
            || &stored.fingerprint != key.fingerprint()
        {
            return Err(Error::corrupt(&path, "entry was recorded under a different key"));
        }

        tracing::debug!(key = %key, "cache hit");
        Ok(CachedValue {
            value: stored.value,
            provenance: stored.provenance,
            created_at: stored.created_at,
        })
    }

    /// Store `value` with its provenance, replacing any previous entry
    pub fn put<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        provenance: &ProvenanceSnapshot,
    ) -> Result<()> {
        // Rejected before anything touches disk, so an existing entry survives
        ensure_finite(value).map_err(|e| {
            Error::serialization(format!("Refusing to cache {key}: {e}"))
        })?;

        let path = self.entry_path(key);
        let dir = path
            .parent()
            .ok_or_else(|| Error::configuration(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))?;

        let document = EntryDocument {
            format_version: FORMAT_VERSION,
            computation: key.computation(),
            patient_id: key.patient_id(),
            fingerprint: key.fingerprint(),
            created_at: Utc::now(),
            provenance,
            value,
        };

        // Hidden temp file in the same directory so the rename stays on one filesystem
        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| Error::io(e, dir, "create temp file"))?;

        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, &document).map_err(|e| {
                Error::serialization(format!("Failed to serialize entry {key}: {e}"))
            })?;
            writer
                .flush()
                .map_err(|e| Error::io(e, temp.path(), "write"))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, temp.path(), "sync_all"))?;
        temp.persist(&path)
            .map_err(|e| Error::io(e.error, &path, "rename"))?;

        tracing::debug!(key = %key, path = %path.display(), "cache entry written");
        Ok(())
    }

    /// Remove the entry for `key`; returns whether one existed
    pub fn delete(&self, key: &CacheKey) -> Result<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                // Prune emptied patient and computation directories; non-empty ones stay
                if let Some(patient_dir) = path.parent() {
                    let _ = fs::remove_dir(patient_dir);
                    if let Some(computation_dir) = patient_dir.parent() {
                        let _ = fs::remove_dir(computation_dir);
                    }
                }
                tracing::debug!(key = %key, "cache entry deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(e, &path, "remove_file")),
        }
    }

    /// Remove every entry of one computation; returns whether any existed
    pub fn clear_computation(&self, computation: &str) -> Result<bool> {
        validate_identifier("computation_name", computation)?;
        let dir = self.root.join(computation);
        let removed = remove_tree(&dir)?;
        if removed {
            tracing::info!(computation, "cleared computation cache");
        }
        Ok(removed)
    }

    /// Remove the whole cache root
    pub fn clear_all(&self) -> Result<()> {
        if remove_tree(&self.root)? {
            tracing::info!(root = %self.root.display(), "cleared cache root");
        }
        Ok(())
    }

    /// Names of computations that currently have a namespace directory
    pub fn computations(&self) -> Result<Vec<String>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(e, &self.root, "read_dir")),
        };

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| Error::io(e, &self.root, "read_dir"))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && validate_identifier("computation_name", name).is_ok()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Enumerate stored entries, optionally for one computation
    ///
    /// Unreadable files are collected in [`EntryScan::unreadable`] instead of
    /// failing the scan; temp files of interrupted writes are skipped.
    pub fn entries(&self, computation: Option<&str>) -> Result<EntryScan> {
        let (base, depth) = match computation {
            Some(name) => {
                validate_identifier("computation_name", name)?;
                (self.root.join(name), 2)
            }
            None => (self.root.clone(), 3),
        };

        let mut scan = EntryScan::default();
        if !base.is_dir() {
            return Ok(scan);
        }

        for item in walkdir::WalkDir::new(&base)
            .min_depth(depth)
            .max_depth(depth)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = item.path();
            if !item.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION)
            {
                continue;
            }
            match read_record(&self.root, path) {
                Ok(record) => scan.records.push(record),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable cache entry"
                    );
                    scan.unreadable.push((path.to_path_buf(), err));
                }
            }
        }

        scan.records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(scan)
    }
}

fn check_format(path: &Path, version: u32) -> Result<()> {
    if version == FORMAT_VERSION {
        Ok(())
    } else {
        Err(Error::corrupt(
            path,
            format!("unsupported entry format version {version}"),
        ))
    }
}

/// Read an entry header and check it against the directory it was found in
fn read_record(root: &Path, path: &Path) -> Result<EntryRecord> {
    let bytes = fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
    let header: StoredHeader = serde_json::from_slice(&bytes)
        .map_err(|e| Error::corrupt(path, format!("unreadable entry: {e}")))?;
    check_format(path, header.format_version)?;

    let expected = root
        .join(&header.computation)
        .join(&header.patient_id)
        .join(format!("{}.{ENTRY_EXTENSION}", header.fingerprint));
    if expected != path {
        return Err(Error::corrupt(path, "entry is stored under the wrong path"));
    }

    let key = CacheKey::new(header.computation, header.patient_id, header.fingerprint)
        .map_err(|e| Error::corrupt(path, e.to_string()))?;
    Ok(EntryRecord {
        key,
        provenance: header.provenance,
        created_at: header.created_at,
    })
}

fn remove_tree(dir: &Path) -> Result<bool> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(e, dir, "remove_dir_all")),
    }
}
