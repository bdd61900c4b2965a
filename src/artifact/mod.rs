//! Named data units with metadata, payload and a hash record.
//!
//! An [`Artifact`] is persisted as two CBOR records in a directory:
//! `{name}.metadata` holding only the metadata (cheap to read when checking
//! the cache) and `{name}.dataset` holding the whole artifact.

pub mod fileset;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::Catalog;
use crate::error::{IoContext, ReproError, Result};
use crate::hash::{self, HashAlgorithm};

pub use self::fileset::{FileLocation, FileSet, FileSetReport, LocalDir};

/// Payload field name to `"{algorithm}:{hex}"`.
pub type HashRecord = BTreeMap<String, String>;

pub const KEY_NAME: &str = "dataset_name";
pub const KEY_HASHES: &str = "hashes";
pub const KEY_FILESET: &str = "fileset";
pub const KEY_LICENSE: &str = "license";
pub const KEY_DESCR: &str = "descr";

const EXT_METADATA: &str = "metadata";
const EXT_DATASET: &str = "dataset";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    name: String,
    metadata: Map<String, Value>,
    #[serde(default)]
    data: Value,
    /// Never `Some(Value::Null)`, which doesn't survive a CBOR round-trip.
    #[serde(default)]
    target: Option<Value>,
}

impl Artifact {
    /// Create an empty artifact. The name is taken from `name` or, failing
    /// that, from `metadata["dataset_name"]`.
    pub fn new(name: Option<&str>, mut metadata: Map<String, Value>) -> Result<Self> {
        let name = match name {
            Some(name) => name.to_string(),
            None => metadata
                .get(KEY_NAME)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ReproError::engine("Artifact needs a name or `dataset_name` in its metadata")
                })?,
        };

        if name.is_empty() {
            return Err(ReproError::engine("Artifact name can't be empty"));
        }

        metadata.insert(KEY_NAME.into(), Value::String(name.clone()));

        Ok(Self {
            name,
            metadata,
            data: Value::Null,
            target: None,
        })
    }

    /// Create an empty artifact with no metadata besides its name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut metadata = Map::new();
        metadata.insert(KEY_NAME.into(), Value::String(name.clone()));
        Self {
            name,
            metadata,
            data: Value::Null,
            target: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_target(mut self, target: Value) -> Self {
        self.set_target(Some(target));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the artifact, keeping `dataset_name` in sync.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.metadata
            .insert(KEY_NAME.into(), Value::String(self.name.clone()));
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn set_data(&mut self, data: Value) {
        self.data = data;
    }

    pub fn target(&self) -> Option<&Value> {
        self.target.as_ref()
    }

    /// Set the target payload. A null target is stored as no target.
    pub fn set_target(&mut self, target: Option<Value>) {
        self.target = target.filter(|t| !t.is_null());
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.metadata
    }

    pub fn license(&self) -> Option<&str> {
        self.metadata.get(KEY_LICENSE).and_then(Value::as_str)
    }

    pub fn descr(&self) -> Option<&str> {
        self.metadata.get(KEY_DESCR).and_then(Value::as_str)
    }

    pub fn fileset(&self) -> Result<Option<FileSet>> {
        match self.metadata.get(KEY_FILESET) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn set_fileset(&mut self, fileset: &FileSet) -> Result<()> {
        self.metadata
            .insert(KEY_FILESET.into(), serde_json::to_value(fileset)?);
        Ok(())
    }

    /// The current hash record.
    pub fn hashes(&self) -> HashRecord {
        hash_record(&self.metadata)
    }

    /// Algorithm used by the current hash record, if any.
    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        self.hashes()
            .values()
            .find_map(|h| hash::split_hash(h).ok().map(|(alg, _)| alg))
    }

    fn compute_hashes(&self, algorithm: HashAlgorithm) -> Result<HashRecord> {
        let mut record = HashRecord::new();
        record.insert("data".into(), hash::hash_value(&self.data, algorithm)?);
        record.insert("target".into(), hash::hash_value(&self.target, algorithm)?);
        Ok(record)
    }

    /// Recompute the hash record over the payload and store it in metadata.
    pub fn update_hashes(&mut self, algorithm: HashAlgorithm) -> Result<&Map<String, Value>> {
        let record = self.compute_hashes(algorithm)?;
        self.metadata
            .insert(KEY_HASHES.into(), serde_json::to_value(record)?);
        Ok(&self.metadata)
    }

    /// Whether every entry of `expected` is present and equal in this
    /// artifact's hash record.
    pub fn verify_hashes(&self, expected: &HashRecord) -> bool {
        is_subset(expected, &self.hashes())
    }

    /// Persist the artifact into `dir`.
    ///
    /// Hashes are refreshed first. If a metadata record already exists and
    /// `force` isn't set, resubmitting identical metadata is a no-op while
    /// anything else is an error.
    pub fn dump(&mut self, dir: impl AsRef<Utf8Path>, force: bool) -> Result<()> {
        let dir = dir.as_ref();
        let algorithm = self.hash_algorithm().unwrap_or_default();
        self.update_hashes(algorithm)?;

        let path_meta = metadata_path(dir, &self.name);
        let path_data = dataset_path(dir, &self.name);

        if path_meta.exists() && !force {
            let existing = Self::load_metadata(&self.name, dir)?;
            if existing != self.metadata {
                return Err(ReproError::collision(
                    "artifact",
                    &self.name,
                    "metadata on disk differs, use `force` to overwrite it",
                ));
            }
            if path_data.exists() {
                tracing::debug!("artifact '{}' already on disk, skipping", self.name);
                return Ok(());
            }
        }

        tracing::debug!("writing artifact '{}' to {}", self.name, dir);
        // The metadata record marks the artifact as cached, so it goes last.
        write_cbor(&path_data, self)?;
        write_cbor(&path_meta, &self.metadata)?;

        Ok(())
    }

    /// Like [`Artifact::dump`], and also commit the metadata as the
    /// artifact's entry in `catalog`.
    pub fn dump_to_catalog(
        &mut self,
        dir: impl AsRef<Utf8Path>,
        force: bool,
        catalog: &mut Catalog<Value>,
    ) -> Result<()> {
        self.dump(dir, force)?;
        catalog.set(self.name.clone(), Value::Object(self.metadata.clone()))
    }

    /// Read only the metadata record.
    pub fn load_metadata(name: &str, dir: impl AsRef<Utf8Path>) -> Result<Map<String, Value>> {
        let path = metadata_path(dir.as_ref(), name);
        if !path.exists() {
            return Err(ReproError::not_found("artifact metadata", name));
        }
        read_cbor(&path)
    }

    /// Load a persisted artifact, re-validating its payload.
    ///
    /// The payload is rehashed and checked against the hash record it was
    /// stored with, against the metadata record and, if given, against
    /// `expected`.
    pub fn from_disk(
        name: &str,
        dir: impl AsRef<Utf8Path>,
        expected: Option<&HashRecord>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dataset_path(dir, name);
        if !path.exists() {
            return Err(ReproError::not_found("artifact", name));
        }

        let artifact: Artifact = read_cbor(&path)?;
        let stored = artifact.hashes();
        let algorithm = artifact.hash_algorithm().unwrap_or_default();
        let actual = artifact.compute_hashes(algorithm)?;

        if !is_subset(&stored, &actual) {
            return Err(ReproError::validation(
                name,
                format!("payload doesn't match its hash record: {}", describe(&stored, &actual)),
            ));
        }

        if let Ok(meta) = Self::load_metadata(name, dir) {
            let meta = hash_record(&meta);
            if !is_subset(&meta, &actual) {
                return Err(ReproError::validation(
                    name,
                    format!("payload doesn't match the metadata record: {}", describe(&meta, &actual)),
                ));
            }
        }

        if let Some(expected) = expected
            && !is_subset(expected, &actual)
        {
            return Err(ReproError::validation(
                name,
                format!("payload doesn't match the expected hashes: {}", describe(expected, &actual)),
            ));
        }

        Ok(artifact)
    }

    /// Load a persisted artifact and check it against its catalog entry.
    pub fn from_catalog(
        name: &str,
        dir: impl AsRef<Utf8Path>,
        catalog: &Catalog<Value>,
    ) -> Result<Self> {
        let entry = catalog
            .get(name)
            .ok_or_else(|| ReproError::not_found("catalog entry", name))?;
        let expected = entry.as_object().map(hash_record).unwrap_or_default();
        Self::from_disk(name, dir, Some(&expected))
    }

    /// Whether a metadata record exists whose hash record covers `expected`.
    pub fn is_cached(name: &str, dir: impl AsRef<Utf8Path>, expected: &HashRecord) -> bool {
        match Self::load_metadata(name, dir) {
            Ok(meta) => is_subset(expected, &hash_record(&meta)),
            Err(_) => false,
        }
    }
}

/// Extract the hash record from an artifact's metadata.
pub fn hash_record(metadata: &Map<String, Value>) -> HashRecord {
    metadata
        .get(KEY_HASHES)
        .and_then(Value::as_object)
        .map(|hashes| {
            hashes
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn is_subset(expected: &HashRecord, actual: &HashRecord) -> bool {
    expected.iter().all(|(k, v)| actual.get(k) == Some(v))
}

fn describe(expected: &HashRecord, actual: &HashRecord) -> String {
    expected
        .iter()
        .filter(|(k, v)| actual.get(*k) != Some(*v))
        .map(|(k, v)| {
            let got = actual.get(k).map(String::as_str).unwrap_or("<missing>");
            format!("{k}: {v} != {got}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn metadata_path(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    dir.join(format!("{name}.{EXT_METADATA}"))
}

pub fn dataset_path(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    dir.join(format!("{name}.{EXT_DATASET}"))
}

fn write_cbor<T: Serialize + ?Sized>(path: &Utf8Path, value: &T) -> Result<()> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| ReproError::Cbor {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    crate::io::write_atomic(path, &buffer)
}

fn read_cbor<T: DeserializeOwned>(path: &Utf8Path) -> Result<T> {
    let file = File::open(path).at(path)?;
    ciborium::from_reader::<T, _>(BufReader::new(file)).map_err(|e| ReproError::Cbor {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}
