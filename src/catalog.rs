//! Disk-backed keyed record store.
//!
//! A [`Catalog`] is a directory of JSON files, one file per key: the record
//! stored under `key` lives at `{root}/{name}/{key}.json`. Every mutation is
//! written through to its own file immediately, and files are pretty-printed
//! with sorted keys, so a catalog directory can be kept under version
//! control with minimal merge conflicts.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{IoContext, ReproError, Result};

pub const DEFAULT_EXTENSION: &str = "json";

/// A generic, disk-backed, keyed store.
#[derive(Debug, Clone)]
pub struct Catalog<T = Value> {
    name: String,
    root: Utf8PathBuf,
    extension: String,
    data: BTreeMap<String, T>,
}

impl<T> Catalog<T>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    /// Open an existing catalog, or create an empty one if `create` is set.
    pub fn load(name: &str, create: bool, root: impl AsRef<Utf8Path>) -> Result<Self> {
        Self::load_with_extension(name, create, root, DEFAULT_EXTENSION)
    }

    pub fn load_with_extension(
        name: &str,
        create: bool,
        root: impl AsRef<Utf8Path>,
        extension: &str,
    ) -> Result<Self> {
        let mut catalog = Self::empty(name, root.as_ref(), extension)?;
        let dir = catalog.dir();

        if !dir.is_dir() {
            if !create {
                return Err(ReproError::not_found("catalog", name));
            }
            tracing::debug!("creating new catalog: {}", name);
            fs::create_dir_all(&dir).at(&dir)?;
        }

        catalog.data = catalog.load_batch()?;
        tracing::debug!("loaded {} records from '{}' catalog", catalog.len(), name);
        catalog.verify();

        Ok(catalog)
    }

    /// Create a catalog from `data`.
    ///
    /// An existing catalog directory is an error unless `replace` is set, in
    /// which case it is wiped first.
    pub fn create<I>(name: &str, data: I, replace: bool, root: impl AsRef<Utf8Path>) -> Result<Self>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let mut catalog = Self::empty(name, root.as_ref(), DEFAULT_EXTENSION)?;
        let dir = catalog.dir();

        if dir.exists() {
            if !replace {
                return Err(ReproError::collision(
                    "catalog",
                    name,
                    "use `replace` to overwrite it",
                ));
            }
            tracing::debug!("deleting existing catalog dir: {}", dir);
            fs::remove_dir_all(&dir).at(&dir)?;
        }

        fs::create_dir_all(&dir).at(&dir)?;

        for (key, value) in data {
            catalog.set(key, value)?;
        }
        catalog.verify();

        Ok(catalog)
    }

    /// Remove an on-disk catalog.
    pub fn delete(name: &str, root: impl AsRef<Utf8Path>) -> Result<()> {
        let dir = root.as_ref().join(name);
        if !dir.is_dir() {
            return Err(ReproError::not_found("catalog", name));
        }
        tracing::debug!("deleting catalog dir: {}", dir);
        fs::remove_dir_all(&dir).at(&dir)
    }

    /// Convert a legacy catalog, stored as one combined JSON object, into a
    /// directory of per-key files.
    ///
    /// The catalog name defaults to the file stem of `file`.
    pub fn from_legacy(
        file: impl AsRef<Utf8Path>,
        name: Option<&str>,
        replace: bool,
        root: impl AsRef<Utf8Path>,
    ) -> Result<Self> {
        let file = file.as_ref();

        let records: BTreeMap<String, T> = if file.exists() {
            let text = fs::read_to_string(file).at(file)?;
            serde_json::from_str(&text)?
        } else {
            tracing::warn!("legacy catalog file '{}' does not exist", file);
            BTreeMap::new()
        };

        let name = match name {
            Some(name) => name,
            None => file
                .file_stem()
                .ok_or_else(|| ReproError::engine(format!("Can't infer catalog name from '{file}'")))?,
        };

        Self::create(name, records, replace, root)
    }

    fn empty(name: &str, root: &Utf8Path, extension: &str) -> Result<Self> {
        validate_key(name)?;
        Ok(Self {
            name: name.to_string(),
            root: root.to_owned(),
            extension: extension.to_string(),
            data: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified catalog directory.
    pub fn dir(&self) -> Utf8PathBuf {
        self.root.join(&self.name)
    }

    fn path_for(&self, key: &str) -> Utf8PathBuf {
        self.dir().join(format!("{key}.{}", self.extension))
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.data.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Set a record in memory and persist it to its own file.
    pub fn set(&mut self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;

        let path = self.path_for(&key);
        tracing::debug!("writing entry '{}' to catalog '{}'", key, self.name);
        crate::io::write_atomic(&path, &encode(&value)?)?;

        self.data.insert(key, value);
        Ok(())
    }

    /// Like [`Catalog::set`], but refuses to replace an existing record
    /// unless `overwrite` is set.
    pub fn insert(&mut self, key: impl Into<String>, value: T, overwrite: bool) -> Result<()> {
        let key = key.into();
        if !overwrite && self.data.contains_key(&key) {
            return Err(ReproError::collision(
                "catalog entry",
                format!("{}/{}", self.name, key),
                "use `overwrite` to replace it",
            ));
        }
        self.set(key, value)
    }

    /// Remove a record from memory and delete its file.
    pub fn remove(&mut self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.data.remove(key) else {
            return Ok(None);
        };

        let path = self.path_for(key);
        tracing::debug!("deleting catalog entry '{}'", path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("catalog entry '{}' was already gone from disk", path);
            }
            Err(err) => return Err(ReproError::Io { path, source: err }),
        }

        Ok(Some(value))
    }

    /// Replace the in-memory state with whatever is currently on disk.
    pub fn reload(&mut self) -> Result<()> {
        self.data = self.load_batch()?;
        Ok(())
    }

    /// Read every record file without touching the in-memory map.
    fn load_batch(&self) -> Result<BTreeMap<String, T>> {
        let dir = self.dir();
        let mut records = BTreeMap::new();

        if !dir.is_dir() {
            return Ok(records);
        }

        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(dir.as_str()),
            self.extension
        );

        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| ReproError::Io {
                path: dir.clone(),
                source: e.into_error(),
            })?;
            let path = Utf8PathBuf::try_from(path)
                .map_err(|e| ReproError::engine(format!("Non UTF-8 catalog path: {e}")))?;

            let Some(key) = path.file_stem() else {
                continue;
            };
            let text = fs::read_to_string(&path).at(&path)?;
            let value = serde_json::from_str(&text).map_err(|e| {
                ReproError::engine(format!("Couldn't parse catalog record '{path}': {e}"))
            })?;
            records.insert(key.to_string(), value);
        }

        Ok(records)
    }

    /// Check that the on-disk state reproduces the in-memory one.
    ///
    /// A mismatch is logged as a consistency error and reported through the
    /// return value, but never fails the caller.
    pub fn verify(&self) -> bool {
        match self.load_batch() {
            Ok(disk) if disk == self.data => true,
            Ok(disk) => {
                let missing: Vec<_> = self
                    .data
                    .keys()
                    .filter(|k| !disk.contains_key(*k))
                    .collect();
                tracing::error!(
                    catalog = %self.name,
                    ?missing,
                    "serialization failed: on-disk catalog differs from in-memory catalog"
                );
                false
            }
            Err(err) => {
                tracing::error!(catalog = %self.name, "couldn't re-read catalog: {}", err);
                false
            }
        }
    }
}

impl<T: PartialEq> PartialEq for Catalog<T> {
    /// Two catalogs are equal if they hold the same records, regardless of
    /// where they are stored.
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    // Going through `Value` sorts object keys.
    let value = serde_json::to_value(value)?;
    let mut bytes = serde_json::to_vec_pretty(&value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(ReproError::engine(format!("Invalid catalog key '{key}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, root)
    }

    #[test]
    fn load_without_create_is_not_found() {
        let (_dir, root) = root();
        let err = Catalog::<Value>::load("datasets", false, &root).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn set_writes_sorted_pretty_json() {
        let (_dir, root) = root();
        let mut catalog = Catalog::load("datasets", true, &root).unwrap();
        catalog.set("raw", json!({ "b": 1, "a": 2 })).unwrap();

        let text = fs::read_to_string(root.join("datasets/raw.json")).unwrap();
        assert_eq!(text, "{\n  \"a\": 2,\n  \"b\": 1\n}\n");
    }

    #[test]
    fn reload_matches_memory_after_set_and_remove() {
        let (_dir, root) = root();
        let mut catalog = Catalog::load("datasets", true, &root).unwrap();

        catalog.set("a", json!({ "n": 1 })).unwrap();
        catalog.set("b", json!({ "n": 2 })).unwrap();
        catalog.set("a", json!({ "n": 3 })).unwrap();
        catalog.remove("b").unwrap();
        catalog.set("c", json!([])).unwrap();

        let reloaded = Catalog::<Value>::load("datasets", false, &root).unwrap();
        assert_eq!(reloaded, catalog);
        assert_eq!(reloaded.get("a"), Some(&json!({ "n": 3 })));
        assert!(!reloaded.contains_key("b"));
        assert!(catalog.verify());
    }

    #[test]
    fn create_refuses_existing_unless_replace() {
        let (_dir, root) = root();
        let data = vec![("x".to_string(), json!(1))];
        Catalog::create("things", data.clone(), false, &root).unwrap();

        let err = Catalog::create("things", data.clone(), false, &root).unwrap_err();
        assert!(err.is_collision());

        let replaced = Catalog::<Value>::create("things", vec![], true, &root).unwrap();
        assert!(replaced.is_empty());
        assert!(!root.join("things/x.json").exists());
    }

    #[test]
    fn insert_without_overwrite_collides() {
        let (_dir, root) = root();
        let mut catalog = Catalog::load("t", true, &root).unwrap();
        catalog.insert("k", json!(1), false).unwrap();

        let err = catalog.insert("k", json!(2), false).unwrap_err();
        assert!(err.is_collision());
        assert_eq!(catalog.get("k"), Some(&json!(1)));

        catalog.insert("k", json!(2), true).unwrap();
        assert_eq!(catalog.get("k"), Some(&json!(2)));
    }

    #[test]
    fn delete_removes_directory() {
        let (_dir, root) = root();
        Catalog::<Value>::load("gone", true, &root).unwrap();
        Catalog::<Value>::delete("gone", &root).unwrap();
        assert!(!root.join("gone").exists());
        assert!(Catalog::<Value>::delete("gone", &root).unwrap_err().is_not_found());
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let (_dir, root) = root();
        let mut catalog = Catalog::load("t", true, &root).unwrap();
        assert!(catalog.set("../escape", json!(1)).is_err());
        assert!(catalog.set("", json!(1)).is_err());
        assert!(catalog.is_empty());
    }

    #[test]
    fn legacy_catalog_migration() {
        let (_dir, root) = root();
        let legacy = root.join("dataset-test.json");
        fs::write(
            &legacy,
            r#"{"wine_reviews": {"url": "x"}, "wine_reviews_130k": {"hashes": {}}}"#,
        )
        .unwrap();

        let catalog = Catalog::<Value>::from_legacy(&legacy, None, false, root.join("cat")).unwrap();
        assert_eq!(catalog.name(), "dataset-test");
        assert_eq!(catalog.len(), 2);
        assert!(root.join("cat/dataset-test/wine_reviews.json").exists());

        let err = Catalog::<Value>::from_legacy(&legacy, None, false, root.join("cat")).unwrap_err();
        assert!(err.is_collision());

        Catalog::<Value>::from_legacy(&legacy, None, true, root.join("cat")).unwrap();
    }

    #[test]
    fn missing_legacy_file_gives_empty_catalog() {
        let (_dir, root) = root();
        let catalog =
            Catalog::<Value>::from_legacy(root.join("nope.json"), Some("fresh"), false, &root)
                .unwrap();
        assert!(catalog.is_empty());
        assert!(root.join("fresh").is_dir());
    }

    #[test]
    fn custom_extension() {
        let (_dir, root) = root();
        let mut catalog = Catalog::load_with_extension("t", true, &root, "rec").unwrap();
        catalog.set("k", json!("v")).unwrap();
        assert!(root.join("t/k.rec").exists());

        let reloaded = Catalog::<Value>::load_with_extension("t", false, &root, "rec").unwrap();
        assert_eq!(reloaded.get("k"), Some(&json!("v")));
    }
}
