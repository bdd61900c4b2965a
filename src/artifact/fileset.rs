//! Tracking of auxiliary files that belong to an artifact but are not part
//! of its payload.
//!
//! A [`FileSet`] maps a path, relative to some root, to a list of weak
//! tokens describing the file: `size:N` or `{algorithm}:{hex}`. It is stored
//! in the artifact metadata under the `fileset` key.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::error::{IoContext, ReproError, Result};
use crate::hash::{self, DEFAULT_BLOCK_SIZE, HashAlgorithm};

const SIZE_PREFIX: &str = "size";

/// Somewhere the files of a [`FileSet`] can be looked up.
///
/// Paths handed to the location are always relative to its root, using `/`
/// as separator.
pub trait FileLocation: Sync {
    /// Size of the file in bytes, or `None` if it doesn't exist.
    fn stat(&self, path: &str) -> Result<Option<u64>>;

    /// Open the file for reading.
    fn open(&self, path: &str) -> Result<Box<dyn Read + '_>>;
}

/// Files on the local filesystem under `root`.
#[derive(Debug, Clone)]
pub struct LocalDir {
    root: Utf8PathBuf,
}

impl LocalDir {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileLocation for LocalDir {
    fn stat(&self, path: &str) -> Result<Option<u64>> {
        let path = self.root.join(path);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ReproError::Io { path, source: err }),
        }
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + '_>> {
        let path = self.root.join(path);
        let file = File::open(&path).at(&path)?;
        Ok(Box::new(file))
    }
}

/// Outcome of [`FileSet::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSetReport {
    pub good: Vec<String>,
    pub bad: Vec<String>,
    pub missing: Vec<String>,
}

impl FileSetReport {
    pub fn is_ok(&self) -> bool {
        self.bad.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Good,
    Bad,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSet(BTreeMap<String, Vec<String>>);

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, tokens: Vec<String>) {
        self.0.insert(path.into(), tokens);
    }

    pub fn get(&self, path: &str) -> Option<&[String]> {
        self.0.get(path).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a set from every file in `dir` matching `pattern`, recording
    /// each file's size and, if an algorithm is given, its digest.
    pub fn from_dir(
        dir: impl AsRef<Utf8Path>,
        pattern: &str,
        algorithm: Option<HashAlgorithm>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let pattern = format!("{}/{}", glob::Pattern::escape(dir.as_str()), pattern);

        let mut files = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| ReproError::Io {
                path: dir.to_owned(),
                source: e.into_error(),
            })?;
            let path = Utf8PathBuf::try_from(path)
                .map_err(|e| ReproError::engine(format!("Non UTF-8 path in fileset: {e}")))?;
            if path.is_file() {
                files.push(path);
            }
        }

        let entries = files
            .into_par_iter()
            .map(|path| {
                let rel = path
                    .strip_prefix(dir)
                    .map_err(|_| ReproError::engine(format!("'{path}' is outside of '{dir}'")))?
                    .as_str()
                    .replace('\\', "/");

                let size = fs::metadata(&path).at(&path)?.len();
                let mut tokens = vec![format!("{SIZE_PREFIX}:{size}")];
                if let Some(algorithm) = algorithm {
                    tokens.push(hash::hash_file(&path, algorithm, DEFAULT_BLOCK_SIZE)?);
                }

                Ok((rel, tokens))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        tracing::debug!("collected {} files from {}", entries.len(), dir);
        Ok(Self(entries))
    }

    /// Partition the referenced files into good, bad and missing.
    pub fn verify(&self, location: &dyn FileLocation) -> Result<FileSetReport> {
        let checked = self
            .0
            .par_iter()
            .map(|(path, tokens)| Ok((path, check_file(location, path, tokens)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut report = FileSetReport::default();
        for (path, check) in checked {
            let list = match check {
                Check::Good => &mut report.good,
                Check::Bad => &mut report.bad,
                Check::Missing => &mut report.missing,
            };
            list.push(path.clone());
        }

        if !report.is_ok() {
            tracing::warn!(
                bad = report.bad.len(),
                missing = report.missing.len(),
                "fileset verification failed"
            );
        }

        Ok(report)
    }
}

fn check_file(location: &dyn FileLocation, path: &str, tokens: &[String]) -> Result<Check> {
    let Some(size) = location.stat(path)? else {
        return Ok(Check::Missing);
    };

    for token in tokens {
        let ok = match token.split_once(':') {
            Some((SIZE_PREFIX, expected)) => expected.parse::<u64>().is_ok_and(|n| n == size),
            Some(_) => match hash::split_hash(token) {
                Ok((algorithm, _)) => {
                    let reader = location.open(path)?;
                    let actual = hash::hash_reader(reader, algorithm, DEFAULT_BLOCK_SIZE)
                        .map_err(|source| ReproError::Io {
                            path: path.into(),
                            source,
                        })?;
                    &actual == token
                }
                Err(_) => {
                    tracing::warn!("unrecognized fileset token '{}' for '{}'", token, path);
                    false
                }
            },
            None => false,
        };

        if !ok {
            return Ok(Check::Bad);
        }
    }

    Ok(Check::Good)
}
