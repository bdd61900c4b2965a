use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{IoContext, Result};

/// Base directories used by catalogs, datasources and artifacts.
///
/// All locations derive from a project root by default:
///
/// * `data/raw` holds fetched files,
/// * `data/interim` holds unpacked files, one directory per datasource,
/// * `data/processed` holds `{name}.metadata` and `{name}.dataset` records,
/// * `catalog` holds one directory per catalog.
///
/// Any of them can be overridden, and the whole struct can be stored as a
/// JSON config file next to the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paths {
    pub data_path: Utf8PathBuf,
    pub raw_data_path: Utf8PathBuf,
    pub interim_data_path: Utf8PathBuf,
    pub processed_data_path: Utf8PathBuf,
    pub catalog_path: Utf8PathBuf,
}

impl Paths {
    pub fn new(project_dir: impl AsRef<Utf8Path>) -> Self {
        let project_dir = project_dir.as_ref();
        let data_path = project_dir.join("data");

        Self {
            raw_data_path: data_path.join("raw"),
            interim_data_path: data_path.join("interim"),
            processed_data_path: data_path.join("processed"),
            catalog_path: project_dir.join("catalog"),
            data_path,
        }
    }

    pub fn with_raw_data_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.raw_data_path = path.into();
        self
    }

    pub fn with_interim_data_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.interim_data_path = path.into();
        self
    }

    pub fn with_processed_data_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.processed_data_path = path.into();
        self
    }

    pub fn with_catalog_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.catalog_path = path.into();
        self
    }

    /// Read a config file written by [`Paths::save`].
    pub fn load(file: impl AsRef<Utf8Path>) -> Result<Self> {
        let file = file.as_ref();
        let text = fs::read_to_string(file).at(file)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, file: impl AsRef<Utf8Path>) -> Result<()> {
        let file = file.as_ref();
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        crate::io::write_atomic(file, text.as_bytes())
    }

    /// Create every configured directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.data_path,
            &self.raw_data_path,
            &self.interim_data_path,
            &self.processed_data_path,
            &self.catalog_path,
        ] {
            fs::create_dir_all(dir).at(dir)?;
        }
        Ok(())
    }
}
