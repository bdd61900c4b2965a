//! Recipes for obtaining raw data.
//!
//! A [`DataSource`] lists the files that make up a raw dataset, how to get
//! each of them ([`FetchAction`]), how to unpack them ([`UnpackAction`]) and
//! which registered processing function turns the unpacked files into an
//! [`Artifact`].
//!
//! Fetched files land in the raw directory, unpacked files in
//! `{interim}/{name}/`.

pub mod unpack;

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::{self, Artifact};
use crate::catalog::Catalog;
use crate::error::{IoContext, ReproError, Result};
use crate::hash::{self, DEFAULT_BLOCK_SIZE};
use crate::registry::{FunctionRef, StepContext};

pub use self::unpack::UnpackAction;

/// Name of the catalog holding datasource recipes.
pub const CATALOG_DATASOURCES: &str = "datasources";

pub const ROLE_LICENSE: &str = "LICENSE";
pub const ROLE_DESCR: &str = "DESCR";

/// Transport used for `url` fetch specs.
pub trait Downloader: Send + Sync {
    fn download(&self, url: &str, dest: &Utf8Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchAction {
    /// Copy a local file. Not reproducible elsewhere.
    Copy,
    /// Download from a URL.
    Url,
    /// Ask the user to obtain the file by hand.
    Message,
    /// Write the given contents.
    Create,
}

/// One file of a datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub file_name: String,
    pub action: FetchAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Committed `"{algorithm}:{hex}"` of the fetched file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpack: Option<UnpackAction>,
    /// Role of the file, `LICENSE` or `DESCR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl FetchSpec {
    fn bare(file_name: impl Into<String>, action: FetchAction) -> Self {
        Self {
            file_name: file_name.into(),
            action,
            url: None,
            source_file: None,
            contents: None,
            message: None,
            hash: None,
            unpack: None,
            name: None,
        }
    }

    /// Download `url` into `file_name`, which defaults to the last segment
    /// of the URL.
    pub fn url(url: impl Into<String>, file_name: Option<&str>) -> Result<Self> {
        let url = url.into();
        let file_name = match file_name {
            Some(name) => name.to_string(),
            None => url
                .split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ReproError::engine(format!("Can't infer file name from '{url}'")))?,
        };

        let mut spec = Self::bare(file_name, FetchAction::Url);
        spec.url = Some(url);
        Ok(spec)
    }

    pub fn create(file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        let mut spec = Self::bare(file_name, FetchAction::Create);
        spec.contents = Some(contents.into());
        spec
    }

    /// Copy a local file, keeping its file name unless one is given.
    pub fn copy(source_file: impl Into<Utf8PathBuf>, file_name: Option<&str>) -> Result<Self> {
        let source_file = source_file.into();
        let file_name = match file_name {
            Some(name) => name.to_string(),
            None => source_file
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| ReproError::engine(format!("'{source_file}' has no file name")))?,
        };

        let mut spec = Self::bare(file_name, FetchAction::Copy);
        spec.source_file = Some(source_file);
        Ok(spec)
    }

    pub fn message(file_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut spec = Self::bare(file_name, FetchAction::Message);
        spec.message = Some(message.into());
        spec
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn with_unpack(mut self, action: UnpackAction) -> Self {
        self.unpack = Some(action);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.name = Some(role.into());
        self
    }

    fn unpack_action(&self) -> UnpackAction {
        self.unpack
            .unwrap_or_else(|| UnpackAction::infer(&self.file_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    name: String,
    #[serde(default)]
    file_list: Vec<FetchSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    descr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    process_function: Option<FunctionRef>,
    #[serde(skip)]
    fetched: bool,
    #[serde(skip)]
    unpacked: bool,
}

impl PartialEq for DataSource {
    // Runtime flags are not part of the recipe.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.file_list == other.file_list
            && self.license == other.license
            && self.descr == other.descr
            && self.process_function == other.process_function
    }
}

impl DataSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_list: Vec::new(),
            license: None,
            descr: None,
            process_function: None,
            fetched: false,
            unpacked: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_list(&self) -> &[FetchSpec] {
        &self.file_list
    }

    pub fn process_function(&self) -> Option<&FunctionRef> {
        self.process_function.as_ref()
    }

    /// Add a file, replacing any previous spec with the same file name.
    pub fn add_file(&mut self, spec: FetchSpec) -> &mut Self {
        if let Some(pos) = self
            .file_list
            .iter()
            .position(|s| s.file_name == spec.file_name)
        {
            tracing::debug!("{}: replacing fetch spec for '{}'", self.name, spec.file_name);
            self.file_list.remove(pos);
        }
        self.file_list.push(spec);
        self.invalidate();
        self
    }

    pub fn add_url(&mut self, url: &str, file_name: Option<&str>, hash: Option<&str>) -> Result<&mut Self> {
        let mut spec = FetchSpec::url(url, file_name)?;
        spec.hash = hash.map(str::to_string);
        Ok(self.add_file(spec))
    }

    pub fn add_manual_download(&mut self, file_name: &str, message: &str, hash: Option<&str>) -> &mut Self {
        let mut spec = FetchSpec::message(file_name, message);
        spec.hash = hash.map(str::to_string);
        self.add_file(spec)
    }

    pub fn add_file_contents(&mut self, file_name: &str, contents: &str) -> &mut Self {
        self.add_file(FetchSpec::create(file_name, contents))
    }

    pub fn add_copy(&mut self, source_file: impl Into<Utf8PathBuf>, file_name: Option<&str>) -> Result<&mut Self> {
        let spec = FetchSpec::copy(source_file, file_name)?;
        Ok(self.add_file(spec))
    }

    /// Attach license or description text, either inline or as a file
    /// created next to the fetched data.
    pub fn add_metadata(&mut self, kind: &str, text: &str, as_file: bool) -> Result<&mut Self> {
        let role = match kind.to_ascii_uppercase().as_str() {
            ROLE_LICENSE => ROLE_LICENSE,
            ROLE_DESCR => ROLE_DESCR,
            _ => {
                return Err(ReproError::engine(format!(
                    "Unknown metadata kind '{kind}', expected LICENSE or DESCR"
                )));
            }
        };

        if as_file {
            let spec = FetchSpec::create(format!("{}.{}", self.name, role.to_lowercase()), text)
                .with_role(role);
            return Ok(self.add_file(spec));
        }

        match role {
            ROLE_LICENSE => self.license = Some(text.to_string()),
            _ => self.descr = Some(text.to_string()),
        }
        Ok(self)
    }

    pub fn set_process_function(&mut self, func: FunctionRef) -> &mut Self {
        self.process_function = Some(func);
        self
    }

    fn invalidate(&mut self) {
        self.fetched = false;
        self.unpacked = false;
    }

    /// Directory holding the unpacked files.
    pub fn unpack_dir(&self, ctx: &StepContext) -> Utf8PathBuf {
        ctx.paths.interim_data_path.join(&self.name)
    }

    fn raw_path(&self, ctx: &StepContext, spec: &FetchSpec) -> Utf8PathBuf {
        ctx.paths.raw_data_path.join(&spec.file_name)
    }

    /// Whether a previous fetch is still valid. Re-checks every managed
    /// file and drops the cached flag if any is gone or changed.
    pub fn is_fetched(&mut self, ctx: &StepContext) -> Result<bool> {
        if !self.fetched {
            return Ok(false);
        }

        for spec in &self.file_list {
            let path = self.raw_path(ctx, spec);
            let intact = match &spec.hash {
                _ if !path.is_file() => false,
                None => true,
                Some(expected) => {
                    let (algorithm, _) = hash::split_hash(expected)?;
                    &hash::hash_file(&path, algorithm, DEFAULT_BLOCK_SIZE)? == expected
                }
            };

            if !intact {
                tracing::info!("{}: '{}' changed since the last fetch", self.name, spec.file_name);
                self.invalidate();
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Obtain every file of the datasource into the raw directory.
    ///
    /// Files already present with a matching hash (or with no committed
    /// hash) are kept unless `force` is set. Hashes of newly fetched files
    /// are checked against the committed ones, or committed if absent.
    pub fn fetch(&mut self, ctx: &StepContext, force: bool) -> Result<()> {
        if !force && self.is_fetched(ctx)? {
            tracing::debug!("{}: already fetched", self.name);
            return Ok(());
        }

        tracing::info!("{}: fetching {} files", self.name, self.file_list.len());
        let raw = &ctx.paths.raw_data_path;
        fs::create_dir_all(raw).at(raw)?;

        let name = self.name.clone();
        for spec in &mut self.file_list {
            let path = raw.join(&spec.file_name);
            let algorithm = match &spec.hash {
                Some(h) => hash::split_hash(h)?.0,
                None => ctx.hash_algorithm,
            };

            if !force && path.is_file() {
                let actual = hash::hash_file(&path, algorithm, DEFAULT_BLOCK_SIZE)?;
                match &spec.hash {
                    None => {
                        tracing::debug!("{}: '{}' exists, committing {}", name, spec.file_name, actual);
                        spec.hash = Some(actual);
                        continue;
                    }
                    Some(expected) if expected == &actual => continue,
                    Some(_) => {
                        tracing::warn!("{}: '{}' has the wrong hash, fetching again", name, spec.file_name);
                    }
                }
            }

            fetch_one(ctx, spec, &path)?;

            let actual = hash::hash_file(&path, algorithm, DEFAULT_BLOCK_SIZE)?;
            match &spec.hash {
                Some(expected) if expected != &actual => {
                    return Err(ReproError::validation(
                        &spec.file_name,
                        format!("fetched file has hash {actual}, expected {expected}"),
                    ));
                }
                Some(_) => {}
                None => spec.hash = Some(actual),
            }
        }

        self.fetched = true;
        self.unpacked = false;
        Ok(())
    }

    /// Unpack every fetched file into [`DataSource::unpack_dir`], fetching
    /// first if needed.
    pub fn unpack(&mut self, ctx: &StepContext, force: bool) -> Result<Utf8PathBuf> {
        let dir = self.unpack_dir(ctx);

        if !self.is_fetched(ctx)? {
            self.fetch(ctx, false)?;
        } else if self.unpacked && !force && dir.is_dir() {
            return Ok(dir);
        }

        crate::io::clear_dir(&dir)?;
        for spec in &self.file_list {
            let src = self.raw_path(ctx, spec);
            unpack::unpack(spec.unpack_action(), &src, &dir)?;
        }

        self.unpacked = true;
        Ok(dir)
    }

    /// Text of the file playing `role`, or of the inline field.
    fn role_text(&self, ctx: &StepContext, role: &str) -> Result<Option<String>> {
        let inline = match role {
            ROLE_LICENSE => &self.license,
            _ => &self.descr,
        };
        if inline.is_some() {
            return Ok(inline.clone());
        }

        let Some(spec) = self
            .file_list
            .iter()
            .find(|s| s.name.as_deref() == Some(role))
        else {
            return Ok(None);
        };

        let path = self.raw_path(ctx, spec);
        Ok(Some(fs::read_to_string(&path).at(&path)?))
    }

    /// Run the processing function and build the raw artifact.
    ///
    /// Metadata is the datasource defaults, overlaid by whatever the
    /// processor returned, overlaid by `overrides`. With `use_docstring`
    /// the processor's documentation becomes the description.
    pub fn process(
        &mut self,
        ctx: &StepContext,
        overrides: Option<&Map<String, Value>>,
        use_docstring: bool,
    ) -> Result<Artifact> {
        self.unpack(ctx, false)?;

        let mut metadata = Map::new();
        metadata.insert(artifact::KEY_NAME.into(), Value::String(self.name.clone()));
        if let Some(license) = self.role_text(ctx, ROLE_LICENSE)? {
            metadata.insert(artifact::KEY_LICENSE.into(), Value::String(license));
        }
        if let Some(descr) = self.role_text(ctx, ROLE_DESCR)? {
            metadata.insert(artifact::KEY_DESCR.into(), Value::String(descr));
        }

        let processed = match &self.process_function {
            Some(func) => {
                if use_docstring && let Some(doc) = ctx.registry.processor_doc(&func.key) {
                    metadata.insert(artifact::KEY_DESCR.into(), Value::String(doc.to_string()));
                }
                ctx.registry.run_processor(ctx, self, func)?
            }
            None => {
                tracing::warn!("{}: no processing function, producing an empty dataset", self.name);
                Default::default()
            }
        };

        metadata.extend(processed.metadata);
        if let Some(overrides) = overrides {
            metadata.extend(overrides.clone());
        }

        let mut artifact = Artifact::new(None, metadata)?.with_data(processed.data);
        artifact.set_target(processed.target);
        Ok(artifact)
    }

    /// Load a datasource from the `datasources` catalog.
    pub fn from_catalog(name: &str, root: impl AsRef<Utf8Path>) -> Result<Self> {
        let catalog = Catalog::<DataSource>::load(CATALOG_DATASOURCES, true, root)?;
        catalog
            .get(name)
            .cloned()
            .ok_or_else(|| ReproError::not_found("datasource", name))
    }

    /// Store the recipe in the `datasources` catalog.
    pub fn to_catalog(&self, root: impl AsRef<Utf8Path>, overwrite: bool) -> Result<()> {
        let mut catalog = Catalog::<DataSource>::load(CATALOG_DATASOURCES, true, root)?;
        if catalog.get(&self.name) == Some(self) {
            return Ok(());
        }
        catalog.insert(self.name.clone(), self.clone(), overwrite)
    }
}

fn fetch_one(ctx: &StepContext, spec: &FetchSpec, path: &Utf8Path) -> Result<()> {
    let fail = |reason: String| ReproError::Fetch {
        file: spec.file_name.clone(),
        reason,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).at(dir)?;
    }

    match spec.action {
        FetchAction::Url => {
            let url = spec.url.as_deref().ok_or_else(|| fail("no url given".into()))?;
            let downloader = ctx
                .downloader
                .ok_or_else(|| fail(format!("no downloader configured for {url}")))?;
            tracing::info!("downloading {}", url);
            downloader
                .download(url, path)
                .map_err(|e| fail(format!("{e:#}")))?;
        }
        FetchAction::Create => {
            let contents = spec.contents.as_deref().unwrap_or_default();
            crate::io::write_atomic(path, contents.as_bytes())?;
        }
        FetchAction::Copy => {
            let src = spec
                .source_file
                .as_deref()
                .ok_or_else(|| fail("no source file given".into()))?;
            tracing::warn!(
                "copying local file {}, this dataset can't be reproduced elsewhere",
                src
            );
            fs::copy(src, path).at(src)?;
        }
        FetchAction::Message => {
            let message = spec.message.as_deref().unwrap_or("obtain this file manually");
            return Err(fail(format!(
                "{message}\nPlace the file at {path} and try again"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::paths::Paths;
    use crate::registry::{Processed, Registry};
    use serde_json::json;

    fn tmp() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, Paths::new(root))
    }

    struct FakeDownloader {
        calls: Mutex<Vec<String>>,
    }

    impl Downloader for FakeDownloader {
        fn download(&self, url: &str, dest: &Utf8Path) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(url.to_string());
            fs::write(dest, format!("payload of {url}"))?;
            Ok(())
        }
    }

    #[test]
    fn add_file_deduplicates_by_name() {
        let mut ds = DataSource::new("wine");
        ds.add_file_contents("a.txt", "one");
        ds.add_file_contents("b.txt", "two");
        ds.add_file_contents("a.txt", "three");

        let names: Vec<_> = ds.file_list().iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(names, vec!["b.txt", "a.txt"]);
        assert_eq!(ds.file_list()[1].contents.as_deref(), Some("three"));
    }

    #[test]
    fn url_file_name_inference() {
        let spec = FetchSpec::url("https://example.org/data/wine.csv.zip?x=1", None).unwrap();
        assert_eq!(spec.file_name, "wine.csv.zip");
        assert!(FetchSpec::url("https://example.org/", None).is_err());
    }

    #[test]
    fn fetch_establishes_then_checks_hashes() {
        let (_dir, paths) = tmp();
        let registry = Registry::new();
        let ctx = StepContext::new(&paths, &registry);

        let mut ds = DataSource::new("toy");
        ds.add_file_contents("toy.txt", "hello");
        ds.fetch(&ctx, false).unwrap();

        let expected = hash::hash_bytes("hello", HashAlgorithm::Sha256);
        assert_eq!(ds.file_list()[0].hash.as_deref(), Some(expected.as_str()));
        assert!(ds.is_fetched(&ctx).unwrap());

        fs::write(paths.raw_data_path.join("toy.txt"), "tampered").unwrap();
        assert!(!ds.is_fetched(&ctx).unwrap());

        // The tampered file is recreated from its contents.
        ds.fetch(&ctx, false).unwrap();
        assert_eq!(fs::read_to_string(paths.raw_data_path.join("toy.txt")).unwrap(), "hello");
    }

    #[test]
    fn fetch_rejects_wrong_committed_hash() {
        let (_dir, paths) = tmp();
        let registry = Registry::new();
        let ctx = StepContext::new(&paths, &registry);

        let mut ds = DataSource::new("toy");
        ds.add_file(FetchSpec::create("toy.txt", "hello").with_hash("sha1:0000"));
        let err = ds.fetch(&ctx, false).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn url_fetch_goes_through_downloader() {
        let (_dir, paths) = tmp();
        let registry = Registry::new();
        let downloader = FakeDownloader {
            calls: Mutex::new(Vec::new()),
        };

        let mut ds = DataSource::new("remote");
        ds.add_url("https://example.org/f.txt", None, None).unwrap();

        let ctx = StepContext::new(&paths, &registry);
        let err = ds.fetch(&ctx, false).unwrap_err();
        assert!(matches!(err, ReproError::Fetch { .. }));

        let ctx = StepContext {
            downloader: Some(&downloader),
            ..StepContext::new(&paths, &registry)
        };
        ds.fetch(&ctx, false).unwrap();
        ds.fetch(&ctx, false).unwrap();
        assert_eq!(downloader.calls.lock().unwrap().len(), 1);

        ds.fetch(&ctx, true).unwrap();
        assert_eq!(downloader.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn manual_download_fails_with_message() {
        let (_dir, paths) = tmp();
        let registry = Registry::new();
        let ctx = StepContext::new(&paths, &registry);

        let mut ds = DataSource::new("manual");
        ds.add_manual_download("secret.csv", "Request access from the owners", None);
        let err = ds.fetch(&ctx, false).unwrap_err();
        assert!(err.to_string().contains("Request access from the owners"));

        // Once the user places the file, fetching succeeds.
        fs::create_dir_all(&paths.raw_data_path).unwrap();
        fs::write(paths.raw_data_path.join("secret.csv"), "a,b").unwrap();
        ds.fetch(&ctx, false).unwrap();
        assert!(ds.file_list()[0].hash.is_some());
    }

    #[test]
    fn process_merges_metadata_layers() {
        let (_dir, paths) = tmp();
        let mut registry = Registry::new();
        registry.register_processor("lines", Some("Split a text file into lines."), |ctx, ds, _| {
            let text = fs::read_to_string(ds.unpack_dir(ctx).join("toy.txt"))?;
            let mut metadata = Map::new();
            metadata.insert("descr".into(), json!("from processor"));
            metadata.insert("rows".into(), json!(text.lines().count()));
            Ok(Processed {
                data: json!(text.lines().collect::<Vec<_>>()),
                target: None,
                metadata,
            })
        });
        let ctx = StepContext::new(&paths, &registry);

        let mut ds = DataSource::new("toy");
        ds.add_file_contents("toy.txt", "a\nb\n");
        ds.add_metadata("license", "CC0", false).unwrap();
        ds.add_metadata("DESCR", "Toy lines.", true).unwrap();
        ds.set_process_function(FunctionRef::new("lines"));

        let plain = ds.process(&ctx, None, false).unwrap();
        assert_eq!(plain.name(), "toy");
        assert_eq!(plain.license(), Some("CC0"));
        assert_eq!(plain.descr(), Some("from processor"));
        assert_eq!(plain.data(), &json!(["a", "b"]));
        assert_eq!(plain.metadata()["rows"], json!(2));

        let mut overrides = Map::new();
        overrides.insert("license".into(), json!("MIT"));
        let over = ds.process(&ctx, Some(&overrides), false).unwrap();
        assert_eq!(over.license(), Some("MIT"));

        ds.set_process_function(FunctionRef::new("missing"));
        assert!(ds.process(&ctx, None, false).is_err());
    }

    #[test]
    fn descr_from_role_file() {
        let (_dir, paths) = tmp();
        let registry = Registry::new();
        let ctx = StepContext::new(&paths, &registry);

        let mut ds = DataSource::new("toy");
        ds.add_metadata("DESCR", "Described in a file.", true).unwrap();
        let artifact = ds.process(&ctx, None, false).unwrap();
        assert_eq!(artifact.descr(), Some("Described in a file."));
        assert!(paths.interim_data_path.join("toy/toy.descr").exists());
    }

    #[test]
    fn catalog_roundtrip_ignores_runtime_state() {
        let (_dir, paths) = tmp();
        let registry = Registry::new();
        let ctx = StepContext::new(&paths, &registry);

        let mut ds = DataSource::new("toy");
        ds.add_file_contents("toy.txt", "x");
        ds.fetch(&ctx, false).unwrap();
        ds.to_catalog(&paths.catalog_path, false).unwrap();

        let loaded = DataSource::from_catalog("toy", &paths.catalog_path).unwrap();
        assert_eq!(loaded, ds);
        assert!(!loaded.fetched);

        // Same recipe again is fine, a different one needs overwrite.
        ds.to_catalog(&paths.catalog_path, false).unwrap();
        ds.add_file_contents("other.txt", "y");
        assert!(ds.to_catalog(&paths.catalog_path, false).unwrap_err().is_collision());
    }
}
