//! Explicit tables of transformation steps and processing functions.
//!
//! Catalog records never contain code. They refer to functions through a
//! [`FunctionRef`], whose `key` is resolved against a [`Registry`] at the
//! moment the function is run.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::Artifact;
use crate::datasource::{DataSource, Downloader};
use crate::error::{ReproError, Result, RuntimeError};
use crate::hash::HashAlgorithm;
use crate::paths::Paths;

/// Artifacts threaded through the steps of an edge, keyed by name.
pub type ArtifactMap = BTreeMap<String, Artifact>;

/// A transformation step: takes the artifacts produced so far and returns
/// the new set.
pub type StepFn =
    dyn Fn(&StepContext, ArtifactMap, &FunctionRef) -> anyhow::Result<ArtifactMap> + Send + Sync;

/// A processing function turning the unpacked files of a datasource into an
/// artifact payload.
pub type ProcessFn =
    dyn Fn(&StepContext, &DataSource, &FunctionRef) -> anyhow::Result<Processed> + Send + Sync;

/// A serializable reference to a registered function, with the arguments
/// it will be called with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub key: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl FunctionRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key).filter(|v| !v.is_null())
    }

    /// A string keyword argument, if present.
    pub fn kwarg_str(&self, key: &str) -> anyhow::Result<Option<&str>> {
        match self.kwarg(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(anyhow!("`{}` expects a string, got {}", key, other)),
        }
    }

    /// A mandatory string keyword argument.
    pub fn require_str(&self, key: &str) -> anyhow::Result<&str> {
        self.kwarg_str(key)?
            .with_context(|| format!("`{}` requires the `{}` argument", self.key, key))
    }

    pub fn kwarg_bool(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        match self.kwarg(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(anyhow!("`{}` expects a boolean, got {}", key, other)),
        }
    }
}

/// Result of a processing function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Processed {
    pub data: Value,
    pub target: Option<Value>,
    pub metadata: Map<String, Value>,
}

/// Everything a step or processor may need from its surroundings.
pub struct StepContext<'a> {
    pub paths: &'a Paths,
    pub registry: &'a Registry,
    pub downloader: Option<&'a dyn Downloader>,
    pub hash_algorithm: HashAlgorithm,
    /// Name of the edge being processed, empty outside of an edge.
    pub edge: &'a str,
    /// Outputs the edge is expected to produce.
    pub outputs: &'a [String],
}

impl<'a> StepContext<'a> {
    pub fn new(paths: &'a Paths, registry: &'a Registry) -> Self {
        Self {
            paths,
            registry,
            downloader: None,
            hash_algorithm: HashAlgorithm::default(),
            edge: "",
            outputs: &[],
        }
    }
}

impl Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("paths", &self.paths)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("edge", &self.edge)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

struct Entry<F: ?Sized> {
    doc: Option<String>,
    func: Box<F>,
}

#[derive(Default)]
pub struct Registry {
    steps: HashMap<String, Entry<StepFn>>,
    processors: HashMap<String, Entry<ProcessFn>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in steps and processors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::steps::register_builtins(&mut registry);
        registry
    }

    pub fn register_step<F>(&mut self, key: impl Into<String>, doc: Option<&str>, func: F) -> &mut Self
    where
        F: Fn(&StepContext, ArtifactMap, &FunctionRef) -> anyhow::Result<ArtifactMap>
            + Send
            + Sync
            + 'static,
    {
        let key = key.into();
        if self.steps.contains_key(&key) {
            tracing::warn!("replacing registered step '{}'", key);
        }
        self.steps.insert(
            key,
            Entry {
                doc: doc.map(str::to_string),
                func: Box::new(func),
            },
        );
        self
    }

    pub fn register_processor<F>(
        &mut self,
        key: impl Into<String>,
        doc: Option<&str>,
        func: F,
    ) -> &mut Self
    where
        F: Fn(&StepContext, &DataSource, &FunctionRef) -> anyhow::Result<Processed>
            + Send
            + Sync
            + 'static,
    {
        let key = key.into();
        if self.processors.contains_key(&key) {
            tracing::warn!("replacing registered processor '{}'", key);
        }
        self.processors.insert(
            key,
            Entry {
                doc: doc.map(str::to_string),
                func: Box::new(func),
            },
        );
        self
    }

    pub fn has_step(&self, key: &str) -> bool {
        self.steps.contains_key(key)
    }

    pub fn has_processor(&self, key: &str) -> bool {
        self.processors.contains_key(key)
    }

    pub fn step_doc(&self, key: &str) -> Option<&str> {
        self.steps.get(key)?.doc.as_deref()
    }

    pub fn processor_doc(&self, key: &str) -> Option<&str> {
        self.processors.get(key)?.doc.as_deref()
    }

    pub fn step_keys(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    /// Resolve `func` to a step and run it.
    pub fn run_step(
        &self,
        ctx: &StepContext,
        input: ArtifactMap,
        func: &FunctionRef,
    ) -> Result<ArtifactMap> {
        let entry = self
            .steps
            .get(&func.key)
            .ok_or_else(|| ReproError::engine(format!("Unknown transformer step '{}'", func.key)))?;

        (entry.func)(ctx, input, func).map_err(|error| step_error(&func.key, error))
    }

    /// Resolve `func` to a processor and run it against `datasource`.
    pub fn run_processor(
        &self,
        ctx: &StepContext,
        datasource: &DataSource,
        func: &FunctionRef,
    ) -> Result<Processed> {
        let entry = self.processors.get(&func.key).ok_or_else(|| {
            ReproError::engine(format!("Unknown processing function '{}'", func.key))
        })?;

        (entry.func)(ctx, datasource, func).map_err(|error| step_error(&func.key, error))
    }
}

fn step_error(key: &str, error: RuntimeError) -> ReproError {
    // Keep library errors raised from inside a step intact.
    match error.downcast::<ReproError>() {
        Ok(err) => err,
        Err(error) => ReproError::Step {
            step: key.to_string(),
            error,
        },
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<_> = self.steps.keys().collect();
        let mut processors: Vec<_> = self.processors.keys().collect();
        steps.sort();
        processors.sort();

        f.debug_struct("Registry")
            .field("steps", &steps)
            .field("processors", &processors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn function_ref_serialized_form() {
        let func = FunctionRef::new("dropNulls").with_kwarg("column", "b");
        let value = serde_json::to_value(&func).unwrap();
        assert_eq!(
            value,
            json!({ "key": "dropNulls", "args": [], "kwargs": { "column": "b" } })
        );

        let parsed: FunctionRef = serde_json::from_value(json!({ "key": "x" })).unwrap();
        assert_eq!(parsed, FunctionRef::new("x"));
    }

    #[test]
    fn kwarg_accessors() {
        let func = FunctionRef::new("f")
            .with_kwarg("name", "a")
            .with_kwarg("flag", true)
            .with_kwarg("num", 3);

        assert_eq!(func.require_str("name").unwrap(), "a");
        assert!(func.require_str("missing").is_err());
        assert!(func.kwarg_str("num").is_err());
        assert!(func.kwarg_bool("flag", false).unwrap());
        assert!(!func.kwarg_bool("other", false).unwrap());
    }

    #[test]
    fn unknown_step_is_engine_error() {
        let registry = Registry::new();
        let paths = Paths::new("/tmp/unused");
        let ctx = StepContext::new(&paths, &registry);

        let err = registry
            .run_step(&ctx, ArtifactMap::new(), &FunctionRef::new("nope"))
            .unwrap_err();
        assert!(matches!(err, ReproError::Engine(_)));
    }

    #[test]
    fn step_errors_are_wrapped() {
        let mut registry = Registry::new();
        registry.register_step("fail", Some("Always fails."), |_, _, _| {
            Err(anyhow!("boom"))
        });
        registry.register_step("missing", None, |_, _, _| {
            Err(ReproError::not_found("artifact", "x").into())
        });

        let paths = Paths::new("/tmp/unused");
        let ctx = StepContext::new(&paths, &registry);

        let err = registry
            .run_step(&ctx, ArtifactMap::new(), &FunctionRef::new("fail"))
            .unwrap_err();
        assert!(matches!(err, ReproError::Step { ref step, .. } if step == "fail"));
        assert!(err.to_string().contains("boom"));

        let err = registry
            .run_step(&ctx, ArtifactMap::new(), &FunctionRef::new("missing"))
            .unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(registry.step_doc("fail"), Some("Always fails."));
    }

    #[test]
    fn builtins_are_registered() {
        let registry = Registry::with_builtins();
        for key in ["datasource", "new_dataset", "copy_dataset"] {
            assert!(registry.has_step(key), "{key}");
        }
        for key in ["fileset", "json"] {
            assert!(registry.has_processor(key), "{key}");
        }
    }
}
