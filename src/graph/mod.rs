//! The dataset dependency graph.
//!
//! Nodes are artifacts, edges are transformers. A transformer is a
//! hyperedge: it consumes any number of input artifacts and produces one or
//! more outputs by running a pipeline of registered steps. Both the
//! artifact records and the transformers live in catalogs, the graph itself
//! is only a view derived from them.

mod execute;
mod traverse;

use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::sync::Arc;

use camino::Utf8Path;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::Catalog;
use crate::datasource::Downloader;
use crate::error::{ReproError, Result};
use crate::hash::HashAlgorithm;
use crate::paths::Paths;
use crate::registry::{FunctionRef, Registry};
use crate::steps;

pub use self::execute::GenerateOptions;
pub use self::traverse::{ArtifactState, Order, Plan};

pub const CATALOG_DATASETS: &str = "datasets";
pub const CATALOG_TRANSFORMERS: &str = "transformers";

/// A hyperedge of the graph, as stored in the `transformers` catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformer {
    #[serde(default)]
    pub input_datasets: Vec<String>,
    pub output_datasets: Vec<String>,
    #[serde(default)]
    pub transformations: Vec<FunctionRef>,
}

impl Transformer {
    pub fn is_source(&self) -> bool {
        self.input_datasets.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct GraphOptions {
    /// Fail on load if a node has no datasets catalog entry, instead of
    /// inserting a placeholder.
    pub strict: bool,
    pub hash_algorithm: HashAlgorithm,
    pub downloader: Option<Arc<dyn Downloader>>,
}

impl Debug for GraphOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphOptions")
            .field("strict", &self.strict)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("downloader", &self.downloader.is_some())
            .finish()
    }
}

/// Description of an edge to add to the graph.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    name: Option<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    datasource: Option<String>,
    steps: Vec<FunctionRef>,
    overwrite_catalog: bool,
    generate: bool,
}

impl Default for EdgeSpec {
    fn default() -> Self {
        Self {
            name: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            datasource: None,
            steps: Vec::new(),
            overwrite_catalog: false,
            generate: true,
        }
    }
}

impl EdgeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit edge name. Defaults to `_` followed by the outputs joined
    /// with `_`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Produce the output from a registered datasource. Only valid for
    /// source edges.
    pub fn datasource(mut self, name: impl Into<String>) -> Self {
        self.datasource = Some(name.into());
        self
    }

    pub fn step(mut self, func: FunctionRef) -> Self {
        self.steps.push(func);
        self
    }

    pub fn overwrite_catalog(mut self, overwrite: bool) -> Self {
        self.overwrite_catalog = overwrite;
        self
    }

    /// Whether to materialize the outputs right after registering the edge.
    pub fn generate(mut self, generate: bool) -> Self {
        self.generate = generate;
        self
    }

    fn edge_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("_{}", self.outputs.join("_")),
        }
    }
}

pub struct DatasetGraph {
    paths: Paths,
    registry: Arc<Registry>,
    options: GraphOptions,
    datasets: Catalog<Value>,
    transformers: Catalog<Transformer>,
}

impl DatasetGraph {
    pub fn new(paths: Paths, registry: Arc<Registry>, options: GraphOptions) -> Result<Self> {
        paths.ensure_dirs()?;
        let datasets = Catalog::load(CATALOG_DATASETS, true, &paths.catalog_path)?;
        let transformers = Catalog::load(CATALOG_TRANSFORMERS, true, &paths.catalog_path)?;

        let mut graph = Self {
            paths,
            registry,
            options,
            datasets,
            transformers,
        };
        graph.check_consistency()?;

        tracing::debug!(
            "loaded dataset graph with {} nodes and {} edges",
            graph.nodes().len(),
            graph.transformers.len()
        );
        Ok(graph)
    }

    /// Open a graph with the built-in registry and default options.
    pub fn open(paths: Paths) -> Result<Self> {
        Self::new(paths, Arc::new(Registry::with_builtins()), GraphOptions::default())
    }

    /// Re-read both catalogs from disk.
    pub fn reload(&mut self) -> Result<()> {
        self.datasets.reload()?;
        self.transformers.reload()?;
        self.check_consistency()
    }

    fn check_consistency(&mut self) -> Result<()> {
        for node in self.nodes() {
            if self.datasets.contains_key(&node) {
                continue;
            }
            if self.options.strict {
                return Err(ReproError::not_found("datasets catalog entry", node));
            }
            tracing::warn!("'{}' has no datasets catalog entry, adding a placeholder", node);
            self.datasets.set(node, placeholder())?;
        }

        for (edge, transformer) in self.transformers.iter() {
            for func in &transformer.transformations {
                if !self.registry.has_step(&func.key) {
                    tracing::warn!("edge '{}' uses unknown step '{}'", edge, func.key);
                }
            }
        }

        Ok(())
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn datasets(&self) -> &Catalog<Value> {
        &self.datasets
    }

    pub fn transformers(&self) -> &Catalog<Transformer> {
        &self.transformers
    }

    fn processed_dir(&self) -> &Utf8Path {
        &self.paths.processed_data_path
    }

    /// Every artifact produced by some edge.
    pub fn nodes(&self) -> BTreeSet<String> {
        self.transformers
            .iter()
            .flat_map(|(_, t)| t.output_datasets.iter().cloned())
            .collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &str> {
        self.transformers.keys()
    }

    pub fn edge(&self, name: &str) -> Option<&Transformer> {
        self.transformers.get(name)
    }

    /// Number of non-source edges producing `node`.
    pub fn in_degree(&self, node: &str) -> usize {
        self.transformers
            .iter()
            .filter(|(_, t)| !t.is_source() && t.output_datasets.iter().any(|o| o == node))
            .count()
    }

    /// Number of edges consuming `node`.
    pub fn out_degree(&self, node: &str) -> usize {
        self.transformers
            .iter()
            .filter(|(_, t)| t.input_datasets.iter().any(|i| i == node))
            .count()
    }

    pub fn sources(&self) -> Vec<String> {
        self.nodes()
            .into_iter()
            .filter(|n| self.in_degree(n) == 0)
            .collect()
    }

    pub fn sinks(&self) -> Vec<String> {
        self.nodes()
            .into_iter()
            .filter(|n| self.out_degree(n) == 0)
            .collect()
    }

    fn producer(&self, node: &str) -> Option<(&str, &Transformer)> {
        self.transformers
            .iter()
            .find(|(_, t)| t.output_datasets.iter().any(|o| o == node))
    }

    /// The edge producing `node`, as `(inputs, edge name, outputs)`.
    pub fn find_producer(&self, node: &str) -> Result<(Vec<String>, String, Vec<String>)> {
        let (name, t) = self
            .producer(node)
            .ok_or_else(|| ReproError::not_found("producer of", node))?;

        Ok((
            t.input_datasets.clone(),
            name.to_string(),
            t.output_datasets.clone(),
        ))
    }

    /// Register a source edge, one with no inputs.
    ///
    /// Either a datasource or a pipeline of steps must be given, not both.
    /// With a datasource the output defaults to the datasource name.
    pub fn add_source(&mut self, mut spec: EdgeSpec) -> Result<String> {
        if !spec.inputs.is_empty() {
            return Err(ReproError::engine("A source edge can't have inputs"));
        }

        match (spec.datasource.take(), spec.steps.is_empty()) {
            (Some(_), false) => {
                return Err(ReproError::engine(
                    "Give either a datasource or a pipeline for a source edge, not both",
                ));
            }
            (None, true) => {
                return Err(ReproError::engine(
                    "A source edge needs a datasource or a pipeline",
                ));
            }
            (Some(ds_name), true) => {
                if spec.outputs.is_empty() {
                    spec.outputs.push(ds_name.clone());
                }
                if spec.outputs.len() != 1 {
                    return Err(ReproError::engine(format!(
                        "Datasource '{ds_name}' produces a single output"
                    )));
                }
                spec.steps.push(
                    FunctionRef::new(steps::STEP_DATASOURCE)
                        .with_kwarg("datasource_name", ds_name)
                        .with_kwarg("output_dataset", spec.outputs[0].clone()),
                );
            }
            (None, false) => {}
        }

        self.add_edge(spec)
    }

    /// Register an edge and, unless disabled, generate its outputs.
    /// Returns the edge name.
    pub fn add_edge(&mut self, spec: EdgeSpec) -> Result<String> {
        if spec.datasource.is_some() {
            return Err(ReproError::engine("Use `add_source` for datasource edges"));
        }
        if spec.outputs.is_empty() {
            return Err(ReproError::engine("An edge needs at least one output"));
        }

        let name = spec.edge_name();
        let transformer = Transformer {
            input_datasets: dedup(&spec.inputs),
            output_datasets: dedup(&spec.outputs),
            transformations: spec.steps.clone(),
        };

        match self.transformers.get(&name).cloned() {
            Some(existing) if existing == transformer => {
                tracing::debug!("edge '{}' is already registered", name);
            }
            Some(_) if !spec.overwrite_catalog => {
                return Err(ReproError::collision(
                    "edge",
                    name,
                    "use `overwrite_catalog` to replace it",
                ));
            }
            _ => {
                self.check_insert(&name, &transformer)?;
                self.transformers.set(name.clone(), transformer.clone())?;
                tracing::info!("registered edge '{}'", name);
            }
        }

        for node in transformer
            .input_datasets
            .iter()
            .chain(&transformer.output_datasets)
        {
            if !self.datasets.contains_key(node) {
                tracing::debug!("adding placeholder for '{}'", node);
                self.datasets.set(node.clone(), placeholder())?;
            }
        }

        if spec.generate {
            let opts = GenerateOptions {
                overwrite_catalog: spec.overwrite_catalog,
                ..Default::default()
            };
            for output in &transformer.output_datasets {
                self.generate(output, &opts)?;
            }
        }

        Ok(name)
    }

    /// Check that `transformer` can be stored under `name` without another
    /// edge producing the same outputs or the graph becoming cyclic.
    fn check_insert(&self, name: &str, transformer: &Transformer) -> Result<()> {
        for output in &transformer.output_datasets {
            if let Some((other, _)) = self
                .transformers
                .iter()
                .filter(|(n, _)| *n != name)
                .find(|(_, t)| t.output_datasets.contains(output))
            {
                return Err(ReproError::collision(
                    "output",
                    output,
                    format!("already produced by edge '{other}'"),
                ));
            }
        }

        let mut graph = DiGraphMap::<&str, ()>::new();
        let all = self
            .transformers
            .iter()
            .filter(|(n, _)| *n != name)
            .map(|(_, t)| t)
            .chain(std::iter::once(transformer));
        for t in all {
            for output in &t.output_datasets {
                graph.add_node(output);
                for input in &t.input_datasets {
                    graph.add_edge(input, output, ());
                }
            }
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(ReproError::engine(format!(
                "Edge '{}' would create a cycle through '{}'",
                name,
                cycle.node_id()
            )));
        }

        Ok(())
    }

    /// Drop an edge from the transformers catalog. Artifact records are
    /// kept.
    pub fn remove_edge(&mut self, name: &str) -> Result<Transformer> {
        self.transformers
            .remove(name)?
            .ok_or_else(|| ReproError::not_found("edge", name))
    }

    /// Register a source edge creating an empty dataset from `metadata`.
    pub fn dataset_from_metadata(
        &mut self,
        name: &str,
        metadata: Map<String, Value>,
        overwrite_catalog: bool,
    ) -> Result<String> {
        self.add_source(
            EdgeSpec::new()
                .output(name)
                .step(
                    FunctionRef::new(steps::STEP_NEW_DATASET)
                        .with_kwarg("dataset_name", name)
                        .with_kwarg("metadata", Value::Object(metadata)),
                )
                .overwrite_catalog(overwrite_catalog),
        )
    }

    /// Register an edge deriving `name` as a copy of `source`, with
    /// `readme` appended to its description.
    pub fn derived_dataset(
        &mut self,
        source: &str,
        name: &str,
        readme: Option<&str>,
        overwrite_catalog: bool,
    ) -> Result<String> {
        let mut func = FunctionRef::new(steps::STEP_COPY_DATASET)
            .with_kwarg("source_dataset_name", source)
            .with_kwarg("dataset_name", name);
        if let Some(readme) = readme {
            func = func.with_kwarg("added_readme_txt", readme);
        }

        self.add_edge(
            EdgeSpec::new()
                .input(source)
                .output(name)
                .step(func)
                .overwrite_catalog(overwrite_catalog),
        )
    }
}

impl Debug for DatasetGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetGraph")
            .field("paths", &self.paths)
            .field("options", &self.options)
            .field("nodes", &self.nodes())
            .field("edges", &self.edges().collect::<Vec<_>>())
            .finish()
    }
}

fn placeholder() -> Value {
    Value::Object(Map::new())
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect()
}
