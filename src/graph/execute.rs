use std::time::Instant;

use serde_json::Value;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::artifact::Artifact;
use crate::error::{OutputFailure, ReproError, Result};
use crate::hash;
use crate::io::as_overhead;
use crate::registry::{ArtifactMap, StepContext};

use super::{DatasetGraph, Order};

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub order: Order,
    /// Re-run every edge back to the sources, ignoring the cache.
    pub exhaustive: bool,
    /// Persist the outputs.
    pub write: bool,
    /// Replace catalog records whose hashes disagree with the new outputs
    /// instead of failing.
    pub overwrite_catalog: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            order: Order::default(),
            exhaustive: false,
            write: true,
            overwrite_catalog: false,
        }
    }
}

impl DatasetGraph {
    /// Run the steps of `edge` and commit its outputs.
    ///
    /// Inputs are loaded from disk and re-validated against the catalog.
    /// Every output is checked before anything is committed, and all
    /// failing outputs are reported together. Without `write` nothing is
    /// committed: outputs are neither persisted nor recorded in the
    /// catalog.
    pub fn process_edge(
        &mut self,
        edge: &str,
        write: bool,
        overwrite_catalog: bool,
    ) -> Result<ArtifactMap> {
        self.run_edge(edge, write, overwrite_catalog, &ArtifactMap::new())
    }

    /// Like [`process_edge`](Self::process_edge), taking inputs found in
    /// `produced` as they are instead of reading them back from disk.
    fn run_edge(
        &mut self,
        edge: &str,
        write: bool,
        overwrite_catalog: bool,
        produced: &ArtifactMap,
    ) -> Result<ArtifactMap> {
        let transformer = self
            .transformers
            .get(edge)
            .cloned()
            .ok_or_else(|| ReproError::not_found("edge", edge))?;

        let mut map = ArtifactMap::new();
        for input in &transformer.input_datasets {
            let artifact = match produced.get(input) {
                Some(artifact) => artifact.clone(),
                None => {
                    let expected = self.catalog_hashes(input);
                    Artifact::from_disk(input, self.processed_dir(), Some(&expected))?
                }
            };
            map.insert(input.clone(), artifact);
        }

        {
            let ctx = StepContext {
                paths: &self.paths,
                registry: &self.registry,
                downloader: self.options.downloader.as_deref(),
                hash_algorithm: self.options.hash_algorithm,
                edge,
                outputs: &transformer.output_datasets,
            };

            for func in &transformer.transformations {
                tracing::debug!("{}: running step '{}'", edge, func.key);
                map = self.registry.run_step(&ctx, map, func)?;
            }
        }

        let mut failures = Vec::new();
        let mut checked = Vec::new();

        for name in &transformer.output_datasets {
            let Some(mut artifact) = map.remove(name) else {
                failures.push(OutputFailure {
                    artifact: name.clone(),
                    error: ReproError::not_found("output", name),
                });
                continue;
            };

            if artifact.name() != name {
                artifact.rename(name);
            }

            let expected = self.catalog_hashes(name);
            let algorithm = expected
                .values()
                .find_map(|h| hash::split_hash(h).ok().map(|(alg, _)| alg))
                .unwrap_or(self.options.hash_algorithm);
            artifact.update_hashes(algorithm)?;

            if !overwrite_catalog && !expected.is_empty() && !artifact.verify_hashes(&expected) {
                let actual = artifact.hashes();
                tracing::error!(
                    edge,
                    artifact = %name,
                    ?expected,
                    ?actual,
                    "output doesn't match its catalog record"
                );
                failures.push(OutputFailure {
                    artifact: name.clone(),
                    error: ReproError::validation(
                        name,
                        "hashes differ from the catalog, use `overwrite_catalog` to replace them",
                    ),
                });
                continue;
            }

            checked.push(artifact);
        }

        if !failures.is_empty() {
            return Err(ReproError::EdgeFailed {
                edge: edge.to_string(),
                failures,
            });
        }

        let dir = self.paths.processed_data_path.clone();
        let mut outputs = ArtifactMap::new();
        for mut artifact in checked {
            let name = artifact.name().to_string();

            if write {
                if overwrite_catalog || !Artifact::is_cached(&name, &dir, &artifact.hashes()) {
                    artifact.dump(&dir, true)?;
                }
                self.datasets
                    .set(name.clone(), Value::Object(artifact.metadata().clone()))?;
            }

            outputs.insert(name, artifact);
        }

        Ok(outputs)
    }

    /// Bring `target` up to date and return it.
    ///
    /// Edges run in plan order and the first failing one aborts the
    /// generation. Outputs of edges that completed before it stay
    /// committed. Each edge takes the outputs of earlier edges in the plan
    /// from memory, so a run without `write` leaves the processed directory
    /// and the datasets catalog as they were.
    pub fn generate(&mut self, target: &str, opts: &GenerateOptions) -> Result<Artifact> {
        let plan = self.traverse(target, opts.order, opts.exhaustive)?;

        if plan.is_empty() {
            tracing::info!("'{}' is up to date", target);
            let expected = self.catalog_hashes(target);
            return Artifact::from_disk(target, self.processed_dir(), Some(&expected));
        }

        let start = Instant::now();
        let root_span = tracing::span!(Level::INFO, "generate", dataset = %target);
        root_span.pb_set_style(&crate::log::style_plan()?);
        root_span.pb_set_length(plan.edges.len() as u64);
        root_span.pb_set_message(&format!("Generating {target}"));
        let _enter = root_span.enter();

        let edge_style = crate::log::style_edge()?;
        let mut produced = ArtifactMap::new();

        for edge in &plan.edges {
            let span = tracing::span!(Level::INFO, "edge", name = %edge);
            span.pb_set_style(&edge_style);
            span.pb_set_message(&format!("Processing {edge}"));
            let _enter = span.enter();

            let s = Instant::now();
            let outputs = self
                .run_edge(edge, opts.write, opts.overwrite_catalog, &produced)
                .inspect_err(|e| tracing::error!("edge '{}' failed:\n{}", edge, e))?;
            tracing::info!("processed edge '{}' {}", edge, as_overhead(s));

            produced.extend(outputs);
            root_span.pb_inc(1);
        }

        tracing::info!(
            "generated '{}' ({} edges) {}",
            target,
            plan.edges.len(),
            as_overhead(start)
        );

        match produced.remove(target) {
            Some(artifact) => Ok(artifact),
            None if opts.write => {
                let expected = self.catalog_hashes(target);
                Artifact::from_disk(target, self.processed_dir(), Some(&expected))
            }
            None => Err(ReproError::not_found("generated artifact", target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;
    use serde_json::json;

    use super::*;
    use crate::graph::{ArtifactState, EdgeSpec, GraphOptions};
    use crate::paths::Paths;
    use crate::registry::{FunctionRef, Registry};

    fn setup(registry: Registry) -> (tempfile::TempDir, crate::graph::DatasetGraph) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let g = DatasetGraph::new(Paths::new(root), Arc::new(registry), GraphOptions::default())
            .unwrap();
        (dir, g)
    }

    fn counting(calls: Arc<AtomicUsize>) -> Registry {
        let mut registry = Registry::with_builtins();
        registry.register_step("count", None, move |ctx, mut map, func| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = func.kwarg("value").cloned().unwrap_or_default();
            for output in ctx.outputs {
                map.insert(output.clone(), Artifact::named(output).with_data(value.clone()));
            }
            Ok(map)
        });
        registry.register_step("forget", None, |_, _, _| Ok(ArtifactMap::new()));
        registry
    }

    #[test]
    fn missing_outputs_fail_the_edge_together() {
        let (_dir, mut g) = setup(counting(Arc::default()));
        g.add_source(
            EdgeSpec::new()
                .output("x")
                .output("y")
                .step(FunctionRef::new("forget"))
                .generate(false),
        )
        .unwrap();

        let err = g.process_edge("_x_y", true, false).unwrap_err();
        match err {
            ReproError::EdgeFailed { edge, failures } => {
                assert_eq!(edge, "_x_y");
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(g.status("x").unwrap(), ArtifactState::PlaceholderOnly);
    }

    #[test]
    fn catalog_mismatch_needs_overwrite() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_dir, mut g) = setup(counting(calls.clone()));
        g.add_source(
            EdgeSpec::new()
                .output("x")
                .step(FunctionRef::new("count").with_kwarg("value", 1)),
        )
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let before = g.catalog_hashes("x");

        g.add_source(
            EdgeSpec::new()
                .output("x")
                .step(FunctionRef::new("count").with_kwarg("value", 2))
                .overwrite_catalog(true)
                .generate(false),
        )
        .unwrap();

        // The catalog still holds the hashes of value 1.
        let err = g.process_edge("_x", true, false).unwrap_err();
        assert!(matches!(err, ReproError::EdgeFailed { .. }));
        assert_eq!(g.catalog_hashes("x"), before);

        let outputs = g.process_edge("_x", true, true).unwrap();
        assert_eq!(outputs["x"].data(), &json!(2));
        assert_ne!(g.catalog_hashes("x"), before);
        assert_eq!(g.status("x").unwrap(), ArtifactState::CachedFresh);
    }

    #[test]
    fn dry_run_returns_without_writing() {
        let (_dir, mut g) = setup(counting(Arc::default()));
        g.add_source(
            EdgeSpec::new()
                .output("x")
                .step(FunctionRef::new("count").with_kwarg("value", "v"))
                .generate(false),
        )
        .unwrap();

        let opts = GenerateOptions {
            write: false,
            ..Default::default()
        };
        let artifact = g.generate("x", &opts).unwrap();
        assert_eq!(artifact.data(), &json!("v"));
        assert!(!g.paths().processed_data_path.join("x.dataset").exists());
        assert_eq!(g.status("x").unwrap(), ArtifactState::PlaceholderOnly);
    }

    #[test]
    fn dry_run_threads_outputs_along_a_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = counting(calls.clone());
        registry.register_step("double", None, |ctx, mut map, _| {
            let n = map["a"].data().as_i64().unwrap_or_default();
            let output = &ctx.outputs[0];
            map.insert(output.clone(), Artifact::named(output).with_data(json!(n * 2)));
            Ok(map)
        });
        let (_dir, mut g) = setup(registry);

        g.add_source(
            EdgeSpec::new()
                .output("a")
                .step(FunctionRef::new("count").with_kwarg("value", 21))
                .generate(false),
        )
        .unwrap();
        g.add_edge(
            EdgeSpec::new()
                .input("a")
                .output("b")
                .step(FunctionRef::new("double"))
                .generate(false),
        )
        .unwrap();

        let opts = GenerateOptions {
            write: false,
            ..Default::default()
        };
        let b = g.generate("b", &opts).unwrap();
        assert_eq!(b.data(), &json!(42));

        let processed = g.paths().processed_data_path.clone();
        for name in ["a", "b"] {
            assert!(!processed.join(format!("{name}.dataset")).exists());
            assert!(g.catalog_hashes(name).is_empty());
            assert_eq!(g.status(name).unwrap(), ArtifactState::PlaceholderOnly);
        }

        // A real run afterwards still generates and commits everything.
        let b = g.generate("b", &GenerateOptions::default()).unwrap();
        assert_eq!(b.data(), &json!(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(g.status("a").unwrap(), ArtifactState::CachedFresh);
        assert_eq!(g.status("b").unwrap(), ArtifactState::CachedFresh);
    }

    #[test]
    fn regeneration_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_dir, mut g) = setup(counting(calls.clone()));
        g.add_source(
            EdgeSpec::new()
                .output("x")
                .step(FunctionRef::new("count").with_kwarg("value", 7))
                .generate(false),
        )
        .unwrap();

        let first = g.generate("x", &Default::default()).unwrap();
        let second = g.generate("x", &Default::default()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.metadata(), second.metadata());

        let opts = GenerateOptions {
            exhaustive: true,
            ..Default::default()
        };
        g.generate("x", &opts).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
