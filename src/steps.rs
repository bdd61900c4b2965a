//! Built-in transformation steps and processing functions.

use std::fs;

use anyhow::{Context, anyhow, bail};
use serde_json::{Map, Value};

use crate::artifact::{self, Artifact, FileSet};
use crate::catalog::Catalog;
use crate::datasource::{CATALOG_DATASOURCES, DataSource};
use crate::registry::{ArtifactMap, FunctionRef, Processed, Registry, StepContext};

pub const STEP_DATASOURCE: &str = "datasource";
pub const STEP_NEW_DATASET: &str = "new_dataset";
pub const STEP_COPY_DATASET: &str = "copy_dataset";

pub const PROCESS_FILESET: &str = "fileset";
pub const PROCESS_JSON: &str = "json";

pub(crate) fn register_builtins(registry: &mut Registry) {
    registry
        .register_step(
            STEP_DATASOURCE,
            Some("Materialize a dataset from a registered datasource."),
            datasource,
        )
        .register_step(
            STEP_NEW_DATASET,
            Some("Create an empty dataset from metadata."),
            new_dataset,
        )
        .register_step(
            STEP_COPY_DATASET,
            Some("Derive a dataset by copying another one."),
            copy_dataset,
        )
        .register_processor(
            PROCESS_FILESET,
            Some("Track the unpacked files of a datasource as a fileset."),
            process_fileset,
        )
        .register_processor(
            PROCESS_JSON,
            Some("Parse a JSON file of a datasource into a dataset."),
            process_json,
        );
}

/// kwargs: `datasource_name`, `output_dataset` (defaults to the datasource
/// name).
fn datasource(ctx: &StepContext, mut map: ArtifactMap, func: &FunctionRef) -> anyhow::Result<ArtifactMap> {
    let ds_name = func.require_str("datasource_name")?;
    let output = func.kwarg_str("output_dataset")?.unwrap_or(ds_name);

    let mut catalog = Catalog::<DataSource>::load(CATALOG_DATASOURCES, true, &ctx.paths.catalog_path)?;
    let recipe = catalog
        .get(ds_name)
        .cloned()
        .ok_or_else(|| anyhow!("datasource '{}' is not in the catalog", ds_name))?;

    let mut ds = recipe.clone();
    let mut artifact = ds.process(ctx, None, false)?;
    artifact.rename(output);

    // Commit hashes established while fetching.
    if ds != recipe {
        tracing::info!("{}: committing fetched file hashes", ds_name);
        catalog.set(ds_name, ds)?;
    }

    map.insert(output.to_string(), artifact);
    Ok(map)
}

/// kwargs: `dataset_name`, `metadata`.
fn new_dataset(_: &StepContext, mut map: ArtifactMap, func: &FunctionRef) -> anyhow::Result<ArtifactMap> {
    let name = func.require_str("dataset_name")?;
    let metadata = match func.kwarg("metadata") {
        None => Map::new(),
        Some(Value::Object(meta)) => meta.clone(),
        Some(other) => bail!("`metadata` must be an object, got {}", other),
    };

    map.insert(name.to_string(), Artifact::new(Some(name), metadata)?);
    Ok(map)
}

/// kwargs: `source_dataset_name`, `dataset_name`, `added_readme_txt`,
/// `drop_fileset` (default true), `drop_data`, `drop_target`.
fn copy_dataset(_: &StepContext, mut map: ArtifactMap, func: &FunctionRef) -> anyhow::Result<ArtifactMap> {
    let source = func.require_str("source_dataset_name")?;
    let name = func.require_str("dataset_name")?;

    let mut artifact = map
        .get(source)
        .cloned()
        .with_context(|| format!("input '{source}' is not available to copy"))?;

    artifact.rename(name);
    artifact.metadata_mut().remove(artifact::KEY_HASHES);

    if let Some(readme) = func.kwarg_str("added_readme_txt")? {
        let descr = match artifact.descr() {
            Some(descr) => format!("{descr}\n{readme}"),
            None => readme.to_string(),
        };
        artifact
            .metadata_mut()
            .insert(artifact::KEY_DESCR.into(), Value::String(descr));
    }
    if func.kwarg_bool("drop_fileset", true)? {
        artifact.metadata_mut().remove(artifact::KEY_FILESET);
    }
    if func.kwarg_bool("drop_data", false)? {
        artifact.set_data(Value::Null);
    }
    if func.kwarg_bool("drop_target", false)? {
        artifact.set_target(None);
    }

    map.insert(name.to_string(), artifact);
    Ok(map)
}

/// kwargs: `extract_dir` (relative to the unpack directory), `file_glob`.
fn process_fileset(ctx: &StepContext, ds: &DataSource, func: &FunctionRef) -> anyhow::Result<Processed> {
    let mut dir = ds.unpack_dir(ctx);
    if let Some(sub) = func.kwarg_str("extract_dir")? {
        dir = dir.join(sub);
    }
    let pattern = func.kwarg_str("file_glob")?.unwrap_or("**/*");

    let fileset = FileSet::from_dir(&dir, pattern, Some(ctx.hash_algorithm))?;
    let mut metadata = Map::new();
    metadata.insert(artifact::KEY_FILESET.into(), serde_json::to_value(&fileset)?);

    Ok(Processed {
        metadata,
        ..Default::default()
    })
}

/// kwargs: `file_name`, `target_field`.
///
/// With a target field, the field is moved out of every record into the
/// target.
fn process_json(ctx: &StepContext, ds: &DataSource, func: &FunctionRef) -> anyhow::Result<Processed> {
    let file_name = func.require_str("file_name")?;
    let path = ds.unpack_dir(ctx).join(file_name);
    let text = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let mut data: Value = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;

    let target = match func.kwarg_str("target_field")? {
        None => None,
        Some(field) => Some(take_field(&mut data, field)?),
    };

    Ok(Processed {
        data,
        target,
        metadata: Map::new(),
    })
}

fn take_field(data: &mut Value, field: &str) -> anyhow::Result<Value> {
    match data {
        Value::Array(records) => records
            .iter_mut()
            .map(|record| match record {
                Value::Object(obj) => Ok(obj.remove(field).unwrap_or(Value::Null)),
                other => Err(anyhow!("can't take `{}` from {}", field, other)),
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(obj) => obj
            .remove(field)
            .with_context(|| format!("field `{field}` not present")),
        other => bail!("can't take `{}` from {}", field, other),
    }
}
