#![forbid(unsafe_code)]
//! Reproducible derivation of named datasets.
//!
//! Raw data enters through a [`DataSource`], a recipe of files to fetch and
//! unpack plus a processing function. Datasets are derived from each other
//! by transformers, pipelines of registered steps stored as edges of a
//! [`DatasetGraph`]. Every produced [`Artifact`] carries a hash record of its
//! payload, and the `datasets` [`Catalog`] remembers the hashes of the last
//! good generation, so asking for a dataset only reruns the edges whose
//! inputs went stale.
//!
//! ```no_run
//! use reprodata::{DataSource, DatasetGraph, EdgeSpec, FunctionRef, Paths};
//!
//! # fn main() -> reprodata::Result<()> {
//! let paths = Paths::new("project");
//!
//! let mut ds = DataSource::new("people");
//! ds.add_file_contents("people.json", r#"[{"name": "a", "age": 1}]"#);
//! ds.set_process_function(FunctionRef::new("json").with_kwarg("file_name", "people.json"));
//! ds.to_catalog(&paths.catalog_path, false)?;
//!
//! let mut graph = DatasetGraph::open(paths)?;
//! graph.add_source(EdgeSpec::new().datasource("people"))?;
//! graph.derived_dataset("people", "people_copy", Some("A plain copy."), false)?;
//!
//! let artifact = graph.generate("people_copy", &Default::default())?;
//! println!("{}", artifact.data());
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod catalog;
pub mod datasource;
mod error;
pub mod graph;
pub mod hash;
mod io;
mod log;
pub mod paths;
pub mod registry;
pub mod steps;

pub use crate::artifact::{Artifact, FileSet, HashRecord};
pub use crate::catalog::Catalog;
pub use crate::datasource::{DataSource, Downloader, FetchAction, FetchSpec, UnpackAction};
pub use crate::error::*;
pub use crate::graph::{
    ArtifactState, DatasetGraph, EdgeSpec, GenerateOptions, GraphOptions, Order, Plan, Transformer,
};
pub use crate::hash::HashAlgorithm;
#[cfg(feature = "logging")]
pub use crate::log::init_logging;
pub use crate::paths::Paths;
pub use crate::registry::{ArtifactMap, FunctionRef, Processed, Registry, StepContext};
