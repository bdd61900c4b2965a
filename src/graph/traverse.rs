use std::collections::{HashMap, VecDeque};

use crate::artifact::{self, Artifact, HashRecord};
use crate::error::{ReproError, Result};

use super::DatasetGraph;

/// Where an artifact stands relative to the catalogs and the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    /// Not in the datasets catalog.
    Missing,
    /// Only a placeholder record, never generated.
    PlaceholderOnly,
    /// On disk with the catalogued hashes, and its inputs are too.
    CachedFresh,
    /// Generated once, but the disk or an input no longer matches.
    CachedStale,
}

/// Order in which the backward walk pops pending nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    BreadthFirst,
    DepthFirst,
}

/// What has to run to regenerate an artifact, sources first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub nodes: Vec<String>,
    pub edges: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl DatasetGraph {
    /// Hash record the datasets catalog holds for `name`.
    pub(crate) fn catalog_hashes(&self, name: &str) -> HashRecord {
        self.datasets
            .get(name)
            .and_then(|v| v.as_object())
            .map(artifact::hash_record)
            .unwrap_or_default()
    }

    /// Whether every input of `edge` is on disk with at least the hashes
    /// the catalog records for it. Source edges are always satisfied.
    pub fn fully_satisfied(&self, edge: &str) -> Result<bool> {
        let transformer = self
            .transformers
            .get(edge)
            .ok_or_else(|| ReproError::not_found("edge", edge))?;

        Ok(transformer.input_datasets.iter().all(|input| {
            Artifact::is_cached(input, self.processed_dir(), &self.catalog_hashes(input))
        }))
    }

    pub fn status(&self, name: &str) -> Result<ArtifactState> {
        if !self.datasets.contains_key(name) {
            return Ok(ArtifactState::Missing);
        }

        let expected = self.catalog_hashes(name);
        if expected.is_empty() {
            return Ok(ArtifactState::PlaceholderOnly);
        }

        if !Artifact::is_cached(name, self.processed_dir(), &expected) {
            return Ok(ArtifactState::CachedStale);
        }

        match self.producer(name) {
            Some((edge, _)) if !self.fully_satisfied(edge)? => Ok(ArtifactState::CachedStale),
            _ => Ok(ArtifactState::CachedFresh),
        }
    }

    /// Walk backward from `target` and collect what must be regenerated.
    ///
    /// Each node leads to its producing edge and that edge's inputs. Unless
    /// `exhaustive` is set, the walk doesn't extend past an edge whose inputs
    /// are all cached, and a target that is already fresh gives an empty
    /// plan. Revisited nodes and edges move to the end of the visitation,
    /// so the reversed result lists every edge after its predecessors.
    pub fn traverse(&self, target: &str, order: Order, exhaustive: bool) -> Result<Plan> {
        if self.producer(target).is_none() && !self.datasets.contains_key(target) {
            return Err(ReproError::not_found("artifact", target));
        }

        if !exhaustive && self.status(target)? == ArtifactState::CachedFresh {
            tracing::debug!("'{}' is fresh, nothing to do", target);
            return Ok(Plan::default());
        }

        let mut satisfied = HashMap::<String, bool>::new();
        let mut is_satisfied = |edge: &str| -> Result<bool> {
            if let Some(&known) = satisfied.get(edge) {
                return Ok(known);
            }
            let known = self.fully_satisfied(edge)?;
            satisfied.insert(edge.to_string(), known);
            Ok(known)
        };

        let mut nodes: Vec<String> = Vec::new();
        let mut edges: Vec<String> = Vec::new();
        let mut queue = VecDeque::from([target.to_string()]);

        while let Some(node) = match order {
            Order::BreadthFirst => queue.pop_front(),
            Order::DepthFirst => queue.pop_back(),
        } {
            move_to_end(&mut nodes, &node);

            let Some((edge, transformer)) = self.producer(&node) else {
                continue;
            };
            move_to_end(&mut edges, edge);

            if !exhaustive && is_satisfied(edge)? {
                continue;
            }

            queue.extend(transformer.input_datasets.iter().cloned());
        }

        nodes.reverse();
        edges.reverse();

        tracing::debug!(?nodes, ?edges, "planned generation of '{}'", target);
        Ok(Plan { nodes, edges })
    }
}

fn move_to_end(list: &mut Vec<String>, item: &str) {
    if let Some(pos) = list.iter().position(|x| x == item) {
        list.remove(pos);
    }
    list.push(item.to_string());
}
