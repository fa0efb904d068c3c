//! Dependency closure over (variant, task) pairs.

use kiln_core::pair::{Pair, PairSet};
use kiln_core::project::Project;
use kiln_core::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Expands a seed set into the smallest superset that satisfies every
/// dependency and requirement edge of a project.
pub struct DependencyIncluder<'a> {
    project: &'a Project,
}

/// Dependency edges discovered during one closure, used for cycle checks.
#[derive(Default)]
struct DependencyGraph {
    graph: DiGraph<Pair, ()>,
    nodes: HashMap<Pair, NodeIndex>,
}

impl DependencyGraph {
    fn node(&mut self, pair: &Pair) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(pair) {
            return idx;
        }
        let idx = self.graph.add_node(pair.clone());
        self.nodes.insert(pair.clone(), idx);
        idx
    }

    fn add_edge(&mut self, from: &Pair, to: &Pair) {
        let a = self.node(from);
        let b = self.node(to);
        self.graph.update_edge(a, b, ());
    }

    fn check_acyclic(&self) -> Result<()> {
        toposort(&self.graph, None).map(|_| ()).map_err(|cycle| {
            let pair = &self.graph[cycle.node_id()];
            Error::DependencyCycle {
                variant: pair.variant.clone(),
                task: pair.task.clone(),
            }
        })
    }
}

impl<'a> DependencyIncluder<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self { project }
    }

    /// Compute the closure of `seed`.
    ///
    /// Every seed must be declared by the project. Required pairs are
    /// expanded like any other pair, so the result is a fixed point:
    /// including it again yields the same set.
    pub fn include(&self, seed: &PairSet) -> Result<PairSet> {
        for pair in seed {
            self.check_declared(pair)?;
        }

        let mut result = seed.clone();
        let mut queue: VecDeque<Pair> = seed.iter().cloned().collect();
        let mut graph = DependencyGraph::default();

        while let Some(pair) = queue.pop_front() {
            for dep in self.project.dependencies_of(&pair)? {
                graph.add_edge(&pair, &dep);
                if result.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
            for req in self.project.requirements_of(&pair)? {
                if result.insert(req.clone()) {
                    queue.push_back(req);
                }
            }
        }

        graph.check_acyclic()?;

        debug!(
            seed = seed.len(),
            included = result.len(),
            "Computed dependency closure"
        );
        Ok(result)
    }

    fn check_declared(&self, pair: &Pair) -> Result<()> {
        let variant = self
            .project
            .find_variant(&pair.variant)
            .ok_or_else(|| Error::UnknownVariant(pair.variant.clone()))?;
        if variant.get(&pair.task).is_none() {
            return Err(Error::UnknownTask {
                variant: pair.variant.clone(),
                task: pair.task.clone(),
            });
        }
        Ok(())
    }
}

/// Expand the pairs a patch requested into everything they need.
pub fn include_patch_dependencies(project: &Project, pairs: &PairSet) -> Result<PairSet> {
    DependencyIncluder::new(project).include(pairs)
}
