//! Task ids assigned before the tasks exist.

use kiln_core::ids::{TaskId, VersionId};
use kiln_core::pair::{Pair, PairSet};
use kiln_core::project::Project;
use std::collections::HashMap;

/// Maps each pair of a closure to the id its task will be created with.
///
/// Ids are a pure function of (version, variant, task), so a dependency
/// edge can name a task that is created later in the same batch, or that
/// an earlier call already created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIdTable {
    ids: HashMap<Pair, TaskId>,
}

impl TaskIdTable {
    /// Assign ids for every pair the project declares. Undeclared pairs are
    /// skipped.
    pub fn build(project: &Project, version: &VersionId, pairs: &PairSet) -> Self {
        let ids = pairs
            .iter()
            .filter(|pair| project.has_pair(pair))
            .map(|pair| {
                let id = TaskId::derive(version, &pair.variant, &pair.task);
                (pair.clone(), id)
            })
            .collect();
        Self { ids }
    }

    pub fn get(&self, variant: &str, task: &str) -> Option<&TaskId> {
        self.ids.get(&Pair::new(variant, task))
    }

    pub fn get_pair(&self, pair: &Pair) -> Option<&TaskId> {
        self.ids.get(pair)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Pair, &TaskId)> {
        self.ids.iter()
    }
}
