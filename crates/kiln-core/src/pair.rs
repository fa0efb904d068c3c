//! Build variant / task pairs.
//!
//! A [`Pair`] names one unit of work: a task on a build variant. Patches
//! store their selection grouped by variant ([`VariantTasks`]); the
//! scheduler works on the flat [`PairSet`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Pair {
    pub variant: String,
    pub task: String,
}

impl Pair {
    pub fn new(variant: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            variant: variant.into(),
            task: task.into(),
        }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.variant, self.task)
    }
}

/// Tasks selected for one build variant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct VariantTasks {
    pub variant: String,
    pub tasks: Vec<String>,
}

/// Ordered set of unique pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Pair>", into = "Vec<Pair>")]
pub struct PairSet {
    pairs: Vec<Pair>,
    index: HashSet<Pair>,
}

impl PairSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair. Returns false if it was already present.
    pub fn insert(&mut self, pair: Pair) -> bool {
        if self.index.contains(&pair) {
            return false;
        }
        self.index.insert(pair.clone());
        self.pairs.push(pair);
        true
    }

    pub fn contains(&self, pair: &Pair) -> bool {
        self.index.contains(pair)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pair> {
        self.pairs.iter()
    }

    /// Union with another set, keeping this set's order first.
    pub fn union(&self, other: &PairSet) -> PairSet {
        let mut out = self.clone();
        out.extend(other.iter().cloned());
        out
    }

    /// Task names requested for `variant`, in first-seen order.
    pub fn task_names(&self, variant: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|p| p.variant == variant)
            .map(|p| p.task.clone())
            .collect()
    }

    /// Distinct variants, in first-seen order.
    pub fn variants(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.pairs
            .iter()
            .filter(|p| seen.insert(p.variant.as_str()))
            .map(|p| p.variant.clone())
            .collect()
    }

    /// Flatten a grouped selection.
    pub fn from_variant_tasks(groups: &[VariantTasks]) -> Self {
        groups
            .iter()
            .flat_map(|vt| vt.tasks.iter().map(|t| Pair::new(&vt.variant, t)))
            .collect()
    }

    /// Group by variant. Variants appear in first-seen order, and so do the
    /// tasks within each variant.
    pub fn to_variant_tasks(&self) -> Vec<VariantTasks> {
        self.variants()
            .into_iter()
            .map(|variant| VariantTasks {
                tasks: self.task_names(&variant),
                variant,
            })
            .collect()
    }

    /// True if both sets hold the same pairs, regardless of order.
    pub fn same_members(&self, other: &PairSet) -> bool {
        self.index == other.index
    }
}

impl PartialEq for PairSet {
    fn eq(&self, other: &Self) -> bool {
        self.pairs == other.pairs
    }
}

impl Eq for PairSet {}

impl Extend<Pair> for PairSet {
    fn extend<I: IntoIterator<Item = Pair>>(&mut self, iter: I) {
        for pair in iter {
            self.insert(pair);
        }
    }
}

impl FromIterator<Pair> for PairSet {
    fn from_iter<I: IntoIterator<Item = Pair>>(iter: I) -> Self {
        let mut set = PairSet::new();
        set.extend(iter);
        set
    }
}

impl From<Vec<Pair>> for PairSet {
    fn from(pairs: Vec<Pair>) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<PairSet> for Vec<Pair> {
    fn from(set: PairSet) -> Self {
        set.pairs
    }
}

impl<'a> IntoIterator for &'a PairSet {
    type Item = &'a Pair;
    type IntoIter = std::slice::Iter<'a, Pair>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

/// Flatten grouped selections into pairs.
pub fn to_pairs(groups: &[VariantTasks]) -> PairSet {
    PairSet::from_variant_tasks(groups)
}

/// Group pairs by variant.
pub fn to_variant_tasks(pairs: &PairSet) -> Vec<VariantTasks> {
    pairs.to_variant_tasks()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vt(variant: &str, tasks: &[&str]) -> VariantTasks {
        VariantTasks {
            variant: variant.to_string(),
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_duplicates_collapse() {
        let set: PairSet = vec![
            Pair::new("linux", "compile"),
            Pair::new("linux", "compile"),
            Pair::new("linux", "test"),
        ]
        .into();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_task_names_ordered_and_scoped() {
        let set = to_pairs(&[vt("linux", &["test", "compile"]), vt("osx", &["lint"])]);
        assert_eq!(set.task_names("linux"), vec!["test", "compile"]);
        assert_eq!(set.task_names("osx"), vec!["lint"]);
        assert!(set.task_names("windows").is_empty());
    }

    #[test]
    fn test_grouping_roundtrip_preserves_members() {
        let groups = vec![
            vt("linux", &["compile", "test"]),
            vt("osx", &["compile"]),
            vt("linux", &["lint"]),
        ];
        let pairs = to_pairs(&groups);
        let regrouped = to_variant_tasks(&pairs);

        assert_eq!(regrouped.len(), 2);
        assert_eq!(regrouped[0], vt("linux", &["compile", "test", "lint"]));
        assert!(to_pairs(&regrouped).same_members(&pairs));
    }

    #[test]
    fn test_union_keeps_left_order() {
        let a: PairSet = vec![Pair::new("linux", "compile")].into();
        let b: PairSet = vec![Pair::new("osx", "compile"), Pair::new("linux", "compile")].into();
        let u = a.union(&b);
        assert_eq!(
            u.iter().cloned().collect::<Vec<_>>(),
            vec![Pair::new("linux", "compile"), Pair::new("osx", "compile")]
        );
    }

    #[test]
    fn test_serializes_as_list() {
        let set: PairSet = vec![Pair::new("linux", "compile")].into();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"[{"variant":"linux","task":"compile"}]"#);
        let back: PairSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
