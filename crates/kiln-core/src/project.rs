//! Project definition types.
//!
//! These types represent the user-authored project YAML: the tasks that
//! exist, how they depend on each other, and which build variants run them.

use crate::pair::Pair;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Wildcard accepted in dependency and requirement names and variants.
pub const ALL: &str = "*";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub tasks: Vec<ProjectTask>,
    #[serde(default, rename = "buildvariants")]
    pub build_variants: Vec<BuildVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectTask {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<TaskDependency>,
    #[serde(default)]
    pub requires: Vec<TaskRequirement>,
}

/// An edge to a task that must finish before the dependent may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskDependency {
    pub name: String,
    /// Empty means "same variant as the dependent".
    #[serde(default)]
    pub variant: Option<String>,
}

/// A task that must be scheduled alongside the requiring one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskRequirement {
    pub name: String,
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildVariant {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub run_on: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<BuildVariantTask>,
}

/// A task as scheduled on a specific variant. Variant-level `depends_on`
/// and `requires` replace the task-level lists when present.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildVariantTask {
    pub name: String,
    #[serde(default)]
    pub depends_on: Option<Vec<TaskDependency>>,
    #[serde(default)]
    pub requires: Option<Vec<TaskRequirement>>,
    #[serde(default)]
    pub distros: Vec<String>,
}

impl BuildVariant {
    pub fn get(&self, task: &str) -> Option<&BuildVariantTask> {
        self.tasks.iter().find(|t| t.name == task)
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Task names in declaration order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }
}

impl Project {
    /// Parse and validate a project from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let project: Project = serde_yaml::from_str(yaml)?;
        project.validate()?;
        Ok(project)
    }

    /// JSON schema of the project file, for editor tooling.
    pub fn json_schema() -> Result<serde_json::Value> {
        Ok(serde_json::to_value(schemars::schema_for!(Project))?)
    }

    /// Check that every name the graph mentions is declared.
    pub fn validate(&self) -> Result<()> {
        let mut task_names = HashSet::new();
        for task in &self.tasks {
            if !task_names.insert(task.name.as_str()) {
                return Err(Error::InvalidProject(format!(
                    "task '{}' defined more than once",
                    task.name
                )));
            }
        }

        let mut variant_names = HashSet::new();
        for bv in &self.build_variants {
            if !variant_names.insert(bv.name.as_str()) {
                return Err(Error::InvalidProject(format!(
                    "build variant '{}' defined more than once",
                    bv.name
                )));
            }
            for unit in &bv.tasks {
                if !task_names.contains(unit.name.as_str()) {
                    return Err(Error::InvalidProject(format!(
                        "build variant '{}' references undefined task '{}'",
                        bv.name, unit.name
                    )));
                }
            }
        }

        let check = |owner: &str, name: &str, variant: Option<&str>| -> Result<()> {
            if name != ALL && !task_names.contains(name) {
                return Err(Error::InvalidProject(format!(
                    "task '{owner}' refers to undefined task '{name}'"
                )));
            }
            match variant {
                Some(v) if !v.is_empty() && v != ALL && !variant_names.contains(v) => {
                    Err(Error::InvalidProject(format!(
                        "task '{owner}' refers to undefined build variant '{v}'"
                    )))
                }
                _ => Ok(()),
            }
        };

        for task in &self.tasks {
            for dep in &task.depends_on {
                check(&task.name, &dep.name, dep.variant.as_deref())?;
            }
            for req in &task.requires {
                check(&task.name, &req.name, req.variant.as_deref())?;
            }
        }
        for bv in &self.build_variants {
            for unit in &bv.tasks {
                for dep in unit.depends_on.iter().flatten() {
                    check(&unit.name, &dep.name, dep.variant.as_deref())?;
                }
                for req in unit.requires.iter().flatten() {
                    check(&unit.name, &req.name, req.variant.as_deref())?;
                }
            }
        }
        Ok(())
    }

    pub fn find_task(&self, name: &str) -> Option<&ProjectTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn find_variant(&self, name: &str) -> Option<&BuildVariant> {
        self.build_variants.iter().find(|bv| bv.name == name)
    }

    /// True if `pair.variant` is declared and lists `pair.task`.
    pub fn has_pair(&self, pair: &Pair) -> bool {
        self.find_variant(&pair.variant)
            .is_some_and(|bv| bv.get(&pair.task).is_some())
    }

    fn unit(&self, pair: &Pair) -> Result<(&BuildVariantTask, &ProjectTask)> {
        let bv = self
            .find_variant(&pair.variant)
            .ok_or_else(|| Error::UnknownVariant(pair.variant.clone()))?;
        let unknown = || Error::UnknownTask {
            variant: pair.variant.clone(),
            task: pair.task.clone(),
        };
        let unit = bv.get(&pair.task).ok_or_else(unknown)?;
        let task = self.find_task(&pair.task).ok_or_else(unknown)?;
        Ok((unit, task))
    }

    /// Dependencies of `pair` as concrete pairs, wildcards expanded.
    pub fn dependencies_of(&self, pair: &Pair) -> Result<Vec<Pair>> {
        let (unit, task) = self.unit(pair)?;
        let deps = unit.depends_on.as_ref().unwrap_or(&task.depends_on);
        let mut out = Vec::new();
        for dep in deps {
            out.extend(self.expand(pair, &dep.name, dep.variant.as_deref())?);
        }
        Ok(out)
    }

    /// Requirements of `pair` as concrete pairs, wildcards expanded.
    pub fn requirements_of(&self, pair: &Pair) -> Result<Vec<Pair>> {
        let (unit, task) = self.unit(pair)?;
        let reqs = unit.requires.as_ref().unwrap_or(&task.requires);
        let mut out = Vec::new();
        for req in reqs {
            out.extend(self.expand(pair, &req.name, req.variant.as_deref())?);
        }
        Ok(out)
    }

    fn expand(&self, from: &Pair, name: &str, variant: Option<&str>) -> Result<Vec<Pair>> {
        let variants: Vec<&BuildVariant> = match variant {
            None | Some("") => vec![
                self.find_variant(&from.variant)
                    .ok_or_else(|| Error::UnknownVariant(from.variant.clone()))?,
            ],
            Some(ALL) => self
                .build_variants
                .iter()
                .filter(|bv| name == ALL || bv.get(name).is_some())
                .collect(),
            Some(v) => vec![
                self.find_variant(v)
                    .ok_or_else(|| Error::UnknownVariant(v.to_string()))?,
            ],
        };
        let wildcard_variant = variant == Some(ALL);

        let mut out = Vec::new();
        for bv in variants {
            if name == ALL {
                out.extend(bv.task_names().map(|t| Pair::new(&bv.name, t)));
            } else if bv.get(name).is_some() {
                out.push(Pair::new(&bv.name, name));
            } else if !wildcard_variant {
                return Err(Error::UnknownTask {
                    variant: bv.name.clone(),
                    task: name.to_string(),
                });
            }
        }
        out.retain(|p| p != from);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const YAML: &str = r#"
identifier: kiln
tasks:
  - name: compile
  - name: test
    depends_on:
      - name: compile
  - name: package
    depends_on:
      - name: "*"
  - name: publish
    depends_on:
      - name: package
        variant: linux
    requires:
      - name: test
buildvariants:
  - name: linux
    display_name: Linux
    run_on: [ubuntu2204]
    tasks:
      - name: compile
      - name: test
      - name: package
  - name: osx
    tasks:
      - name: compile
      - name: test
        depends_on: []
      - name: publish
"#;

    fn project() -> Project {
        Project::from_yaml(YAML).unwrap()
    }

    #[test]
    fn test_same_variant_dependency() {
        let deps = project()
            .dependencies_of(&Pair::new("linux", "test"))
            .unwrap();
        assert_eq!(deps, vec![Pair::new("linux", "compile")]);
    }

    #[test]
    fn test_variant_override_replaces_task_dependencies() {
        let deps = project().dependencies_of(&Pair::new("osx", "test")).unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn test_wildcard_name_excludes_self() {
        let deps = project()
            .dependencies_of(&Pair::new("linux", "package"))
            .unwrap();
        assert_eq!(
            deps,
            vec![Pair::new("linux", "compile"), Pair::new("linux", "test")]
        );
    }

    #[test]
    fn test_cross_variant_dependency_and_requirement() {
        let p = project();
        let publish = Pair::new("osx", "publish");
        assert_eq!(
            p.dependencies_of(&publish).unwrap(),
            vec![Pair::new("linux", "package")]
        );
        assert_eq!(
            p.requirements_of(&publish).unwrap(),
            vec![Pair::new("osx", "test")]
        );
    }

    #[test]
    fn test_unknown_pair_is_rejected() {
        let err = project()
            .dependencies_of(&Pair::new("linux", "publish"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTask { .. }));
    }

    #[test]
    fn test_validation_rejects_undefined_dependency() {
        let yaml = r#"
tasks:
  - name: test
    depends_on:
      - name: compile
buildvariants: []
"#;
        let err = Project::from_yaml(yaml).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_malformed_yaml_is_configuration_error() {
        let err = Project::from_yaml("tasks: [").unwrap_err();
        assert!(matches!(err, Error::InvalidProject(_)));
    }
}
