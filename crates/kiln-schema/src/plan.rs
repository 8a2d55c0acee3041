use crate::manifest::ManifestError;
use crate::secrets::SecretProviders;
use crate::step::Step;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// A validated set of steps plus its derived build levels.
///
/// Steps live in a fixed-order array; dependency edges are indices into it.
/// `levels` is computed once in [`Manifest::resolve`] and read-only
/// thereafter.
#[derive(Debug, Clone)]
pub struct Manifest {
    steps: Vec<Step>,
    dependencies: Vec<Vec<usize>>,
    levels: Vec<Vec<usize>>,
    pub work_dir: Option<String>,
    pub secrets: SecretProviders,
    /// Set when any step runs cleanup commands, which need a running
    /// container and a commit.
    pub is_privileged: bool,
}

impl Manifest {
    /// Validate and level a list of steps.
    ///
    /// Checks, in order: unique step names, resolvable dependency
    /// references (by label, then by name), and acyclicity.
    pub fn resolve(steps: Vec<Step>) -> Result<Self, ManifestError> {
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (idx, step) in steps.iter().enumerate() {
            if by_name.insert(step.name.as_str(), idx).is_some() {
                return Err(ManifestError::DuplicateStepName(step.name.clone()));
            }
        }
        let by_label: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.label.as_str(), idx))
            .collect();

        let mut dependencies = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut deps = BTreeSet::new();
            for reference in &step.depends_on {
                let idx = by_label
                    .get(reference.as_str())
                    .or_else(|| by_name.get(reference.as_str()))
                    .ok_or_else(|| ManifestError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: reference.clone(),
                    })?;
                deps.insert(*idx);
            }
            dependencies.push(deps.into_iter().collect::<Vec<_>>());
        }

        let levels = build_levels(&dependencies).map_err(|stalled| {
            ManifestError::CircularDependency(
                stalled.iter().map(|&i| steps[i].name.clone()).collect(),
            )
        })?;
        debug!("resolved {} steps into {} levels", steps.len(), levels.len());

        let is_privileged = steps.iter().any(|s| !s.cleanup.is_empty());
        Ok(Self {
            steps,
            dependencies,
            levels,
            work_dir: None,
            secrets: SecretProviders::new(),
            is_privileged,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, idx: usize) -> &Step {
        &self.steps[idx]
    }

    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Steps that list `idx` as a direct dependency.
    pub fn dependents(&self, idx: usize) -> Vec<usize> {
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&idx))
            .map(|(i, _)| i)
            .collect()
    }

    /// `idx` plus everything that transitively depends on it.
    pub fn dependent_closure(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::from([idx]);
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn find_by_label(&self, label: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.label == label)
    }

    /// Level names, for display and tests.
    pub fn level_names(&self) -> Vec<Vec<String>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| self.steps[i].name.clone()).collect())
            .collect()
    }
}

/// Partition nodes into levels such that every node's dependencies lie in
/// strictly earlier levels (Kahn's algorithm grouped by wavefront).
///
/// `dependencies[i]` lists the nodes `i` depends on. Only in-degree counters
/// are mutated. On a stalled pass the still-unplaced nodes are returned as
/// the error; no partial levels escape.
pub fn build_levels(dependencies: &[Vec<usize>]) -> Result<Vec<Vec<usize>>, Vec<usize>> {
    let count = dependencies.len();
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (node, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut placed = vec![false; count];
    let mut placed_count = 0;
    let mut levels = Vec::new();

    while placed_count < count {
        let level: Vec<usize> = (0..count)
            .filter(|&i| !placed[i] && remaining[i] == 0)
            .collect();

        if level.is_empty() {
            return Err((0..count).filter(|&i| !placed[i]).collect());
        }

        for &node in &level {
            placed[node] = true;
            for &dependent in &dependents[node] {
                remaining[dependent] -= 1;
            }
        }
        placed_count += level.len();
        levels.push(level);
    }

    Ok(levels)
}
