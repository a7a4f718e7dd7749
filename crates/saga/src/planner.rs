//! Execution planning: groups step indices into levels that may run concurrently.

use std::collections::HashMap;

use crate::aggregate::SagaStep;
use crate::error::ValidationError;
use crate::types::ExecutionMode;

/// Step indices that may execute concurrently.
pub type Level = Vec<usize>;

/// Computes the ordered levels a saga walks through.
///
/// Every step index appears in exactly one level and, in mixed mode, every
/// dependency of a step sits in a strictly earlier level. Output is
/// deterministic: indices inside a level are ascending.
pub struct ExecutionPlanner;

impl ExecutionPlanner {
    /// Plans the given steps under `mode`.
    pub fn plan(steps: &[SagaStep], mode: ExecutionMode) -> Result<Vec<Level>, ValidationError> {
        match mode {
            ExecutionMode::Sequential => Ok((0..steps.len()).map(|index| vec![index]).collect()),
            ExecutionMode::Parallel if steps.is_empty() => Ok(Vec::new()),
            ExecutionMode::Parallel => Ok(vec![(0..steps.len()).collect()]),
            ExecutionMode::Mixed => {
                let graph: Vec<(&str, &[String])> = steps
                    .iter()
                    .map(|step| {
                        (
                            step.name.as_str(),
                            step.configuration.dependencies.as_slice(),
                        )
                    })
                    .collect();
                Self::dependency_levels(&graph)
            }
        }
    }

    /// Levels a dependency graph given as `(name, dependency names)` pairs.
    ///
    /// Each pass schedules every unscheduled node whose dependencies are all
    /// scheduled in earlier passes. A pass that schedules nothing while nodes
    /// remain means a cycle.
    pub fn dependency_levels(graph: &[(&str, &[String])]) -> Result<Vec<Level>, ValidationError> {
        let index_of: HashMap<&str, usize> = graph
            .iter()
            .enumerate()
            .map(|(index, (name, _))| (*name, index))
            .collect();

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(graph.len());
        for (name, deps) in graph {
            let mut resolved = Vec::with_capacity(deps.len());
            for dep in deps.iter() {
                if dep == name {
                    return Err(ValidationError::SelfDependency(name.to_string()));
                }
                let index = index_of.get(dep.as_str()).ok_or_else(|| {
                    ValidationError::UnresolvedDependency {
                        step: name.to_string(),
                        dependency: dep.clone(),
                    }
                })?;
                resolved.push(*index);
            }
            dependencies.push(resolved);
        }

        let mut scheduled = vec![false; graph.len()];
        let mut remaining = graph.len();
        let mut levels = Vec::new();

        while remaining > 0 {
            let level: Level = (0..graph.len())
                .filter(|&index| !scheduled[index])
                .filter(|&index| dependencies[index].iter().all(|&dep| scheduled[dep]))
                .collect();

            if level.is_empty() {
                let stuck = (0..graph.len())
                    .filter(|&index| !scheduled[index])
                    .map(|index| graph[index].0.to_string())
                    .collect();
                return Err(ValidationError::DependencyCycle(stuck));
            }

            for &index in &level {
                scheduled[index] = true;
            }
            remaining -= level.len();
            levels.push(level);
        }

        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use common::SagaId;

    use crate::types::{CompensationStrategy, StepConfiguration};

    fn step(index: usize, name: &str, deps: &[&str]) -> SagaStep {
        SagaStep::new(
            SagaId::new(),
            name,
            index,
            StepConfiguration {
                service_name: "svc".into(),
                endpoint: format!("/{name}"),
                method: "POST".into(),
                timeout: Duration::from_secs(1),
                retry_policy: None,
                compensation_strategy: CompensationStrategy::None,
                compensation_endpoint: None,
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                conditions: BTreeMap::new(),
                metadata: BTreeMap::new(),
            },
        )
    }

    fn steps(graph: &[(&str, &[&str])]) -> Vec<SagaStep> {
        graph
            .iter()
            .enumerate()
            .map(|(index, (name, deps))| step(index, name, deps))
            .collect()
    }

    fn assert_valid_partition(steps: &[SagaStep], levels: &[Level]) {
        let mut seen: Vec<usize> = levels.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..steps.len()).collect::<Vec<_>>());

        let level_of: HashMap<usize, usize> = levels
            .iter()
            .enumerate()
            .flat_map(|(level, indices)| indices.iter().map(move |&i| (i, level)))
            .collect();
        for (index, step) in steps.iter().enumerate() {
            for dep in &step.configuration.dependencies {
                let dep_index = steps.iter().position(|s| &s.name == dep).unwrap();
                assert!(level_of[&dep_index] < level_of[&index]);
            }
        }
    }

    #[test]
    fn test_mixed_fan_out() {
        let steps = steps(&[("A", &[]), ("B", &["A"]), ("C", &["A"])]);
        let levels = ExecutionPlanner::plan(&steps, ExecutionMode::Mixed).unwrap();
        assert_eq!(levels, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn test_mixed_diamond() {
        let steps = steps(&[
            ("D", &["B", "C"]),
            ("B", &["A"]),
            ("C", &["A"]),
            ("A", &[]),
            ("E", &[]),
        ]);
        let levels = ExecutionPlanner::plan(&steps, ExecutionMode::Mixed).unwrap();
        assert_eq!(levels, vec![vec![3, 4], vec![1, 2], vec![0]]);
        assert_valid_partition(&steps, &levels);
    }

    #[test]
    fn test_mixed_chain_is_fully_ordered() {
        let steps = steps(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let levels = ExecutionPlanner::plan(&steps, ExecutionMode::Mixed).unwrap();
        assert_eq!(levels, vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn test_two_step_cycle_is_an_error() {
        let steps = steps(&[("A", &["B"]), ("B", &["A"])]);
        let err = ExecutionPlanner::plan(&steps, ExecutionMode::Mixed).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DependencyCycle(vec!["A".into(), "B".into()])
        );
    }

    #[test]
    fn test_long_cycle_behind_valid_prefix_is_an_error() {
        let steps = steps(&[
            ("root", &[]),
            ("x", &["root", "z"]),
            ("y", &["x"]),
            ("z", &["y"]),
        ]);
        let err = ExecutionPlanner::plan(&steps, ExecutionMode::Mixed).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DependencyCycle(vec!["x".into(), "y".into(), "z".into()])
        );
    }

    #[test]
    fn test_self_dependency_is_an_error() {
        let steps = steps(&[("A", &["A"])]);
        assert_eq!(
            ExecutionPlanner::plan(&steps, ExecutionMode::Mixed),
            Err(ValidationError::SelfDependency("A".into()))
        );
    }

    #[test]
    fn test_unresolved_dependency_is_an_error() {
        let steps = steps(&[("A", &[]), ("B", &["missing"])]);
        assert_eq!(
            ExecutionPlanner::plan(&steps, ExecutionMode::Mixed),
            Err(ValidationError::UnresolvedDependency {
                step: "B".into(),
                dependency: "missing".into()
            })
        );
    }

    #[test]
    fn test_sequential_ignores_dependencies() {
        let steps = steps(&[("A", &["C"]), ("B", &[]), ("C", &["B"])]);
        let levels = ExecutionPlanner::plan(&steps, ExecutionMode::Sequential).unwrap();
        assert_eq!(levels, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_parallel_yields_single_level() {
        let steps = steps(&[("A", &[]), ("B", &[]), ("C", &[]), ("D", &[])]);
        let levels = ExecutionPlanner::plan(&steps, ExecutionMode::Parallel).unwrap();
        assert_eq!(levels, vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let steps = steps(&[("A", &[]), ("B", &["A"]), ("C", &[]), ("D", &["B", "C"])]);
        let first = ExecutionPlanner::plan(&steps, ExecutionMode::Mixed).unwrap();
        for _ in 0..10 {
            assert_eq!(ExecutionPlanner::plan(&steps, ExecutionMode::Mixed).unwrap(), first);
        }
        assert_valid_partition(&steps, &first);
    }

    #[test]
    fn test_empty_step_set() {
        assert!(ExecutionPlanner::plan(&[], ExecutionMode::Mixed).unwrap().is_empty());
        assert!(ExecutionPlanner::plan(&[], ExecutionMode::Parallel).unwrap().is_empty());
    }
}
