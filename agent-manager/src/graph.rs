//! Start order for agents.
//!
//! Agents are grouped into waves with Kahn's algorithm:
//! - Wave 0: agents without dependencies
//! - Wave N: agents whose dependencies all sit in waves 0..N-1
//!
//! Agents in one wave start concurrently; waves are stopped in reverse.

use crate::error::LifecycleError;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Resolves `dependencies` (agent -> agents it depends on) into waves.
///
/// Every name inside a wave is sorted, so plans are deterministic.
///
/// # Errors
/// - `UnknownDependency` if an agent names an unregistered dependency
/// - `DependencyCycle` listing every agent left on or behind a cycle
pub(crate) fn start_waves(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Vec<String>>, LifecycleError> {
    for (agent, deps) in dependencies {
        if let Some(missing) = deps.iter().find(|d| !dependencies.contains_key(*d)) {
            return Err(LifecycleError::UnknownDependency {
                agent: agent.clone(),
                dependency: missing.clone(),
            });
        }
    }

    // dependents[dep] = agents waiting on dep
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

    for (agent, deps) in dependencies {
        in_degree.insert(agent.as_str(), deps.len());
        for dep in deps {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(agent.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut waves: Vec<Vec<String>> = Vec::new();
    while !queue.is_empty() {
        let mut wave: Vec<&str> = queue.drain(..).collect();
        wave.sort_unstable();

        for name in &wave {
            in_degree.remove(name);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        waves.push(wave.into_iter().map(String::from).collect());
    }

    if !in_degree.is_empty() {
        return Err(LifecycleError::DependencyCycle {
            agents: in_degree.keys().map(|name| name.to_string()).collect(),
        });
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_dependencies_start_in_earlier_waves() {
        let waves = start_waves(&graph(&[
            ("update-applier", &["audit", "hardware"]),
            ("update-proposer", &["update-applier"]),
            ("audit", &[]),
            ("hardware", &[]),
        ]))
        .unwrap();

        assert_eq!(
            waves,
            vec![
                vec!["audit".to_string(), "hardware".to_string()],
                vec!["update-applier".to_string()],
                vec!["update-proposer".to_string()],
            ]
        );
    }

    #[test]
    fn test_independent_agents_share_one_wave() {
        let waves = start_waves(&graph(&[("b", &[]), ("a", &[]), ("c", &[])])).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0], vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_is_reported_with_members() {
        let err = start_waves(&graph(&[("a", &["c"]), ("c", &["a"]), ("b", &[])])).unwrap_err();
        match err {
            LifecycleError::DependencyCycle { agents } => {
                assert_eq!(agents, vec!["a".to_string(), "c".to_string()]);
            }
            other => panic!("expected DependencyCycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = start_waves(&graph(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, LifecycleError::DependencyCycle { .. }));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = start_waves(&graph(&[("a", &["ghost"])])).unwrap_err();
        match err {
            LifecycleError::UnknownDependency { agent, dependency } => {
                assert_eq!(agent, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected UnknownDependency, got {other}"),
        }
    }

    #[test]
    fn test_empty_graph() {
        assert!(start_waves(&BTreeMap::new()).unwrap().is_empty());
    }
}
