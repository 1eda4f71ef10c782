//! Pipeline dependency graph: unknown ids, cycles, and exclusion propagation.
//!
//! Uses petgraph's `DiGraph` with an edge from each dependency to its dependent.

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Accepted ids in dependency order, plus every rejection with its cause.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub order: Vec<String>,
    pub rejected: BTreeMap<String, ConfigError>,
}

/// Drop every pipeline whose id is declared more than once.
pub fn reject_duplicates(
    configs: Vec<PipelineConfig>,
    rejected: &mut BTreeMap<String, ConfigError>,
) -> Vec<PipelineConfig> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for config in &configs {
        *counts.entry(config.id.clone()).or_default() += 1;
    }
    configs
        .into_iter()
        .filter(|config| {
            if counts.get(&config.id).copied().unwrap_or(0) > 1 {
                rejected.insert(
                    config.id.clone(),
                    ConfigError::DuplicatePipeline {
                        id: config.id.clone(),
                    },
                );
                false
            } else {
                true
            }
        })
        .collect()
}

/// Resolve dependencies among `configs`.
///
/// `rejected` carries pipelines already excluded for other reasons; their ids are
/// known, so dependents get `ExcludedDependency` rather than `UnknownDependency`.
pub fn resolve(
    configs: &[PipelineConfig],
    mut rejected: BTreeMap<String, ConfigError>,
) -> Resolution {
    let mut sorted: Vec<&PipelineConfig> = configs.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let known: BTreeSet<String> = sorted
        .iter()
        .map(|c| c.id.clone())
        .chain(rejected.keys().cloned())
        .collect();

    for config in &sorted {
        if rejected.contains_key(&config.id) {
            continue;
        }
        if let Some(missing) = config
            .dependencies
            .iter()
            .find(|dep| !known.contains(*dep))
        {
            rejected.insert(
                config.id.clone(),
                ConfigError::UnknownDependency {
                    id: config.id.clone(),
                    dependency: missing.clone(),
                },
            );
        }
    }

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for config in &sorted {
        nodes.insert(config.id.as_str(), graph.add_node(config.id.clone()));
    }
    for config in &sorted {
        for dep in &config.dependencies {
            let endpoints = (nodes.get(dep.as_str()), nodes.get(config.id.as_str()));
            if let (Some(&from), Some(&to)) = endpoints {
                graph.add_edge(from, to, ());
            }
        }
    }

    for component in tarjan_scc(&graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if !cyclic {
            continue;
        }
        let mut members: Vec<String> = component.iter().map(|&n| graph[n].clone()).collect();
        members.sort();
        if let Some(first) = members.first().cloned() {
            members.push(first);
        }
        for &node in &component {
            let id = graph[node].clone();
            rejected.entry(id.clone()).or_insert(ConfigError::DependencyCycle {
                id,
                cycle: members.clone(),
            });
        }
    }

    // Exclusion is transitive.
    loop {
        let mut changed = false;
        for config in &sorted {
            if rejected.contains_key(&config.id) {
                continue;
            }
            if let Some(dep) = config.dependencies.iter().find(|d| rejected.contains_key(*d)) {
                rejected.insert(
                    config.id.clone(),
                    ConfigError::ExcludedDependency {
                        id: config.id.clone(),
                        dependency: dep.clone(),
                    },
                );
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let accepted: Vec<&str> = sorted
        .iter()
        .map(|c| c.id.as_str())
        .filter(|id| !rejected.contains_key(*id))
        .collect();
    let mut dag: DiGraph<&str, ()> = DiGraph::new();
    let mut dag_nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for &id in &accepted {
        dag_nodes.insert(id, dag.add_node(id));
    }
    for config in &sorted {
        let Some(&to) = dag_nodes.get(config.id.as_str()) else {
            continue;
        };
        for dep in &config.dependencies {
            if let Some(&from) = dag_nodes.get(dep.as_str()) {
                dag.add_edge(from, to, ());
            }
        }
    }
    let order = match toposort(&dag, None) {
        Ok(indices) => indices.into_iter().map(|n| dag[n].to_string()).collect(),
        Err(_) => accepted.iter().map(|id| id.to_string()).collect(),
    };

    Resolution { order, rejected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FileFormat, SourceSpec};
    use pretty_assertions::assert_eq;

    fn cfg(id: &str, deps: &[&str]) -> PipelineConfig {
        PipelineConfig::new(
            id,
            SourceSpec::File {
                path: "in.json".into(),
                format: FileFormat::Auto,
                id_field: None,
            },
        )
        .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_order_puts_dependencies_first() {
        let configs = vec![cfg("c", &["b"]), cfg("b", &["a"]), cfg("a", &[])];
        let resolution = resolve(&configs, BTreeMap::new());
        assert!(resolution.rejected.is_empty());
        assert_eq!(resolution.order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_rejects_members_only() {
        let configs = vec![cfg("a", &["b"]), cfg("b", &["a"]), cfg("solo", &[])];
        let resolution = resolve(&configs, BTreeMap::new());
        assert_eq!(resolution.order, vec!["solo"]);
        match &resolution.rejected["a"] {
            ConfigError::DependencyCycle { cycle, .. } => {
                assert_eq!(cycle, &vec!["a".to_string(), "b".into(), "a".into()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            resolution.rejected["b"],
            ConfigError::DependencyCycle { .. }
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let resolution = resolve(&[cfg("a", &["a"])], BTreeMap::new());
        assert!(matches!(
            resolution.rejected["a"],
            ConfigError::DependencyCycle { .. }
        ));
    }

    #[test]
    fn test_unknown_and_excluded_dependencies() {
        let configs = vec![cfg("a", &["ghost"]), cfg("b", &["a"]), cfg("c", &["b"]), cfg("d", &[])];
        let resolution = resolve(&configs, BTreeMap::new());
        assert!(matches!(
            resolution.rejected["a"],
            ConfigError::UnknownDependency { ref dependency, .. } if dependency == "ghost"
        ));
        assert!(matches!(
            resolution.rejected["b"],
            ConfigError::ExcludedDependency { ref dependency, .. } if dependency == "a"
        ));
        assert!(matches!(
            resolution.rejected["c"],
            ConfigError::ExcludedDependency { .. }
        ));
        assert_eq!(resolution.order, vec!["d"]);
    }

    #[test]
    fn test_pre_rejected_dependency_is_excluded_not_unknown() {
        let mut pre = BTreeMap::new();
        pre.insert("a".to_string(), ConfigError::DuplicatePipeline { id: "a".into() });
        let resolution = resolve(&[cfg("b", &["a"])], pre);
        assert!(matches!(
            resolution.rejected["b"],
            ConfigError::ExcludedDependency { .. }
        ));
    }

    #[test]
    fn test_duplicates_rejected_everywhere() {
        let mut rejected = BTreeMap::new();
        let kept = reject_duplicates(vec![cfg("a", &[]), cfg("a", &[]), cfg("b", &[])], &mut rejected);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "b");
        assert!(matches!(
            rejected["a"],
            ConfigError::DuplicatePipeline { .. }
        ));
    }
}
