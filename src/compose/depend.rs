//! Dependency planning: layer the pod graph for start order, and compute the
//! downstream closure that a restart must take with it.

use crate::config::PodConfig;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Topological layering. Layer 0 holds the roots (no dependencies); every
/// pod lands in the layer one past its deepest dependency, so all pods of a
/// layer may start concurrently once the previous layers are ready.
pub fn build_layers(pods: &[PodConfig]) -> Result<Vec<Vec<String>>> {
    let by_name: HashMap<&str, &PodConfig> =
        pods.iter().map(|p| (p.name.as_str(), p)).collect();

    let mut depth = HashMap::new();
    let mut in_progress = HashSet::new();
    for pod in pods {
        resolve_depth(pod.name.as_str(), &by_name, &mut depth, &mut in_progress)?;
    }

    let max_depth = depth.values().copied().max().unwrap_or(0);
    let mut layers = vec![Vec::new(); if pods.is_empty() { 0 } else { max_depth + 1 }];
    for pod in pods {
        layers[depth[pod.name.as_str()]].push(pod.name.clone());
    }
    Ok(layers)
}

fn resolve_depth(
    name: &str,
    by_name: &HashMap<&str, &PodConfig>,
    depth: &mut HashMap<String, usize>,
    in_progress: &mut HashSet<String>,
) -> Result<usize> {
    if let Some(d) = depth.get(name) {
        return Ok(*d);
    }
    if !in_progress.insert(name.to_string()) {
        return Err(Error::CycleDetected(name.to_string()));
    }
    let pod = by_name
        .get(name)
        .ok_or_else(|| Error::UnknownPod(name.to_string()))?;
    let mut d = 0;
    for depend in &pod.depends {
        d = d.max(resolve_depth(depend, by_name, depth, in_progress)? + 1);
    }
    in_progress.remove(name);
    depth.insert(name.to_string(), d);
    Ok(d)
}

/// The impact closure of a restart: the given pods plus everything that
/// transitively depends on any of them.
pub fn impact_closure(
    pods: &HashMap<String, PodConfig>,
    names: &[String],
) -> HashSet<String> {
    let mut closure: HashSet<String> = names.iter().cloned().collect();
    loop {
        let before = closure.len();
        for pod in pods.values() {
            if pod.depends.iter().any(|d| closure.contains(d)) {
                closure.insert(pod.name.clone());
            }
        }
        if closure.len() == before {
            return closure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, depends: &[&str]) -> PodConfig {
        PodConfig {
            name: name.to_string(),
            depends: depends.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn pod_map(pods: &[PodConfig]) -> HashMap<String, PodConfig> {
        pods.iter().map(|p| (p.name.clone(), p.clone())).collect()
    }

    #[test]
    fn layers_put_roots_first_and_deepest_dependents_last() {
        let pods = vec![
            pod("A", &["B", "C"]),
            pod("B", &["C"]),
            pod("C", &["D", "F", "G"]),
            pod("D", &[]),
            pod("E", &[]),
            pod("F", &["G"]),
            pod("G", &[]),
        ];
        let layers = build_layers(&pods).unwrap();
        assert_eq!(layers.len(), 5);
        let mut roots = layers[0].clone();
        roots.sort();
        assert_eq!(roots, vec!["D", "E", "G"]);
        assert_eq!(layers[1], vec!["F"]);
        assert_eq!(layers[2], vec!["C"]);
        assert_eq!(layers[3], vec!["B"]);
        assert_eq!(layers[4], vec!["A"]);
    }

    #[test]
    fn single_layer_when_nothing_depends() {
        let pods = vec![pod("a", &[]), pod("b", &[])];
        let layers = build_layers(&pods).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].len(), 2);
    }

    #[test]
    fn detects_a_two_node_cycle() {
        let pods = vec![pod("a", &["b"]), pod("b", &["a"])];
        let err = build_layers(&pods).unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));
    }

    #[test]
    fn detects_a_longer_cycle_behind_a_chain() {
        let pods = vec![
            pod("entry", &["a"]),
            pod("a", &["b"]),
            pod("b", &["c"]),
            pod("c", &["a"]),
        ];
        assert!(matches!(
            build_layers(&pods).unwrap_err(),
            Error::CycleDetected(_)
        ));
    }

    #[test]
    fn closure_follows_reverse_dependencies_transitively() {
        let pods = vec![
            pod("A", &["B"]),
            pod("B", &["D"]),
            pod("C", &["D"]),
            pod("D", &[]),
            pod("E", &[]),
        ];
        let map = pod_map(&pods);
        let closure = impact_closure(&map, &["D".to_string()]);
        assert_eq!(closure.len(), 4);
        assert!(closure.contains("A") && closure.contains("B") && closure.contains("C"));
        assert!(!closure.contains("E"));

        let closure = impact_closure(&map, &["E".to_string()]);
        assert_eq!(closure.len(), 1);
    }
}
