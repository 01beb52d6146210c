//! Dependency graph validation and topological ordering for one node set.
//!
//! Built once per image. Dependencies that name a node of the same set become
//! graph edges; every other dependency is "external" and must already be in the
//! snapshot when the set is resolved (an input field, or a base node when
//! resolving augment data).

use crate::models::{is_reserved, NodeSet, Phase};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionPlan {
    order: Vec<String>,
    external: BTreeSet<String>,
}

impl ResolutionPlan {
    #[tracing::instrument(level = "debug", skip(nodes))]
    pub fn build(phase: Phase, nodes: &NodeSet) -> Result<Self> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut external = BTreeSet::new();

        for name in nodes.keys() {
            if name.trim().is_empty() {
                return Err(Error::configuration(format!("{phase} data name is empty")));
            }
            if is_reserved(name) {
                return Err(Error::configuration(format!(
                    "data name \"{name}\" is a reserved name"
                )));
            }
            indegree.insert(name.as_str(), 0);
        }

        for (name, spec) in nodes {
            for dep in spec.dependencies() {
                if is_reserved(dep) {
                    return Err(Error::configuration(format!(
                        "data \"{name}\" depends on reserved name \"{dep}\""
                    )));
                }
                if dep == name {
                    return Err(Error::configuration(format!(
                        "{phase} data contains a dependency cycle: {name} -> {name}"
                    )));
                }
                if nodes.contains_key(dep) {
                    if let Some(d) = indegree.get_mut(name.as_str()) {
                        *d += 1;
                    }
                    dependents
                        .entry(dep.as_str())
                        .or_default()
                        .push(name.as_str());
                } else {
                    external.insert(dep.clone());
                }
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter_map(|(name, &d)| (d == 0).then_some(*name))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for child in dependents.get(name).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if order.len() != nodes.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter_map(|(name, &d)| (d > 0).then_some(*name))
                .collect();
            return Err(Error::configuration(format!(
                "{phase} data contains a dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(Self { order, external })
    }

    /// Node names, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn external_dependencies(&self) -> impl Iterator<Item = &str> {
        self.external.iter().map(String::as_str)
    }
}
