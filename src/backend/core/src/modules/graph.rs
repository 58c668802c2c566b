//! Dependency graph over modules.
//!
//! Edges point from a module to each module it depends on. Node indices
//! follow registration order, which is also the tie-breaker for the
//! topological sort so the resulting order is deterministic.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{BTreeSet, HashMap, HashSet};

use super::registry::RegistryError;

/// Directed "depends on" graph of the enabled modules.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from `(name, dependencies)` pairs given in registration order.
    ///
    /// Fails with `MissingDependency` for the first dependency that names a
    /// module not present in the input.
    pub fn build<'a, I>(modules: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeSet<String>)>,
    {
        Self::build_inner(modules, true)
    }

    /// Build the graph, dropping edges to modules that are not present.
    pub fn build_lenient<'a, I>(modules: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeSet<String>)>,
    {
        match Self::build_inner(modules, false) {
            Ok(graph) => graph,
            Err(_) => Self::default(),
        }
    }

    fn build_inner<'a, I>(modules: I, strict: bool) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeSet<String>)>,
    {
        let modules: Vec<_> = modules.into_iter().collect();
        let mut graph = DiGraph::with_capacity(modules.len(), modules.len());
        let mut index = HashMap::with_capacity(modules.len());

        for (name, _) in &modules {
            let node = graph.add_node((*name).to_string());
            index.insert((*name).to_string(), node);
        }

        for (name, dependencies) in &modules {
            let from = index[*name];
            for dependency in dependencies.iter() {
                match index.get(dependency) {
                    Some(to) => {
                        graph.add_edge(from, *to, ());
                    }
                    None if strict => {
                        return Err(RegistryError::MissingDependency {
                            module: (*name).to_string(),
                            missing: dependency.clone(),
                        });
                    }
                    None => {}
                }
            }
        }

        Ok(Self { graph, index })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct dependencies of a node, in registration order.
    fn dependencies(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<_> = self.graph.neighbors(node).collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Depth-first topological sort; every dependency precedes its dependents.
    ///
    /// Uses an explicit stack. A node reached again while still on the
    /// current path closes a cycle, which is reported as the exact path
    /// with the first node repeated at the end (`a -> b -> c -> a`).
    pub fn topological_order(&self) -> Result<Vec<String>, RegistryError> {
        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut visiting: HashSet<NodeIndex> = HashSet::new();

        for root in self.graph.node_indices() {
            if visited.contains(&root) {
                continue;
            }

            // Each frame is (node, its dependencies, next dependency to look at).
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
                vec![(root, self.dependencies(root), 0)];
            visiting.insert(root);

            while let Some(frame) = stack.last_mut() {
                let (node, deps, next) = (frame.0, &frame.1, frame.2);

                if next == deps.len() {
                    stack.pop();
                    visiting.remove(&node);
                    visited.insert(node);
                    order.push(self.graph[node].clone());
                    continue;
                }

                let dep = deps[next];
                frame.2 += 1;

                if visiting.contains(&dep) {
                    let start = stack.iter().position(|(n, _, _)| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|(n, _, _)| self.graph[*n].clone())
                        .collect();
                    cycle.push(self.graph[dep].clone());
                    return Err(RegistryError::CircularDependency { cycle });
                }

                if !visited.contains(&dep) {
                    visiting.insert(dep);
                    stack.push((dep, self.dependencies(dep), 0));
                }
            }
        }

        Ok(order)
    }

    /// Every module that transitively depends on `name`, in registration order.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };

        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = Vec::new();
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                found.push(node);
            }
        }

        found.sort_unstable();
        found.into_iter().map(|n| self.graph[n].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_order_puts_dependencies_first() {
        let user = deps(&[]);
        let language = deps(&[]);
        let security = deps(&["user"]);
        let graph = DependencyGraph::build([
            ("security", &security),
            ("user", &user),
            ("language", &language),
        ])
        .unwrap();

        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec!["user", "security", "language"]);
    }

    #[test]
    fn test_missing_dependency_names_both_sides() {
        let billing = deps(&["ledger"]);
        let err = DependencyGraph::build([("billing", &billing)]).unwrap_err();
        match err {
            RegistryError::MissingDependency { module, missing } => {
                assert_eq!(module, "billing");
                assert_eq!(missing, "ledger");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_lenient_build_drops_unknown_edges() {
        let billing = deps(&["ledger", "user"]);
        let user = deps(&[]);
        let graph = DependencyGraph::build_lenient([("billing", &billing), ("user", &user)]);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.dependents_of("user"), vec!["billing"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let a = deps(&["b"]);
        let b = deps(&["a"]);
        let graph = DependencyGraph::build([("a", &a), ("b", &b)]).unwrap();
        match graph.topological_order().unwrap_err() {
            RegistryError::CircularDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_indirect_cycle_path_excludes_entry_chain() {
        // root -> a -> b -> c -> a
        let root = deps(&["a"]);
        let a = deps(&["b"]);
        let b = deps(&["c"]);
        let c = deps(&["a"]);
        let graph =
            DependencyGraph::build([("root", &root), ("a", &a), ("b", &b), ("c", &c)]).unwrap();
        match graph.topological_order().unwrap_err() {
            RegistryError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let base = deps(&[]);
        let left = deps(&["base"]);
        let right = deps(&["base"]);
        let top = deps(&["left", "right"]);
        let graph = DependencyGraph::build([
            ("top", &top),
            ("left", &left),
            ("right", &right),
            ("base", &base),
        ])
        .unwrap();

        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec!["base", "left", "right", "top"]);
    }

    #[test]
    fn test_dependents_are_transitive() {
        let base = deps(&[]);
        let mid = deps(&["base"]);
        let leaf = deps(&["mid"]);
        let other = deps(&[]);
        let graph = DependencyGraph::build([
            ("base", &base),
            ("mid", &mid),
            ("leaf", &leaf),
            ("other", &other),
        ])
        .unwrap();

        assert_eq!(graph.dependents_of("base"), vec!["mid", "leaf"]);
        assert!(graph.dependents_of("leaf").is_empty());
        assert!(graph.dependents_of("unknown").is_empty());
    }
}
