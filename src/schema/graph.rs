//! OwningReference graph: cycle detection and dependency ordering for DDL emission.
//!
//! Edges point from the declaring resource to the resource it references. Owned collections
//! and join relationships never appear here; they may form cycles freely.

use crate::error::SchemaError;
use crate::schema::resolved::ResourceSchema;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default)]
pub struct OwnershipGraph {
    /// node -> nodes it depends on
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl OwnershipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_schemas<'a>(schemas: impl IntoIterator<Item = &'a ResourceSchema>) -> Self {
        let mut graph = Self::new();
        for s in schemas {
            graph.add_node(&s.name);
            for dep in s.ordering_dependencies() {
                graph.add_edge(&s.name, dep);
            }
        }
        graph
    }

    pub fn add_node(&mut self, node: &str) {
        self.edges.entry(node.to_string()).or_default();
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(to);
        self.edges.entry(from.to_string()).or_default().insert(to.to_string());
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn dependencies(&self, node: &str) -> impl Iterator<Item = &str> {
        self.edges.get(node).into_iter().flatten().map(String::as_str)
    }

    /// First cycle found by depth-first search, as a closed path `[a, b, c, a]`.
    /// Only nodes on the cycle appear in the path.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for node in self.edges.keys() {
            if done.contains(node.as_str()) {
                continue;
            }
            if let Some(cycle) = self.visit(node, &mut stack, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        stack: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Option<Vec<String>> {
        stack.push(node);
        for next in self.dependencies(node) {
            if let Some(pos) = stack.iter().position(|n| *n == next) {
                let mut path: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
                path.push(next.to_string());
                return Some(path);
            }
            if done.contains(next) {
                continue;
            }
            if let Some(cycle) = self.visit(next, stack, done) {
                return Some(cycle);
            }
        }
        stack.pop();
        done.insert(node);
        None
    }

    /// Kahn's algorithm: every node appears once, after everything it depends on.
    /// Ties break alphabetically so the order is stable across runs.
    pub fn topological_order(&self) -> Result<Vec<String>, SchemaError> {
        let mut remaining: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(n, deps)| (n.as_str(), deps.len()))
            .collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (n, deps) in &self.edges {
            for d in deps {
                dependents.entry(d.as_str()).or_default().push(n.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(n) = ready.pop_first() {
            order.push(n.to_string());
            remaining.remove(n);
            for d in dependents.get(n).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(d) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(d);
                    }
                }
            }
        }

        if order.len() < self.edges.len() {
            return Err(SchemaError::Unordered {
                unresolved: remaining.keys().map(|s| s.to_string()).collect(),
            });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(edges: &[(&str, &str)]) -> OwnershipGraph {
        let mut g = OwnershipGraph::new();
        for (a, b) in edges {
            g.add_edge(a, b);
        }
        g
    }

    #[test]
    fn dag_orders_every_node_once_before_dependents() {
        let g = graph(&[
            ("comments", "posts"),
            ("comments", "users"),
            ("posts", "users"),
            ("post_tags", "posts"),
            ("post_tags", "tags"),
        ]);
        let order = g.topological_order().unwrap();
        assert_eq!(order.len(), 5);
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        for (from, deps) in &g.edges {
            for d in deps {
                assert!(pos(d) < pos(from), "{} must precede {}", d, from);
            }
        }
        assert_eq!(order[0], "tags");
        assert_eq!(order[1], "users");
    }

    #[test]
    fn cycle_path_contains_only_cycle_members() {
        // d hangs off the cycle but is not part of it
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")]);
        let path = g.find_cycle().unwrap();
        assert_eq!(path.first(), path.last());
        let members: BTreeSet<&str> = path.iter().map(String::as_str).collect();
        assert_eq!(members, BTreeSet::from(["a", "b", "c"]));
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn ordering_a_cycle_names_unresolved_nodes() {
        let g = graph(&[("a", "b"), ("b", "a"), ("c", "a"), ("b", "z")]);
        match g.topological_order() {
            Err(SchemaError::Unordered { unresolved }) => {
                assert_eq!(unresolved, vec!["a".to_string(), "b".into(), "c".into()]);
            }
            other => panic!("expected unordered error, got {other:?}"),
        }
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let g = graph(&[("a", "b"), ("a", "c"), ("b", "c")]);
        assert_eq!(g.find_cycle(), None);
    }
}
