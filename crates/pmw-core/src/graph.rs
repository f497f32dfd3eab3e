//! Dependency graph shared by deliverables and tasks: cycle detection with a
//! reportable path, and Kahn layering into parallel execution groups.

use crate::error::{PmwError, Result};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]` = indices node `i` depends on.
    deps: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node if absent. Insertion order drives every tie-break below.
    pub fn add_node(&mut self, id: &str) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(id.to_string());
        self.index.insert(id.to_string(), i);
        self.deps.push(BTreeSet::new());
        i
    }

    /// `node` depends on `dep`. Both must already exist.
    pub fn add_edge(&mut self, node: &str, dep: &str) -> bool {
        match (self.index.get(node), self.index.get(dep)) {
            (Some(&n), Some(&d)) => self.deps[n].insert(d),
            _ => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn depends_on(&self, node: &str, dep: &str) -> bool {
        match (self.index.get(node), self.index.get(dep)) {
            (Some(&n), Some(&d)) => self.deps[n].contains(&d),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the first cycle found as a closed path, e.g. `["1", "2", "1"]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut stack: Vec<usize> = Vec::new();

        fn visit(
            g: &DependencyGraph,
            n: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[n] = Mark::Grey;
            stack.push(n);
            for &d in &g.deps[n] {
                match marks[d] {
                    Mark::Grey => {
                        let start = stack.iter().position(|&s| s == d).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|&i| g.nodes[i].clone()).collect();
                        path.push(g.nodes[d].clone());
                        return Some(path);
                    }
                    Mark::White => {
                        if let Some(p) = visit(g, d, marks, stack) {
                            return Some(p);
                        }
                    }
                    Mark::Black => {}
                }
            }
            stack.pop();
            marks[n] = Mark::Black;
            None
        }

        for n in 0..self.nodes.len() {
            if marks[n] == Mark::White {
                if let Some(p) = visit(self, n, &mut marks, &mut stack) {
                    return Some(p);
                }
            }
        }
        None
    }

    pub fn ensure_acyclic(&self, kind: &str) -> Result<()> {
        match self.find_cycle() {
            Some(path) => Err(PmwError::Cycle {
                kind: kind.to_string(),
                path,
            }),
            None => Ok(()),
        }
    }

    /// Topological layers (Kahn). Layer 0 has no dependencies; each later layer
    /// depends only on earlier ones. Within a layer nodes keep insertion order.
    pub fn layers(&self, kind: &str) -> Result<Vec<Vec<String>>> {
        self.ensure_acyclic(kind)?;

        let n = self.nodes.len();
        let mut in_degree: Vec<usize> = self.deps.iter().map(BTreeSet::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, deps) in self.deps.iter().enumerate() {
            for &d in deps {
                dependents[d].push(node);
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &i in &current {
                for &dep in &dependents[i] {
                    in_degree[dep] -= 1;
                    if in_degree[dep] == 0 {
                        next.push(dep);
                    }
                }
            }
            next.sort_unstable();
            layers.push(current.iter().map(|&i| self.nodes[i].clone()).collect());
            current = next;
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(n);
        }
        for (n, d) in edges {
            g.add_edge(n, d);
        }
        g
    }

    #[test]
    fn two_node_cycle_reports_path() {
        let g = graph(&["1", "2"], &[("1", "2"), ("2", "1")]);
        assert_eq!(g.find_cycle().unwrap(), vec!["1", "2", "1"]);
        let err = g.layers("deliverables").unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle in deliverables: 1 -> 2 -> 1");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(&["a"], &[("a", "a")]);
        assert_eq!(g.find_cycle().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn diamond_layers() {
        let g = graph(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
        );
        assert_eq!(
            g.layers("tasks").unwrap(),
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
    }

    #[test]
    fn independent_nodes_share_layer_in_insertion_order() {
        let g = graph(&["10", "2", "3"], &[]);
        assert_eq!(g.layers("tasks").unwrap(), vec![vec!["10", "2", "3"]]);
    }

    #[test]
    fn edges_to_unknown_nodes_are_ignored() {
        let mut g = graph(&["a"], &[]);
        assert!(!g.add_edge("a", "missing"));
        assert!(g.find_cycle().is_none());
    }
}
