//! Dependency graph over a feature's work packages.
//!
//! The graph is an arena of indices rather than a pointer graph: work package
//! ids are interned once at build time and every edge after that is a plain
//! `usize`. Cycle detection walks the graph once with a three-color DFS
//! (white / gray / black) so that the first back-edge encountered yields the
//! exact cycle via the live traversal stack, rather than merely reporting
//! that *some* cycle exists.

use crate::errors::GraphError;
use crate::workpackage::WorkPackage;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Status a work package's execution is considered to have when computing
/// the ready set. Only `Pending` and `Completed` matter to readiness; other
/// statuses (in-flight) simply exclude a WP from both "ready" and "blocking".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessStatus {
    Pending,
    Completed,
    Other,
}

#[derive(Debug)]
pub struct DependencyGraph {
    wp_ids: Vec<String>,
    index: HashMap<String, usize>,
    /// `forward_edges[i]` holds the indices of the work packages `i` depends on.
    forward_edges: Vec<Vec<usize>>,
    /// `reverse_edges[i]` holds the indices of the work packages that depend on `i`.
    reverse_edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph from a set of work packages, validating references,
    /// self-edges and cycles. No partial graph is ever returned.
    pub fn build(work_packages: &[WorkPackage]) -> Result<Self, GraphError> {
        let mut wp_ids: Vec<String> = work_packages.iter().map(|wp| wp.wp_id.clone()).collect();
        wp_ids.sort();

        let mut index = HashMap::with_capacity(wp_ids.len());
        for (i, id) in wp_ids.iter().enumerate() {
            index.insert(id.clone(), i);
        }

        let mut forward_edges = vec![Vec::new(); wp_ids.len()];
        let mut reverse_edges = vec![Vec::new(); wp_ids.len()];

        for wp in work_packages {
            let &from = index.get(&wp.wp_id).expect("wp_id interned above");
            for dep in &wp.dependencies {
                if dep == &wp.wp_id {
                    return Err(GraphError::SelfDependency {
                        wp_id: wp.wp_id.clone(),
                    });
                }
                let &to = index
                    .get(dep)
                    .ok_or_else(|| GraphError::UnknownDependency {
                        wp_id: wp.wp_id.clone(),
                        dependency: dep.clone(),
                    })?;
                forward_edges[from].push(to);
                reverse_edges[to].push(from);
            }
        }

        let graph = DependencyGraph {
            wp_ids,
            index,
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    fn validate_no_cycles(&self) -> Result<(), GraphError> {
        let n = self.wp_ids.len();
        let mut color = vec![Color::White; n];
        let mut stack: Vec<usize> = Vec::new();

        for start in 0..n {
            if color[start] == Color::White {
                self.dfs_visit(start, &mut color, &mut stack)?;
            }
        }
        Ok(())
    }

    /// Recursive three-color DFS. On encountering a gray node (a back-edge),
    /// the cycle is the suffix of `stack` from that node's first occurrence
    /// through the current top, in traversal order.
    fn dfs_visit(
        &self,
        node: usize,
        color: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Result<(), GraphError> {
        color[node] = Color::Gray;
        stack.push(node);

        for &dep in &self.forward_edges[node] {
            match color[dep] {
                Color::White => self.dfs_visit(dep, color, stack)?,
                Color::Gray => {
                    let pos = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let cycle = stack[pos..]
                        .iter()
                        .map(|&i| self.wp_ids[i].clone())
                        .collect();
                    return Err(GraphError::Cycle { cycle });
                }
                Color::Black => {}
            }
        }

        stack.pop();
        color[node] = Color::Black;
        Ok(())
    }

    /// All known work package ids, in stable lexicographic order.
    pub fn wp_ids(&self) -> &[String] {
        &self.wp_ids
    }

    pub fn dependencies_of(&self, wp_id: &str) -> Vec<&str> {
        match self.index.get(wp_id) {
            Some(&i) => self.forward_edges[i]
                .iter()
                .map(|&d| self.wp_ids[d].as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Work packages that directly depend on `wp_id`.
    pub fn dependents(&self, wp_id: &str) -> Vec<&str> {
        match self.index.get(wp_id) {
            Some(&i) => self.reverse_edges[i]
                .iter()
                .map(|&d| self.wp_ids[d].as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The ready set: work packages whose status is `Pending` and whose every
    /// dependency is `Completed`, in stable lexicographic order.
    pub fn ready(&self, statuses: &HashMap<String, ReadinessStatus>) -> Vec<String> {
        let mut ready = Vec::new();
        for (i, wp_id) in self.wp_ids.iter().enumerate() {
            let status = statuses.get(wp_id).copied().unwrap_or(ReadinessStatus::Pending);
            if status != ReadinessStatus::Pending {
                continue;
            }
            let all_deps_complete = self.forward_edges[i].iter().all(|&d| {
                statuses
                    .get(&self.wp_ids[d])
                    .copied()
                    .unwrap_or(ReadinessStatus::Pending)
                    == ReadinessStatus::Completed
            });
            if all_deps_complete {
                ready.push(wp_id.clone());
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn wp(id: &str, deps: &[&str]) -> WorkPackage {
        WorkPackage {
            wp_id: id.to_string(),
            title: id.to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            prompt_path: PathBuf::from(format!("{id}.md")),
        }
    }

    #[test]
    fn ready_at_start_is_exactly_zero_dependency_set() {
        let wps = vec![wp("WP01", &[]), wp("WP02", &["WP01"]), wp("WP03", &[])];
        let graph = DependencyGraph::build(&wps).unwrap();
        let statuses = HashMap::new();
        let mut ready = graph.ready(&statuses);
        ready.sort();
        assert_eq!(ready, vec!["WP01".to_string(), "WP03".to_string()]);
    }

    #[test]
    fn ready_unblocks_once_dependency_completes() {
        let wps = vec![wp("WP01", &[]), wp("WP02", &["WP01"])];
        let graph = DependencyGraph::build(&wps).unwrap();
        let mut statuses = HashMap::new();
        statuses.insert("WP01".to_string(), ReadinessStatus::Completed);
        let ready = graph.ready(&statuses);
        assert_eq!(ready, vec!["WP02".to_string()]);
    }

    #[test]
    fn detects_simple_cycle() {
        let wps = vec![wp("WP01", &["WP02"]), wp("WP02", &["WP01"])];
        let err = DependencyGraph::build(&wps).unwrap_err();
        match err {
            GraphError::Cycle { cycle } => {
                let mut sorted = cycle.clone();
                sorted.sort();
                assert_eq!(sorted, vec!["WP01".to_string(), "WP02".to_string()]);
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn detects_longer_cycle_reports_only_cycle_members() {
        let wps = vec![
            wp("WP01", &[]),
            wp("WP02", &["WP01", "WP04"]),
            wp("WP03", &["WP02"]),
            wp("WP04", &["WP03"]),
        ];
        let err = DependencyGraph::build(&wps).unwrap_err();
        match err {
            GraphError::Cycle { cycle } => {
                assert!(!cycle.contains(&"WP01".to_string()));
                assert!(cycle.contains(&"WP02".to_string()));
                assert!(cycle.contains(&"WP03".to_string()));
                assert!(cycle.contains(&"WP04".to_string()));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_dependency() {
        let wps = vec![wp("WP01", &["missing"])];
        let err = DependencyGraph::build(&wps).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_self_dependency() {
        let wps = vec![wp("WP01", &["WP01"])];
        let err = DependencyGraph::build(&wps).unwrap_err();
        assert!(matches!(err, GraphError::SelfDependency { .. }));
    }

    #[test]
    fn dependents_is_inverse_of_dependencies() {
        let wps = vec![wp("WP01", &[]), wp("WP02", &["WP01"]), wp("WP03", &["WP01"])];
        let graph = DependencyGraph::build(&wps).unwrap();
        let mut dependents = graph.dependents("WP01").to_vec();
        dependents.sort();
        assert_eq!(dependents, vec!["WP02", "WP03"]);
    }
}
