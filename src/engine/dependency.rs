// ABOUTME: Dependency graph management, cycle detection and static wave planning
// ABOUTME: Validates task references and decomposes an acyclic workflow into parallel execution waves

use petgraph::graph::NodeIndex;
use petgraph::{Direction, Graph};
use std::collections::{HashMap, HashSet};

use super::error::{ExecutionError, Result};

pub struct DependencyGraph {
    graph: Graph<String, ()>,
    task_indices: HashMap<String, NodeIndex>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<String>>,
    pub total_tasks: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Unvisited,
    OnPath,
    Done,
}

impl DependencyGraph {
    /// Build a graph from `(task, dependencies)` pairs, in declaration order.
    ///
    /// Fails with `UnknownDependency` if any dependency names a task that is
    /// not part of the input.
    pub fn build<'a, I, D>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, D)> + Clone,
        D: IntoIterator<Item = &'a String>,
    {
        let mut graph = Graph::new();
        let mut task_indices = HashMap::new();

        for (task_id, _) in tasks.clone() {
            let node_index = graph.add_node(task_id.to_string());
            task_indices.insert(task_id.to_string(), node_index);
        }

        // Edges point from dependency to dependent
        for (task_id, dependencies) in tasks {
            let task_node = task_indices[task_id];

            for dependency in dependencies {
                match task_indices.get(dependency) {
                    Some(&dep_node) => {
                        graph.add_edge(dep_node, task_node, ());
                    }
                    None => {
                        return Err(ExecutionError::UnknownDependency {
                            task: task_id.to_string(),
                            dependency: dependency.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            graph,
            task_indices,
        })
    }

    /// Depth-first cycle detection with an explicit stack and an
    /// "on current path" marker, so graph depth never grows the call stack.
    pub fn detect_cycles(&self) -> Result<()> {
        let node_count = self.graph.node_count();
        let adjacency: Vec<Vec<NodeIndex>> = self
            .graph
            .node_indices()
            .map(|node| {
                let mut deps: Vec<NodeIndex> = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .collect();
                deps.sort();
                deps
            })
            .collect();

        let mut visit = vec![Visit::Unvisited; node_count];
        let mut path: Vec<NodeIndex> = Vec::new();

        for start in self.graph.node_indices() {
            if visit[start.index()] != Visit::Unvisited {
                continue;
            }

            let mut stack: Vec<(NodeIndex, usize)> = vec![(start, 0)];
            visit[start.index()] = Visit::OnPath;
            path.push(start);

            while let Some((node, next)) = stack.last_mut() {
                let deps = &adjacency[node.index()];
                if *next < deps.len() {
                    let dep = deps[*next];
                    *next += 1;

                    match visit[dep.index()] {
                        Visit::OnPath => {
                            let cycle_start = path.iter().position(|n| *n == dep).unwrap_or(0);
                            let mut cycle: Vec<String> = path[cycle_start..]
                                .iter()
                                .map(|n| self.graph[*n].clone())
                                .collect();
                            cycle.push(self.graph[dep].clone());
                            return Err(ExecutionError::CircularDependency { path: cycle });
                        }
                        Visit::Done => {}
                        Visit::Unvisited => {
                            visit[dep.index()] = Visit::OnPath;
                            path.push(dep);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    visit[node.index()] = Visit::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }

        Ok(())
    }

    /// Create an execution plan with waves of mutually independent tasks
    pub fn create_execution_plan(&self) -> Result<ExecutionPlan> {
        self.detect_cycles()?;

        let mut waves = Vec::new();
        let mut completed: HashSet<NodeIndex> = HashSet::new();
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<NodeIndex>, Vec<NodeIndex>) =
                remaining.into_iter().partition(|&node_idx| {
                    self.graph
                        .neighbors_directed(node_idx, Direction::Incoming)
                        .all(|dep_node| completed.contains(&dep_node))
                });

            if ready.is_empty() {
                // Unreachable once detect_cycles has passed
                return Err(ExecutionError::Deadlock {
                    pending: blocked.iter().map(|n| self.graph[*n].clone()).collect(),
                });
            }

            completed.extend(ready.iter().copied());
            waves.push(ready.iter().map(|n| self.graph[*n].clone()).collect());
            remaining = blocked;
        }

        Ok(ExecutionPlan {
            waves,
            total_tasks: self.task_indices.len(),
        })
    }

    /// Get all tasks that depend on the given task
    pub fn dependents(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    /// Get all tasks that the given task depends on
    pub fn dependencies(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, Direction::Incoming)
    }

    fn neighbors(&self, task_id: &str, direction: Direction) -> Vec<String> {
        let mut names: Vec<String> = match self.task_indices.get(task_id) {
            Some(&node_idx) => self
                .graph
                .neighbors_directed(node_idx, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        };
        names.sort();
        names
    }

    /// Get tasks that have no dependencies (root tasks)
    pub fn roots(&self) -> Vec<String> {
        self.endpoints(Direction::Incoming)
    }

    /// Get tasks that no other tasks depend on (leaf tasks)
    pub fn leaves(&self) -> Vec<String> {
        self.endpoints(Direction::Outgoing)
    }

    fn endpoints(&self, direction: Direction) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph.neighbors_directed(n, direction).next().is_none())
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

impl ExecutionPlan {
    /// Get the maximum parallelism level (largest wave size)
    pub fn max_parallelism(&self) -> usize {
        self.waves.iter().map(|wave| wave.len()).max().unwrap_or(0)
    }

    /// Get the total number of waves
    pub fn depth(&self) -> usize {
        self.waves.len()
    }

    /// Get the wave index for a specific task
    pub fn wave_of(&self, task_id: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|wave| wave.iter().any(|t| t == task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        pairs
            .iter()
            .map(|(task, deps)| {
                (
                    task.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    fn graph_of(edges: &[(String, Vec<String>)]) -> Result<DependencyGraph> {
        DependencyGraph::build(edges.iter().map(|(t, d)| (t.as_str(), d.iter())))
    }

    fn diamond() -> Vec<(String, Vec<String>)> {
        deps(&[
            ("task_a", &[]),
            ("task_b", &["task_a"]),
            ("task_c", &["task_a"]),
            ("task_d", &["task_b", "task_c"]),
        ])
    }

    #[test]
    fn test_execution_plan_creation() {
        let edges = diamond();
        let graph = graph_of(&edges).unwrap();
        let plan = graph.create_execution_plan().unwrap();

        assert_eq!(plan.total_tasks, 4);
        assert_eq!(plan.depth(), 3);
        assert_eq!(plan.waves[0], vec!["task_a"]);
        assert_eq!(plan.waves[1], vec!["task_b", "task_c"]);
        assert_eq!(plan.waves[2], vec!["task_d"]);
        assert_eq!(plan.max_parallelism(), 2);
        assert_eq!(plan.wave_of("task_d"), Some(2));
        assert_eq!(plan.wave_of("task_x"), None);
    }

    #[test]
    fn test_dependency_queries() {
        let edges = diamond();
        let graph = graph_of(&edges).unwrap();

        assert!(graph.dependencies("task_a").is_empty());
        assert_eq!(graph.dependencies("task_d"), vec!["task_b", "task_c"]);
        assert_eq!(graph.dependents("task_a"), vec!["task_b", "task_c"]);
        assert_eq!(graph.roots(), vec!["task_a"]);
        assert_eq!(graph.leaves(), vec!["task_d"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let edges = deps(&[("task_a", &["ghost"])]);
        let err = graph_of(&edges).err().unwrap();

        assert_eq!(
            err,
            ExecutionError::UnknownDependency {
                task: "task_a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_two_node_cycle() {
        let edges = deps(&[("task_a", &["task_b"]), ("task_b", &["task_a"])]);
        let graph = graph_of(&edges).unwrap();

        match graph.detect_cycles() {
            Err(ExecutionError::CircularDependency { path }) => {
                assert_eq!(path, vec!["task_a", "task_b", "task_a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let edges = deps(&[("task_a", &["task_a"])]);
        let graph = graph_of(&edges).unwrap();

        assert!(matches!(
            graph.detect_cycles(),
            Err(ExecutionError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let edges = deps(&[
            ("root", &[]),
            ("x", &["root", "z"]),
            ("y", &["x"]),
            ("z", &["y"]),
        ]);
        let graph = graph_of(&edges).unwrap();

        match graph.create_execution_plan() {
            Err(ExecutionError::CircularDependency { path }) => {
                assert_eq!(path.first(), path.last());
                assert!(!path.contains(&"root".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let edges: Vec<(String, Vec<String>)> = (0..20_000)
            .map(|i| {
                let deps = if i == 0 {
                    vec![]
                } else {
                    vec![format!("t{}", i - 1)]
                };
                (format!("t{}", i), deps)
            })
            .collect();
        let graph = graph_of(&edges).unwrap();

        assert!(graph.detect_cycles().is_ok());
    }
}
