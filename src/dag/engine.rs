//! Dependency graph construction and phase scheduling.
//!
//! The engine builds a directed graph from a task list (edges run from
//! dependency to dependent), rejects cycles as they appear, and derives
//! topological phases, the critical path, and round-robin session
//! assignments from it.

use std::collections::HashMap;

use crate::errors::{FlowError, Result};
use crate::model::TaskInfo;

/// Index into the engine's task list.
type NodeIndex = usize;

/// Directed acyclic graph over a task list.
///
/// Construction validates the graph: every dependency must name a declared
/// task, and the edge set must stay acyclic. A violated cycle is reported
/// as a closed identifier sequence (`[a, b, ..., a]`) ready for display.
#[derive(Debug, Clone)]
pub struct DagEngine {
    tasks: Vec<TaskInfo>,
    index: HashMap<String, NodeIndex>,
    /// dependency -> dependents
    dependents: Vec<Vec<NodeIndex>>,
    /// dependent -> dependencies
    dependencies: Vec<Vec<NodeIndex>>,
}

impl DagEngine {
    /// Build the graph from an ordered task list.
    pub fn new(tasks: Vec<TaskInfo>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(FlowError::InvalidTaskFormat {
                    message: format!("duplicate task id '{}'", task.id),
                });
            }
        }

        let mut engine = Self {
            dependents: vec![Vec::new(); tasks.len()],
            dependencies: vec![Vec::new(); tasks.len()],
            index,
            tasks,
        };

        // Add dependency edges one at a time, checking acyclicity after
        // each addition so the first closing edge names its cycle.
        for to in 0..engine.tasks.len() {
            for dep_pos in 0..engine.tasks[to].dependencies.len() {
                let dep_id = engine.tasks[to].dependencies[dep_pos].clone();
                let from = *engine.index.get(&dep_id).ok_or_else(|| {
                    FlowError::UnknownDependency {
                        task: engine.tasks[to].id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;

                engine.dependents[from].push(to);
                engine.dependencies[to].push(from);

                // The new edge from -> to closes a cycle iff `to` already
                // reaches `from`.
                if let Some(path) = engine.find_path(to, from) {
                    let mut cycle: Vec<String> =
                        Vec::with_capacity(path.len() + 1);
                    cycle.push(engine.tasks[from].id.clone());
                    cycle.extend(path.iter().map(|&n| engine.tasks[n].id.clone()));
                    return Err(FlowError::CyclicDependency { cycle });
                }
            }
        }

        Ok(engine)
    }

    /// DFS path from `start` to `goal`, inclusive of both endpoints.
    /// For `start == goal` returns the trivial single-node path.
    fn find_path(&self, start: NodeIndex, goal: NodeIndex) -> Option<Vec<NodeIndex>> {
        if start == goal {
            return Some(vec![start]);
        }
        let mut visited = vec![false; self.tasks.len()];
        let mut stack = vec![(start, vec![start])];
        visited[start] = true;

        while let Some((node, path)) = stack.pop() {
            for &next in &self.dependents[node] {
                if next == goal {
                    let mut full = path.clone();
                    full.push(next);
                    return Some(full);
                }
                if !visited[next] {
                    visited[next] = true;
                    let mut full = path.clone();
                    full.push(next);
                    stack.push((next, full));
                }
            }
        }
        None
    }

    /// Re-check acyclicity of the current edge set using Kahn's algorithm.
    pub fn validate(&self) -> Result<()> {
        let mut in_degree: Vec<usize> =
            self.dependencies.iter().map(|deps| deps.len()).collect();
        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.tasks.len() {
            let cycle: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.tasks[i].id.clone())
                .collect();
            return Err(FlowError::CyclicDependency { cycle });
        }
        Ok(())
    }

    pub fn tasks(&self) -> &[TaskInfo] {
        &self.tasks
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn get_task(&self, task_id: &str) -> Option<&TaskInfo> {
        self.index.get(task_id).map(|&i| &self.tasks[i])
    }

    /// Topological generations: phase 0 holds every task with no
    /// dependencies; phase k holds every task whose dependencies all sit in
    /// earlier phases. Ids within a phase are sorted lexically.
    pub fn get_phases(&self) -> Vec<Vec<String>> {
        if self.tasks.is_empty() {
            return Vec::new();
        }

        let mut in_degree: Vec<usize> =
            self.dependencies.iter().map(|deps| deps.len()).collect();
        let mut current: Vec<NodeIndex> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        let mut phases = Vec::new();
        while !current.is_empty() {
            let mut ids: Vec<String> = current
                .iter()
                .map(|&i| self.tasks[i].id.clone())
                .collect();
            ids.sort();

            let mut next = Vec::new();
            for &node in &current {
                for &dependent in &self.dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            phases.push(ids);
            current = next;
        }
        phases
    }

    pub fn phase_count(&self) -> usize {
        self.get_phases().len()
    }

    /// Longest dependency chain (unit edge weights). On a disconnected
    /// graph this is the longest path across all components. Lower bound on
    /// sequential work.
    pub fn critical_path(&self) -> Vec<String> {
        if self.tasks.is_empty() {
            return Vec::new();
        }

        // Longest-path DP over a topological order.
        let topo = self.topological_order();
        let mut dist = vec![0usize; self.tasks.len()];
        let mut pred: Vec<Option<NodeIndex>> = vec![None; self.tasks.len()];

        for &node in &topo {
            for &dependent in &self.dependents[node] {
                if dist[node] + 1 > dist[dependent] {
                    dist[dependent] = dist[node] + 1;
                    pred[dependent] = Some(node);
                }
            }
        }

        let mut end = 0;
        for i in 1..self.tasks.len() {
            if dist[i] > dist[end] {
                end = i;
            }
        }

        let mut path = vec![end];
        while let Some(prev) = pred[*path.last().unwrap()] {
            path.push(prev);
        }
        path.reverse();
        path.into_iter().map(|i| self.tasks[i].id.clone()).collect()
    }

    /// Deterministic topological order: phases in order, ids lexical
    /// within each phase.
    fn topological_order(&self) -> Vec<NodeIndex> {
        self.get_phases()
            .into_iter()
            .flatten()
            .map(|id| self.index[&id])
            .collect()
    }

    /// Distribute tasks over sessions, phase by phase.
    ///
    /// A phase with a single task, or containing any non-parallelizable
    /// task, is pinned entirely to session 0 so serialized work stays
    /// serialized. Otherwise tasks go round-robin over `0..num_sessions` in
    /// lexical id order.
    pub fn assign_sessions(&mut self, num_sessions: usize) -> Result<()> {
        if num_sessions < 1 {
            return Err(FlowError::InvalidArgument(format!(
                "num_sessions must be >= 1, got {num_sessions}"
            )));
        }

        for phase in self.get_phases() {
            let all_parallel = phase
                .iter()
                .all(|id| self.tasks[self.index[id]].parallelizable);

            if !all_parallel || phase.len() == 1 {
                for id in &phase {
                    let idx = self.index[id];
                    self.tasks[idx].session = Some(0);
                }
            } else {
                for (pos, id) in phase.iter().enumerate() {
                    let idx = self.index[id];
                    self.tasks[idx].session = Some(pos % num_sessions);
                }
            }
        }
        Ok(())
    }

    /// Tasks assigned to one session, dependencies first.
    pub fn session_tasks(&self, session_id: usize) -> Vec<&TaskInfo> {
        self.topological_order()
            .into_iter()
            .map(|i| &self.tasks[i])
            .filter(|t| t.session == Some(session_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: Vec<&str>) -> TaskInfo {
        TaskInfo::new(
            id,
            &format!("Task {id}"),
            deps.into_iter().map(String::from).collect(),
        )
    }

    fn ptask(id: &str, deps: Vec<&str>) -> TaskInfo {
        task(id, deps).parallel(true)
    }

    #[test]
    fn empty_task_list_is_a_valid_dag() {
        let engine = DagEngine::new(vec![]).unwrap();
        assert!(engine.get_phases().is_empty());
        assert!(engine.critical_path().is_empty());
        engine.validate().unwrap();
    }

    #[test]
    fn linear_chain_phases() {
        let engine = DagEngine::new(vec![
            task("T001", vec![]),
            task("T002", vec!["T001"]),
            task("T003", vec!["T002"]),
        ])
        .unwrap();

        assert_eq!(
            engine.get_phases(),
            vec![vec!["T001"], vec!["T002"], vec!["T003"]]
        );
        assert_eq!(engine.critical_path(), vec!["T001", "T002", "T003"]);
    }

    #[test]
    fn diamond_phases_and_critical_path() {
        let engine = DagEngine::new(vec![
            task("T001", vec![]),
            ptask("T002", vec!["T001"]),
            ptask("T003", vec!["T001"]),
            ptask("T004", vec!["T002", "T003"]),
        ])
        .unwrap();

        assert_eq!(
            engine.get_phases(),
            vec![vec!["T001"], vec!["T002", "T003"], vec!["T004"]]
        );
        assert_eq!(engine.critical_path().len(), 3);
    }

    #[test]
    fn phases_partition_the_task_set() {
        let engine = DagEngine::new(vec![
            task("T003", vec![]),
            task("T001", vec![]),
            task("T002", vec!["T001"]),
            task("T004", vec!["T002", "T003"]),
        ])
        .unwrap();

        let flat: Vec<String> = engine.get_phases().into_iter().flatten().collect();
        assert_eq!(flat.len(), engine.task_count());
        let mut sorted = flat.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), engine.task_count());
    }

    #[test]
    fn dependency_phase_ordering() {
        let engine = DagEngine::new(vec![
            task("T001", vec![]),
            task("T002", vec!["T001"]),
            task("T003", vec!["T001"]),
            task("T004", vec!["T003"]),
        ])
        .unwrap();

        let phases = engine.get_phases();
        let phase_of = |id: &str| phases.iter().position(|p| p.iter().any(|t| t == id)).unwrap();
        for t in engine.tasks() {
            for dep in &t.dependencies {
                assert!(phase_of(dep) < phase_of(&t.id));
            }
        }
    }

    #[test]
    fn two_node_cycle_rejected() {
        let err = DagEngine::new(vec![
            task("T001", vec!["T002"]),
            task("T002", vec!["T001"]),
        ])
        .unwrap_err();

        match err {
            FlowError::CyclicDependency { cycle } => {
                assert!(cycle.contains(&"T001".to_string()));
                assert!(cycle.contains(&"T002".to_string()));
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_reports_trivial_cycle() {
        let err = DagEngine::new(vec![task("T001", vec!["T001"])]).unwrap_err();
        match err {
            FlowError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["T001".to_string(), "T001".to_string()]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = DagEngine::new(vec![task("T001", vec!["T999"])]).unwrap_err();
        match err {
            FlowError::UnknownDependency { task, dependency } => {
                assert_eq!(task, "T001");
                assert_eq!(dependency, "T999");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_id_rejected() {
        let err =
            DagEngine::new(vec![task("T001", vec![]), task("T001", vec![])]).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTaskFormat { .. }));
    }

    #[test]
    fn critical_path_spans_components() {
        // Component 1: T001 -> T002; component 2: T003 -> T004 -> T005.
        let engine = DagEngine::new(vec![
            task("T001", vec![]),
            task("T002", vec!["T001"]),
            task("T003", vec![]),
            task("T004", vec!["T003"]),
            task("T005", vec!["T004"]),
        ])
        .unwrap();

        assert_eq!(engine.critical_path(), vec!["T003", "T004", "T005"]);
    }

    #[test]
    fn assign_sessions_rejects_zero() {
        let mut engine = DagEngine::new(vec![task("T001", vec![])]).unwrap();
        let err = engine.assign_sessions(0).unwrap_err();
        assert!(matches!(err, FlowError::InvalidArgument(_)));
    }

    #[test]
    fn single_task_phase_pinned_to_session_zero() {
        let mut engine = DagEngine::new(vec![
            task("T001", vec![]),
            ptask("T002", vec!["T001"]),
            ptask("T003", vec!["T001"]),
        ])
        .unwrap();
        engine.assign_sessions(2).unwrap();

        assert_eq!(engine.get_task("T001").unwrap().session, Some(0));
        assert_eq!(engine.get_task("T002").unwrap().session, Some(0));
        assert_eq!(engine.get_task("T003").unwrap().session, Some(1));
    }

    #[test]
    fn non_parallelizable_phase_serialized() {
        // T002 is sequential, so its whole phase lands on session 0.
        let mut engine = DagEngine::new(vec![
            task("T001", vec![]),
            task("T002", vec!["T001"]),
            ptask("T003", vec!["T001"]),
        ])
        .unwrap();
        engine.assign_sessions(3).unwrap();

        assert_eq!(engine.get_task("T002").unwrap().session, Some(0));
        assert_eq!(engine.get_task("T003").unwrap().session, Some(0));
    }

    #[test]
    fn diamond_assignment_matches_round_robin() {
        let mut engine = DagEngine::new(vec![
            task("T001", vec![]),
            ptask("T002", vec!["T001"]),
            ptask("T003", vec!["T001"]),
            ptask("T004", vec!["T002", "T003"]),
        ])
        .unwrap();
        engine.assign_sessions(2).unwrap();

        assert_eq!(engine.get_task("T001").unwrap().session, Some(0));
        assert_eq!(engine.get_task("T002").unwrap().session, Some(0));
        assert_eq!(engine.get_task("T003").unwrap().session, Some(1));
        assert_eq!(engine.get_task("T004").unwrap().session, Some(0));
    }

    #[test]
    fn every_task_gets_a_session_in_range() {
        for sessions in 1..=4 {
            let mut engine = DagEngine::new(vec![
                task("T001", vec![]),
                ptask("T002", vec!["T001"]),
                ptask("T003", vec!["T001"]),
                ptask("T004", vec!["T001"]),
                ptask("T005", vec!["T002"]),
            ])
            .unwrap();
            engine.assign_sessions(sessions).unwrap();
            for t in engine.tasks() {
                let s = t.session.expect("assigned");
                assert!(s < sessions);
            }
        }
    }

    #[test]
    fn session_tasks_in_topological_order() {
        let mut engine = DagEngine::new(vec![
            task("T001", vec![]),
            task("T002", vec!["T001"]),
            task("T003", vec!["T002"]),
        ])
        .unwrap();
        engine.assign_sessions(3).unwrap();

        let session_0: Vec<&str> = engine
            .session_tasks(0)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(session_0, vec!["T001", "T002", "T003"]);
        assert!(engine.session_tasks(1).is_empty());
        assert!(engine.session_tasks(2).is_empty());
    }
}
