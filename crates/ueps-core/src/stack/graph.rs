//! Stack dependency graph and deploy ordering.
//!
//! An edge `A -> B` means B depends on A: A must be deployed first. Edges
//! are declared freely and acyclicity is checked once by [`StackGraph::validate`]
//! (or any ordering call), before a deploy is scheduled.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::error::{Result, UepsError};

#[derive(Debug, Clone, Default)]
pub struct StackGraph {
    /// `dependent -> {dependency, ...}`
    upstream: BTreeMap<String, BTreeSet<String>>,
    /// `dependency -> {dependent, ...}`
    downstream: BTreeMap<String, BTreeSet<String>>,
}

impl StackGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stack. Idempotent.
    pub fn add_stack(&mut self, name: &str) {
        self.upstream.entry(name.to_string()).or_default();
        self.downstream.entry(name.to_string()).or_default();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.upstream.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    /// Declare that `dependent` deploys after `dependency`. Both must be
    /// registered.
    pub fn add_dependency(&mut self, dependency: &str, dependent: &str) -> Result<()> {
        for name in [dependency, dependent] {
            if !self.contains(name) {
                return Err(UepsError::UnknownStack(name.to_string()));
            }
        }
        self.upstream
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.downstream
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
        Ok(())
    }

    /// Direct dependencies of `name`, sorted.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<&str>> {
        self.upstream
            .get(name)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .ok_or_else(|| UepsError::UnknownStack(name.to_string()))
    }

    /// Fail with `StackDependencyCycle` naming the cycle if there is one.
    pub fn validate(&self) -> Result<()> {
        match self.find_cycle() {
            Some(stacks) => Err(UepsError::StackDependencyCycle { stacks }),
            None => Ok(()),
        }
    }

    /// Stacks grouped by topological level. Every stack's dependencies sit
    /// in earlier levels; names within a level are sorted.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        self.validate()?;

        let mut in_degree: BTreeMap<&str, usize> = self
            .upstream
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for name in &current {
                for dependent in self.downstream.get(*name).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(dependent.as_str());
                        }
                    }
                }
            }
            levels.push(current.iter().map(|s| s.to_string()).collect());
            current = next.into_iter().collect();
        }

        Ok(levels)
    }

    /// Stacks in deploy order (dependencies first).
    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// DFS for a cycle. Returns the stacks on it, first stack repeated at
    /// the end, or `None` when the graph is acyclic.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a StackGraph,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            path.push(node);
            for dependent in graph.downstream.get(node).into_iter().flatten() {
                if let Some(cycle) = visit(graph, dependent, marks, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for node in self.upstream.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, node, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }
}
