//! Action graph builder
//!
//! Builds the dependency graph of a workflow definition, rejects invalid
//! structure (duplicate refs, dangling edges, cycles), and computes
//! execution levels for reporting.

use std::collections::HashMap;

use crate::workflow::expressions::ExpressionError;
use crate::workflow::{DependencyKind, WorkflowDefinition};

#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate action ref: {0}")]
    DuplicateRef(String),

    #[error("Action '{action}' depends on non-existent action '{dependency}'")]
    MissingDependency { action: String, dependency: String },

    #[error("Cyclic dependency detected between actions: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("Invalid action ref '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidRef(String),

    #[error("Action '{0}' has an empty action type")]
    EmptyActionType(String),

    #[error("Action '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Action '{action}' lists dependency '{dependency}' more than once")]
    DuplicateDependency { action: String, dependency: String },

    #[error("Invalid for_each on action '{action}': {reason}")]
    InvalidLoop { action: String, reason: String },

    #[error("Invalid expression in {action}.{field}: {source}")]
    InvalidExpression {
        action: String,
        field: String,
        source: ExpressionError,
    },
}

#[derive(Debug, Clone)]
pub struct ActionNode {
    pub reference: String,
    /// Incoming edges as (source index, kind)
    pub dependencies: Vec<(usize, DependencyKind)>,
    /// Outgoing edges, in definition order
    pub dependents: Vec<usize>,
}

/// Dependency graph over a definition's actions. Node indices follow
/// definition order.
#[derive(Debug, Clone)]
pub struct ActionGraph {
    nodes: Vec<ActionNode>,
    index: HashMap<String, usize>,
    execution_levels: Vec<Vec<String>>,
}

impl ActionGraph {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        definition.check_statements()?;

        let mut index = HashMap::new();
        for (i, action) in definition.actions.iter().enumerate() {
            if index.insert(action.reference.clone(), i).is_some() {
                return Err(GraphError::DuplicateRef(action.reference.clone()));
            }
        }

        let mut nodes: Vec<ActionNode> = definition
            .actions
            .iter()
            .map(|action| ActionNode {
                reference: action.reference.clone(),
                dependencies: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for (i, action) in definition.actions.iter().enumerate() {
            for dep in &action.depends_on {
                let source = *index
                    .get(&dep.source)
                    .ok_or_else(|| GraphError::MissingDependency {
                        action: action.reference.clone(),
                        dependency: dep.source.clone(),
                    })?;
                nodes[i].dependencies.push((source, dep.kind));
                nodes[source].dependents.push(i);
            }
        }

        let execution_levels = Self::compute_execution_levels(&nodes)?;

        Ok(Self {
            nodes,
            index,
            execution_levels,
        })
    }

    fn compute_execution_levels(nodes: &[ActionNode]) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut current_level: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut processed = 0;

        while !current_level.is_empty() {
            processed += current_level.len();

            let mut next_level = Vec::new();
            for &i in &current_level {
                for &dependent in &nodes[i].dependents {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next_level.push(dependent);
                    }
                }
            }

            let mut names: Vec<String> = current_level
                .iter()
                .map(|&i| nodes[i].reference.clone())
                .collect();
            names.sort();
            levels.push(names);
            current_level = next_level;
        }

        if processed != nodes.len() {
            let mut remaining: Vec<String> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, n)| n.reference.clone())
                .collect();
            remaining.sort();
            return Err(GraphError::CyclicDependency(remaining));
        }

        Ok(levels)
    }

    pub fn execution_levels(&self) -> &[Vec<String>] {
        &self.execution_levels
    }

    pub fn nodes(&self) -> &[ActionNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &ActionNode {
        &self.nodes[index]
    }

    pub fn index_of(&self, reference: &str) -> Option<usize> {
        self.index.get(reference).copied()
    }

    /// Refs with no incoming edges, in definition order
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| n.reference.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ActionStatement, Dependency};

    fn make_definition(actions: Vec<(&str, Vec<&str>)>) -> WorkflowDefinition {
        WorkflowDefinition {
            title: "test".to_string(),
            description: String::new(),
            entrypoint: None,
            inputs: Default::default(),
            actions: actions
                .into_iter()
                .map(|(reference, deps)| {
                    deps.into_iter().fold(
                        ActionStatement::new(reference, "core.noop"),
                        |stmt, dep| stmt.depends_on(Dependency::weak(dep)),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_simple_dag() {
        let graph = ActionGraph::build(&make_definition(vec![
            ("setup", vec![]),
            ("scan", vec!["setup"]),
            ("cleanup", vec!["scan"]),
        ]))
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.execution_levels().len(), 3);
        assert_eq!(graph.execution_levels()[0], vec!["setup"]);
        assert_eq!(graph.execution_levels()[1], vec!["scan"]);
        assert_eq!(graph.execution_levels()[2], vec!["cleanup"]);
    }

    #[test]
    fn test_parallel_dag() {
        let graph = ActionGraph::build(&make_definition(vec![
            ("setup", vec![]),
            ("lookup_ip", vec!["setup"]),
            ("lookup_hash", vec!["setup"]),
            ("report", vec!["lookup_ip", "lookup_hash"]),
        ]))
        .unwrap();

        assert_eq!(graph.execution_levels().len(), 3);
        assert_eq!(graph.execution_levels()[1], vec!["lookup_hash", "lookup_ip"]);
        assert_eq!(graph.execution_levels()[2], vec!["report"]);

        let report = graph.node(graph.index_of("report").unwrap());
        assert_eq!(report.dependencies.len(), 2);
        assert_eq!(graph.node(0).dependents, vec![1, 2]);
    }

    #[test]
    fn test_independent_actions() {
        let graph =
            ActionGraph::build(&make_definition(vec![("c", vec![]), ("a", vec![]), ("b", vec![])]))
                .unwrap();

        assert_eq!(graph.execution_levels().len(), 1);
        assert_eq!(graph.execution_levels()[0], vec!["a", "b", "c"]);
        assert_eq!(graph.roots(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_missing_dependency() {
        let result = ActionGraph::build(&make_definition(vec![("scan", vec!["setup"])]));
        assert!(matches!(result, Err(GraphError::MissingDependency { .. })));
    }

    #[test]
    fn test_cyclic_dependency() {
        let result = ActionGraph::build(&make_definition(vec![
            ("start", vec![]),
            ("a", vec!["c"]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
        ]));
        match result {
            Err(GraphError::CyclicDependency(refs)) => assert_eq!(refs, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_ref() {
        let result = ActionGraph::build(&make_definition(vec![("same", vec![]), ("same", vec![])]));
        assert!(matches!(result, Err(GraphError::DuplicateRef(_))));
    }

    #[test]
    fn test_empty_definition_builds() {
        let graph = ActionGraph::build(&make_definition(vec![])).unwrap();
        assert!(graph.is_empty());
        assert!(graph.execution_levels().is_empty());
    }
}
