//! Workflow definition types
//!
//! A workflow is an ordered list of action statements connected by typed
//! dependency edges. Definitions are immutable once validated and are shared
//! read-only across runs.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::expressions::{validate_condition, validate_template, ExpressionError};
use crate::engine::{ActionGraph, GraphError};

static REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static FOR_SHORTHAND_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{\{\s*for\s+var\.([A-Za-z_][A-Za-z0-9_]*)\s+in\s+(.+?)\s*\}\}$").unwrap()
});

// ============================================================================
// Workflow
// ============================================================================

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Ref of the unique root action
    #[serde(default)]
    pub entrypoint: Option<String>,

    /// Static values exposed as `INPUTS.*`
    #[serde(default)]
    pub inputs: Map<String, Value>,

    pub actions: Vec<ActionStatement>,
}

impl WorkflowDefinition {
    /// Validate statements and graph structure
    pub fn validate(&self) -> Result<ActionGraph, GraphError> {
        ActionGraph::build(self)
    }

    pub fn action(&self, reference: &str) -> Option<&ActionStatement> {
        self.actions.iter().find(|a| a.reference == reference)
    }

    /// Per-statement checks that do not need the whole graph
    pub(crate) fn check_statements(&self) -> Result<(), GraphError> {
        self.actions.iter().try_for_each(ActionStatement::check)
    }
}

// ============================================================================
// Action statement
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStatement {
    /// Unique, stable identifier
    #[serde(rename = "ref")]
    pub reference: String,

    /// Which action implementation to dispatch
    #[serde(rename = "action", alias = "type")]
    pub action_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEach>,

    #[serde(default, alias = "args")]
    pub inputs: Map<String, Value>,
}

impl ActionStatement {
    pub fn new(reference: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            action_type: action_type.into(),
            depends_on: Vec::new(),
            run_if: None,
            for_each: None,
            inputs: Map::new(),
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn run_if(mut self, condition: impl Into<String>) -> Self {
        self.run_if = Some(condition.into());
        self
    }

    pub fn for_each(mut self, for_each: ForEach) -> Self {
        self.for_each = Some(for_each);
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    fn check(&self) -> Result<(), GraphError> {
        if !REF_REGEX.is_match(&self.reference) {
            return Err(GraphError::InvalidRef(self.reference.clone()));
        }
        if self.action_type.trim().is_empty() {
            return Err(GraphError::EmptyActionType(self.reference.clone()));
        }

        let mut seen = HashSet::new();
        for dep in &self.depends_on {
            if dep.source == self.reference {
                return Err(GraphError::SelfDependency(self.reference.clone()));
            }
            if !seen.insert(dep.source.as_str()) {
                return Err(GraphError::DuplicateDependency {
                    action: self.reference.clone(),
                    dependency: dep.source.clone(),
                });
            }
        }

        if let Some(condition) = &self.run_if {
            validate_condition(condition).map_err(|e| self.expression_error("run_if", e))?;
        }

        if let Some(for_each) = &self.for_each {
            for_each
                .check()
                .map_err(|reason| GraphError::InvalidLoop {
                    action: self.reference.clone(),
                    reason,
                })?;
            for iterable in &for_each.iterables {
                validate_condition(&iterable.expr)
                    .map_err(|e| self.expression_error("for_each", e))?;
            }
        }

        for (key, value) in &self.inputs {
            check_templates(value).map_err(|e| self.expression_error(&format!("inputs.{}", key), e))?;
        }

        Ok(())
    }

    fn expression_error(&self, field: &str, source: ExpressionError) -> GraphError {
        GraphError::InvalidExpression {
            action: self.reference.clone(),
            field: field.to_string(),
            source,
        }
    }
}

fn check_templates(value: &Value) -> Result<(), ExpressionError> {
    match value {
        Value::String(s) => validate_template(s),
        Value::Array(items) => items.iter().try_for_each(check_templates),
        Value::Object(map) => map.values().try_for_each(check_templates),
        _ => Ok(()),
    }
}

// ============================================================================
// Dependencies
// ============================================================================

/// Strong edges require the source to succeed. Weak edges tolerate a skipped
/// source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Strong,
    #[default]
    Weak,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    #[serde(rename = "ref")]
    pub source: String,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn strong(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: DependencyKind::Strong,
        }
    }

    pub fn weak(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: DependencyKind::Weak,
        }
    }
}

impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DependencyHelper {
            Ref(String),
            Full {
                #[serde(rename = "ref")]
                source: String,
                #[serde(default)]
                kind: DependencyKind,
            },
        }

        match DependencyHelper::deserialize(deserializer)? {
            DependencyHelper::Ref(source) => Ok(Dependency::weak(source)),
            DependencyHelper::Full { source, kind } => Ok(Dependency { source, kind }),
        }
    }
}

// ============================================================================
// Loops
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStrategy {
    #[default]
    Map,
    Zip,
    Arrange,
}

/// One loop variable bound from an iterable expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopIterable {
    pub var: String,
    #[serde(rename = "in")]
    pub expr: String,
}

impl LoopIterable {
    pub fn new(var: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            expr: expr.into(),
        }
    }

    /// Parse `${{ for var.x in <expr> }}`
    pub fn parse_shorthand(source: &str) -> Option<Self> {
        let caps = FOR_SHORTHAND_REGEX.captures(source.trim())?;
        Some(Self::new(&caps[1], &caps[2]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForEach {
    pub strategy: LoopStrategy,
    pub iterables: Vec<LoopIterable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_size: Option<usize>,
}

impl ForEach {
    pub fn map(var: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            strategy: LoopStrategy::Map,
            iterables: vec![LoopIterable::new(var, expr)],
            group_size: None,
        }
    }

    pub fn zip(iterables: Vec<LoopIterable>) -> Self {
        Self {
            strategy: LoopStrategy::Zip,
            iterables,
            group_size: None,
        }
    }

    pub fn arrange(var: impl Into<String>, expr: impl Into<String>, group_size: usize) -> Self {
        Self {
            strategy: LoopStrategy::Arrange,
            iterables: vec![LoopIterable::new(var, expr)],
            group_size: Some(group_size),
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.iterables.is_empty() {
            return Err("at least one iterable is required".to_string());
        }

        let mut vars = HashSet::new();
        for iterable in &self.iterables {
            if !REF_REGEX.is_match(&iterable.var) {
                return Err(format!("invalid loop variable '{}'", iterable.var));
            }
            if !vars.insert(iterable.var.as_str()) {
                return Err(format!("duplicate loop variable '{}'", iterable.var));
            }
        }

        match self.strategy {
            LoopStrategy::Map | LoopStrategy::Arrange if self.iterables.len() != 1 => Err(format!(
                "{:?} takes exactly one iterable, got {}",
                self.strategy,
                self.iterables.len()
            )
            .to_lowercase()),
            LoopStrategy::Arrange => match self.group_size {
                Some(n) if n > 0 => Ok(()),
                _ => Err("arrange requires a positive group_size".to_string()),
            },
            _ if self.group_size.is_some() => {
                Err("group_size is only valid with the arrange strategy".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl<'de> Deserialize<'de> for ForEach {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ForEachHelper {
            Shorthand(String),
            ShorthandList(Vec<String>),
            Full {
                #[serde(default)]
                strategy: LoopStrategy,
                iterables: Vec<LoopIterable>,
                #[serde(default)]
                group_size: Option<usize>,
            },
        }

        let shorthand = |source: &str| -> Result<LoopIterable, D::Error> {
            LoopIterable::parse_shorthand(source).ok_or_else(|| {
                <D::Error as serde::de::Error>::custom(format!(
                    "invalid for_each '{}', expected '${{{{ for var.<name> in <expr> }}}}'",
                    source
                ))
            })
        };

        match ForEachHelper::deserialize(deserializer)? {
            ForEachHelper::Shorthand(source) => Ok(ForEach {
                strategy: LoopStrategy::Map,
                iterables: vec![shorthand(&source)?],
                group_size: None,
            }),
            ForEachHelper::ShorthandList(sources) => {
                let iterables = sources
                    .iter()
                    .map(|s| shorthand(s))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ForEach {
                    strategy: if iterables.len() == 1 {
                        LoopStrategy::Map
                    } else {
                        LoopStrategy::Zip
                    },
                    iterables,
                    group_size: None,
                })
            }
            ForEachHelper::Full {
                strategy,
                iterables,
                group_size,
            } => Ok(ForEach {
                strategy,
                iterables,
                group_size,
            }),
        }
    }
}
