//! Expression evaluation for `${{ }}` templates
//!
//! Supports:
//! - `${{ ACTIONS.<ref>.result }}`, `${{ ACTIONS.<ref>.status }}`
//! - `${{ TRIGGER.field }}`, `${{ ENV.NAME }}`, `${{ INPUTS.name }}`
//! - `${{ var.x }}` inside `for_each` loops
//! - operators and `FN.<name>(...)` / `FN.<name>.map(...)` calls
//!
//! A string that is exactly one template yields the typed value. A string
//! mixing text and templates is interpolated into a string.

pub mod broadcast;
mod eval;
pub mod functions;
mod lexer;
pub mod parser;

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

pub use parser::{parse, Expr, Namespace, Path, PathSegment};

use super::context::{select_in_map, ExecutionContext, Resolved};

static TEMPLATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\$\{\{\s*(.+?)\s*\}\}").unwrap());

/// Errors that can occur during expression evaluation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Invalid expression syntax: {0}")]
    Syntax(String),

    #[error("Unknown function: FN.{0}")]
    UnknownFunction(String),

    #[error("FN.{function} expects {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },

    #[error("Absent value: {0}")]
    AbsentValue(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Pattern '{0}' did not match")]
    NoMatch(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Not iterable: {0}")]
    NotIterable(String),
}

/// A parsed template string
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    /// No `${{ }}` inside; passes through unchanged
    Literal(String),
    /// The whole string is a single `${{ expr }}`
    Expression(Expr),
    /// Text mixed with one or more expressions
    Interpolated(Vec<Fragment>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Expr(Expr),
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let captures: Vec<_> = TEMPLATE_REGEX.captures_iter(source).collect();
        if captures.is_empty() {
            return Ok(Template::Literal(source.to_string()));
        }

        if let [only] = captures.as_slice() {
            let full = &only[0];
            if source.trim() == full {
                return Ok(Template::Expression(parse(&only[1])?));
            }
        }

        let mut fragments = Vec::new();
        let mut last = 0;
        for cap in &captures {
            let (Some(full), Some(inner)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            if full.start() > last {
                fragments.push(Fragment::Text(source[last..full.start()].to_string()));
            }
            fragments.push(Fragment::Expr(parse(inner.as_str())?));
            last = full.end();
        }
        if last < source.len() {
            fragments.push(Fragment::Text(source[last..].to_string()));
        }

        Ok(Template::Interpolated(fragments))
    }

    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<Resolved, ExpressionError> {
        match self {
            Template::Literal(text) => Ok(Resolved::Value(Value::String(text.clone()))),
            Template::Expression(expr) => eval::eval(expr, scope),
            Template::Interpolated(fragments) => {
                let mut out = String::new();
                for fragment in fragments {
                    match fragment {
                        Fragment::Text(text) => out.push_str(text),
                        Fragment::Expr(expr) => match eval::eval(expr, scope)? {
                            Resolved::Value(value) => out.push_str(&render(&value)),
                            Resolved::Absent => {
                                return Err(ExpressionError::AbsentValue(eval::describe(expr)))
                            }
                        },
                    }
                }
                Ok(Resolved::Value(Value::String(out)))
            }
        }
    }
}

/// What an expression can see: the run's context plus loop-local bindings
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    ctx: &'a ExecutionContext,
    locals: Option<&'a Map<String, Value>>,
}

impl<'a> Scope<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx, locals: None }
    }

    /// Bind `var.*` for one loop iteration
    pub fn with_locals(self, locals: &'a Map<String, Value>) -> Self {
        Self {
            locals: Some(locals),
            ..self
        }
    }

    pub(crate) fn lookup(&self, path: &Path) -> Resolved {
        match path.root {
            Namespace::Var => match self.locals {
                Some(locals) => select_in_map(locals, &path.segments),
                None => Resolved::Absent,
            },
            _ => self.ctx.resolve_path(path),
        }
    }
}

/// Resolve a literal or template value, recursing into sequences and mappings
pub fn resolve(value: &Value, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => match Template::parse(s)?.evaluate(scope)? {
            Resolved::Value(v) => Ok(v),
            Resolved::Absent => Err(ExpressionError::AbsentValue(s.clone())),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_inputs(map, scope).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve every entry of an input mapping
pub fn resolve_inputs(
    inputs: &Map<String, Value>,
    scope: &Scope<'_>,
) -> Result<Map<String, Value>, ExpressionError> {
    inputs
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve(value, scope)?)))
        .collect()
}

/// Resolve a single template string
pub fn resolve_str(template: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    resolve(&Value::String(template.to_string()), scope)
}

/// Check if a condition evaluates to true.
///
/// The `${{ }}` wrapper is optional. Absent values are false.
pub fn evaluate_condition(condition: &str, scope: &Scope<'_>) -> Result<bool, ExpressionError> {
    let condition = condition.trim();
    let template = parse_condition(condition)?;

    match template.evaluate(scope) {
        Ok(Resolved::Value(value)) => Ok(match (&template, &value) {
            (Template::Interpolated(_), Value::String(s)) => is_truthy_str(s),
            _ => is_truthy(&value),
        }),
        Ok(Resolved::Absent) | Err(ExpressionError::AbsentValue(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Evaluate to a concrete value. The `${{ }}` wrapper is optional.
pub fn evaluate_value(source: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    let source = source.trim();
    match parse_condition(source)?.evaluate(scope)? {
        Resolved::Value(value) => Ok(value),
        Resolved::Absent => Err(ExpressionError::AbsentValue(source.to_string())),
    }
}

fn parse_condition(condition: &str) -> Result<Template, ExpressionError> {
    if TEMPLATE_REGEX.is_match(condition) {
        Template::parse(condition)
    } else {
        parse(condition).map(Template::Expression)
    }
}

/// Parse a template or condition without evaluating it
pub fn validate_template(source: &str) -> Result<(), ExpressionError> {
    Template::parse(source).map(|_| ())
}

/// Parse a `run_if` condition without evaluating it
pub fn validate_condition(condition: &str) -> Result<(), ExpressionError> {
    parse_condition(condition.trim()).map(|_| ())
}

/// Render a value for string interpolation: strings raw, everything else as JSON
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// null, false, 0, "", [] and {} are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn is_truthy_str(value: &str) -> bool {
    !value.is_empty()
        && value != "false"
        && value != "0"
        && value.to_lowercase() != "null"
        && value.to_lowercase() != "none"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ActionError, ActionResult};
    use serde_json::json;

    fn test_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("run-test");
        ctx.env.insert("REGION".to_string(), "eu-west-1".to_string());
        ctx.trigger = json!({"alert": {"severity": 7, "hosts": ["a", "b"]}});
        ctx.inputs.insert("threshold".to_string(), json!(5));
        ctx.record("enrich", ActionResult::success(json!({"score": 90, "tags": ["x", "y"]})))
            .unwrap();
        ctx.record("skipped_one", ActionResult::skipped()).unwrap();
        ctx.record("broken", ActionResult::failed(ActionError::Cancelled))
            .unwrap();
        ctx
    }

    #[test]
    fn test_whole_template_keeps_type() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert_eq!(resolve_str("${{ ACTIONS.enrich.result.score }}", &scope).unwrap(), json!(90));
        assert_eq!(resolve_str("${{ TRIGGER.alert.hosts }}", &scope).unwrap(), json!(["a", "b"]));
        assert_eq!(resolve_str("  ${{ INPUTS.threshold }}  ", &scope).unwrap(), json!(5));
    }

    #[test]
    fn test_interpolation() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert_eq!(
            resolve_str("region=${{ ENV.REGION }} score=${{ ACTIONS.enrich.result.score }}", &scope)
                .unwrap(),
            json!("region=eu-west-1 score=90")
        );
        assert_eq!(
            resolve_str("tags: ${{ ACTIONS.enrich.result.tags }}", &scope).unwrap(),
            json!("tags: [\"x\",\"y\"]")
        );
    }

    #[test]
    fn test_template_spanning_lines() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert_eq!(
            resolve_str("${{\n  ACTIONS.enrich.result.score\n    >= INPUTS.threshold\n}}\n", &scope).unwrap(),
            json!(true)
        );
        assert_eq!(
            resolve_str("score: ${{ FN.add(\n  ACTIONS.enrich.result.score,\n  1) }}", &scope).unwrap(),
            json!("score: 91")
        );
    }

    #[test]
    fn test_literals_pass_through() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert_eq!(resolve(&json!("plain"), &scope).unwrap(), json!("plain"));
        assert_eq!(resolve(&json!(3), &scope).unwrap(), json!(3));
        assert_eq!(
            resolve(&json!({"nested": ["${{ TRIGGER.alert.severity }}", true]}), &scope).unwrap(),
            json!({"nested": [7, true]})
        );
    }

    #[test]
    fn test_status_and_error_views() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert_eq!(resolve_str("${{ ACTIONS.skipped_one.status }}", &scope).unwrap(), json!("skipped"));
        assert_eq!(
            resolve_str("${{ ACTIONS.broken.error.kind }}", &scope).unwrap(),
            json!("cancelled")
        );
    }

    #[test]
    fn test_absent_in_inputs_is_error() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        let err = resolve_str("${{ ACTIONS.missing.result }}", &scope).unwrap_err();
        assert!(matches!(err, ExpressionError::AbsentValue(_)));
        let err = resolve_str("id=${{ TRIGGER.nope }}", &scope).unwrap_err();
        assert!(matches!(err, ExpressionError::AbsentValue(_)));
    }

    #[test]
    fn test_condition_absent_is_false() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert!(!evaluate_condition("${{ ACTIONS.skipped_one.result }}", &scope).unwrap());
        assert!(!evaluate_condition("${{ ACTIONS.missing.result.x > 3 }}", &scope).unwrap());
        assert!(!evaluate_condition("${{ FN.add(TRIGGER.nope, 1) }}", &scope).unwrap());
    }

    #[test]
    fn test_condition_operators() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert!(evaluate_condition("${{ TRIGGER.alert.severity > INPUTS.threshold }}", &scope).unwrap());
        assert!(evaluate_condition("ACTIONS.enrich.status == 'success'", &scope).unwrap());
        assert!(!evaluate_condition("${{ FN.is_empty(ACTIONS.enrich.result.tags) }}", &scope).unwrap());
        assert!(evaluate_condition("${{ FN.is_null(ACTIONS.skipped_one.result) }}", &scope).unwrap());
    }

    #[test]
    fn test_condition_errors_propagate() {
        let ctx = test_context();
        let scope = Scope::new(&ctx);
        assert!(matches!(
            evaluate_condition("${{ FN.nope(1) }}", &scope),
            Err(ExpressionError::UnknownFunction(_))
        ));
        assert!(matches!(
            evaluate_condition("${{ FN.add(1) }}", &scope),
            Err(ExpressionError::Arity { .. })
        ));
        assert!(matches!(
            evaluate_condition("${{ TRIGGER.alert.severity < 'x' }}", &scope),
            Err(ExpressionError::Type(_))
        ));
    }

    #[test]
    fn test_loop_locals() {
        let ctx = test_context();
        let mut locals = Map::new();
        locals.insert("host".to_string(), json!({"name": "db-1"}));
        let scope = Scope::new(&ctx).with_locals(&locals);
        assert_eq!(resolve_str("${{ var.host.name }}", &scope).unwrap(), json!("db-1"));
        assert!(resolve_str("${{ var.other }}", &Scope::new(&ctx)).is_err());
    }

    #[test]
    fn test_validate_template() {
        assert!(validate_template("${{ ACTIONS.a.result }}").is_ok());
        assert!(validate_template("no templates here").is_ok());
        assert!(matches!(
            validate_template("${{ ACTIONS.a.result + }}"),
            Err(ExpressionError::Syntax(_))
        ));
        assert!(validate_condition("TRIGGER.x == 1").is_ok());
        assert!(validate_condition("TRIGGER.x ==").is_err());
    }

    #[test]
    fn test_truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(""), json!([]), json!({})] {
            assert!(!is_truthy(&falsy), "{} should be falsy", falsy);
        }
        for truthy in [json!(true), json!(1), json!("0"), json!([0]), json!({"a": null})] {
            assert!(is_truthy(&truthy), "{} should be truthy", truthy);
        }
    }
}
