//! Tree-walking evaluator over the parsed AST.

use std::cmp::Ordering;

use serde_json::Value;

use super::functions::{self, compare, values_equal};
use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{is_truthy, ExpressionError, Scope};
use crate::workflow::context::Resolved;

pub(super) fn eval(expr: &Expr, scope: &Scope<'_>) -> Result<Resolved, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(Resolved::Value(value.clone())),

        Expr::List(items) => items
            .iter()
            .map(|item| require(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Resolved::Value(Value::Array(items))),

        Expr::Path(path) => Ok(scope.lookup(path)),

        Expr::Member(base, field) => Ok(eval(base, scope)?.field(field)),

        Expr::Index(base, index) => {
            let base = eval(base, scope)?;
            match require(index, scope)? {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Ok(base.index(i)),
                    None => Err(ExpressionError::Type(format!(
                        "index must be an integer, got {}",
                        n
                    ))),
                },
                Value::String(key) => Ok(base.field(&key)),
                other => Err(ExpressionError::Type(format!(
                    "cannot index with {}",
                    other
                ))),
            }
        }

        Expr::Call {
            function,
            broadcast,
            args,
        } => {
            let function = functions::lookup(function)?;
            let values = args
                .iter()
                .map(|arg| match eval(arg, scope)? {
                    Resolved::Value(value) => Ok(value),
                    Resolved::Absent if function.accepts_absent() => Ok(Value::Null),
                    Resolved::Absent => Err(ExpressionError::AbsentValue(describe(arg))),
                })
                .collect::<Result<Vec<_>, _>>()?;

            let result = if *broadcast {
                function.call_map(&values)?
            } else {
                function.call(&values)?
            };
            Ok(Resolved::Value(result))
        }

        Expr::Unary(UnaryOp::Not, operand) => {
            let truthy = truthy(&eval(operand, scope)?);
            Ok(Resolved::Value(Value::Bool(!truthy)))
        }

        Expr::Unary(UnaryOp::Negate, operand) => {
            let value = require(operand, scope)?;
            functions::lookup("sub")?
                .call(&[Value::from(0), value])
                .map(Resolved::Value)
        }

        Expr::Binary(op, left, right) => binary(*op, left, right, scope),
    }
}

fn binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    scope: &Scope<'_>,
) -> Result<Resolved, ExpressionError> {
    let value = match op {
        BinaryOp::And => {
            let result = truthy(&eval(left, scope)?) && truthy(&eval(right, scope)?);
            Value::Bool(result)
        }
        BinaryOp::Or => {
            let result = truthy(&eval(left, scope)?) || truthy(&eval(right, scope)?);
            Value::Bool(result)
        }
        BinaryOp::Equal | BinaryOp::NotEqual => {
            let l = eval(left, scope)?.into_value().unwrap_or(Value::Null);
            let r = eval(right, scope)?.into_value().unwrap_or(Value::Null);
            let equal = values_equal(&l, &r);
            Value::Bool(if op == BinaryOp::Equal { equal } else { !equal })
        }
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            let l = require(left, scope)?;
            let r = require(right, scope)?;
            let ordering = compare(&l, &r, symbol(op))?;
            Value::Bool(match op {
                BinaryOp::Less => ordering == Ordering::Less,
                BinaryOp::LessEqual => ordering != Ordering::Greater,
                BinaryOp::Greater => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let l = require(left, scope)?;
            let r = require(right, scope)?;
            let name = match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::Div => "div",
                _ => "mod",
            };
            functions::lookup(name)?.call(&[l, r])?
        }
    };
    Ok(Resolved::Value(value))
}

/// Evaluate and demand a concrete value
fn require(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    eval(expr, scope)?
        .into_value()
        .ok_or_else(|| ExpressionError::AbsentValue(describe(expr)))
}

fn truthy(resolved: &Resolved) -> bool {
    match resolved {
        Resolved::Value(value) => is_truthy(value),
        Resolved::Absent => false,
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Less => "<",
        BinaryOp::LessEqual => "<=",
        BinaryOp::Greater => ">",
        BinaryOp::GreaterEqual => ">=",
        _ => "operator",
    }
}

/// Short human-readable name of an operand for error messages
pub(super) fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Path(path) => path.to_string(),
        Expr::Member(base, field) => format!("{}.{}", describe(base), field),
        Expr::Index(base, _) => format!("{}[...]", describe(base)),
        Expr::Call { function, .. } => format!("FN.{}(...)", function),
        _ => "expression".to_string(),
    }
}
