//! `for_each` expansion into per-iteration variable bindings

use serde_json::{Map, Value};

use crate::workflow::expressions::broadcast::zip_rows;
use crate::workflow::expressions::{evaluate_value, ExpressionError, Scope};
use crate::workflow::{ForEach, LoopIterable, LoopStrategy};

/// Evaluate the loop's iterables and produce one `var.*` binding map per
/// iteration, in index order.
pub fn expand(
    for_each: &ForEach,
    scope: &Scope<'_>,
) -> Result<Vec<Map<String, Value>>, ExpressionError> {
    let values = for_each
        .iterables
        .iter()
        .map(|iterable| evaluate_value(&iterable.expr, scope))
        .collect::<Result<Vec<_>, _>>()?;

    match for_each.strategy {
        LoopStrategy::Map => {
            let (iterable, items) = single(for_each, &values)?;
            Ok(items
                .iter()
                .map(|item| bind([(iterable.var.as_str(), item.clone())]))
                .collect())
        }
        LoopStrategy::Zip => {
            let rows = zip_rows(&values).ok_or_else(|| {
                ExpressionError::NotIterable(format!(
                    "zip needs at least one sequence among {}",
                    describe(&for_each.iterables)
                ))
            })?;
            Ok(rows
                .into_iter()
                .map(|row| {
                    bind(
                        for_each
                            .iterables
                            .iter()
                            .map(|iterable| iterable.var.as_str())
                            .zip(row),
                    )
                })
                .collect())
        }
        LoopStrategy::Arrange => {
            let (iterable, items) = single(for_each, &values)?;
            let size = for_each.group_size.unwrap_or(1).max(1);
            Ok(items
                .chunks(size)
                .map(|chunk| bind([(iterable.var.as_str(), Value::Array(chunk.to_vec()))]))
                .collect())
        }
    }
}

fn single<'a>(
    for_each: &'a ForEach,
    values: &'a [Value],
) -> Result<(&'a LoopIterable, &'a Vec<Value>), ExpressionError> {
    let (Some(iterable), Some(value)) = (for_each.iterables.first(), values.first()) else {
        return Err(ExpressionError::NotIterable("no iterable given".to_string()));
    };
    match value {
        Value::Array(items) => Ok((iterable, items)),
        other => Err(ExpressionError::NotIterable(format!(
            "{} evaluated to {}",
            iterable.expr, other
        ))),
    }
}

fn bind<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(var, value)| (var.to_string(), value))
        .collect()
}

fn describe(iterables: &[LoopIterable]) -> String {
    iterables
        .iter()
        .map(|i| i.expr.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
