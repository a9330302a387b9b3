//! Element-wise broadcasting shared by `FN.<name>.map(...)` and `for_each: zip`.
//!
//! Sequence arguments are zipped by position and stop at the shortest one;
//! non-sequence arguments repeat for every row.

use serde_json::Value;

/// Zip `args` into rows. Returns `None` when no argument is a sequence.
pub fn zip_rows(args: &[Value]) -> Option<Vec<Vec<Value>>> {
    let len = args
        .iter()
        .filter_map(|arg| arg.as_array().map(Vec::len))
        .min()?;

    let rows = (0..len)
        .map(|i| {
            args.iter()
                .map(|arg| match arg {
                    Value::Array(items) => items[i].clone(),
                    scalar => scalar.clone(),
                })
                .collect()
        })
        .collect();

    Some(rows)
}

/// Apply `f` element-wise across `args`.
///
/// With no sequence argument, `f` is applied once and its scalar result is
/// returned unchanged.
pub fn broadcast<F, E>(args: &[Value], mut f: F) -> Result<Value, E>
where
    F: FnMut(&[Value]) -> Result<Value, E>,
{
    match zip_rows(args) {
        Some(rows) => rows
            .iter()
            .map(|row| f(row))
            .collect::<Result<Vec<_>, E>>()
            .map(Value::Array),
        None => f(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_zip_rows_repeats_scalars() {
        let rows = zip_rows(&[json!([1, 2, 3]), json!(10)]).unwrap();
        assert_eq!(rows, vec![vec![json!(1), json!(10)], vec![json!(2), json!(10)], vec![json!(3), json!(10)]]);
    }

    #[test]
    fn test_zip_rows_stops_at_shortest() {
        let rows = zip_rows(&[json!([1, 2, 3]), json!(["a", "b"])]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![json!(2), json!("b")]);
    }

    #[test]
    fn test_zip_rows_without_sequence() {
        assert!(zip_rows(&[json!(1), json!("x")]).is_none());
    }

    #[test]
    fn test_broadcast_scalar_call() {
        let result: Result<Value, ()> = broadcast(&[json!(2), json!(3)], |row| {
            Ok(json!(row[0].as_i64().unwrap() * row[1].as_i64().unwrap()))
        });
        assert_eq!(result.unwrap(), json!(6));
    }

    #[test]
    fn test_broadcast_empty_sequence() {
        let result: Result<Value, ()> = broadcast(&[json!([]), json!(1)], |_| Ok(json!(0)));
        assert_eq!(result.unwrap(), json!([]));
    }
}
