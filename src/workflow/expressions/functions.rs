//! Built-in function catalog exposed as `FN.<name>(...)`
//!
//! Every function is pure and has two entry points: [`Function::call`] for a
//! scalar invocation and [`Function::call_map`] for the broadcast form
//! (`FN.<name>.map(...)`), both backed by the same scalar implementation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use super::broadcast::broadcast;
use super::{is_truthy, render, ExpressionError};

type ScalarFn = fn(&[Value]) -> Result<Value, ExpressionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exact(expected) => n == *expected,
            Arity::AtLeast(min) => n >= *min,
        }
    }

    fn describe(&self) -> String {
        match self {
            Arity::Exact(n) => n.to_string(),
            Arity::AtLeast(n) => format!("at least {}", n),
        }
    }
}

pub struct Function {
    pub name: &'static str,
    pub arity: Arity,
    nullable: bool,
    scalar: ScalarFn,
}

impl Function {
    const fn new(name: &'static str, arity: Arity, scalar: ScalarFn) -> Self {
        Self {
            name,
            arity,
            nullable: false,
            scalar,
        }
    }

    const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Whether an absent operand may be passed to this function as `null`
    pub fn accepts_absent(&self) -> bool {
        self.nullable
    }

    fn check_arity(&self, found: usize) -> Result<(), ExpressionError> {
        if self.arity.accepts(found) {
            Ok(())
        } else {
            Err(ExpressionError::Arity {
                function: self.name.to_string(),
                expected: self.arity.describe(),
                found,
            })
        }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, ExpressionError> {
        self.check_arity(args.len())?;
        (self.scalar)(args)
    }

    pub fn call_map(&self, args: &[Value]) -> Result<Value, ExpressionError> {
        self.check_arity(args.len())?;
        broadcast(args, |row| (self.scalar)(row))
    }
}

static CATALOG: LazyLock<HashMap<&'static str, Function>> = LazyLock::new(|| {
    use Arity::*;

    [
        // Comparison
        Function::new("less_than", Exact(2), less_than),
        Function::new("less_than_or_equal", Exact(2), less_than_or_equal),
        Function::new("greater_than", Exact(2), greater_than),
        Function::new("greater_than_or_equal", Exact(2), greater_than_or_equal),
        Function::new("not_equal", Exact(2), not_equal),
        Function::new("is_equal", Exact(2), is_equal),
        Function::new("not_null", Exact(1), not_null).nullable(),
        Function::new("is_null", Exact(1), is_null).nullable(),
        // Regex
        Function::new("regex_extract", Exact(2), regex_extract),
        Function::new("regex_match", Exact(2), regex_match),
        Function::new("regex_not_match", Exact(2), regex_not_match),
        // Collections
        Function::new("contains", Exact(2), contains),
        Function::new("does_not_contain", Exact(2), does_not_contain),
        Function::new("length", Exact(1), length),
        Function::new("is_empty", Exact(1), is_empty),
        Function::new("not_empty", Exact(1), not_empty),
        // Math
        Function::new("add", Exact(2), add),
        Function::new("sub", Exact(2), sub),
        Function::new("mul", Exact(2), mul),
        Function::new("div", Exact(2), div),
        Function::new("mod", Exact(2), modulo),
        Function::new("pow", Exact(2), pow),
        Function::new("sum", Exact(1), sum),
        // Transform
        Function::new("join", Exact(2), join),
        Function::new("concat", AtLeast(0), concat),
        Function::new("format", AtLeast(1), format_string),
        // Logical
        Function::new("and", Exact(2), and),
        Function::new("or", Exact(2), or),
        Function::new("not", Exact(1), not),
        // Type conversion
        Function::new("serialize_json", Exact(1), serialize_json),
        Function::new("from_timestamp", Exact(2), from_timestamp),
        Function::new("to_int", Exact(1), to_int),
        Function::new("to_float", Exact(1), to_float),
        Function::new("to_str", Exact(1), to_str),
        Function::new("to_bool", Exact(1), to_bool),
    ]
    .into_iter()
    .map(|f| (f.name, f))
    .collect()
});

/// Look up a function by name
pub fn lookup(name: &str) -> Result<&'static Function, ExpressionError> {
    CATALOG
        .get(name)
        .ok_or_else(|| ExpressionError::UnknownFunction(name.to_string()))
}

/// Names of all catalog functions, sorted
pub fn names() -> Vec<&'static str> {
    let mut names: Vec<_> = CATALOG.keys().copied().collect();
    names.sort_unstable();
    names
}

// ============================================================================
// Numeric helpers
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn type_error(function: &str, message: impl std::fmt::Display) -> ExpressionError {
    ExpressionError::Type(format!("{}: {}", function, message))
}

fn num(value: &Value, function: &str) -> Result<Num, ExpressionError> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Num::Int(i)),
            None => n
                .as_f64()
                .map(Num::Float)
                .ok_or_else(|| type_error(function, format!("unsupported number {}", n))),
        },
        other => Err(type_error(
            function,
            format!("expected a number, got {}", render(other)),
        )),
    }
}

fn float_value(f: f64, function: &str) -> Result<Value, ExpressionError> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| type_error(function, "result is not a finite number"))
}

fn arithmetic(
    function: &str,
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ExpressionError> {
    match (num(a, function)?, num(b, function)?) {
        (Num::Int(x), Num::Int(y)) => match int_op(x, y) {
            Some(r) => Ok(Value::from(r)),
            None => float_value(float_op(x as f64, y as f64), function),
        },
        (x, y) => float_value(float_op(x.as_f64(), y.as_f64()), function),
    }
}

fn as_str<'a>(value: &'a Value, function: &str) -> Result<&'a str, ExpressionError> {
    value
        .as_str()
        .ok_or_else(|| type_error(function, format!("expected a string, got {}", render(value))))
}

/// Ordering used by the comparison functions and operators
pub(crate) fn compare(a: &Value, b: &Value, function: &str) -> Result<Ordering, ExpressionError> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            match (num(a, function)?, num(b, function)?) {
                (Num::Int(x), Num::Int(y)) => Ok(x.cmp(&y)),
                (x, y) => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .ok_or_else(|| type_error(function, "cannot compare NaN")),
            }
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(type_error(
            function,
            format!("cannot compare {} with {}", render(a), render(b)),
        )),
    }
}

/// Structural equality where `1 == 1.0`
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, v)| ym.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

// ============================================================================
// Comparison
// ============================================================================

fn less_than(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(compare(&args[0], &args[1], "less_than")? == Ordering::Less))
}

fn less_than_or_equal(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(
        compare(&args[0], &args[1], "less_than_or_equal")? != Ordering::Greater,
    ))
}

fn greater_than(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(
        compare(&args[0], &args[1], "greater_than")? == Ordering::Greater,
    ))
}

fn greater_than_or_equal(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(
        compare(&args[0], &args[1], "greater_than_or_equal")? != Ordering::Less,
    ))
}

fn not_equal(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(!values_equal(&args[0], &args[1])))
}

fn is_equal(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(values_equal(&args[0], &args[1])))
}

fn not_null(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(!args[0].is_null()))
}

fn is_null(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(args[0].is_null()))
}

// ============================================================================
// Regex
// ============================================================================

fn compile(pattern: &str) -> Result<Regex, ExpressionError> {
    Regex::new(pattern).map_err(|e| ExpressionError::InvalidRegex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Match anchored at the start of `text`
fn matches_prefix(args: &[Value], function: &str) -> Result<bool, ExpressionError> {
    let pattern = as_str(&args[0], function)?;
    let text = as_str(&args[1], function)?;
    let re = compile(&format!("^(?:{})", pattern))?;
    Ok(re.is_match(text))
}

fn regex_extract(args: &[Value]) -> Result<Value, ExpressionError> {
    let pattern = as_str(&args[0], "regex_extract")?;
    let text = as_str(&args[1], "regex_extract")?;
    compile(pattern)?
        .find(text)
        .map(|m| Value::String(m.as_str().to_string()))
        .ok_or_else(|| ExpressionError::NoMatch(pattern.to_string()))
}

fn regex_match(args: &[Value]) -> Result<Value, ExpressionError> {
    matches_prefix(args, "regex_match").map(Value::Bool)
}

fn regex_not_match(args: &[Value]) -> Result<Value, ExpressionError> {
    matches_prefix(args, "regex_not_match").map(|m| Value::Bool(!m))
}

// ============================================================================
// Collections
// ============================================================================

fn contains_item(item: &Value, container: &Value, function: &str) -> Result<bool, ExpressionError> {
    match container {
        Value::Array(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        Value::String(s) => Ok(s.contains(as_str(item, function)?)),
        Value::Object(map) => Ok(map.contains_key(as_str(item, function)?)),
        other => Err(type_error(
            function,
            format!("{} is not a container", render(other)),
        )),
    }
}

fn contains(args: &[Value]) -> Result<Value, ExpressionError> {
    contains_item(&args[0], &args[1], "contains").map(Value::Bool)
}

fn does_not_contain(args: &[Value]) -> Result<Value, ExpressionError> {
    contains_item(&args[0], &args[1], "does_not_contain").map(|c| Value::Bool(!c))
}

fn len_of(value: &Value, function: &str) -> Result<usize, ExpressionError> {
    match value {
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        Value::String(s) => Ok(s.chars().count()),
        other => Err(type_error(function, format!("{} has no length", render(other)))),
    }
}

fn length(args: &[Value]) -> Result<Value, ExpressionError> {
    len_of(&args[0], "length").map(Value::from)
}

fn is_empty(args: &[Value]) -> Result<Value, ExpressionError> {
    len_of(&args[0], "is_empty").map(|n| Value::Bool(n == 0))
}

fn not_empty(args: &[Value]) -> Result<Value, ExpressionError> {
    len_of(&args[0], "not_empty").map(|n| Value::Bool(n > 0))
}

// ============================================================================
// Math
// ============================================================================

fn add(args: &[Value]) -> Result<Value, ExpressionError> {
    match (&args[0], &args[1]) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
        (a, b) => arithmetic("add", a, b, i64::checked_add, |x, y| x + y),
    }
}

fn sub(args: &[Value]) -> Result<Value, ExpressionError> {
    arithmetic("sub", &args[0], &args[1], i64::checked_sub, |x, y| x - y)
}

/// Upper bound on the byte length of a repeated string
const MAX_REPEAT_LEN: usize = 1 << 20;

fn mul(args: &[Value]) -> Result<Value, ExpressionError> {
    match (&args[0], &args[1]) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            let times = n
                .as_u64()
                .ok_or_else(|| type_error("mul", "string repeat count must be a non-negative integer"))?;
            let too_long = || type_error("mul", format!("repeated string exceeds {} bytes", MAX_REPEAT_LEN));
            let times = usize::try_from(times).map_err(|_| too_long())?;
            match s.len().checked_mul(times) {
                Some(len) if len <= MAX_REPEAT_LEN => Ok(Value::String(s.repeat(times))),
                _ => Err(too_long()),
            }
        }
        (a, b) => arithmetic("mul", a, b, i64::checked_mul, |x, y| x * y),
    }
}

fn div(args: &[Value]) -> Result<Value, ExpressionError> {
    let a = num(&args[0], "div")?.as_f64();
    let b = num(&args[1], "div")?.as_f64();
    if b == 0.0 {
        return Err(ExpressionError::DivisionByZero);
    }
    float_value(a / b, "div")
}

/// Remainder taking the sign of the divisor. `b` must be non-zero.
fn floor_mod(a: i64, b: i64) -> i64 {
    // i64::MIN % -1 is 0 mathematically
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn modulo(args: &[Value]) -> Result<Value, ExpressionError> {
    match (num(&args[0], "mod")?, num(&args[1], "mod")?) {
        (_, Num::Int(0)) => Err(ExpressionError::DivisionByZero),
        (Num::Int(a), Num::Int(b)) => Ok(Value::from(floor_mod(a, b))),
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            if b == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            float_value(((a % b) + b) % b, "mod")
        }
    }
}

fn pow(args: &[Value]) -> Result<Value, ExpressionError> {
    match (num(&args[0], "pow")?, num(&args[1], "pow")?) {
        (Num::Int(base), Num::Int(exp)) if exp >= 0 => {
            match u32::try_from(exp).ok().and_then(|e| base.checked_pow(e)) {
                Some(r) => Ok(Value::from(r)),
                None => float_value((base as f64).powf(exp as f64), "pow"),
            }
        }
        (base, exp) => float_value(base.as_f64().powf(exp.as_f64()), "pow"),
    }
}

fn sum(args: &[Value]) -> Result<Value, ExpressionError> {
    let items = args[0]
        .as_array()
        .ok_or_else(|| type_error("sum", format!("expected a sequence, got {}", render(&args[0]))))?;

    items.iter().try_fold(Value::from(0), |acc, item| {
        arithmetic("sum", &acc, item, i64::checked_add, |x, y| x + y)
    })
}

// ============================================================================
// Transform
// ============================================================================

fn join(args: &[Value]) -> Result<Value, ExpressionError> {
    let items = args[0]
        .as_array()
        .ok_or_else(|| type_error("join", format!("expected a sequence, got {}", render(&args[0]))))?;
    let sep = as_str(&args[1], "join")?;
    Ok(Value::String(
        items.iter().map(render).collect::<Vec<_>>().join(sep),
    ))
}

fn concat(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::String(args.iter().map(render).collect()))
}

/// `str.format`-style positional formatting: `{}`, `{0}`, `{{`, `}}`
fn format_string(args: &[Value]) -> Result<Value, ExpressionError> {
    let template = as_str(&args[0], "format")?;
    let values = &args[1..];

    let mut out = String::with_capacity(template.len());
    let mut next_auto = 0;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => return Err(type_error("format", "unclosed '{' in template")),
                    }
                }
                let index = if field.trim().is_empty() {
                    next_auto += 1;
                    next_auto - 1
                } else {
                    field
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| type_error("format", format!("invalid field '{{{}}}'", field)))?
                };
                let value = values.get(index).ok_or_else(|| {
                    type_error("format", format!("missing argument for field {}", index))
                })?;
                out.push_str(&render(value));
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            other => out.push(other),
        }
    }

    Ok(Value::String(out))
}

// ============================================================================
// Logical
// ============================================================================

fn and(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(is_truthy(&args[0]) && is_truthy(&args[1])))
}

fn or(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(is_truthy(&args[0]) || is_truthy(&args[1])))
}

fn not(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(!is_truthy(&args[0])))
}

// ============================================================================
// Type conversion
// ============================================================================

fn serialize_json(args: &[Value]) -> Result<Value, ExpressionError> {
    serde_json::to_string(&args[0])
        .map(Value::String)
        .map_err(|e| type_error("serialize_json", e))
}

fn from_timestamp(args: &[Value]) -> Result<Value, ExpressionError> {
    let ts = num(&args[0], "from_timestamp")?;
    let unit = as_str(&args[1], "from_timestamp")?;

    let dt: Option<DateTime<Utc>> = match (unit, ts) {
        ("ms", Num::Int(ms)) => DateTime::from_timestamp_millis(ms),
        ("ms", Num::Float(ms)) => DateTime::from_timestamp_millis(ms.trunc() as i64),
        ("s", Num::Int(secs)) => DateTime::from_timestamp(secs, 0),
        ("s", Num::Float(secs)) => {
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round() as u32;
            DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
        }
        (other, _) => {
            return Err(type_error(
                "from_timestamp",
                format!("unit must be 's' or 'ms', got '{}'", other),
            ))
        }
    };

    dt.map(|d| Value::String(d.to_rfc3339()))
        .ok_or_else(|| type_error("from_timestamp", "timestamp out of range"))
}

fn to_int(args: &[Value]) -> Result<Value, ExpressionError> {
    match &args[0] {
        Value::Number(_) => match num(&args[0], "to_int")? {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => Ok(Value::from(f.trunc() as i64)),
        },
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| type_error("to_int", format!("cannot convert '{}'", s))),
        other => Err(type_error("to_int", format!("cannot convert {}", render(other)))),
    }
}

fn to_float(args: &[Value]) -> Result<Value, ExpressionError> {
    let f = match &args[0] {
        Value::Number(_) => num(&args[0], "to_float")?.as_f64(),
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| type_error("to_float", format!("cannot convert '{}'", s)))?,
        other => return Err(type_error("to_float", format!("cannot convert {}", render(other)))),
    };
    float_value(f, "to_float")
}

fn to_str(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::String(render(&args[0])))
}

fn to_bool(args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(Value::Bool(match &args[0] {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1"),
        other => is_truthy(other),
    }))
}
