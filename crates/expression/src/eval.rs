//! Expression evaluation against a path resolver.

use serde_json::Value;

use crate::ExprError;
use crate::ast::{BinaryOp, Expr};
use crate::parser::parse;

/// Evaluation recursion cap.
const MAX_DEPTH: usize = 64;

/// Resolves dotted context paths to values.
pub trait PathResolver {
    /// Resolve a path, `None` when absent.
    fn resolve(&self, path: &str) -> Option<Value>;
}

/// Resolver over a flat key map, descending into stored JSON values.
pub struct MapResolver<'a> {
    map: &'a serde_json::Map<String, Value>,
}

impl<'a> MapResolver<'a> {
    /// Wrap a map.
    #[must_use]
    pub fn new(map: &'a serde_json::Map<String, Value>) -> Self {
        Self { map }
    }
}

impl PathResolver for MapResolver<'_> {
    fn resolve(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.map.get(path) {
            return Some(value.clone());
        }
        for (split, _) in path.rmatch_indices('.') {
            let (prefix, rest) = (&path[..split], &path[split + 1..]);
            if let Some(base) = self.map.get(prefix) {
                return rest
                    .split('.')
                    .try_fold(base, |value, segment| match value {
                        Value::Object(map) => map.get(segment),
                        Value::Array(items) => {
                            segment.parse::<usize>().ok().and_then(|i| items.get(i))
                        }
                        _ => None,
                    })
                    .cloned();
            }
        }
        None
    }
}

/// JSON truthiness: null and `false` are false; numbers are true when
/// non-zero; strings, arrays and objects are true when non-empty.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Parse and evaluate an expression.
///
/// # Errors
///
/// Parse errors, unknown paths, type errors, or excessive nesting.
pub fn evaluate(src: &str, resolver: &dyn PathResolver) -> Result<Value, ExprError> {
    let expr = parse(src)?;
    eval(&expr, resolver, 0)
}

/// Parse and evaluate an expression down to a boolean.
///
/// # Errors
///
/// Same as [`evaluate`]. The engine treats any error as `false` after
/// logging it.
pub fn evaluate_guard(src: &str, resolver: &dyn PathResolver) -> Result<bool, ExprError> {
    Ok(truthy(&evaluate(src, resolver)?))
}

fn eval(expr: &Expr, resolver: &dyn PathResolver, depth: usize) -> Result<Value, ExprError> {
    if depth > MAX_DEPTH {
        return Err(ExprError::TooDeep);
    }
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => resolver
            .resolve(path)
            .ok_or_else(|| ExprError::UnknownPath(path.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, resolver, depth + 1)?))),
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, resolver, depth),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    resolver: &dyn PathResolver,
    depth: usize,
) -> Result<Value, ExprError> {
    match op {
        BinaryOp::And => {
            let lhs = eval(left, resolver, depth + 1)?;
            if !truthy(&lhs) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(right, resolver, depth + 1)?)))
        }
        BinaryOp::Or => {
            let lhs = eval(left, resolver, depth + 1)?;
            if truthy(&lhs) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(right, resolver, depth + 1)?)))
        }
        BinaryOp::Eq | BinaryOp::Ne => {
            let lhs = eval(left, resolver, depth + 1)?;
            let rhs = eval(right, resolver, depth + 1)?;
            let equal = values_equal(&lhs, &rhs);
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let lhs = eval(left, resolver, depth + 1)?;
            let rhs = eval(right, resolver, depth + 1)?;
            let ordering = compare(&lhs, &rhs)?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| ExprError::Type("cannot order NaN".into()))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(ExprError::Type(format!(
            "cannot order {} against {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
