// src/expression.rs
// Aggregation expressions: field references, literals, arithmetic

use serde_json::{Map, Number, Value};

use crate::document::resolve_path;
use crate::error::{Result, ShelfError};

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `"$path"`; missing resolves to null
    Field(String),
    Literal(Value),
    /// `{out: expr, ...}` evaluated per key (compound group keys)
    Object(Vec<(String, Expr)>),
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
}

/// Numeric operand, integers kept exact
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

    fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        }
    }
}

impl Expr {
    pub fn from_json(json: &Value) -> Result<Self> {
        match json {
            Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                if path.is_empty() {
                    return Err(ShelfError::AggregationError("empty field reference '$'".into()));
                }
                Ok(Expr::Field(path.to_string()))
            }
            Value::Object(map) => match map.iter().next() {
                Some((op, arg)) if map.len() == 1 && op.starts_with('$') => Self::parse_operator(op, arg),
                _ => {
                    if let Some(key) = map.keys().find(|k| k.starts_with('$')) {
                        return Err(ShelfError::AggregationError(format!(
                            "operator '{}' must be the only key of its object",
                            key
                        )));
                    }
                    let fields = map
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), Self::from_json(v)?)))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Expr::Object(fields))
                }
            },
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    fn parse_operator(op: &str, arg: &Value) -> Result<Self> {
        match op {
            "$literal" => Ok(Expr::Literal(arg.clone())),
            "$add" => Ok(Expr::Add(Self::parse_args(op, arg, None)?)),
            "$multiply" => Ok(Expr::Multiply(Self::parse_args(op, arg, None)?)),
            "$subtract" | "$divide" | "$mod" => {
                let mut args = Self::parse_args(op, arg, Some(2))?.into_iter();
                let (Some(lhs), Some(rhs)) = (args.next(), args.next()) else {
                    return Err(ShelfError::AggregationError(format!("{} requires exactly 2 arguments", op)));
                };
                let (lhs, rhs) = (Box::new(lhs), Box::new(rhs));
                Ok(match op {
                    "$subtract" => Expr::Subtract(lhs, rhs),
                    "$divide" => Expr::Divide(lhs, rhs),
                    _ => Expr::Mod(lhs, rhs),
                })
            }
            _ => Err(ShelfError::AggregationError(format!("Unknown expression operator: {}", op))),
        }
    }

    fn parse_args(op: &str, arg: &Value, arity: Option<usize>) -> Result<Vec<Expr>> {
        let items = arg
            .as_array()
            .ok_or_else(|| ShelfError::AggregationError(format!("{} requires an array", op)))?;
        match arity {
            Some(n) if items.len() != n => {
                return Err(ShelfError::AggregationError(format!(
                    "{} requires exactly {} arguments",
                    op, n
                )));
            }
            None if items.is_empty() => {
                return Err(ShelfError::AggregationError(format!("{} requires at least one argument", op)));
            }
            _ => {}
        }
        items.iter().map(Self::from_json).collect()
    }

    /// Evaluate against one document
    pub fn eval(&self, doc: &Value) -> Result<Value> {
        match self {
            Expr::Field(path) => Ok(resolve_path(doc, path).cloned().unwrap_or(Value::Null)),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, expr) in fields {
                    out.insert(key.clone(), expr.eval(doc)?);
                }
                Ok(Value::Object(out))
            }
            Expr::Add(args) => Self::fold(args, doc, "$add", Num::Int(0), |a, b| match (a, b) {
                (Num::Int(x), Num::Int(y)) => x.checked_add(y).map_or(Num::Float(x as f64 + y as f64), Num::Int),
                _ => Num::Float(a.as_f64() + b.as_f64()),
            }),
            Expr::Multiply(args) => Self::fold(args, doc, "$multiply", Num::Int(1), |a, b| match (a, b) {
                (Num::Int(x), Num::Int(y)) => x.checked_mul(y).map_or(Num::Float(x as f64 * y as f64), Num::Int),
                _ => Num::Float(a.as_f64() * b.as_f64()),
            }),
            Expr::Subtract(lhs, rhs) => Self::binary(lhs, rhs, doc, "$subtract", |a, b| match (a, b) {
                (Num::Int(x), Num::Int(y)) => {
                    Ok(x.checked_sub(y).map_or(Num::Float(x as f64 - y as f64), Num::Int))
                }
                _ => Ok(Num::Float(a.as_f64() - b.as_f64())),
            }),
            Expr::Divide(lhs, rhs) => Self::binary(lhs, rhs, doc, "$divide", |a, b| {
                if b.as_f64() == 0.0 {
                    return Err(ShelfError::AggregationError("$divide by zero".into()));
                }
                Ok(match (a, b) {
                    (Num::Int(x), Num::Int(y)) if x.checked_rem(y) == Some(0) => {
                        x.checked_div(y).map_or(Num::Float(x as f64 / y as f64), Num::Int)
                    }
                    _ => Num::Float(a.as_f64() / b.as_f64()),
                })
            }),
            Expr::Mod(lhs, rhs) => Self::binary(lhs, rhs, doc, "$mod", |a, b| {
                if b.as_f64() == 0.0 {
                    return Err(ShelfError::AggregationError("$mod by zero".into()));
                }
                Ok(match (a, b) {
                    (Num::Int(x), Num::Int(y)) => x.checked_rem_euclid(y).map_or(Num::Int(0), Num::Int),
                    _ => Num::Float(a.as_f64().rem_euclid(b.as_f64())),
                })
            }),
        }
    }

    /// Numeric operand; `None` for null/missing
    fn operand(expr: &Expr, doc: &Value, op: &str) -> Result<Option<Num>> {
        match expr.eval(doc)? {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(Some(match n.as_i64() {
                Some(i) => Num::Int(i),
                None => Num::Float(n.as_f64().unwrap_or(f64::NAN)),
            })),
            other => Err(ShelfError::TypeMismatch(format!("{} only supports numeric types, got {}", op, other))),
        }
    }

    fn fold(args: &[Expr], doc: &Value, op: &str, init: Num, f: impl Fn(Num, Num) -> Num) -> Result<Value> {
        let mut acc = init;
        let mut saw_null = false;
        for arg in args {
            match Self::operand(arg, doc, op)? {
                Some(n) => acc = f(acc, n),
                None => saw_null = true,
            }
        }
        Ok(if saw_null { Value::Null } else { acc.into_value() })
    }

    fn binary(
        lhs: &Expr,
        rhs: &Expr,
        doc: &Value,
        op: &str,
        f: impl Fn(Num, Num) -> Result<Num>,
    ) -> Result<Value> {
        let a = Self::operand(lhs, doc, op)?;
        let b = Self::operand(rhs, doc, op)?;
        match (a, b) {
            (Some(a), Some(b)) => Ok(f(a, b)?.into_value()),
            _ => Ok(Value::Null),
        }
    }

    /// Field path when the expression is a bare reference
    pub fn field_path(&self) -> Option<&str> {
        match self {
            Expr::Field(path) => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: Value, doc: Value) -> Result<Value> {
        Expr::from_json(&expr)?.eval(&doc)
    }

    #[test]
    fn test_field_reference() {
        let doc = json!({"title": "Dune", "publisher": {"city": "Philadelphia"}});
        assert_eq!(eval(json!("$title"), doc.clone()).unwrap(), json!("Dune"));
        assert_eq!(eval(json!("$publisher.city"), doc.clone()).unwrap(), json!("Philadelphia"));
        assert_eq!(eval(json!("$missing"), doc).unwrap(), Value::Null);
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval(json!(5), json!({})).unwrap(), json!(5));
        assert_eq!(eval(json!("plain"), json!({})).unwrap(), json!("plain"));
        assert_eq!(eval(json!({"$literal": "$notAField"}), json!({})).unwrap(), json!("$notAField"));
    }

    #[test]
    fn test_decade_bucketing() {
        let decade = json!({"$subtract": ["$published_year", {"$mod": ["$published_year", 10]}]});
        assert_eq!(eval(decade.clone(), json!({"published_year": 1997})).unwrap(), json!(1990));
        assert_eq!(eval(decade.clone(), json!({"published_year": 2010})).unwrap(), json!(2010));
        assert_eq!(eval(decade, json!({"published_year": -5})).unwrap(), json!(-10));
    }

    #[test]
    fn test_integer_results_stay_integers() {
        let doc = json!({"a": 7, "b": 2});
        assert_eq!(eval(json!({"$add": ["$a", "$b", 1]}), doc.clone()).unwrap(), json!(10));
        assert_eq!(eval(json!({"$multiply": ["$a", "$b"]}), doc.clone()).unwrap(), json!(14));
        assert_eq!(eval(json!({"$divide": [8, "$b"]}), doc.clone()).unwrap(), json!(4));
        assert_eq!(eval(json!({"$divide": ["$a", "$b"]}), doc).unwrap(), json!(3.5));
    }

    #[test]
    fn test_float_arithmetic() {
        let doc = json!({"price": 12.5, "qty": 2});
        assert_eq!(eval(json!({"$multiply": ["$price", "$qty"]}), doc.clone()).unwrap(), json!(25.0));
        assert_eq!(eval(json!({"$mod": [7.5, 2]}), doc).unwrap(), json!(1.5));
    }

    #[test]
    fn test_null_operand_yields_null() {
        let doc = json!({"a": 10});
        assert_eq!(eval(json!({"$add": ["$a", "$missing"]}), doc.clone()).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$subtract": [null, "$a"]}), doc).unwrap(), Value::Null);
    }

    #[test]
    fn test_non_numeric_operand_is_type_mismatch() {
        let err = eval(json!({"$add": ["$title", 1]}), json!({"title": "Dune"})).unwrap_err();
        assert!(matches!(err, ShelfError::TypeMismatch(_)));
    }

    #[test]
    fn test_division_by_zero_is_rejected() {
        let err = eval(json!({"$divide": [1, 0]}), json!({})).unwrap_err();
        assert!(matches!(err, ShelfError::AggregationError(_)));
        assert!(eval(json!({"$mod": ["$a", 0]}), json!({"a": 3})).is_err());
    }

    #[test]
    fn test_object_expression() {
        let key = json!({"genre": "$genre", "decade": {"$subtract": ["$y", {"$mod": ["$y", 10]}]}});
        let value = eval(key, json!({"genre": "Fiction", "y": 1984})).unwrap();
        assert_eq!(value, json!({"genre": "Fiction", "decade": 1980}));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::from_json(&json!({"$pow": [2, 3]})).is_err());
        assert!(Expr::from_json(&json!({"$subtract": [1]})).is_err());
        assert!(Expr::from_json(&json!({"$add": 1})).is_err());
        assert!(Expr::from_json(&json!({"$add": [1], "x": 2})).is_err());
        assert!(Expr::from_json(&json!("$")).is_err());
    }
}
