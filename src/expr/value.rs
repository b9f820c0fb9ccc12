use super::ExprError;

/// Runtime value of a symbol or literal. Metric values arrive with dynamic
/// types, so every leaf carries its own tag and coercion happens at
/// comparison time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Seconds.
    Duration(f64),
    List(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    fn is_equality(&self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Duration(_) => "duration",
            Value::List(_) => "list",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Duration(d) => *d != 0.0,
            Value::List(items) => !items.is_empty(),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::Null,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Parse a duration literal: a number with an optional `s`/`m`/`h`/`d`
/// suffix, in seconds.
pub fn parse_duration(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (number, multiplier) = match raw.char_indices().last() {
        Some((idx, 's')) => (&raw[..idx], 1.0),
        Some((idx, 'm')) => (&raw[..idx], 60.0),
        Some((idx, 'h')) => (&raw[..idx], 3600.0),
        Some((idx, 'd')) => (&raw[..idx], 86400.0),
        _ => (raw, 1.0),
    };
    number.parse::<f64>().ok().map(|n| n * multiplier)
}

fn incomparable(op: CmpOp, lhs: &Value, rhs: &Value) -> ExprError {
    ExprError::Incomparable {
        op: op.symbol(),
        lhs: lhs.kind(),
        rhs: rhs.kind(),
    }
}

/// Compare two values under the coercion rules: int and float mix freely,
/// durations compare to duration-shaped strings, strings support equality
/// only, and anything against Null is false without raising.
pub fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    if matches!(lhs, Value::Null) || matches!(rhs, Value::Null) {
        return Ok(false);
    }

    match (lhs, rhs) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = lhs.as_number().expect("numeric");
            let b = rhs.as_number().expect("numeric");
            Ok(cmp_f64(op, a, b))
        }
        (Value::Duration(a), Value::Duration(b)) => Ok(cmp_f64(op, *a, *b)),
        (Value::Duration(a), Value::Str(s)) => match parse_duration(s) {
            Some(b) => Ok(cmp_f64(op, *a, b)),
            None => Err(incomparable(op, lhs, rhs)),
        },
        (Value::Str(s), Value::Duration(b)) => match parse_duration(s) {
            Some(a) => Ok(cmp_f64(op, a, *b)),
            None => Err(incomparable(op, lhs, rhs)),
        },
        (Value::Str(a), Value::Str(b)) if op.is_equality() => {
            Ok(apply_eq(op, a == b))
        }
        (Value::Bool(a), Value::Bool(b)) if op.is_equality() => Ok(apply_eq(op, a == b)),
        (Value::List(a), Value::List(b)) if op.is_equality() => Ok(apply_eq(op, a == b)),
        _ => Err(incomparable(op, lhs, rhs)),
    }
}

/// Membership: an item in a list, or a substring in a string.
pub fn contains(needle: &Value, haystack: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::Null => Ok(false),
        Value::List(items) => Ok(items
            .iter()
            .any(|item| compare(CmpOp::Eq, needle, item).unwrap_or(false))),
        Value::Str(text) => match needle {
            Value::Str(sub) => Ok(text.contains(sub.as_str())),
            Value::Null => Ok(false),
            _ => Err(incomparable(CmpOp::Eq, needle, haystack)),
        },
        _ => Err(ExprError::Incomparable {
            op: "in",
            lhs: needle.kind(),
            rhs: haystack.kind(),
        }),
    }
}

fn cmp_f64(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

fn apply_eq(op: CmpOp, equal: bool) -> bool {
    match op {
        CmpOp::Eq => equal,
        CmpOp::Ne => !equal,
        _ => unreachable!("equality-only path"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(2).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Str("x".into()).truthy());
        assert!(!Value::List(vec![]).truthy());
        assert!(Value::List(vec![Value::Int(1)]).truthy());
    }

    #[test]
    fn test_numeric_coercion() {
        assert!(compare(CmpOp::Lt, &Value::Int(3), &Value::Float(3.5)).unwrap());
        assert!(compare(CmpOp::Eq, &Value::Int(3), &Value::Float(3.0)).unwrap());
        assert!(!compare(CmpOp::Gt, &Value::Float(1.0), &Value::Int(2)).unwrap());
    }

    #[test]
    fn test_null_comparisons_are_false() {
        assert!(!compare(CmpOp::Gt, &Value::Null, &Value::Int(1)).unwrap());
        assert!(!compare(CmpOp::Lt, &Value::Float(1.0), &Value::Null).unwrap());
        assert!(!compare(CmpOp::Eq, &Value::Null, &Value::Null).unwrap());
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(parse_duration("25s"), Some(25.0));
        assert_eq!(parse_duration("5m"), Some(300.0));
        assert_eq!(parse_duration("2h"), Some(7200.0));
        assert_eq!(parse_duration("1d"), Some(86400.0));
        assert_eq!(parse_duration("30"), Some(30.0));
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_duration_vs_string() {
        assert!(compare(
            CmpOp::Gt,
            &Value::Duration(27.0),
            &Value::Str("25s".into())
        )
        .unwrap());
        assert!(!compare(
            CmpOp::Gt,
            &Value::Duration(23.0),
            &Value::Str("25s".into())
        )
        .unwrap());
        assert!(compare(
            CmpOp::Lt,
            &Value::Str("30s".into()),
            &Value::Duration(60.0)
        )
        .unwrap());
    }

    #[test]
    fn test_string_equality_only() {
        assert!(compare(
            CmpOp::Eq,
            &Value::Str("a".into()),
            &Value::Str("a".into())
        )
        .unwrap());
        assert!(compare(
            CmpOp::Lt,
            &Value::Str("a".into()),
            &Value::Str("b".into())
        )
        .is_err());
    }

    #[test]
    fn test_incompatible_kinds() {
        assert!(compare(CmpOp::Eq, &Value::Int(1), &Value::Str("1".into())).is_err());
        assert!(compare(CmpOp::Lt, &Value::Bool(true), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_membership() {
        let list = Value::List(vec![Value::Str("name".into()), Value::Str("world".into())]);
        assert!(contains(&Value::Str("world".into()), &list).unwrap());
        assert!(!contains(&Value::Str("other".into()), &list).unwrap());
        assert!(contains(&Value::Str("orl".into()), &Value::Str("world".into())).unwrap());
        assert!(contains(&Value::Int(1), &Value::Int(2)).is_err());
    }
}
