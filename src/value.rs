//! Variable maps and helpers for reading JSON values loosely.

use serde_json::{Map, Value};

/// Variable map shared by chains, steps and templates.
///
/// `serde_json::Map` is ordered, so two maps with equal contents serialize to
/// identical bytes.
pub type Variables = Map<String, Value>;

/// Something variables can be looked up in by root name.
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Lookup for Variables {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Variables plus one locally bound name (a loop alias).
pub struct Scope<'a> {
    parent: &'a dyn Lookup,
    name: &'a str,
    value: &'a Value,
}

impl<'a> Scope<'a> {
    pub fn bind(parent: &'a dyn Lookup, name: &'a str, value: &'a Value) -> Self {
        Self {
            parent,
            name,
            value,
        }
    }
}

impl Lookup for Scope<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        if name == self.name {
            Some(self.value)
        } else {
            self.parent.lookup(name)
        }
    }
}

/// Resolve a dotted path (`client.contact.email`, `items.0.name`).
pub fn lookup_path<'a, S: AsRef<str>>(scope: &'a dyn Lookup, path: &[S]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = scope.lookup(first.as_ref())?;

    for segment in rest {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Truthiness: null, false, 0, NaN and "" are false; everything else is true.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Numeric view of a value; numeric strings count.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Loose equality: numbers compare numerically, everything else by text.
pub fn loosely_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => false,
        (Some(l), Some(r)) => match (as_number(l), as_number(r)) {
            (Some(a), Some(b)) if l.is_number() || r.is_number() => a == b,
            _ => value_to_string(l) == value_to_string(r),
        },
    }
}

/// Display form used when a value is substituted into text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_lookup_nested_path() {
        let v = vars(json!({"client": {"contact": {"email": "a@b.c"}}, "items": [{"name": "x"}]}));
        assert_eq!(
            lookup_path(&v, &["client", "contact", "email"]),
            Some(&json!("a@b.c"))
        );
        assert_eq!(lookup_path(&v, &["items", "0", "name"]), Some(&json!("x")));
        assert_eq!(lookup_path(&v, &["client", "missing"]), None);
        assert_eq!(lookup_path(&v, &["items", "name"]), None);
    }

    #[test]
    fn test_scope_shadows_parent() {
        let v = vars(json!({"it": 1, "other": 2}));
        let bound = json!({"name": "a"});
        let scope = Scope::bind(&v, "it", &bound);
        assert_eq!(lookup_path(&scope, &["it", "name"]), Some(&json!("a")));
        assert_eq!(scope.lookup("other"), Some(&json!(2)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(is_truthy(Some(&json!("no"))));
        assert!(is_truthy(Some(&json!([]))));
    }

    #[test]
    fn test_loose_equality() {
        assert!(loosely_equal(Some(&json!(5)), Some(&json!("5"))));
        assert!(loosely_equal(Some(&json!(true)), Some(&json!("true"))));
        assert!(loosely_equal(Some(&json!(2.0)), Some(&json!(2))));
        assert!(!loosely_equal(Some(&json!("a")), None));
        assert!(loosely_equal(None, Some(&Value::Null)));
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!(5000.0)), "5000");
        assert_eq!(value_to_string(&json!(2.5)), "2.5");
        assert_eq!(value_to_string(&json!([1, 2])), "[1,2]");
        assert_eq!(value_to_string(&Value::Null), "");
    }
}
