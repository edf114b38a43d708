//! Metadata filter predicate tree (spec §4.3): a small boolean expression
//! language evaluated against a record's JSON-shaped metadata payload.

use serde_json::Value;

/// A single comparison or logical-combinator node.
///
/// Covers equality, ordering, membership, string matching, and null checks
/// (`Eq`, `Neq`, `Gt`, `Gte`, `Lt`, `Lte`, `In`, `NotIn`, `Contains`,
/// `NotContains`, `Regex`, `StartsWith`, `EndsWith`, `IsNull`, `IsNotNull`),
/// combined with `And`/`Or`/`Not`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { field: String, value: Value },
    Neq { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    Contains { field: String, value: String },
    NotContains { field: String, value: String },
    In { field: String, values: Vec<Value> },
    NotIn { field: String, values: Vec<Value> },
    Regex { field: String, pattern: String },
    StartsWith { field: String, prefix: String },
    EndsWith { field: String, suffix: String },
    IsNull { field: String },
    IsNotNull { field: String },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq { field: field.into(), value: value.into() }
    }

    #[must_use]
    pub fn neq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Neq { field: field.into(), value: value.into() }
    }

    #[must_use]
    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Contains { field: field.into(), value: value.into() }
    }

    #[must_use]
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull { field: field.into() }
    }

    #[must_use]
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::IsNotNull { field: field.into() }
    }

    #[must_use]
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::And(conditions)
    }

    #[must_use]
    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::Or(conditions)
    }

    #[must_use]
    pub fn not(condition: Condition) -> Self {
        Self::Not(Box::new(condition))
    }

    /// Evaluates this condition against `payload`. A missing field is always
    /// `false` for every comparison operator (never an error, never treated
    /// as wildcard-match) except `IsNull`, which treats "missing" the same
    /// as "present and null".
    #[must_use]
    pub fn evaluate(&self, payload: &Value) -> bool {
        match self {
            Self::Eq { field, value } => field_eq(payload, field, value),
            Self::Neq { field, value } => !field_eq(payload, field, value),
            Self::Gt { field, value } => compare(payload, field, value, |o| o == std::cmp::Ordering::Greater),
            Self::Gte { field, value } => {
                compare(payload, field, value, |o| o != std::cmp::Ordering::Less)
            }
            Self::Lt { field, value } => compare(payload, field, value, |o| o == std::cmp::Ordering::Less),
            Self::Lte { field, value } => {
                compare(payload, field, value, |o| o != std::cmp::Ordering::Greater)
            }
            Self::Contains { field, value } => {
                get_str(payload, field).is_some_and(|s| s.contains(value.as_str()))
            }
            Self::NotContains { field, value } => {
                !get_str(payload, field).is_some_and(|s| s.contains(value.as_str()))
            }
            Self::In { field, values } => get_field(payload, field).is_some_and(|v| values.contains(v)),
            Self::NotIn { field, values } => {
                !get_field(payload, field).is_some_and(|v| values.contains(v))
            }
            Self::Regex { field, pattern } => get_str(payload, field).is_some_and(|s| regex_match(s, pattern)),
            Self::StartsWith { field, prefix } => {
                get_str(payload, field).is_some_and(|s| s.starts_with(prefix.as_str()))
            }
            Self::EndsWith { field, suffix } => {
                get_str(payload, field).is_some_and(|s| s.ends_with(suffix.as_str()))
            }
            Self::IsNull { field } => get_field(payload, field).is_none_or(Value::is_null),
            Self::IsNotNull { field } => get_field(payload, field).is_some_and(|v| !v.is_null()),
            Self::And(children) => children.iter().all(|c| c.evaluate(payload)),
            Self::Or(children) => children.iter().any(|c| c.evaluate(payload)),
            Self::Not(inner) => !inner.evaluate(payload),
        }
    }
}

fn get_field<'a>(payload: &'a Value, field: &str) -> Option<&'a Value> {
    payload.as_object()?.get(field)
}

fn get_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    get_field(payload, field)?.as_str()
}

fn field_eq(payload: &Value, field: &str, value: &Value) -> bool {
    get_field(payload, field) == Some(value)
}

fn compare(
    payload: &Value,
    field: &str,
    value: &Value,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let Some(actual) = get_field(payload, field) else {
        return false;
    };
    numeric_ordering(actual, value).is_some_and(accept)
}

fn numeric_ordering(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a = a.as_f64()?;
    let b = b.as_f64()?;
    a.partial_cmp(&b)
}

/// An invalid pattern never matches, same as a missing field for every other
/// operator, rather than surfacing a parse error out of `evaluate`.
fn regex_match(text: &str, pattern: &str) -> bool {
    regex::Regex::new(pattern).is_ok_and(|re| re.is_match(text))
}

/// Parses an operator name from an untyped source (e.g. JSON filter specs),
/// normalizing unrecognized strings to `"eq"` rather than erroring, so a
/// caller building a filter from loosely-typed input degrades gracefully
/// instead of rejecting the whole query.
#[must_use]
pub fn normalize_operator(op: &str) -> &'static str {
    match op {
        "neq" | "ne" => "neq",
        "gt" => "gt",
        "gte" | "ge" => "gte",
        "lt" => "lt",
        "lte" | "le" => "lte",
        "contains" => "contains",
        "not_contains" | "notcontains" => "not_contains",
        "in" => "in",
        "not_in" | "notin" => "not_in",
        "regex" => "regex",
        "starts_with" | "startswith" => "starts_with",
        "ends_with" | "endswith" => "ends_with",
        "is_null" => "is_null",
        "is_not_null" => "is_not_null",
        _ => "eq",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({ "category": "fruit", "price": 3, "name": "banana", "deleted": null })
    }

    #[test]
    fn eq_matches() {
        assert!(Condition::eq("category", "fruit").evaluate(&payload()));
        assert!(!Condition::eq("category", "veg").evaluate(&payload()));
    }

    #[test]
    fn missing_field_is_false_for_comparisons() {
        assert!(!Condition::eq("missing", "x").evaluate(&payload()));
        assert!(!Condition::Gt {
            field: "missing".into(),
            value: json!(1)
        }
        .evaluate(&payload()));
    }

    #[test]
    fn numeric_ordering_ops() {
        let p = payload();
        assert!(Condition::Gt { field: "price".into(), value: json!(2) }.evaluate(&p));
        assert!(!Condition::Gt { field: "price".into(), value: json!(3) }.evaluate(&p));
        assert!(Condition::Gte { field: "price".into(), value: json!(3) }.evaluate(&p));
        assert!(Condition::Lte { field: "price".into(), value: json!(3) }.evaluate(&p));
        assert!(Condition::Lt { field: "price".into(), value: json!(4) }.evaluate(&p));
    }

    #[test]
    fn contains_and_not_contains() {
        let p = payload();
        assert!(Condition::contains("name", "nan").evaluate(&p));
        assert!(!Condition::NotContains { field: "name".into(), value: "nan".into() }.evaluate(&p));
    }

    #[test]
    fn in_and_not_in() {
        let p = payload();
        assert!(Condition::In { field: "category".into(), values: vec![json!("fruit"), json!("veg")] }
            .evaluate(&p));
        assert!(!Condition::NotIn { field: "category".into(), values: vec![json!("fruit")] }.evaluate(&p));
    }

    #[test]
    fn starts_ends_with() {
        let p = payload();
        assert!(Condition::StartsWith { field: "name".into(), prefix: "ban".into() }.evaluate(&p));
        assert!(Condition::EndsWith { field: "name".into(), suffix: "ana".into() }.evaluate(&p));
    }

    #[test]
    fn is_null_treats_missing_as_null() {
        assert!(Condition::is_null("deleted").evaluate(&payload()));
        assert!(Condition::is_null("totally_missing").evaluate(&payload()));
        assert!(Condition::is_not_null("category").evaluate(&payload()));
    }

    #[test]
    fn and_or_not_short_circuit_and_combine() {
        let p = payload();
        let and = Condition::and(vec![Condition::eq("category", "fruit"), Condition::eq("price", 3)]);
        assert!(and.evaluate(&p));
        let or = Condition::or(vec![Condition::eq("category", "veg"), Condition::eq("price", 3)]);
        assert!(or.evaluate(&p));
        let not = Condition::not(Condition::eq("category", "veg"));
        assert!(not.evaluate(&p));
    }

    #[test]
    fn regex_matching() {
        assert!(Condition::Regex { field: "name".into(), pattern: "^ban.*".into() }.evaluate(&payload()));
        assert!(Condition::Regex { field: "name".into(), pattern: "b.nana".into() }.evaluate(&payload()));
        assert!(!Condition::Regex { field: "name".into(), pattern: "^apple$".into() }.evaluate(&payload()));
    }

    #[test]
    fn regex_invalid_pattern_never_matches() {
        assert!(!Condition::Regex { field: "name".into(), pattern: "(unclosed".into() }.evaluate(&payload()));
    }

    #[test]
    fn normalize_operator_unknown_defaults_to_eq() {
        assert_eq!(normalize_operator("bogus"), "eq");
        assert_eq!(normalize_operator("gte"), "gte");
        assert_eq!(normalize_operator("ge"), "gte");
    }
}
