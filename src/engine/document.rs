//! Helpers for projecting document paths into SQL values.

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

use crate::engine::spec::IndexType;
use crate::{Error, Result};

/// Returns the value at the dot-delimited `path` of `doc`.
///
/// When an intermediate value is an array, the remaining path is projected
/// into each element and the results are collected into an array.
pub fn project(doc: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(doc.clone());
    }
    project_parts(doc, &path.split('.').collect::<Vec<_>>())
}

fn project_parts(doc: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(doc.clone());
    };
    match doc {
        Value::Object(map) => {
            let child = map.get(*head)?;
            project_parts(child, rest)
        }
        Value::Array(items) => {
            let projected: Vec<Value> = items
                .iter()
                .filter_map(|item| project_parts(item, parts))
                .collect();
            Some(Value::Array(projected))
        }
        _ => None,
    }
}

/// Converts a projected value into the stored value of an index column.
pub fn to_column_value(value: Option<&Value>, index_type: IndexType) -> SqlValue {
    let Some(value) = value else {
        return SqlValue::Null;
    };
    match index_type {
        IndexType::String | IndexType::FullText => match value {
            Value::Null => SqlValue::Null,
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
        IndexType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(SqlValue::Integer)
                .unwrap_or(SqlValue::Null),
            Value::String(s) => s.trim().parse::<i64>().map(SqlValue::Integer).unwrap_or(SqlValue::Null),
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            _ => SqlValue::Null,
        },
        IndexType::Floating => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
            Value::String(s) => s.trim().parse::<f64>().map(SqlValue::Real).unwrap_or(SqlValue::Null),
            _ => SqlValue::Null,
        },
        IndexType::Json1 => SqlValue::Null,
    }
}

/// Converts a query key into a bound statement argument.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Ensures `element` is a JSON object and returns its map.
pub fn as_object_mut(element: &mut Value) -> Result<&mut Map<String, Value>> {
    match element {
        Value::Object(map) => Ok(map),
        other => Err(Error::MalformedDocument(format!(
            "soup elements must be JSON objects, got {}",
            type_name(other)
        ))),
    }
}

/// Parses a stored document body.
pub fn parse_document(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_nested_and_arrays() {
        let doc = json!({"a": {"b": {"c": 5}}, "items": [{"n": 1}, {"n": 2}, {"x": 0}]});
        assert_eq!(project(&doc, "a.b.c"), Some(json!(5)));
        assert_eq!(project(&doc, "a.missing"), None);
        assert_eq!(project(&doc, "items.n"), Some(json!([1, 2])));
        assert_eq!(project(&doc, "a.b.c.d"), None);
    }

    #[test]
    fn test_column_values() {
        assert_eq!(to_column_value(Some(&json!("x")), IndexType::String), SqlValue::Text("x".into()));
        assert_eq!(to_column_value(Some(&json!(12)), IndexType::String), SqlValue::Text("12".into()));
        assert_eq!(to_column_value(Some(&json!("42")), IndexType::Integer), SqlValue::Integer(42));
        assert_eq!(to_column_value(Some(&json!(2.5)), IndexType::Floating), SqlValue::Real(2.5));
        assert_eq!(to_column_value(Some(&json!("abc")), IndexType::Integer), SqlValue::Null);
        assert_eq!(to_column_value(None, IndexType::String), SqlValue::Null);
    }

    #[test]
    fn test_as_object_mut() {
        let mut doc = json!([1]);
        assert!(matches!(as_object_mut(&mut doc), Err(Error::MalformedDocument(_))));
        let mut doc = json!({"a": 1});
        assert!(as_object_mut(&mut doc).is_ok());
    }
}
