//! Named pure transform functions applied by `Transform` field mappings.
//!
//! Each function takes the raw value plus the mapping's JSON parameters and
//! either produces a value or fails with a `Transform` error. Failures never
//! guess a fallback; the engine decides between skip and escalation.

use chrono::{NaiveDate, NaiveDateTime};

use crate::core::Value;
use crate::error::{MigrateError, Result};

/// True-ish tokens accepted by `to_boolean`.
const TRUE_TOKENS: &[&str] = &["true", "1", "yes", "y", "t", "si"];

/// Apply a named transform function.
pub fn apply(name: &str, value: Value, params: &serde_json::Value) -> Result<Value> {
    match name {
        "uppercase" => Ok(Value::Text(value.to_text().to_uppercase())),
        "lowercase" => Ok(Value::Text(value.to_text().to_lowercase())),
        "trim" => Ok(Value::Text(value.to_text().trim().to_string())),
        "strip_markup" => Ok(Value::Text(strip_markup(&value.to_text()))),
        "to_date" => to_date(value, params),
        "to_datetime" => to_datetime(value, params),
        "to_float" => value
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| err(name, &value, "not numeric")),
        "to_int" => value
            .as_f64()
            .map(|f| Value::Int(f as i64))
            .ok_or_else(|| err(name, &value, "not numeric")),
        "to_boolean" => Ok(to_boolean(&value)),
        "add_prefix" => {
            let prefix = param_str(params, "prefix");
            Ok(Value::Text(format!("{}{}", prefix, value.to_text())))
        }
        "add_suffix" => {
            let suffix = param_str(params, "suffix");
            Ok(Value::Text(format!("{}{}", value.to_text(), suffix)))
        }
        "replace" => {
            let old = param_str(params, "old");
            let new = param_str(params, "new");
            Ok(Value::Text(value.to_text().replace(old, new)))
        }
        other => Err(MigrateError::transform(
            other,
            format!("unknown transform function '{other}'"),
        )),
    }
}

fn param_str<'a>(params: &'a serde_json::Value, key: &str) -> &'a str {
    params.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn err(func: &str, value: &Value, reason: &str) -> MigrateError {
    MigrateError::transform(func, format!("cannot apply to '{}': {reason}", value))
}

/// Remove markup tags: every `<...>` span is dropped.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn to_date(value: Value, params: &serde_json::Value) -> Result<Value> {
    match value {
        Value::Date(_) => Ok(value),
        Value::DateTime(dt) => Ok(Value::Date(dt.date())),
        Value::Text(ref s) => {
            let format = params
                .get("format")
                .and_then(|v| v.as_str())
                .unwrap_or("%Y-%m-%d");
            NaiveDate::parse_from_str(s.trim(), format)
                .map(Value::Date)
                .map_err(|e| err("to_date", &value, &e.to_string()))
        }
        other => Err(err("to_date", &other, "not a date or string")),
    }
}

fn to_datetime(value: Value, params: &serde_json::Value) -> Result<Value> {
    match value {
        Value::DateTime(_) => Ok(value),
        Value::Date(d) => Ok(Value::DateTime(d.and_hms_opt(0, 0, 0).unwrap_or_default())),
        Value::Text(ref s) => {
            let format = params
                .get("format")
                .and_then(|v| v.as_str())
                .unwrap_or("%Y-%m-%d %H:%M:%S");
            NaiveDateTime::parse_from_str(s.trim(), format)
                .map(Value::DateTime)
                .map_err(|e| err("to_datetime", &value, &e.to_string()))
        }
        other => Err(err("to_datetime", &other, "not a datetime or string")),
    }
}

fn to_boolean(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(i) => Value::Bool(*i != 0),
        Value::Float(f) => Value::Bool(*f != 0.0),
        Value::Text(s) => Value::Bool(TRUE_TOKENS.contains(&s.trim().to_lowercase().as_str())),
        _ => Value::Bool(false),
    }
}
