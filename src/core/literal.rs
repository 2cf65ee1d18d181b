//! Literal parsing and the loose equality used by filter predicates.
//!
//! Precedence for an unquoted literal: integer, float, boolean
//! (`true`/`True`/`false`/`False`), null (`null`/`None`), quoted string, else the
//! bare text as a string.

use crate::types::{Number, Value};

pub fn coerce(raw: &str) -> Value {
    let text = raw.trim();
    if let Some(number) = parse_number(text) {
        return Value::Number(number);
    }
    match text {
        "true" | "True" => Value::Boolean(true),
        "false" | "False" => Value::Boolean(false),
        "null" | "None" => Value::Null,
        _ => Value::String(unquote(text).to_string()),
    }
}

/// Parses decimal integer or float text. Words such as `inf` or `NaN` are not numbers here.
pub fn parse_number(text: &str) -> Option<Number> {
    let text = text.trim();
    if !looks_numeric(text) {
        return None;
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(Number::Int(i));
    }
    if let Ok(u) = text.parse::<u64>() {
        return Some(Number::UInt(u));
    }
    text.parse::<f64>().ok().filter(|f| f.is_finite()).map(Number::Float)
}

fn looks_numeric(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    digits.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
}

fn unquote(text: &str) -> &str {
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}

/// Equality between a resolved field and a filter literal.
pub fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::String(a), Value::Boolean(b)) => a.eq_ignore_ascii_case(&b.to_string()),
        (Value::String(a), Value::Number(_)) => *a == expected.to_string(),
        (Value::Date(_) | Value::DateTime(_), Value::String(b)) => actual.to_string() == *b,
        (Value::Object(_), Value::String(b)) => actual.to_string() == *b,
        _ => actual == expected,
    }
}
