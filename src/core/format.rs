use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use chrono::{Locale, NaiveDate, NaiveDateTime, NaiveTime};
use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ResolutionErrorKind;
use crate::types::{Number, Value};

static NUMERIC_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(,)?(?:\.(\d+))?([fd])$").expect("valid numeric format pattern"));

/// Date tokens, longest first so `MMMM` wins over `MM`.
const DATE_TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("yyyy", "%Y"),
    ("YY", "%y"),
    ("yy", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("dd", "%d"),
    ("DD", "%d"),
    ("d", "%-d"),
    ("D", "%-d"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("ss", "%S"),
    ("tt", "%p"),
];

#[derive(Debug, Clone, PartialEq)]
pub enum FormatSpec {
    Case(CaseTransform),
    /// `%`-prefixed pattern passed straight to chrono.
    Strftime(String),
    Numeric(NumericFormat),
    /// Token pattern such as `MMMM dd, YYYY`, kept with its strftime translation.
    DateTokens { tokens: String, pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseTransform {
    Upper,
    Lower,
    Capitalize,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericFormat {
    pub grouping: bool,
    pub kind: NumericKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    /// `.Nf`, round-half-even to N decimals.
    Fixed(usize),
    /// `d`, truncated toward zero.
    Integer,
}

impl FormatSpec {
    pub fn parse(spec: &str) -> Result<FormatSpec, ResolutionErrorKind> {
        let spec = spec.trim();
        let unknown = || ResolutionErrorKind::UnknownFormat { spec: spec.to_string() };

        match spec {
            "upper" => return Ok(FormatSpec::Case(CaseTransform::Upper)),
            "lower" => return Ok(FormatSpec::Case(CaseTransform::Lower)),
            "capitalize" => return Ok(FormatSpec::Case(CaseTransform::Capitalize)),
            "title" => return Ok(FormatSpec::Case(CaseTransform::Title)),
            "" => return Err(unknown()),
            _ => (),
        }

        if spec.contains('%') {
            if StrftimeItems::new(spec).any(|item| matches!(item, Item::Error)) {
                return Err(unknown());
            }
            return Ok(FormatSpec::Strftime(spec.to_string()));
        }

        if let Some(captures) = NUMERIC_SPEC.captures(spec) {
            let grouping = captures.get(1).is_some();
            let precision = captures.get(2).map(|m| m.as_str().parse::<usize>()).transpose().map_err(|_| unknown())?;
            let kind = match (&captures[3], precision) {
                ("f", precision) => NumericKind::Fixed(precision.unwrap_or(6)),
                ("d", None) => NumericKind::Integer,
                _ => return Err(unknown()),
            };
            return Ok(FormatSpec::Numeric(NumericFormat { grouping, kind }));
        }

        let pattern = translate_date_tokens(spec).ok_or_else(unknown)?;
        trace!("Translated date tokens {:?} into {:?}", spec, pattern);
        Ok(FormatSpec::DateTokens { tokens: spec.to_string(), pattern })
    }

    fn source(&self) -> String {
        match self {
            FormatSpec::Case(case) => format!("{:?}", case).to_lowercase(),
            FormatSpec::Strftime(pattern) => pattern.clone(),
            FormatSpec::Numeric(numeric) => {
                let grouping = if numeric.grouping { "," } else { "" };
                match numeric.kind {
                    NumericKind::Fixed(precision) => format!("{}.{}f", grouping, precision),
                    NumericKind::Integer => format!("{}d", grouping),
                }
            }
            FormatSpec::DateTokens { tokens, .. } => tokens.clone(),
        }
    }
}

fn translate_date_tokens(spec: &str) -> Option<String> {
    let mut pattern = String::with_capacity(spec.len() * 2);
    let mut rest = spec;
    'scan: while let Some(c) = rest.chars().next() {
        for (token, replacement) in DATE_TOKENS {
            if let Some(remaining) = rest.strip_prefix(token) {
                pattern.push_str(replacement);
                rest = remaining;
                continue 'scan;
            }
        }
        if c.is_alphabetic() {
            return None;
        }
        pattern.push(c);
        rest = &rest[c.len_utf8()..];
    }
    Some(pattern)
}

/// Applies a format to a resolved value. Lists are formatted element by element and
/// null stays null so it still renders empty.
pub fn apply(value: Value, spec: &FormatSpec, locale: Locale) -> Result<Value, ResolutionErrorKind> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::List(items) => items
            .into_iter()
            .map(|item| apply(item, spec, locale))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        scalar => format_scalar(&scalar, spec, locale).map(Value::String),
    }
}

pub fn format_scalar(value: &Value, spec: &FormatSpec, locale: Locale) -> Result<String, ResolutionErrorKind> {
    match spec {
        FormatSpec::Case(case) => Ok(change_case(&value.to_string(), *case)),
        FormatSpec::Strftime(pattern) | FormatSpec::DateTokens { pattern, .. } => {
            let datetime = as_datetime(value).ok_or_else(|| mismatch(spec, value))?;
            let mut rendered = String::new();
            write!(rendered, "{}", datetime.and_utc().format_localized(pattern, locale))
                .map_err(|_| ResolutionErrorKind::UnknownFormat { spec: spec.source() })?;
            Ok(rendered)
        }
        FormatSpec::Numeric(numeric) => {
            let number = value.as_number().ok_or_else(|| mismatch(spec, value))?;
            Ok(format_number(number, *numeric))
        }
    }
}

fn mismatch(spec: &FormatSpec, value: &Value) -> ResolutionErrorKind {
    ResolutionErrorKind::FormatMismatch { spec: spec.source(), found: value.type_name() }
}

fn as_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(datetime) => Some(*datetime),
        Value::Date(date) => Some(date.and_time(NaiveTime::default())),
        Value::String(text) => parse_datetime(text.trim()),
        _ => None,
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|pattern| NaiveDateTime::parse_from_str(text, pattern).ok())
        .or_else(|| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(|d| d.and_time(NaiveTime::default())))
}

fn change_case(text: &str, case: CaseTransform) -> String {
    match case {
        CaseTransform::Upper => text.to_uppercase(),
        CaseTransform::Lower => text.to_lowercase(),
        CaseTransform::Capitalize => {
            let mut chars = text.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
                None => String::new(),
            }
        }
        CaseTransform::Title => {
            let mut result = String::with_capacity(text.len());
            let mut previous_is_letter = false;
            for c in text.chars() {
                if previous_is_letter {
                    result.extend(c.to_lowercase());
                } else {
                    result.extend(c.to_uppercase());
                }
                previous_is_letter = c.is_alphabetic();
            }
            result
        }
    }
}

pub fn format_number(number: Number, format: NumericFormat) -> String {
    let text = match format.kind {
        NumericKind::Integer => match number {
            Number::Float(f) if f.is_finite() => format!("{:.0}", f.trunc()),
            other => other.to_string(),
        },
        NumericKind::Fixed(precision) => match number {
            Number::Float(f) if !f.is_finite() => f.to_string(),
            other => round_half_even(&other.to_string(), precision),
        },
    };
    let text = normalize_zero(text);
    if format.grouping { group_thousands(&text) } else { text }
}

/// Rounds a plain decimal string (no exponent) to `precision` places, ties to even.
fn round_half_even(decimal: &str, precision: usize) -> String {
    let (negative, unsigned) = match decimal.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, decimal),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));

    let mut digits: Vec<u8> = int_part.bytes().chain(frac_part.bytes().take(precision)).map(|b| b - b'0').collect();
    digits.extend(std::iter::repeat_n(0, precision.saturating_sub(frac_part.len())));

    let dropped = frac_part.as_bytes().get(precision..).unwrap_or(&[]);
    let round_up = match dropped.split_first() {
        Some((&first, _)) if first > b'5' => true,
        Some((&first, rest)) if first == b'5' => {
            rest.iter().any(|&d| d != b'0') || digits.last().is_some_and(|d| d % 2 == 1)
        }
        _ => false,
    };

    if round_up {
        let mut index = digits.len();
        loop {
            if index == 0 {
                digits.insert(0, 1);
                break;
            }
            index -= 1;
            if digits[index] == 9 {
                digits[index] = 0;
            } else {
                digits[index] += 1;
                break;
            }
        }
    }

    let split = digits.len() - precision;
    let mut result = String::with_capacity(digits.len() + 2);
    if negative {
        result.push('-');
    }
    result.extend(digits[..split].iter().map(|d| (b'0' + d) as char));
    if precision > 0 {
        result.push('.');
        result.extend(digits[split..].iter().map(|d| (b'0' + d) as char));
    }
    result
}

fn normalize_zero(text: String) -> String {
    match text.strip_prefix('-') {
        Some(rest) if rest.chars().all(|c| c == '0' || c == '.') => rest.to_string(),
        _ => text,
    }
}

fn group_thousands(text: &str) -> String {
    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text),
    };
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac)) => (int_part, Some(frac)),
        None => (unsigned, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}
