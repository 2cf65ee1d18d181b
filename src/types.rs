use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

/// An attribute-bearing value supplied by the caller (a query result row, a domain object).
///
/// Lookups go through [`Record::field`]; methods with literal arguments go through
/// [`Record::call`]. Returning `None` from either means the name does not exist.
pub trait Record: fmt::Debug + Send + Sync {
    fn field(&self, name: &str) -> Option<Value>;

    fn call(&self, _method: &str, _args: &[Value]) -> Option<Result<Value, String>> {
        None
    }

    /// Natural string representation, used when the record itself is rendered.
    fn display(&self) -> String;
}

#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(Number),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(Arc<dyn Record>),
}

#[derive(Clone, Copy, Debug)]
pub enum Number {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Number {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(*i),
            Number::UInt(u) => i64::try_from(*u).ok(),
            Number::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::UInt(u) => *u as f64,
            Number::Float(f) => *f,
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::UInt(u) => write!(f, "{}", u),
            Number::Float(x) => write!(f, "{}", x),
        }
    }
}

/// How a value can be traversed by one path segment.
pub(crate) enum Access<'a> {
    Attributes(&'a dyn Record),
    Keys(&'a BTreeMap<String, Value>),
    Sequence(&'a [Value]),
    Scalar,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    pub(crate) fn access(&self) -> Access<'_> {
        match self {
            Value::Object(record) => Access::Attributes(record.as_ref()),
            Value::Map(map) => Access::Keys(map),
            Value::List(items) => Access::Sequence(items),
            _ => Access::Scalar,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Convenience for building a [`Value::Map`] from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(Number::Int(i)) => (*i).into(),
            Value::Number(Number::UInt(u)) => (*u).into(),
            Value::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(d.to_string()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_string()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Object(record) => serde_json::Value::String(record.display()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Natural string representation. Lists are joined with ", " the way inline text shows them.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d),
            Value::DateTime(dt) => write!(f, "{}", dt),
            Value::List(items) => {
                let mut first = true;
                for item in items.iter().filter(|item| !item.is_null()) {
                    if !first {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                    first = false;
                }
                Ok(())
            }
            Value::Map(_) => write!(f, "{}", self.to_json()),
            Value::Object(record) => f.write_str(&record.display()),
        }
    }
}

macro_rules! impl_value_conversion {
    ($variant:ident, $type:ty) => {
        impl From<$type> for Value {
            fn from(value: $type) -> Value {
                Value::$variant(value)
            }
        }
    };
}

macro_rules! impl_number_conversion {
    ($variant:ident, $type:ty, $target:ty) => {
        impl From<$type> for Number {
            fn from(value: $type) -> Number {
                Number::$variant(value as $target)
            }
        }

        impl From<$type> for Value {
            fn from(value: $type) -> Value {
                Value::Number(Number::$variant(value as $target))
            }
        }
    };
}

impl_value_conversion!(Boolean, bool);
impl_value_conversion!(String, String);
impl_value_conversion!(Date, NaiveDate);
impl_value_conversion!(DateTime, NaiveDateTime);
impl_value_conversion!(Map, BTreeMap<String, Value>);
impl_value_conversion!(Number, Number);
impl_number_conversion!(Int, i64, i64);
impl_number_conversion!(Int, i32, i64);
impl_number_conversion!(UInt, u64, u64);
impl_number_conversion!(UInt, u32, u64);
impl_number_conversion!(UInt, usize, u64);
impl_number_conversion!(Float, f64, f64);

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::String(value.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Value {
        Value::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Arc<dyn Record>> for Value {
    fn from(record: Arc<dyn Record>) -> Value {
        Value::Object(record)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(number) => Value::Number(number.into()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => Value::List(values.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Value {
        value.clone().into()
    }
}

impl From<serde_json::Number> for Number {
    fn from(number: serde_json::Number) -> Number {
        if let Some(i) = number.as_i64() {
            Number::Int(i)
        } else if let Some(u) = number.as_u64() {
            Number::UInt(u)
        } else {
            Number::Float(number.as_f64().unwrap_or(f64::NAN))
        }
    }
}
