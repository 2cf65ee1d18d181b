use std::collections::HashMap;

use log::trace;

use crate::types::Value;

/// Caller-owned data graph for one render. Never mutated by the engine.
#[derive(Debug, Clone, Default)]
pub struct Context {
    variables: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { variables: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

impl From<serde_json::Value> for Context {
    /// A JSON object becomes the top-level mapping; anything else yields an empty context.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Context::default(),
        }
    }
}

pub trait VariableResolver {
    fn get_variable(&self, name: &str) -> Option<Value>;
}

impl VariableResolver for Context {
    fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).cloned()
    }
}

/// A shallow overlay of the outer [`Context`]: loop variables, `loop_number`,
/// `sheet_name` and friends shadow context keys of the same name.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    context: &'a Context,
    locals: HashMap<String, Value>,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a Context) -> Self {
        Self { context, locals: HashMap::new() }
    }

    /// Derives a child scope with one more binding.
    pub fn with(&self, name: impl Into<String>, value: impl Into<Value>) -> Scope<'a> {
        let mut child = self.clone();
        child.locals.insert(name.into(), value.into());
        child
    }
}

impl VariableResolver for Scope<'_> {
    fn get_variable(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.locals.get(name) {
            trace!("Found variable '{}' in local scope", name);
            return Some(value.clone());
        }
        trace!("Variable '{}' not bound locally, proceeding to context lookup.", name);
        self.context.get_variable(name)
    }
}
