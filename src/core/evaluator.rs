use log::{debug, trace};

use crate::config::RenderSettings;
use crate::context::{Scope, VariableResolver};
use crate::core::format::{self, FormatSpec};
use crate::core::literal;
use crate::core::permissions::{self, PermissionChecker};
use crate::errors::{PlaceholderError, ResolutionError, ResolutionErrorKind};
use crate::parser::{self, BinaryOp, Condition, Expr, Path, Segment};
use crate::types::{Access, Number, Value};

/// Path that resolves to the render timestamp unless the context binds it.
pub const NOW: &str = "now";

/// Resolves placeholder bodies against one scope.
pub struct Evaluator<'s, 'a> {
    scope: &'s Scope<'a>,
    settings: &'s RenderSettings,
}

impl<'s, 'a> Evaluator<'s, 'a> {
    pub fn new(scope: &'s Scope<'a>, settings: &'s RenderSettings) -> Self {
        Self { scope, settings }
    }

    pub fn settings(&self) -> &RenderSettings {
        self.settings
    }

    /// Evaluates the inside of a `{{ ... }}` span: `$...$` pre-pass, parse, resolve, format.
    pub fn evaluate(&self, body: &str) -> Result<Value, PlaceholderError> {
        let expanded = parser::substitute_nested(body, |inner| {
            self.evaluate(inner).map(|value| value.to_string())
        })?;
        let placeholder = parser::parse_expression(&expanded)?;
        let raw = format!("{{{{ {} }}}}", body.trim());

        let value = self
            .eval_expr(&placeholder.expr)
            .map_err(|kind| ResolutionError::new(raw.clone(), kind))?;

        let value = match &placeholder.format {
            Some(spec) => {
                let spec = FormatSpec::parse(spec).map_err(|kind| ResolutionError::new(raw.clone(), kind))?;
                format::apply(value, &spec, self.settings.locale).map_err(|kind| ResolutionError::new(raw, kind))?
            }
            None => value,
        };
        trace!("Resolved {:?} to {:?}", body, value);
        Ok(value)
    }

    fn eval_expr(&self, expr: &Expr) -> Result<Value, ResolutionErrorKind> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => self.resolve_path(path),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval_expr(lhs)?;
                let rhs = self.eval_expr(rhs)?;
                arithmetic(*op, lhs, rhs)
            }
        }
    }

    fn resolve_path(&self, path: &Path) -> Result<Value, ResolutionErrorKind> {
        let mut segments = path.segments.iter();
        let Some(first) = segments.next() else {
            return Ok(Value::Null);
        };

        let mut parts = first.parts();
        let root_name = parts.next().unwrap_or_default();
        let root = match self.scope.get_variable(root_name) {
            Some(value) => value,
            None if root_name == NOW => Value::DateTime(self.settings.now),
            None => {
                return Err(ResolutionErrorKind::UnknownAttribute {
                    segment: root_name.to_string(),
                    path: String::new(),
                })
            }
        };

        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() && first.call.is_some() {
            return Err(ResolutionErrorKind::NotCallable { segment: root_name.to_string() });
        }

        let checker = self.settings.permission_checker();
        let mut walked = root_name.to_string();
        let mut current = descend(root, &rest, first, &mut walked, checker)?;

        for segment in segments {
            if current.is_null() {
                debug!("Path {:?} reached null before '{}'", walked, segment.name);
                return Ok(Value::Null);
            }
            let parts: Vec<&str> = segment.parts().collect();
            current = descend(current, &parts, segment, &mut walked, checker)?;
        }
        Ok(current)
    }
}

/// Walks `parts` of one written segment from `value`, mapping over sequences.
/// Filters apply once the parts are used up. Every record reached is shown to `checker`.
fn descend(
    value: Value,
    parts: &[&str],
    segment: &Segment,
    walked: &mut String,
    checker: Option<&dyn PermissionChecker>,
) -> Result<Value, ResolutionErrorKind> {
    let Some((part, rest)) = parts.split_first() else {
        permissions::enforce(checker, &value)?;
        return apply_filters(value, segment);
    };
    if !matches!(value, Value::List(_)) {
        permissions::enforce(checker, &value)?;
    }

    match value {
        Value::Null => Ok(Value::Null),
        Value::List(items) => {
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                let mut item_walked = walked.clone();
                match descend(item, parts, segment, &mut item_walked, checker)? {
                    Value::List(inner) => mapped.extend(inner),
                    other => mapped.push(other),
                }
            }
            walked.push('.');
            walked.push_str(parts.join(".").as_str());
            Ok(Value::List(mapped))
        }
        current => {
            let next = match (&segment.call, rest.is_empty()) {
                (Some(args), true) => call(&current, part, args)?,
                _ => lookup(&current, part, walked)?,
            };
            walked.push('.');
            walked.push_str(part);
            descend(next, rest, segment, walked, checker)
        }
    }
}

fn lookup(value: &Value, name: &str, walked: &str) -> Result<Value, ResolutionErrorKind> {
    let unknown = || ResolutionErrorKind::UnknownAttribute { segment: name.to_string(), path: walked.to_string() };
    match value.access() {
        Access::Attributes(record) => record.field(name).ok_or_else(unknown),
        Access::Keys(map) => map.get(name).cloned().ok_or_else(unknown),
        Access::Sequence(_) => Err(ResolutionErrorKind::NotAnObject { segment: name.to_string(), found: "list" }),
        Access::Scalar => Err(ResolutionErrorKind::NotAnObject { segment: name.to_string(), found: value.type_name() }),
    }
}

fn call(value: &Value, method: &str, args: &[Value]) -> Result<Value, ResolutionErrorKind> {
    let Access::Attributes(record) = value.access() else {
        return Err(ResolutionErrorKind::NotCallable { segment: method.to_string() });
    };
    match record.call(method, args) {
        Some(Ok(result)) => Ok(result),
        Some(Err(message)) => Err(ResolutionErrorKind::CallFailed { segment: method.to_string(), message }),
        None if record.field(method).is_some() => Err(ResolutionErrorKind::NotCallable { segment: method.to_string() }),
        None => Err(ResolutionErrorKind::UnknownAttribute { segment: method.to_string(), path: record.display() }),
    }
}

fn apply_filters(value: Value, segment: &Segment) -> Result<Value, ResolutionErrorKind> {
    if segment.filters.is_empty() {
        return Ok(value);
    }
    let items = match value {
        Value::List(items) => items,
        other => {
            return Err(ResolutionErrorKind::NotASequence { segment: segment.name.clone(), found: other.type_name() });
        }
    };
    let before = items.len();
    let kept: Vec<Value> = items
        .into_iter()
        .filter(|item| segment.filters.iter().all(|condition| matches_condition(item, condition)))
        .collect();
    trace!("Filter on '{}' kept {} of {} elements", segment.name, kept.len(), before);
    Ok(Value::List(kept))
}

fn matches_condition(item: &Value, condition: &Condition) -> bool {
    let mut current = item.clone();
    for part in condition.field.split('.').flat_map(|p| p.split("__")) {
        let next = match current.access() {
            Access::Attributes(record) => record.field(part),
            Access::Keys(map) => map.get(part).cloned(),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return false,
        }
    }
    literal::loosely_equal(&current, &condition.expected)
}

/// `+ - * /` on numbers, element-wise when either side is a list.
pub fn arithmetic(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ResolutionErrorKind> {
    match (lhs, rhs) {
        (Value::List(left), Value::List(right)) => {
            if left.len() != right.len() {
                return Err(ResolutionErrorKind::TypeMismatch {
                    message: format!("lists of length {} and {} with '{}'", left.len(), right.len(), op.symbol()),
                });
            }
            left.into_iter()
                .zip(right)
                .map(|(l, r)| arithmetic(op, l, r))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
        (Value::List(left), rhs) => left
            .into_iter()
            .map(|l| arithmetic(op, l, rhs.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (lhs, Value::List(right)) => right
            .into_iter()
            .map(|r| arithmetic(op, lhs.clone(), r))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (Value::Number(a), Value::Number(b)) => numeric(op, a, b).map(Value::Number),
        (lhs, rhs) => Err(ResolutionErrorKind::TypeMismatch {
            message: format!("{} {} {}", lhs.type_name(), op.symbol(), rhs.type_name()),
        }),
    }
}

fn numeric(op: BinaryOp, a: Number, b: Number) -> Result<Number, ResolutionErrorKind> {
    if op == BinaryOp::Div && b.as_f64() == 0.0 {
        return Err(ResolutionErrorKind::DivisionByZero);
    }

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div => (x.checked_rem(y) == Some(0)).then(|| x.checked_div(y)).flatten(),
        };
        if let Some(result) = exact {
            return Ok(Number::Int(result));
        }
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
    };
    Ok(Number::Float(result))
}
