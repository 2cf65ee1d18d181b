use std::fmt;

use log::debug;

use crate::errors::ResolutionErrorKind;
use crate::types::{Record, Value};

/// Decides whether a record reached during path resolution may be rendered.
pub trait PermissionChecker: fmt::Debug + Send + Sync {
    fn can_view(&self, record: &dyn Record) -> bool;
}

/// Checks `value`, or every element when it is a list. Only records are checked.
pub fn enforce(checker: Option<&dyn PermissionChecker>, value: &Value) -> Result<(), ResolutionErrorKind> {
    let Some(checker) = checker else {
        return Ok(());
    };
    let items = match value {
        Value::List(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };
    for item in items {
        if let Value::Object(record) = item {
            if !checker.can_view(record.as_ref()) {
                debug!("Permission denied for {:?}", record.display());
                return Err(ResolutionErrorKind::PermissionDenied { object: record.display() });
            }
        }
    }
    Ok(())
}
