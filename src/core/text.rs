use log::{error, warn};

use crate::config::RenderSettings;
use crate::core::Evaluator;
use crate::errors::{Diagnostics, Location, ParseError, RenderError, ResolutionError, ResolutionErrorKind};
use crate::parser::{self, Token};
use crate::types::Value;

/// How list results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    /// Lists are joined with ", ".
    Normal,
    /// A lone list-valued placeholder yields one string per element.
    Table,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Text(String),
    List(Vec<String>),
}

impl Rendered {
    pub fn into_text(self) -> String {
        match self {
            Rendered::Text(text) => text,
            Rendered::List(items) => items.join(", "),
        }
    }
}

pub fn error_marker(cause: &str) -> String {
    format!("[ERROR: {}]", cause)
}

/// Records a data-dependent error and returns the inline marker, or aborts.
pub fn recover(error: RenderError, settings: &RenderSettings, diagnostics: &mut Diagnostics) -> Result<String, RenderError> {
    if error.is_structural() || settings.fail_fast {
        error!("Aborting render: {}", error);
        return Err(error);
    }
    warn!("{}", error);
    let marker = error_marker(&error.cause());
    diagnostics.push(error);
    Ok(marker)
}

/// Substitutes every placeholder in `text`.
///
/// Loop and image directives are rejected here; callers strip them out beforehand.
pub fn process_text(
    text: &str,
    evaluator: &Evaluator,
    mode: TextMode,
    location: &Location,
    diagnostics: &mut Diagnostics,
) -> Result<Rendered, RenderError> {
    let tokens = parser::tokenize(text).map_err(|e| RenderError::parse(location, e))?;
    if let Some(control) = tokens.iter().find(|t| t.is_control()) {
        return Err(RenderError::parse(location, ParseError::MisplacedDirective { text: control.raw().to_string() }));
    }

    let count = parser::placeholder_count(&tokens);
    if count == 0 {
        return Ok(Rendered::Text(text.to_string()));
    }

    let mut resolved = Vec::with_capacity(tokens.len());
    for token in &tokens {
        let piece = match token {
            Token::Placeholder { body, .. } => match evaluator.evaluate(body) {
                Ok(value) => Ok(value),
                Err(e) => Err(recover(e.at(location), evaluator.settings(), diagnostics)?),
            },
            other => Err(other.raw().to_string()),
        };
        resolved.push(piece);
    }

    if mode == TextMode::Table {
        let list_count = resolved.iter().filter(|p| matches!(p, Ok(Value::List(_)))).count();
        if list_count > 0 && count > 1 {
            let source = tokens
                .iter()
                .find(|t| t.is_placeholder())
                .map(|t| t.raw().to_string())
                .unwrap_or_default();
            let error = ResolutionError::new(source, ResolutionErrorKind::AmbiguousExpansion { count });
            let marker = recover(RenderError::resolution(location, error), evaluator.settings(), diagnostics)?;
            return Ok(Rendered::Text(marker));
        }
        if list_count == 1 {
            return Ok(Rendered::List(expand_single(&resolved)));
        }
    }

    Ok(Rendered::Text(resolved.iter().map(piece_text).collect()))
}

/// Literal text or error markers are `Err`, placeholder values are `Ok`.
type Piece = Result<Value, String>;

fn piece_text(piece: &Piece) -> String {
    match piece {
        Ok(value) => value.to_string(),
        Err(text) => text.clone(),
    }
}

fn expand_single(pieces: &[Piece]) -> Vec<String> {
    let Some(index) = pieces.iter().position(|p| matches!(p, Ok(Value::List(_)))) else {
        return Vec::new();
    };
    let prefix: String = pieces[..index].iter().map(piece_text).collect();
    let suffix: String = pieces[index + 1..].iter().map(piece_text).collect();
    match &pieces[index] {
        Ok(Value::List(items)) => items.iter().map(|item| format!("{}{}{}", prefix, item, suffix)).collect(),
        _ => Vec::new(),
    }
}

/// Processes a run of labels (chart categories, series names). A single entry with a
/// single placeholder expands to one label per element; otherwise each entry is rendered inline.
pub fn process_text_list(
    items: &[String],
    evaluator: &Evaluator,
    location: &Location,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<String>, RenderError> {
    if let [only] = items {
        let tokens = parser::tokenize(only).map_err(|e| RenderError::parse(location, e))?;
        if parser::placeholder_count(&tokens) == 1 {
            return match process_text(only, evaluator, TextMode::Table, location, diagnostics)? {
                Rendered::List(values) => Ok(values),
                Rendered::Text(text) => Ok(vec![text]),
            };
        }
    }
    items
        .iter()
        .map(|item| process_text(item, evaluator, TextMode::Normal, location, diagnostics).map(Rendered::into_text))
        .collect()
}
