use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::evaluator::NOW;
use crate::core::loops::{LOOP_COUNT, LOOP_NUMBER};
use crate::document::{ChartValue, Presentation, ShapeKind, Workbook};
use crate::errors::ParseError;
use crate::parser::{self, Expr, Token};
use crate::render::xlsx::SHEET_NAME;

const RESERVED: &[&str] = &[NOW, LOOP_COUNT, LOOP_NUMBER, SHEET_NAME];

/// Top-level context keys a template refers to.
///
/// `simple_fields` are used bare (`{{ title }}`); `object_fields` are traversed,
/// filtered or called (`{{ user.name }}`, `{{ users[is_active=True] }}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextKeys {
    pub simple_fields: Vec<String>,
    pub object_fields: Vec<String>,
}

#[derive(Default)]
struct KeyCollector {
    simple: BTreeSet<String>,
    object: BTreeSet<String>,
    loop_variables: BTreeSet<String>,
}

impl KeyCollector {
    fn scan_text(&mut self, text: &str) -> Result<(), ParseError> {
        for token in parser::tokenize(text)? {
            match token {
                Token::Placeholder { body, .. } => self.scan_expression(&body)?,
                Token::LoopStart { variable, collection, .. } => {
                    self.loop_variables.insert(variable);
                    let collection = collection.trim();
                    let collection = collection
                        .strip_prefix("{{")
                        .and_then(|rest| rest.strip_suffix("}}"))
                        .unwrap_or(collection);
                    self.scan_expression(collection)?;
                }
                Token::Image { source, .. } => {
                    let source = self.scan_nested(&source)?;
                    self.scan_text(&source)?;
                }
                Token::Literal(_) | Token::LoopEnd { .. } => (),
            }
        }
        Ok(())
    }

    /// Records keys used inside `$...$` spans and returns the body with them blanked out.
    fn scan_nested(&mut self, body: &str) -> Result<String, ParseError> {
        parser::substitute_nested(body, |inner| {
            self.scan_expression(inner)?;
            Ok::<_, ParseError>("0".to_string())
        })
    }

    fn scan_expression(&mut self, body: &str) -> Result<(), ParseError> {
        let body = self.scan_nested(body)?;
        let placeholder = parser::parse_expression(&body)?;
        self.scan_expr(&placeholder.expr);
        Ok(())
    }

    fn scan_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Literal(_) => (),
            Expr::Binary { lhs, rhs, .. } => {
                self.scan_expr(lhs);
                self.scan_expr(rhs);
            }
            Expr::Path(path) => {
                let Some(first) = path.segments.first() else {
                    return;
                };
                let root = first.parts().next().unwrap_or_default().to_string();
                let traversed = path.segments.len() > 1
                    || first.name.contains("__")
                    || first.call.is_some()
                    || !first.filters.is_empty();
                if traversed {
                    self.object.insert(root);
                } else {
                    self.simple.insert(root);
                }
            }
        }
    }

    fn finish(self) -> ContextKeys {
        let keep = |key: &String| !RESERVED.contains(&key.as_str()) && !self.loop_variables.contains(key);
        let object_fields: Vec<String> = self.object.iter().filter(|k| keep(*k)).cloned().collect();
        let simple_fields = self
            .simple
            .iter()
            .filter(|k| keep(*k) && !self.object.contains(*k))
            .cloned()
            .collect();
        ContextKeys { simple_fields, object_fields }
    }
}

pub fn presentation_keys(presentation: &Presentation) -> Result<ContextKeys, ParseError> {
    let mut collector = KeyCollector::default();
    for shape in presentation.slides.iter().flat_map(|slide| slide.shapes.iter()) {
        match &shape.kind {
            ShapeKind::Text(frame) => {
                for paragraph in &frame.paragraphs {
                    collector.scan_text(&paragraph.text())?;
                }
            }
            ShapeKind::Table(table) => {
                for cell in table.rows.iter().flat_map(|row| row.cells.iter()) {
                    collector.scan_text(&cell.text())?;
                }
            }
            ShapeKind::Chart(chart) => {
                for text in &chart.categories {
                    collector.scan_text(text)?;
                }
                for series in &chart.series {
                    collector.scan_text(&series.name)?;
                    for value in &series.values {
                        if let ChartValue::Text(text) = value {
                            collector.scan_text(text)?;
                        }
                    }
                }
            }
            ShapeKind::Picture(_) => (),
        }
    }
    Ok(collector.finish())
}

pub fn workbook_keys(workbook: &Workbook) -> Result<ContextKeys, ParseError> {
    let mut collector = KeyCollector::default();
    for sheet in &workbook.sheets {
        for cell in sheet.rows.iter().flat_map(|row| row.cells.iter()) {
            if let Some(text) = cell.value.as_text() {
                collector.scan_text(text)?;
            }
        }
    }
    Ok(collector.finish())
}
