use log::debug;

use crate::config::RenderSettings;
use crate::context::Scope;
use crate::core::expander::{self, Fill, PendingCells};
use crate::core::literal;
use crate::core::text::process_text;
use crate::core::{Evaluator, Rendered, TextMode};
use crate::document::{CellValue, Workbook, Worksheet};
use crate::errors::{Diagnostics, Location, RenderError};
use crate::parser;
use crate::Context;

/// Bound in every sheet's scope to the sheet's own name.
pub const SHEET_NAME: &str = "sheet_name";

pub fn render_workbook(
    template: &Workbook,
    context: &Context,
    settings: &RenderSettings,
) -> Result<(Workbook, Diagnostics), RenderError> {
    let mut workbook = template.clone();
    let mut diagnostics = Diagnostics::default();
    let root = Scope::new(context);

    for sheet in &mut workbook.sheets {
        let scope = root.with(SHEET_NAME, sheet.name.clone());
        let evaluator = Evaluator::new(&scope, settings);
        render_sheet(sheet, &evaluator, &mut diagnostics)?;
    }
    Ok((workbook, diagnostics))
}

/// Walks column by column, top to bottom, so a list fills downward before the
/// next column is visited.
fn render_sheet(sheet: &mut Worksheet, evaluator: &Evaluator, diagnostics: &mut Diagnostics) -> Result<(), RenderError> {
    let mut pending = PendingCells::new(sheet, |row, column| {
        sheet
            .cell(row, column)
            .and_then(|cell| cell.value.as_text())
            .is_some_and(|text| text.contains("{{"))
    });
    let width = sheet.column_count();
    debug!("Rendering sheet {:?} ({} rows, {} columns)", sheet.name, sheet.rows.len(), width);

    for column in 0..width {
        let mut row = 0;
        while row < pending.row_count() {
            if !pending.is_pending(row, column) {
                row += 1;
                continue;
            }
            pending.done(row, column);

            let location = Location::SheetCell { sheet: sheet.name.clone(), row, column };
            let text = sheet
                .cell(row, column)
                .and_then(|cell| cell.value.as_text())
                .unwrap_or_default()
                .to_string();
            let tokens = parser::tokenize(&text).map_err(|e| RenderError::parse(&location, e))?;
            let count = parser::placeholder_count(&tokens);

            match process_text(text.trim(), evaluator, TextMode::Table, &location, diagnostics)? {
                Rendered::List(values) if count == 1 => {
                    let fill = expander::fill_column(sheet, row, column, &values)
                        .map_err(|e| RenderError::expansion(&location, e))?;
                    pending.apply(&fill, column, width);
                    match &fill {
                        Fill::Removed { .. } => continue,
                        Fill::Filled { rows, .. } => {
                            for &filled in rows {
                                coerce_numeric(sheet, filled, column);
                            }
                        }
                    }
                }
                rendered => {
                    if let Some(cell) = sheet.cell_mut(row, column) {
                        cell.value = CellValue::Text(rendered.into_text());
                    }
                    coerce_numeric(sheet, row, column);
                }
            }
            row += 1;
        }
    }
    Ok(())
}

/// Stores text that reads as a number as a numeric cell.
fn coerce_numeric(sheet: &mut Worksheet, row: usize, column: usize) {
    if let Some(cell) = sheet.cell_mut(row, column) {
        let number = cell.value.as_text().and_then(literal::parse_number);
        if let Some(number) = number {
            cell.value = CellValue::Number(number.as_f64());
        }
    }
}
