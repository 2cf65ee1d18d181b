use serde::{Deserialize, Serialize};

use crate::core::expander::RowGrid;
use crate::document::presentation::Style;
use crate::errors::ExpansionError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Worksheet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Worksheet {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<SheetRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetRow {
    #[serde(default)]
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    #[serde(default)]
    pub value: CellValue,
    #[serde(default, skip_serializing_if = "Style::is_empty")]
    pub style: Style,
}

impl Cell {
    pub fn text(text: &str) -> Self {
        Self { value: CellValue::Text(text.to_string()), style: Style::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }
}

impl Worksheet {
    pub fn cell(&self, row: usize, column: usize) -> Option<&Cell> {
        self.rows.get(row).and_then(|r| r.cells.get(column))
    }

    pub fn cell_mut(&mut self, row: usize, column: usize) -> Option<&mut Cell> {
        self.rows.get_mut(row).and_then(|r| r.cells.get_mut(column))
    }

    /// Widest row, the sheet's used column count.
    pub fn column_count(&self) -> usize {
        self.rows.iter().map(|r| r.cells.len()).max().unwrap_or(0)
    }
}

/// Sheets grow on demand: a column fill past the last row appends rows, and
/// short rows are padded with empty cells.
impl RowGrid for Worksheet {
    type Row = SheetRow;

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn width(&self, _row: usize) -> usize {
        self.column_count()
    }

    fn is_blank(&self, row: usize, column: usize) -> bool {
        self.cell(row, column).is_none_or(|cell| cell.value.is_blank())
    }

    fn set_text(&mut self, row: usize, column: usize, text: &str) {
        if let Some(r) = self.rows.get_mut(row) {
            if r.cells.len() <= column {
                r.cells.resize_with(column + 1, Cell::default);
            }
            r.cells[column].value = CellValue::Text(text.to_string());
        }
    }

    fn blank_copy(&self, row: usize) -> Result<SheetRow, ExpansionError> {
        let template = self
            .rows
            .get(row)
            .ok_or_else(|| ExpansionError::InvalidCloneTarget { row, reason: "row does not exist".to_string() })?;
        let cells = template
            .cells
            .iter()
            .map(|cell| match cell.value.as_text() {
                Some(text) if text.contains("{{") => Cell { value: CellValue::Empty, style: cell.style.clone() },
                _ => cell.clone(),
            })
            .collect();
        Ok(SheetRow { cells })
    }

    fn insert_row(&mut self, index: usize, row: SheetRow) {
        self.rows.insert(index.min(self.rows.len()), row);
    }

    fn remove_row(&mut self, index: usize) -> Result<(), ExpansionError> {
        if index < self.rows.len() {
            self.rows.remove(index);
        }
        Ok(())
    }
}
