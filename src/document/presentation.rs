use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::core::expander::RowGrid;
use crate::errors::ExpansionError;

/// Formatting carried through unchanged (fonts, fills, borders).
pub type Style = Map<String, Json>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presentation {
    pub slides: Vec<Slide>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slide {
    #[serde(default)]
    pub id: usize,
    #[serde(default)]
    pub shapes: Vec<Shape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    #[serde(default)]
    pub id: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub geometry: Geometry,
    #[serde(flatten)]
    pub kind: ShapeKind,
}

/// Position and size in EMU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShapeKind {
    Text(TextFrame),
    Table(Table),
    Chart(Chart),
    Picture(Picture),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextFrame {
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
}

impl TextFrame {
    pub fn from_text(text: &str) -> Self {
        Self { paragraphs: text.split('\n').map(Paragraph::from_text).collect() }
    }

    pub fn text(&self) -> String {
        self.paragraphs.iter().map(Paragraph::text).collect::<Vec<_>>().join("\n")
    }

    /// Replaces all text, keeping the first run's formatting.
    pub fn set_text(&mut self, text: &str) {
        let style = self
            .paragraphs
            .iter()
            .flat_map(|p| p.runs.first())
            .next()
            .map(|run| run.style.clone())
            .unwrap_or_default();
        self.paragraphs = text
            .split('\n')
            .map(|line| Paragraph { runs: vec![TextRun { text: line.to_string(), style: style.clone() }] })
            .collect();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub runs: Vec<TextRun>,
}

impl Paragraph {
    pub fn from_text(text: &str) -> Self {
        Self { runs: vec![TextRun::new(text)] }
    }

    pub fn text(&self) -> String {
        self.runs.iter().map(|run| run.text.as_str()).collect()
    }

    /// Collapses the paragraph into one run carrying the first run's formatting.
    pub fn set_text(&mut self, text: &str) {
        let style = self.runs.first().map(|run| run.style.clone()).unwrap_or_default();
        self.runs = vec![TextRun { text: text.to_string(), style }];
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub style: Style,
}

impl TextRun {
    pub fn new(text: &str) -> Self {
        Self { text: text.to_string(), style: Style::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<TableRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    #[serde(default)]
    pub height: i64,
    pub cells: Vec<TableCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    #[serde(default)]
    pub frame: TextFrame,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub style: Style,
    #[serde(default = "one")]
    pub row_span: usize,
    #[serde(default = "one")]
    pub col_span: usize,
    /// Covered by a span that starts in another cell.
    #[serde(default)]
    pub merged: bool,
}

fn one() -> usize {
    1
}

impl TableCell {
    pub fn new(text: &str) -> Self {
        Self { frame: TextFrame::from_text(text), style: Style::new(), row_span: 1, col_span: 1, merged: false }
    }

    pub fn text(&self) -> String {
        self.frame.text()
    }
}

impl RowGrid for Table {
    type Row = TableRow;

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn width(&self, row: usize) -> usize {
        self.rows.get(row).map_or(0, |r| r.cells.len())
    }

    fn is_blank(&self, row: usize, column: usize) -> bool {
        self.rows
            .get(row)
            .and_then(|r| r.cells.get(column))
            .is_some_and(|cell| !cell.merged && cell.text().trim().is_empty())
    }

    fn set_text(&mut self, row: usize, column: usize, text: &str) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.cells.get_mut(column)) {
            cell.frame.set_text(text);
        }
    }

    fn blank_copy(&self, row: usize) -> Result<TableRow, ExpansionError> {
        let template = self
            .rows
            .get(row)
            .ok_or_else(|| ExpansionError::InvalidCloneTarget { row, reason: "row does not exist".to_string() })?;
        if let Some(reason) = self.vertical_merge(row) {
            return Err(ExpansionError::InvalidCloneTarget { row, reason: reason.to_string() });
        }

        let mut copy = template.clone();
        for cell in &mut copy.cells {
            if cell.text().contains("{{") {
                cell.frame.set_text("");
            }
        }
        Ok(copy)
    }

    fn insert_row(&mut self, index: usize, row: TableRow) {
        self.rows.insert(index.min(self.rows.len()), row);
    }

    fn remove_row(&mut self, index: usize) -> Result<(), ExpansionError> {
        if let Some(reason) = self.vertical_merge(index) {
            return Err(ExpansionError::UnremovableRow { row: index, reason: reason.to_string() });
        }
        if index < self.rows.len() {
            self.rows.remove(index);
        }
        Ok(())
    }
}

impl Table {
    /// Why `row` takes part in a vertical merge, if it does.
    fn vertical_merge(&self, row: usize) -> Option<&'static str> {
        let cells = &self.rows.get(row)?.cells;
        if cells.iter().any(|cell| cell.row_span > 1) {
            return Some("a cell spans several rows");
        }
        let covered_from_above = cells.iter().enumerate().any(|(column, cell)| {
            let covered_from_left = cells[..column]
                .iter()
                .enumerate()
                .any(|(start, c)| c.col_span > 1 && start + c.col_span > column);
            cell.merged && !covered_from_left
        });
        covered_from_above.then_some("the row is covered by a vertical merge")
    }
}

/// Category labels plus named series of values, one value per category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub series: Vec<ChartSeries>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub name: String,
    #[serde(default)]
    pub values: Vec<ChartValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChartValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Picture {
    pub image: Vec<u8>,
    pub content_type: String,
    /// The URL the image was fetched from.
    #[serde(default)]
    pub source: String,
}
