pub mod presentation;
pub mod workbook;

use serde::{Deserialize, Serialize};

pub use presentation::{
    Chart, ChartSeries, ChartValue, Geometry, Paragraph, Picture, Presentation, Shape, ShapeKind, Slide, Table,
    TableCell, TableRow, TextFrame, TextRun,
};
pub use workbook::{Cell, CellValue, SheetRow, Workbook, Worksheet};

/// Serialized form accepted by [`crate::Renderer::render_bytes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "document", rename_all = "snake_case")]
pub enum Document {
    Presentation(Presentation),
    Workbook(Workbook),
}
