//! Column fill for row-based regions (presentation tables and worksheets).
//!
//! The first element lands in the template cell, the next ones reuse the blank
//! cells directly below it, and only then are copies of the template row inserted
//! after the last filled row.

use log::debug;

use crate::errors::ExpansionError;

/// A row-addressable grid whose rows can be copied and inserted.
pub trait RowGrid {
    type Row: Clone;

    fn row_count(&self) -> usize;
    fn width(&self, row: usize) -> usize;
    fn is_blank(&self, row: usize, column: usize) -> bool;
    fn set_text(&mut self, row: usize, column: usize, text: &str);
    /// Copy of `row` with every placeholder-bearing cell cleared.
    fn blank_copy(&self, row: usize) -> Result<Self::Row, ExpansionError>;
    fn insert_row(&mut self, index: usize, row: Self::Row);
    fn remove_row(&mut self, index: usize) -> Result<(), ExpansionError>;
}

/// What a fill did to the grid, so callers can keep row bookkeeping in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fill {
    /// The template row was removed (empty list).
    Removed { row: usize },
    /// Rows written in order; `inserted` of them were created after `reused` blank rows.
    Filled { rows: Vec<usize>, reused: usize, inserted: usize },
}

pub fn fill_column<G: RowGrid>(grid: &mut G, row: usize, column: usize, items: &[String]) -> Result<Fill, ExpansionError> {
    let width = grid.width(row);
    if column >= width {
        return Err(ExpansionError::ColumnOutOfRange { column, width });
    }

    if items.is_empty() {
        debug!("Empty list at row {}, column {}: removing template row", row, column);
        grid.remove_row(row)?;
        return Ok(Fill::Removed { row });
    }

    let wanted = items.len() - 1;
    let reusable = (row + 1..grid.row_count())
        .take_while(|&r| column < grid.width(r) && grid.is_blank(r, column))
        .take(wanted)
        .count();
    let inserted = wanted - reusable;

    // Copies are built before any write; a failing template row leaves the grid untouched.
    let copies = if inserted > 0 {
        let copy = grid.blank_copy(row)?;
        vec![copy; inserted]
    } else {
        Vec::new()
    };

    let mut rows = Vec::with_capacity(items.len());
    for (offset, item) in items.iter().take(reusable + 1).enumerate() {
        grid.set_text(row + offset, column, item);
        rows.push(row + offset);
    }

    let mut next = row + reusable + 1;
    for (copy, item) in copies.into_iter().zip(&items[reusable + 1..]) {
        grid.insert_row(next, copy);
        grid.set_text(next, column, item);
        rows.push(next);
        next += 1;
    }

    debug!(
        "Filled column {} from row {}: {} values, {} blank rows reused, {} rows inserted",
        column,
        row,
        items.len(),
        reusable,
        inserted
    );
    Ok(Fill::Filled { rows, reused: reusable, inserted })
}

/// Tracks which template cells still need processing while rows move around.
#[derive(Debug, Clone, Default)]
pub struct PendingCells {
    rows: Vec<Vec<bool>>,
}

impl PendingCells {
    pub fn new<G: RowGrid>(grid: &G, mut pending: impl FnMut(usize, usize) -> bool) -> Self {
        let rows = (0..grid.row_count())
            .map(|r| (0..grid.width(r)).map(|c| pending(r, c)).collect())
            .collect();
        Self { rows }
    }

    pub fn is_pending(&self, row: usize, column: usize) -> bool {
        self.rows.get(row).and_then(|r| r.get(column)).copied().unwrap_or(false)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self, row: usize) -> usize {
        self.rows.get(row).map_or(0, Vec::len)
    }

    pub fn done(&mut self, row: usize, column: usize) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(column)) {
            *cell = false;
        }
    }

    /// Mirrors a [`Fill`] applied at `column`.
    pub fn apply(&mut self, fill: &Fill, column: usize, width: usize) {
        match fill {
            Fill::Removed { row } => {
                if *row < self.rows.len() {
                    self.rows.remove(*row);
                }
            }
            Fill::Filled { rows, reused, inserted } => {
                let first_new = rows.len() - inserted;
                for &row in &rows[first_new..] {
                    self.rows.insert(row.min(self.rows.len()), vec![false; width]);
                }
                for &row in rows.iter().take(reused + 1) {
                    self.done(row, column);
                }
            }
        }
    }
}
