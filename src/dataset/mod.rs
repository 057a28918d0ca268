//! In-memory tabular data for scenario editing.
//!
//! A [`Dataset`] is a list of named columns plus ordered rows of [`Cell`]s.
//! It is what a sheet of a scenario workbook becomes once loaded, what the
//! sandbox receives as `df`, and what gets written to the output artifact.
//!
//! Sources and sinks live in the submodules:
//! - [`workbook`]: multi-sheet sources read by sheet name
//! - [`parquet_io`]: the single-sheet Parquet artifact written after a successful edit

pub mod parquet_io;
pub mod workbook;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::DatasetError;

pub use parquet_io::{read_dataset, write_dataset};
pub use workbook::{Sheet, Workbook};

/// Largest integer an f64 represents exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A single value in a dataset.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Cell {
    /// Returns the numeric value, if this cell holds one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text value, if this cell holds one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

// Integral numbers are written as JSON integers so that pandas keeps integer
// dtypes (years, vintages) instead of turning them into floats.
impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Null => serializer.serialize_none(),
            Cell::Bool(b) => serializer.serialize_bool(*b),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < MAX_EXACT_INTEGER => {
                serializer.serialize_i64(*n as i64)
            }
            Cell::Number(n) => serializer.serialize_f64(*n),
            Cell::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Number(value as f64)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

/// The value kinds found in a column, ignoring nulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Every cell is null (or there are no rows).
    Empty,
    Number,
    Bool,
    Text,
    /// More than one non-null kind.
    Mixed,
}

/// A table with named columns and ordered rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Dataset {
    /// Creates a dataset, checking that every row matches the column count.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, DatasetError> {
        for (row, cells) in rows.iter().enumerate() {
            if cells.len() != columns.len() {
                return Err(DatasetError::RaggedRow {
                    row,
                    expected: columns.len(),
                    actual: cells.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    /// Column names in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows in order.
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Index of the named column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of the named column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&Cell>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Classifies the values of the column at `idx`.
    pub fn column_kind(&self, idx: usize) -> ColumnKind {
        let mut kind = ColumnKind::Empty;
        for row in &self.rows {
            let cell_kind = match &row[idx] {
                Cell::Null => continue,
                Cell::Number(_) => ColumnKind::Number,
                Cell::Bool(_) => ColumnKind::Bool,
                Cell::Text(_) => ColumnKind::Text,
            };
            kind = match kind {
                ColumnKind::Empty => cell_kind,
                existing if existing == cell_kind => existing,
                _ => return ColumnKind::Mixed,
            };
        }
        kind
    }

    /// A fresh copy for one transformation attempt.
    ///
    /// Attempts only ever see working copies; the dataset they were taken
    /// from stays untouched whatever the generated code does.
    pub fn working_copy(&self) -> Dataset {
        self.clone()
    }

    /// Renders the first `n` rows as JSON records (`{"column": value, ...}`),
    /// one per line, keeping column order.
    pub fn sample_records(&self, n: usize) -> String {
        self.rows
            .iter()
            .take(n)
            .map(|row| {
                let fields: Vec<String> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(name, cell)| {
                        format!(
                            "{}: {}",
                            serde_json::to_string(name).unwrap_or_default(),
                            serde_json::to_string(cell).unwrap_or_else(|_| "null".to_string())
                        )
                    })
                    .collect();
                format!("{{{}}}", fields.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
