//! Multi-sheet tabular sources.
//!
//! A workbook is any source that holds named sheets:
//! - a JSON workbook: `{"sheets": [{"name": ..., "columns": [...], "rows": [[...]]}]}`
//! - a single `.parquet` file, exposed as one sheet named after the file stem
//! - a directory of `.parquet` files, one sheet per file (sorted by name)

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::parquet_io::read_dataset;
use super::{Cell, Dataset};
use crate::error::DatasetError;

/// A named sheet of a workbook.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub data: Dataset,
}

/// A loaded multi-sheet source.
#[derive(Debug, Clone)]
pub struct Workbook {
    path: PathBuf,
    sheets: Vec<Sheet>,
}

#[derive(Debug, Deserialize)]
struct JsonWorkbook {
    sheets: Vec<JsonSheet>,
}

#[derive(Debug, Deserialize)]
struct JsonSheet {
    name: String,
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Cell>>,
}

impl Workbook {
    /// Opens a workbook, loading all of its sheets.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let sheets = if path.is_dir() {
            load_parquet_dir(path)?
        } else {
            match extension(path).as_deref() {
                Some("json") => load_json_workbook(path)?,
                Some("parquet") => vec![Sheet {
                    name: file_stem(path),
                    data: read_dataset(path)?,
                }],
                _ => return Err(DatasetError::UnsupportedFormat(path.display().to_string())),
            }
        };

        if sheets.is_empty() {
            return Err(DatasetError::EmptySource(path.display().to_string()));
        }

        debug!(
            path = %path.display(),
            sheets = sheets.len(),
            "Workbook opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            sheets,
        })
    }

    /// Path the workbook was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sheet names in source order.
    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    /// Looks up a sheet by exact name.
    pub fn sheet(&self, name: &str) -> Option<&Dataset> {
        self.sheets.iter().find(|s| s.name == name).map(|s| &s.data)
    }

    /// Takes the sheet with the exact name out of the workbook.
    pub fn into_sheet(self, name: &str) -> Option<Sheet> {
        self.sheets.into_iter().find(|s| s.name == name)
    }

    /// Takes the first sheet out of the workbook.
    pub fn into_first_sheet(self) -> Option<Sheet> {
        self.sheets.into_iter().next()
    }
}

/// Writes sheets as a JSON workbook.
pub fn write_json_workbook(path: impl AsRef<Path>, sheets: &[Sheet]) -> Result<(), DatasetError> {
    let value = serde_json::json!({
        "sheets": sheets
            .iter()
            .map(|s| serde_json::json!({
                "name": s.name,
                "columns": s.data.columns(),
                "rows": s.data.rows(),
            }))
            .collect::<Vec<_>>()
    });
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&value)?)?;
    Ok(())
}

fn load_json_workbook(path: &Path) -> Result<Vec<Sheet>, DatasetError> {
    let content = fs::read_to_string(path)?;
    let workbook: JsonWorkbook = serde_json::from_str(&content)?;
    workbook
        .sheets
        .into_iter()
        .map(|s| {
            Ok(Sheet {
                name: s.name,
                data: Dataset::new(s.columns, s.rows)?,
            })
        })
        .collect()
}

fn load_parquet_dir(dir: &Path) -> Result<Vec<Sheet>, DatasetError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && extension(p).as_deref() == Some("parquet"))
        .collect();
    files.sort();

    files
        .iter()
        .map(|file| {
            Ok(Sheet {
                name: file_stem(file),
                data: read_dataset(file)?,
            })
        })
        .collect()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
