//! Target resolution: which table does an edit instruction apply to?
//!
//! A supplied file is used as-is (its first sheet). Otherwise the retriever
//! is asked which sheet of the default workbook the instruction is about; the
//! first line of the best passage names the sheet.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{Dataset, Workbook};
use crate::error::PipelineError;
use crate::retrieval::Retriever;

/// Marker that precedes the sheet name on the first line of a passage.
pub const DEFAULT_SHEET_MARKER: &str = "Sheet: ";

const SHEET_QUERY_PREFIX: &str = "which sheet has information about this query: ";

/// Where the data for an edit comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// A file supplied with the instruction; its first sheet is edited.
    SuppliedFile(PathBuf),
    /// A multi-sheet workbook; the sheet is found through retrieval.
    Workbook(PathBuf),
}

impl DataSource {
    pub fn path(&self) -> &Path {
        match self {
            DataSource::SuppliedFile(path) | DataSource::Workbook(path) => path,
        }
    }
}

/// What the resolver decided about the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub sheet_name: Option<String>,
    pub resolution_reason: Option<String>,
}

/// A loaded target table.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub dataset: Dataset,
    pub spec: TargetSpec,
}

/// Builds the retrieval query used to find the sheet for `instruction`.
pub fn sheet_query(instruction: &str) -> String {
    format!("{}{}", SHEET_QUERY_PREFIX, instruction)
}

/// Reads the sheet name from the first line of a passage body.
pub fn sheet_name_from_passage(body: &str, marker: &str) -> Option<String> {
    let first_line = body.lines().next()?.trim();
    let name = first_line
        .strip_prefix(marker.trim_end())
        .unwrap_or(first_line)
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Finds and loads the table an instruction targets.
pub struct TargetResolver {
    retriever: Arc<dyn Retriever>,
    sheet_marker: String,
}

impl TargetResolver {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            retriever,
            sheet_marker: DEFAULT_SHEET_MARKER.to_string(),
        }
    }

    pub fn with_sheet_marker(mut self, marker: impl Into<String>) -> Self {
        self.sheet_marker = marker.into();
        self
    }

    /// Loads the target table. Failing to identify or find the sheet is
    /// fatal for the run.
    pub async fn resolve(
        &self,
        instruction: &str,
        source: &DataSource,
    ) -> Result<ResolvedTarget, PipelineError> {
        match source {
            DataSource::SuppliedFile(path) => {
                let sheet = Workbook::open(path)?
                    .into_first_sheet()
                    .ok_or_else(|| PipelineError::TargetNotFound {
                        sheet: String::new(),
                        origin: path.display().to_string(),
                    })?;
                debug!(path = %path.display(), sheet = %sheet.name, "Using supplied file");
                Ok(ResolvedTarget {
                    dataset: sheet.data,
                    spec: TargetSpec::default(),
                })
            }
            DataSource::Workbook(path) => self.resolve_in_workbook(instruction, path).await,
        }
    }

    async fn resolve_in_workbook(
        &self,
        instruction: &str,
        path: &Path,
    ) -> Result<ResolvedTarget, PipelineError> {
        let passages = self.retriever.retrieve(&sheet_query(instruction), 1).await?;
        let top = passages
            .first()
            .ok_or_else(|| PipelineError::TargetUnresolved(instruction.to_string()))?;
        let sheet_name = sheet_name_from_passage(&top.body, &self.sheet_marker)
            .ok_or_else(|| PipelineError::TargetUnresolved(instruction.to_string()))?;

        info!(sheet = %sheet_name, doc = %top.doc_title, "Identified target sheet");

        let sheet = Workbook::open(path)?.into_sheet(&sheet_name).ok_or_else(|| {
            PipelineError::TargetNotFound {
                sheet: sheet_name.clone(),
                origin: path.display().to_string(),
            }
        })?;

        Ok(ResolvedTarget {
            dataset: sheet.data,
            spec: TargetSpec {
                resolution_reason: Some(format!(
                    "top retrieval match in '{}' (score {:.2})",
                    top.doc_title, top.score
                )),
                sheet_name: Some(sheet_name),
            },
        })
    }
}
