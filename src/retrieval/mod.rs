//! Passage retrieval.
//!
//! The pipeline only depends on the [`Retriever`] trait: sheet resolution asks
//! for the single best passage, the knowledge path for the top ten. The
//! shipped [`PassageStore`] is a read-only, in-memory store loaded from JSON
//! and ranked by IDF-weighted term overlap. It is built once at startup and
//! shared behind an `Arc`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// A passage returned for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub body: String,
    pub doc_title: String,
    pub score: f32,
}

/// Source of ranked passages.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Returns at most `k` passages, best first.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>, RetrievalError>;
}

/// A stored passage as it appears in the index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub body: String,
    #[serde(default, alias = "docTitle")]
    pub doc_title: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PassageFile {
    Wrapped { passages: Vec<Passage> },
    Bare(Vec<Passage>),
}

#[derive(Debug)]
struct IndexedPassage {
    passage: Passage,
    terms: HashSet<String>,
}

/// In-memory passage index.
#[derive(Debug, Default)]
pub struct PassageStore {
    passages: Vec<IndexedPassage>,
    idf: HashMap<String, f32>,
}

impl PassageStore {
    /// Builds the index over `passages`.
    pub fn from_passages(passages: Vec<Passage>) -> Self {
        let indexed: Vec<IndexedPassage> = passages
            .into_iter()
            .map(|passage| IndexedPassage {
                terms: tokenize(&format!("{} {}", passage.doc_title, passage.body)),
                passage,
            })
            .collect();

        let mut document_frequency: HashMap<&str, usize> = HashMap::new();
        for entry in &indexed {
            for term in &entry.terms {
                *document_frequency.entry(term.as_str()).or_default() += 1;
            }
        }

        let n = indexed.len() as f32;
        let idf = document_frequency
            .into_iter()
            .map(|(term, df)| (term.to_string(), (1.0 + n / df as f32).ln()))
            .collect();

        Self {
            passages: indexed,
            idf,
        }
    }

    /// Loads passages from a JSON file holding either an array of
    /// `{"body", "doc_title"}` objects or `{"passages": [...]}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RetrievalError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let passages = match serde_json::from_str::<PassageFile>(&content) {
            Ok(PassageFile::Wrapped { passages }) | Ok(PassageFile::Bare(passages)) => passages,
            Err(e) => {
                return Err(RetrievalError::InvalidIndex(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };

        tracing::info!(
            path = %path.display(),
            passages = passages.len(),
            "Passage store loaded"
        );

        Ok(Self::from_passages(passages))
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Ranks passages against `query`. Passages sharing no term are dropped;
    /// ties keep store order.
    pub fn search(&self, query: &str, k: usize) -> Vec<RetrievedPassage> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .passages
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                let score: f32 = query_terms
                    .iter()
                    .filter(|t| entry.terms.contains(*t))
                    .map(|t| self.idf.get(t).copied().unwrap_or(0.0))
                    .sum();
                (score > 0.0).then_some((idx, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        scored
            .into_iter()
            .take(k)
            .map(|(idx, score)| {
                let passage = &self.passages[idx].passage;
                RetrievedPassage {
                    body: passage.body.clone(),
                    doc_title: passage.doc_title.clone(),
                    score,
                }
            })
            .collect()
    }
}

#[async_trait]
impl Retriever for PassageStore {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        Ok(self.search(query, k))
    }
}

/// Lower-cased word tokens; `_` stays inside words so `inv_cost` is one term.
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PassageStore {
        PassageStore::from_passages(vec![
            Passage {
                body: "Sheet: inv_cost\nInvestment cost per technology and vintage year.".into(),
                doc_title: "CurPol-v2 workbook".into(),
            },
            Passage {
                body: "Sheet: fix_cost\nFixed operation and maintenance cost.".into(),
                doc_title: "CurPol-v2 workbook".into(),
            },
            Passage {
                body: "The var_cost parameter is the variable operating cost.".into(),
                doc_title: "MESSAGEix documentation".into(),
            },
        ])
    }

    #[test]
    fn test_search_ranks_specific_terms_first() {
        let results = store().search(
            "which sheet has information about this query: double the inv_cost of solar",
            1,
        );
        assert_eq!(results.len(), 1);
        assert!(results[0].body.starts_with("Sheet: inv_cost"));
    }

    #[test]
    fn test_search_respects_k_and_drops_non_matches() {
        let store = store();
        assert_eq!(store.search("cost", 10).len(), 3);
        assert_eq!(store.search("cost", 2).len(), 2);
        assert!(store.search("photovoltaic", 10).is_empty());
        assert!(store.search("", 10).is_empty());
    }

    #[test]
    fn test_ties_keep_store_order() {
        let results = store().search("workbook", 10);
        assert_eq!(results.len(), 2);
        assert!(results[0].body.contains("inv_cost"));
        assert!(results[1].body.contains("fix_cost"));
    }

    #[test]
    fn test_load_both_file_shapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, r#"[{"body": "Sheet: a", "docTitle": "t"}]"#).expect("write");
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(&wrapped, r#"{"passages": [{"body": "x"}, {"body": "y"}]}"#)
            .expect("write");

        let bare = PassageStore::load(&bare).expect("load bare");
        assert_eq!(bare.len(), 1);
        assert_eq!(bare.search("a", 1)[0].doc_title, "t");
        assert_eq!(PassageStore::load(&wrapped).expect("load wrapped").len(), 2);

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, r#"{"nope": 1}"#).expect("write");
        assert!(matches!(
            PassageStore::load(&broken),
            Err(RetrievalError::InvalidIndex(_))
        ));
    }

    #[tokio::test]
    async fn test_retriever_trait() {
        let store: std::sync::Arc<dyn Retriever> = std::sync::Arc::new(store());
        let results = store.retrieve("var_cost", 10).await.expect("retrieve");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_title, "MESSAGEix documentation");
    }
}
