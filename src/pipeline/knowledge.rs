//! Answers information requests from retrieved passages.

use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::llm::Oracle;
use crate::retrieval::{RetrievedPassage, Retriever};

/// Default number of passages fed to the answer prompt.
pub const DEFAULT_RETRIEVAL_K: usize = 10;

const ANSWER_SYSTEM_PROMPT: &str =
    "You answer questions about energy and climate scenario data from the provided context.";

/// An answer together with the documents it was drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeAnswer {
    pub text: String,
    pub sources: Vec<String>,
}

/// Document titles in retrieval order, without repeats.
pub fn unique_sources(passages: &[RetrievedPassage]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for passage in passages {
        if !passage.doc_title.is_empty() && !sources.contains(&passage.doc_title) {
            sources.push(passage.doc_title.clone());
        }
    }
    sources
}

pub fn build_answer_prompt(question: &str, passages: &[RetrievedPassage]) -> String {
    let context = passages
        .iter()
        .map(|p| p.body.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let sources = unique_sources(passages);

    format!(
        "Use only the context below to answer the question. \
         If the context does not contain the answer, say so.\n\
         List the source documents you relied on at the end of your answer.\n\n\
         Context:\n{}\n\n\
         Sources: {}\n\n\
         Question: {}\n\n\
         Answer:",
        if context.is_empty() { "(no context found)" } else { context.as_str() },
        if sources.is_empty() { "none".to_string() } else { sources.join(", ") },
        question
    )
}

/// Retrieval-grounded question answering.
pub struct KnowledgeResponder {
    retriever: Arc<dyn Retriever>,
    oracle: Oracle,
    k: usize,
}

impl KnowledgeResponder {
    pub fn new(retriever: Arc<dyn Retriever>, oracle: Oracle) -> Self {
        Self {
            retriever,
            oracle,
            k: DEFAULT_RETRIEVAL_K,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub async fn answer(&self, question: &str) -> Result<KnowledgeAnswer, PipelineError> {
        let passages = self.retriever.retrieve(question, self.k).await?;
        debug!(passages = passages.len(), "Retrieved context for question");

        let prompt = build_answer_prompt(question, &passages);
        let text = self
            .oracle
            .complete(Some(ANSWER_SYSTEM_PROMPT), &prompt)
            .await?;

        Ok(KnowledgeAnswer {
            text,
            sources: unique_sources(&passages),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::oracle::testing::ScriptedProvider;
    use crate::retrieval::{Passage, PassageStore};
    use std::time::Duration;

    fn passage(body: &str, title: &str) -> RetrievedPassage {
        RetrievedPassage {
            body: body.to_string(),
            doc_title: title.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn test_unique_sources_keeps_order() {
        let passages = [
            passage("a", "guide.pdf"),
            passage("b", "workbook"),
            passage("c", "guide.pdf"),
            passage("d", ""),
        ];
        assert_eq!(unique_sources(&passages), vec!["guide.pdf", "workbook"]);
    }

    #[test]
    fn test_prompt_contains_context_and_question() {
        let prompt = build_answer_prompt(
            "what is inv_cost?",
            &[passage("inv_cost is the investment cost", "guide.pdf")],
        );
        assert!(prompt.contains("Context:\ninv_cost is the investment cost"));
        assert!(prompt.contains("Sources: guide.pdf"));
        assert!(prompt.ends_with("Question: what is inv_cost?\n\nAnswer:"));
    }

    #[test]
    fn test_prompt_without_context() {
        let prompt = build_answer_prompt("why?", &[]);
        assert!(prompt.contains("(no context found)"));
        assert!(prompt.contains("Sources: none"));
    }

    #[tokio::test]
    async fn test_answer_uses_retrieved_passages() {
        let store = PassageStore::from_passages(vec![
            Passage {
                body: "inv_cost is the investment cost per unit of capacity".into(),
                doc_title: "guide.pdf".into(),
            },
            Passage {
                body: "emission factors by technology".into(),
                doc_title: "emissions.pdf".into(),
            },
        ]);
        let provider = Arc::new(ScriptedProvider::answering("It is the investment cost."));
        let responder = KnowledgeResponder::new(
            Arc::new(store),
            Oracle::new(provider.clone(), "m", Duration::from_secs(5)),
        );

        let answer = responder.answer("what is inv_cost").await.expect("answers");

        assert_eq!(answer.text, "It is the investment cost.");
        assert_eq!(answer.sources, vec!["guide.pdf"]);
        assert!(provider.prompts.lock().expect("lock")[0].contains("investment cost per unit"));
    }

    #[tokio::test]
    async fn test_oracle_failure_propagates() {
        let provider = Arc::new(ScriptedProvider::failing("down"));
        let responder = KnowledgeResponder::new(
            Arc::new(PassageStore::default()),
            Oracle::new(provider, "m", Duration::from_secs(5)),
        );

        let err = responder.answer("what?").await.unwrap_err();
        assert!(matches!(err, PipelineError::Llm(LlmError::RequestFailed(_))));
    }
}
