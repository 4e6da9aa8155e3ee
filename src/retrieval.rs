//! Retrieval seam for the context assembler.
//!
//! The supervisor treats retrieval as an opaque function of the query, the
//! thread's history, and its content store; a failure is logged by the
//! caller and the turn proceeds with an empty retrieved block. The default
//! implementation is a keyword scorer over the two stores.

use async_trait::async_trait;
use anyhow::Result;

use crate::context::estimate_tokens;
use crate::store::{ContentStore, HistoryLog};

/// Produces the retrieved-context block for one turn, bounded by a token
/// budget.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        history: &HistoryLog,
        content: &ContentStore,
        budget_tokens: usize,
    ) -> Result<String>;
}

/// Keyword retriever over history search and stored blobs.
#[derive(Debug, Default)]
pub struct KeywordRetriever;

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(
        &self,
        query: &str,
        history: &HistoryLog,
        content: &ContentStore,
        budget_tokens: usize,
    ) -> Result<String> {
        if budget_tokens == 0 {
            return Ok(String::new());
        }

        let mut remaining = budget_tokens;
        let mut lines: Vec<String> = Vec::new();

        for term in query_terms(query) {
            for hit in history.search(&term).await {
                let line = format!("[history #{}] {}", hit.id, hit.content);
                let cost = estimate_tokens(&line);
                if cost > remaining {
                    continue;
                }
                if lines.contains(&line) {
                    continue;
                }
                remaining -= cost;
                lines.push(line);
            }
            for id in content.search(&term).await? {
                let line = format!("[stored {id}] available via fetch_stored");
                let cost = estimate_tokens(&line);
                if cost > remaining || lines.contains(&line) {
                    continue;
                }
                remaining -= cost;
                lines.push(line);
            }
        }

        Ok(lines.join("\n"))
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 3)
        .map(|word| word.to_lowercase())
        .collect();
    terms.dedup();
    terms
}
