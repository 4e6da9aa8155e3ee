//! Per-turn context assembly under a hard token budget.
//!
//! Builds the system prompt sent to the claude CLI out of conversation
//! stats, the always-include block, a bounded slice of recent messages, and
//! the retrieved-context block, and decides whether the user's own input is
//! small enough to send inline or must be externalized to the content store
//! behind a `[STORED:<id>]` sentinel.

use anyhow::Result;
use log::debug;

use crate::store::{ContentStore, HistoryStats, Message, Role};

/// How many trailing messages are considered for the recent block.
pub const RECENT_CONTEXT_COUNT: usize = 10;
/// Per-message token ceiling inside the recent block.
pub const RECENT_MSG_MAX_TOKENS: usize = 500;
/// Overall context window budget for one turn.
pub const TOTAL_CONTEXT_BUDGET: usize = 120_000;
/// Slice of the total reserved for the recent block.
pub const RECENT_CONTEXT_BUDGET: usize = 6_000;

/// Absolute ceiling beyond which user input is always externalized.
const USER_INPUT_EXTERNALIZE_TOKENS: usize = 8_000;

/// Rough token estimate: one token per four bytes of UTF-8.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimation function injected into the assembler.
pub type TokenEstimator = fn(&str) -> usize;

/// Everything the assembler needs for one turn.
pub struct ContextInputs<'a> {
    pub stats: HistoryStats,
    pub session_id: &'a str,
    /// Latest-last, at most [`RECENT_CONTEXT_COUNT`] entries.
    pub recent: &'a [Message],
    pub user_input: &'a str,
    pub retrieved_context: &'a str,
    pub always_include: &'a str,
    pub always_include_tokens: usize,
}

/// The assembled prompt plus the (possibly rewritten) user input.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub system_prompt: String,
    pub user_input: String,
}

/// Budgeted system-prompt builder.
pub struct ContextAssembler {
    estimator: TokenEstimator,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextAssembler {
    pub fn new() -> Self {
        Self {
            estimator: estimate_tokens,
        }
    }

    pub fn with_estimator(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    /// The token budget handed to the retriever for this turn.
    pub fn rag_budget(&self, user_input: &str, always_include_tokens: usize) -> usize {
        TOTAL_CONTEXT_BUDGET
            .saturating_sub((self.estimator)(user_input))
            .saturating_sub(always_include_tokens)
            .saturating_sub(RECENT_CONTEXT_BUDGET)
    }

    /// Build the final system prompt and rewrite the user input if the
    /// externalization policy demands it.
    pub async fn assemble(
        &self,
        inputs: ContextInputs<'_>,
        content: &ContentStore,
    ) -> Result<AssembledContext> {
        let recent_block = self.format_recent_block(inputs.recent);

        let user_tokens = (self.estimator)(inputs.user_input);
        let inline_budget = TOTAL_CONTEXT_BUDGET
            .saturating_sub(inputs.always_include_tokens)
            .saturating_sub(RECENT_CONTEXT_BUDGET);
        let user_input = if should_externalize_user_input(user_tokens, inline_budget) {
            let id = content.put(inputs.user_input).await?;
            debug!("externalized user input ({user_tokens} tokens) as [STORED:{id}]");
            format!("[STORED:{id}]")
        } else {
            inputs.user_input.to_string()
        };

        let system_prompt = format!(
            "You are resuming a long-running conversation.\n\
             \n\
             ## Conversation stats\n\
             - Prior messages: {count}\n\
             - Estimated prior tokens: {tokens}\n\
             - Session: {session}\n\
             \n\
             ## Workspace notes\n\
             {always_include}\n\
             \n\
             ## Recent conversation\n\
             {recent}\n\
             \n\
             ## Retrieved context\n\
             {retrieved}\n\
             \n\
             {tools}",
            count = inputs.stats.count,
            tokens = inputs.stats.total_tokens,
            session = inputs.session_id,
            always_include = inputs.always_include,
            recent = recent_block,
            retrieved = inputs.retrieved_context,
            tools = RETRIEVAL_TOOLS_BLOCK,
        );

        Ok(AssembledContext {
            system_prompt,
            user_input,
        })
    }

    /// Walk the recent list newest-to-oldest, truncating each message and
    /// prepending while it fits the recent budget. Stops at the first
    /// over-budget message; later (older) messages are not considered. The
    /// rendered block is oldest-first.
    fn format_recent_block(&self, recent: &[Message]) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut remaining = RECENT_CONTEXT_BUDGET;

        for message in recent.iter().rev() {
            let line = format!(
                "{}: {}",
                role_label(message.role),
                truncate_to_tokens(&message.content, RECENT_MSG_MAX_TOKENS)
            );
            let cost = (self.estimator)(&line);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            lines.push(line);
        }

        lines.reverse();
        lines.join("\n")
    }
}

/// Constant instruction block describing the fallback retrieval tools.
const RETRIEVAL_TOOLS_BLOCK: &str = "## Retrieval tools\n\
    If the context above is missing something you need, call\n\
    search_history(query) to search the full conversation log, or\n\
    fetch_stored(id) to expand any [STORED:<id>] sentinel into its full body.";

/// Policy predicate for swapping oversized user input for a sentinel.
fn should_externalize_user_input(user_tokens: usize, inline_budget: usize) -> bool {
    user_tokens > USER_INPUT_EXTERNALIZE_TOKENS || user_tokens > inline_budget
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::SystemMarker => "system",
    }
}

/// Truncate to roughly `max_tokens` worth of characters, marking the cut.
fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let char_budget = max_tokens * 3;
    if text.len() <= char_budget {
        return text.to_string();
    }
    let mut cut = char_budget;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated]", &text[..cut])
}
