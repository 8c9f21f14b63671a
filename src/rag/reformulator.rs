//! Follow-up question rewriting for standalone retrieval queries.
//!
//! Reformulation is a best-effort optimization: it only triggers when the
//! question looks anaphoric and history exists, and any failure of the
//! rewrite call falls back silently to the original question.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::config::ChatConfig;
use crate::rag::generator::{GenerationClient, PromptMessage};
use crate::storage::{ConversationMessage, MessageRole};

/// Referential words that suggest the question leans on prior turns.
const FOLLOW_UP_CUES: &str =
    r"(?i)\b(that|this|it|those|these|above|previous|last|more|explain|elaborate)\b";

/// History turns fed to the rewrite prompt.
const REWRITE_HISTORY_TURNS: usize = 4;

fn follow_up_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FOLLOW_UP_CUES).expect("static cue pattern is valid"))
}

/// Whether a question contains a whole-word follow-up cue.
pub fn is_follow_up(question: &str) -> bool {
    follow_up_regex().is_match(question)
}

pub struct QueryReformulator {
    generator: Arc<dyn GenerationClient>,
    config: ChatConfig,
}

impl QueryReformulator {
    pub fn new(generator: Arc<dyn GenerationClient>, config: ChatConfig) -> Self {
        Self { generator, config }
    }

    /// Rewrite a follow-up question into a standalone search query, or
    /// return the original question when rewriting does not apply or fails.
    pub async fn reformulate(&self, question: &str, history: &[ConversationMessage]) -> String {
        if history.is_empty() || !is_follow_up(question) {
            return question.to_string();
        }

        let mut prompt = vec![PromptMessage::system(
            "You rewrite follow-up questions into standalone search queries. \
             Using the conversation for context, rewrite the user's latest \
             question so it can be understood without the conversation. \
             Output only the rewritten query, nothing else."
                .to_string(),
        )];

        let start = history.len().saturating_sub(REWRITE_HISTORY_TURNS);
        for message in &history[start..] {
            let content = truncate_chars(&message.content, self.config.history_message_chars);
            prompt.push(match message.role {
                MessageRole::User => PromptMessage::user(content),
                MessageRole::Assistant => PromptMessage::assistant(content),
            });
        }
        prompt.push(PromptMessage::user(format!(
            "Rewrite this question as a standalone search query: {question}"
        )));

        match self.generator.complete(&prompt, 128, 0.0).await {
            Ok(completion) => {
                let rewritten = completion.text.trim().trim_matches('"').to_string();
                if rewritten.is_empty() {
                    question.to_string()
                } else {
                    log::debug!("Reformulated {question:?} -> {rewritten:?}");
                    rewritten
                }
            }
            Err(e) => {
                log::warn!("Query reformulation failed, using original question: {e}");
                question.to_string()
            }
        }
    }
}

/// Truncate to a character budget on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}
