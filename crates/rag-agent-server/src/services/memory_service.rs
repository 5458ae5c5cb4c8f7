use crate::config::MemoryConfig;
use crate::database::{ConversationStore, MemoryStore, UserProfile};
use crate::llm::{extract_first_json_object, GenerationRequest, LlmGateway};
use crate::models::chat::ChatMessage;
use crate::utils::token_estimator;
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-turn user context assembled from the relational store: profile,
/// rolling summary, recent facts and the tail of the conversation.
#[derive(Debug, Clone)]
pub struct UserContext {
    /// The `### USER CONTEXT` block prepended to the system prompt.
    pub block: String,
    pub profile: Option<UserProfile>,
    /// True when the profile was missing and an anonymous context was built.
    pub degraded: bool,
}

pub struct MemoryService {
    store: Arc<MemoryStore>,
    conversations: Arc<ConversationStore>,
    gateway: Arc<LlmGateway>,
    config: MemoryConfig,
}

#[derive(Debug, Deserialize)]
struct ExtractedFacts {
    facts: Vec<ExtractedFact>,
}

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    content: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.7
}

impl MemoryService {
    pub fn new(
        store: Arc<MemoryStore>,
        conversations: Arc<ConversationStore>,
        gateway: Arc<LlmGateway>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            conversations,
            gateway,
            config,
        }
    }

    /// Assemble the injection block. Failures here are non-fatal: a missing
    /// profile or a dead table degrades to an anonymous context.
    pub async fn assemble_context(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
    ) -> UserContext {
        let profile = match self.store.get_profile(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Profile lookup failed for {}: {}", user_id, e);
                None
            }
        };
        let degraded = profile.is_none();
        if degraded {
            warn!("No profile for user {}, using anonymous context", user_id);
        }

        let mut block = String::from("### USER CONTEXT\n");

        match &profile {
            Some(profile) => {
                block.push_str(&format!("User: {} (role: {}", profile.name, profile.role));
                if let Some(department) = &profile.department {
                    block.push_str(&format!(", department: {}", department));
                }
                block.push_str(&format!(")\nPreferred language: {}\n", profile.language));
                if let Some(notes) = &profile.notes {
                    block.push_str(&format!("Notes: {}\n", notes));
                }
            }
            None => {
                block.push_str("User: anonymous\n");
            }
        }

        if let Ok(Some(summary)) = self.store.get_summary(user_id).await {
            let bounded = bound_to_tokens(&summary, self.config.max_summary_tokens);
            block.push_str(&format!("\nInteraction summary:\n{}\n", bounded));
        }

        match self.store.recent_facts(user_id, self.config.max_facts).await {
            Ok(facts) if !facts.is_empty() => {
                block.push_str("\nKnown facts:\n");
                for fact in facts {
                    block.push_str(&format!(
                        "- {} (confidence {:.2})\n",
                        fact.content, fact.confidence
                    ));
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Fact lookup failed for {}: {}", user_id, e),
        }

        if let Some(conversation_id) = conversation_id {
            match self
                .conversations
                .recent(conversation_id, self.config.max_history_turns)
                .await
            {
                Ok(turns) if !turns.is_empty() => {
                    block.push_str("\nRecent turns:\n");
                    for turn in turns {
                        let content: String = turn.content.chars().take(300).collect();
                        block.push_str(&format!("{}: {}\n", turn.role, content));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("History lookup failed for {}: {}", conversation_id, e),
            }
        }

        UserContext {
            block,
            profile,
            degraded,
        }
    }

    /// Extract durable facts from a finished exchange and append them.
    /// Facts are append-only; nothing is mutated in place.
    pub async fn extract_facts(
        &self,
        user_id: &str,
        user_message: &str,
        answer: &str,
    ) -> Result<usize> {
        let system_prompt = "You extract durable facts about a user from a conversation \
            exchange (their business, visa status, deadlines, preferences).\n\
            Return ONLY valid JSON: {\"facts\": [{\"content\": \"...\", \"confidence\": 0.0}]}\n\
            Only include facts worth remembering across sessions. Empty list if none.";

        let request = GenerationRequest {
            max_tokens: Some(400),
            temperature: Some(0.0),
            ..GenerationRequest::new(
                system_prompt,
                vec![ChatMessage::user(format!(
                    "user: {}\nassistant: {}",
                    user_message, answer
                ))],
            )
        };

        let generation = self
            .gateway
            .generate(&request)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let json_str = extract_first_json_object(&generation.text).unwrap_or("{\"facts\":[]}");
        let extracted: ExtractedFacts =
            serde_json::from_str(json_str).unwrap_or(ExtractedFacts { facts: Vec::new() });

        let count = extracted.facts.len();
        for fact in extracted.facts {
            self.store
                .append_fact(user_id, &fact.content, "conversation", fact.confidence)
                .await?;
        }

        if count > 0 {
            info!("Extracted {} memory facts for user {}", count, user_id);
        }
        Ok(count)
    }

    /// Re-summarize a user's recent interactions into the rolling summary.
    /// Called from the scheduled memory sweep, not the request path.
    pub async fn refresh_summary(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        let turns = self.conversations.recent(conversation_id, 20).await?;
        if turns.is_empty() {
            return Ok(());
        }

        let transcript: String = turns
            .iter()
            .map(|t| format!("{}: {}\n", t.role, t.content))
            .collect();

        let previous = self.store.get_summary(user_id).await?.unwrap_or_default();

        let request = GenerationRequest {
            max_tokens: Some(self.config.max_summary_tokens),
            temperature: Some(0.2),
            ..GenerationRequest::new(
                format!(
                    "Merge the previous summary and the new transcript into one rolling \
                     summary of at most {} tokens. Keep concrete facts (deadlines, document \
                     numbers, service requests). Reply with the summary text only.",
                    self.config.max_summary_tokens
                ),
                vec![ChatMessage::user(format!(
                    "Previous summary:\n{}\n\nNew transcript:\n{}",
                    previous, transcript
                ))],
            )
        };

        let generation = self
            .gateway
            .generate(&request)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let summary = bound_to_tokens(generation.text.trim(), self.config.max_summary_tokens);
        self.store.set_summary(user_id, &summary).await?;
        debug!("Refreshed summary for user {}", user_id);

        Ok(())
    }
}

fn bound_to_tokens(text: &str, max_tokens: usize) -> String {
    if token_estimator::estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }

    let max_words = (max_tokens.saturating_sub(5) as f64 / 1.3) as usize;
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_to_tokens_keeps_short_text() {
        let text = "Pemegang KITAS investor";
        assert_eq!(bound_to_tokens(text, 100), text);
    }

    #[test]
    fn test_bound_to_tokens_truncates_long_text() {
        let text = "kata ".repeat(1000);
        let bounded = bound_to_tokens(&text, 50);
        assert!(token_estimator::estimate_tokens(&bounded) <= 55);
    }
}
