use crate::llm::{GenerationRequest, LlmGateway};
use crate::models::chat::ChatMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cheap pre-checks that run before any tool use: an out-of-domain gate that
/// returns a fixed refusal, and an identity-question detector answered from
/// the user profile without touching retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefilterDecision {
    Proceed,
    OutOfDomain,
    Identity,
}

static IDENTITY_PATTERNS: &[&str] = &[
    "who am i",
    "what do you know about me",
    "what is my role",
    "what's my role",
    "my profile",
    "siapa saya",
    "siapa aku",
    "siapakah saya",
    "apa yang kamu tahu tentang saya",
    "apa peran saya",
    "profil saya",
];

static IN_DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(visa|kitas|kitap|voa|imigrasi|immigration|paspor|passport|pajak|tax|npwp|spt|pph|ppn|kbli|oss|nib|pt pma|rptka|bkpm|perusahaan|company|izin|permit|regulasi|regulation|peraturan|undang|hukum|legal|law|notaris|deed|akta|bpjs|harga|price|biaya|cost|layanan|service|pp\s*\d+|uu\s*\d+)\b",
    )
    .unwrap()
});

static OUT_OF_DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(world cup|piala dunia|sepak bola|football match|basketball|olympics|olimpiade|celebrity|selebriti|movie|film terbaru|lyrics|lirik lagu|resep|recipe|cuaca|weather|horoscope|zodiak|game of thrones|premier league)\b",
    )
    .unwrap()
});

pub struct PreFilter {
    gateway: Arc<LlmGateway>,
}

impl PreFilter {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    pub fn matches_identity(message: &str) -> bool {
        let lower = message.to_lowercase();
        IDENTITY_PATTERNS.iter().any(|p| lower.contains(p))
    }

    pub fn matches_in_domain(message: &str) -> bool {
        IN_DOMAIN.is_match(message)
    }

    pub fn matches_out_of_domain(message: &str) -> bool {
        OUT_OF_DOMAIN.is_match(message)
    }

    /// Deterministic keyword pass first; only a suspected off-topic query
    /// pays for the lightweight classifier call (which tempers false
    /// refusals on ambiguous phrasing).
    pub async fn decide(&self, message: &str) -> PrefilterDecision {
        if Self::matches_identity(message) {
            debug!("Prefilter: identity question");
            return PrefilterDecision::Identity;
        }

        if Self::matches_in_domain(message) {
            return PrefilterDecision::Proceed;
        }

        if Self::matches_out_of_domain(message) {
            return match self.classify_in_domain(message).await {
                Some(true) => PrefilterDecision::Proceed,
                Some(false) | None => PrefilterDecision::OutOfDomain,
            };
        }

        PrefilterDecision::Proceed
    }

    async fn classify_in_domain(&self, message: &str) -> Option<bool> {
        let request = GenerationRequest {
            max_tokens: Some(8),
            temperature: Some(0.0),
            ..GenerationRequest::new(
                "You classify whether a question is about Indonesian legal, visa, tax, \
                 business-licensing or company-operations topics. Answer with exactly \
                 one word: YES or NO.",
                vec![ChatMessage::user(message.to_string())],
            )
        };

        match self.gateway.generate(&request).await {
            Ok(generation) => {
                let answer = generation.text.trim().to_uppercase();
                Some(answer.starts_with("YES"))
            }
            Err(e) => {
                warn!("Domain classifier unavailable ({}), trusting keywords", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_detection() {
        assert!(PreFilter::matches_identity("Who am I?"));
        assert!(PreFilter::matches_identity("Siapa saya?"));
        assert!(PreFilter::matches_identity("apa yang kamu tahu tentang saya"));
        assert!(!PreFilter::matches_identity("Who issues the KITAS?"));
    }

    #[test]
    fn test_in_domain_detection() {
        assert!(PreFilter::matches_in_domain("Berapa biaya investor KITAS?"));
        assert!(PreFilter::matches_in_domain("What is the validity of PP 31/2013?"));
        assert!(PreFilter::matches_in_domain("How do I register an NPWP?"));
        assert!(!PreFilter::matches_in_domain("Who won the match last night?"));
    }

    #[test]
    fn test_out_of_domain_detection() {
        assert!(PreFilter::matches_out_of_domain("Who won the 1998 World Cup?"));
        assert!(PreFilter::matches_out_of_domain("resep nasi goreng enak"));
        assert!(!PreFilter::matches_out_of_domain(
            "Apa syarat visa untuk digital nomad?"
        ));
    }

    #[test]
    fn test_domain_keywords_override_offtopic_suspicion() {
        // Both sides match; the in-domain check runs first.
        let msg = "Is there a tax on world cup tickets sold in Indonesia?";
        assert!(PreFilter::matches_in_domain(msg));
    }
}
