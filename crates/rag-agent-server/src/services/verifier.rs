use crate::llm::{extract_first_json_object, GenerationRequest, LlmGateway};
use crate::models::chat::ChatMessage;
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierStatus {
    Pass,
    /// Passes through with marking; the answer ships tagged low-confidence.
    Warn,
    /// Claims not supported by the evidence; the loop may retry.
    Fail,
}

impl VerifierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierReport {
    pub status: VerifierStatus,
    pub score: f32,
    pub reasoning: String,
}

/// Grades a draft answer against the retrieved evidence. `fail` means
/// hallucination suspected.
pub struct Verifier {
    gateway: Arc<LlmGateway>,
}

#[derive(Debug, Deserialize)]
struct WireReport {
    status: String,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl Verifier {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    pub async fn verify(
        &self,
        query: &str,
        draft: &str,
        evidence_passages: &[String],
    ) -> Result<VerifierReport> {
        let mut evidence_block = String::new();
        for passage in evidence_passages {
            evidence_block.push_str(passage);
            evidence_block.push_str("\n\n");
        }
        if evidence_block.is_empty() {
            evidence_block.push_str("(no evidence passages were retrieved)\n");
        }

        let system_prompt = "You grade whether a draft answer is supported by the evidence \
            passages.\n\
            Return ONLY valid JSON: {\"status\": \"pass\"|\"warn\"|\"fail\", \
            \"score\": 0.0-1.0, \"reasoning\": \"...\"}\n\
            - pass: every factual claim is supported by the evidence\n\
            - warn: mostly supported, minor unsupported details\n\
            - fail: key claims are not in the evidence (hallucination suspected)";

        let request = GenerationRequest {
            max_tokens: Some(300),
            temperature: Some(0.0),
            ..GenerationRequest::new(
                system_prompt,
                vec![ChatMessage::user(format!(
                    "Question:\n{}\n\nDraft answer:\n{}\n\nEvidence:\n{}",
                    query, draft, evidence_block
                ))],
            )
        };

        let generation = self
            .gateway
            .generate(&request)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let report = Self::parse_report(&generation.text);
        info!(
            "Verifier verdict: {} (score {:.2})",
            report.status.as_str(),
            report.score
        );

        Ok(report)
    }

    /// Parse the grading output; anything unparseable degrades to `warn` so
    /// a flaky grader never blocks an answer.
    pub fn parse_report(text: &str) -> VerifierReport {
        let Some(json_str) = extract_first_json_object(text) else {
            warn!("Verifier returned no JSON, degrading to warn");
            return VerifierReport {
                status: VerifierStatus::Warn,
                score: 0.5,
                reasoning: "verifier output unparseable".to_string(),
            };
        };

        let Ok(wire) = serde_json::from_str::<WireReport>(json_str) else {
            warn!("Verifier JSON malformed, degrading to warn");
            return VerifierReport {
                status: VerifierStatus::Warn,
                score: 0.5,
                reasoning: "verifier output unparseable".to_string(),
            };
        };

        let status = match wire.status.trim().to_lowercase().as_str() {
            "pass" => VerifierStatus::Pass,
            "fail" => VerifierStatus::Fail,
            _ => VerifierStatus::Warn,
        };

        VerifierReport {
            status,
            score: wire.score.unwrap_or(0.5).clamp(0.0, 1.0),
            reasoning: wire.reasoning.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pass() {
        let report = Verifier::parse_report(
            r#"{"status": "pass", "score": 0.93, "reasoning": "all claims cited"}"#,
        );
        assert_eq!(report.status, VerifierStatus::Pass);
        assert!((report.score - 0.93).abs() < 1e-6);
    }

    #[test]
    fn test_parse_fail_with_noise() {
        let report = Verifier::parse_report(
            "Here is my grading: {\"status\": \"fail\", \"score\": 0.2, \"reasoning\": \"the validity period is not in the evidence\"} done",
        );
        assert_eq!(report.status, VerifierStatus::Fail);
        assert!(report.reasoning.contains("validity period"));
    }

    #[test]
    fn test_unknown_status_degrades_to_warn() {
        let report = Verifier::parse_report(r#"{"status": "maybe", "score": 0.6}"#);
        assert_eq!(report.status, VerifierStatus::Warn);
    }

    #[test]
    fn test_unparseable_output_degrades_to_warn() {
        let report = Verifier::parse_report("I think it looks fine.");
        assert_eq!(report.status, VerifierStatus::Warn);
        assert_eq!(report.score, 0.5);
    }

    #[test]
    fn test_score_clamped() {
        let report = Verifier::parse_report(r#"{"status": "pass", "score": 1.7}"#);
        assert_eq!(report.score, 1.0);
    }
}
