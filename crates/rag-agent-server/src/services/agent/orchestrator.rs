use crate::config::{AgentConfig, FeatureFlags, PromptsConfig};
use crate::database::ConversationStore;
use crate::llm::{GenerationRequest, LlmEvent, LlmGateway, ToolInvocation};
use crate::logging::{AuditLogger, AuditRecord, AuditStatus, Component, RecordKind};
use crate::metrics::PerformanceMetrics;
use crate::models::chat::{
    AgentEvent, ChatMessage, ModelAttempt, SourceInfo, TurnMetadata, VerifierInfo,
};
use crate::services::agent::prefilter::{PreFilter, PrefilterDecision};
use crate::services::memory_service::{MemoryService, UserContext};
use crate::services::session::SessionCache;
use crate::services::verifier::{Verifier, VerifierStatus};
use crate::tools::ToolRegistry;
use crate::utils::error::ApiError;
use crate::utils::token_estimator;
use dashmap::DashMap;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub request_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub message: String,
    pub preferred_model: Option<String>,
}

pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// How a turn ended, other than a streamed answer.
enum Terminal {
    Failed(ApiError),
    Cancelled,
}

/// How one generation round ended.
enum RoundEnd {
    Complete,
    Cancelled,
    TimedOut,
    ProviderError(String),
}

/// The ReAct loop: assemble context, generate, execute tool calls as
/// observations, optionally verify, stream the final answer. Exactly one
/// `Done` or `Error` event terminates every stream, after all other events.
pub struct AgentOrchestrator {
    memory: Arc<MemoryService>,
    gateway: Arc<LlmGateway>,
    tools: Arc<ToolRegistry>,
    verifier: Arc<Verifier>,
    conversations: Arc<ConversationStore>,
    sessions: SessionCache,
    prefilter: PreFilter,
    audit: AuditLogger,
    metrics: Arc<PerformanceMetrics>,
    agent_cfg: AgentConfig,
    features: FeatureFlags,
    prompts: PromptsConfig,
    /// Per-conversation locks: two concurrent requests on one conversation
    /// are serialized, FIFO, with the acquire bounded by a timeout.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

const DELTA_CHARS: usize = 48;

impl AgentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: Arc<MemoryService>,
        gateway: Arc<LlmGateway>,
        tools: Arc<ToolRegistry>,
        verifier: Arc<Verifier>,
        conversations: Arc<ConversationStore>,
        sessions: SessionCache,
        prefilter: PreFilter,
        audit: AuditLogger,
        metrics: Arc<PerformanceMetrics>,
        agent_cfg: AgentConfig,
        features: FeatureFlags,
        prompts: PromptsConfig,
    ) -> Self {
        Self {
            memory,
            gateway,
            tools,
            verifier,
            conversations,
            sessions,
            prefilter,
            audit,
            metrics,
            agent_cfg,
            features,
            prompts,
            locks: DashMap::new(),
        }
    }

    pub fn new_conversation_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Split final text into streaming deltas (server-side streaming).
    fn text_as_deltas(text: &str, max_chars_per_delta: usize) -> Vec<String> {
        if text.is_empty() {
            return vec![];
        }

        let mut out = Vec::new();
        let mut buf = String::new();
        let mut count = 0usize;

        for ch in text.chars() {
            buf.push(ch);
            count += 1;

            if count >= max_chars_per_delta {
                out.push(std::mem::take(&mut buf));
                count = 0;
            }
        }

        if !buf.is_empty() {
            out.push(buf);
        }

        out
    }

    /// Canonical dedup key for a tool call: name plus arguments with object
    /// keys sorted at every level.
    fn tool_call_key(invocation: &ToolInvocation) -> String {
        fn canonicalize(value: &Value) -> Value {
            match value {
                Value::Object(map) => {
                    let mut keys: Vec<&String> = map.keys().collect();
                    keys.sort();
                    let mut sorted = serde_json::Map::new();
                    for key in keys {
                        sorted.insert(key.clone(), canonicalize(&map[key]));
                    }
                    Value::Object(sorted)
                }
                Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
                other => other.clone(),
            }
        }

        format!("{}:{}", invocation.name, canonicalize(&invocation.arguments))
    }

    fn identity_answer(context: &UserContext) -> String {
        match &context.profile {
            Some(profile) => {
                let mut department = String::new();
                if let Some(d) = &profile.department {
                    department = format!(" ({})", d);
                }

                if profile.language == "id" {
                    format!(
                        "Anda adalah {}, {}{} berdasarkan profil yang tersimpan. \
                         Ada yang bisa saya bantu terkait regulasi, visa, atau pajak?",
                        profile.name, profile.role, department
                    )
                } else {
                    format!(
                        "You are {}, {}{} according to your stored profile. \
                         How can I help with regulations, visas or tax today?",
                        profile.name, profile.role, department
                    )
                }
            }
            None => "Saya belum memiliki profil tersimpan untuk Anda. / \
                     I don't have a stored profile for you yet."
                .to_string(),
        }
    }

    fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
        *cancel.borrow()
    }

    fn log_terminal(&self, request: &AgentRequest, started: Instant, terminal: &Terminal) {
        let elapsed = started.elapsed().as_millis();
        match terminal {
            Terminal::Failed(err) => {
                self.audit.log(
                    AuditRecord::builder(
                        &request.request_id,
                        Component::Orchestrator,
                        RecordKind::TurnCompleted,
                    )
                    .conversation(&request.conversation_id)
                    .user(&request.user_id)
                    .error(err.to_string())
                    .duration(elapsed as i32)
                    .build(),
                );
            }
            Terminal::Cancelled => {
                self.audit.log(
                    AuditRecord::builder(
                        &request.request_id,
                        Component::Orchestrator,
                        RecordKind::TurnCancelled,
                    )
                    .conversation(&request.conversation_id)
                    .user(&request.user_id)
                    .status(AuditStatus::Warning)
                    .duration(elapsed as i32)
                    .build(),
                );
            }
        }
        self.metrics.record_request(elapsed as u64, true);
    }

    fn terminal_event(terminal: Terminal) -> AgentEvent {
        match terminal {
            Terminal::Failed(err) => AgentEvent::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
            Terminal::Cancelled => AgentEvent::Error {
                kind: "cancelled".to_string(),
                message: "Request cancelled".to_string(),
            },
        }
    }

    /// Run one turn. The returned stream owns the conversation lock for its
    /// whole lifetime; dropping it mid-flight aborts in-flight provider work
    /// at the transport level.
    pub async fn handle_message(
        self: Arc<Self>,
        request: AgentRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<AgentEventStream, ApiError> {
        if request.message.trim().is_empty() {
            return Err(ApiError::BadRequest("Message cannot be empty".to_string()));
        }

        let orchestrator = self;

        let stream = async_stream::stream! {
            let start_time = Instant::now();
            let deadline = tokio::time::Instant::now()
                + Duration::from_secs(orchestrator.agent_cfg.turn_timeout_seconds);

            orchestrator.audit.log(
                AuditRecord::builder(&request.request_id, Component::Orchestrator, RecordKind::RequestReceived)
                    .conversation(&request.conversation_id)
                    .user(&request.user_id)
                    .message(&request.message)
                    .status(AuditStatus::Info)
                    .build(),
            );

            let terminal: Option<Terminal> = 'run: {
                // Serialize turns within one conversation (FIFO queueing).
                let lock = orchestrator.conversation_lock(&request.conversation_id);
                let _guard = match tokio::time::timeout(
                    Duration::from_secs(orchestrator.agent_cfg.conversation_lock_timeout_seconds),
                    lock.lock_owned(),
                )
                .await
                {
                    Ok(guard) => guard,
                    Err(_) => break 'run Some(Terminal::Failed(ApiError::Timeout(
                        "Conversation is busy with another request".to_string(),
                    ))),
                };

                if let Err(e) = orchestrator
                    .conversations
                    .ensure_conversation(&request.conversation_id, &request.user_id)
                    .await
                {
                    break 'run Some(Terminal::Failed(ApiError::DatabaseError(e.to_string())));
                }
                if let Err(e) = orchestrator
                    .conversations
                    .append_turn(&request.conversation_id, "user", &request.message, None, None)
                    .await
                {
                    break 'run Some(Terminal::Failed(ApiError::DatabaseError(e.to_string())));
                }

                // === PRE-FILTERS: identity shortcut & out-of-domain gate ===
                let decision = orchestrator.prefilter.decide(&request.message).await;
                if decision != PrefilterDecision::Proceed {
                    let answer = match decision {
                        PrefilterDecision::Identity => {
                            let context = orchestrator
                                .memory
                                .assemble_context(&request.user_id, None)
                                .await;
                            Self::identity_answer(&context)
                        }
                        _ => orchestrator.prompts.out_of_domain_refusal.trim().to_string(),
                    };

                    orchestrator.audit.log(
                        AuditRecord::builder(&request.request_id, Component::Orchestrator, RecordKind::PrefilterShortcut)
                            .conversation(&request.conversation_id)
                            .user(&request.user_id)
                            .message(match decision {
                                PrefilterDecision::Identity => "identity",
                                _ => "out_of_domain",
                            })
                            .build(),
                    );

                    let mut interrupted = false;
                    for delta in Self::text_as_deltas(&answer, DELTA_CHARS) {
                        if Self::is_cancelled(&cancel) {
                            interrupted = true;
                            break;
                        }
                        yield AgentEvent::Token { delta };
                    }
                    if interrupted {
                        break 'run Some(Terminal::Cancelled);
                    }

                    if let Err(e) = orchestrator
                        .conversations
                        .append_turn(&request.conversation_id, "assistant", &answer, None, None)
                        .await
                    {
                        warn!("Failed to persist shortcut answer: {}", e);
                    }

                    let latency = start_time.elapsed().as_millis() as u64;
                    orchestrator.metrics.record_request(latency, false);
                    yield AgentEvent::Metadata(Box::new(TurnMetadata {
                        route_used: "none".to_string(),
                        completion_tokens_estimate: token_estimator::estimate_tokens(&answer),
                        latency_ms: latency,
                        ..Default::default()
                    }));
                    yield AgentEvent::Done;
                    break 'run None;
                }

                // === CONTEXT ASSEMBLY ===
                let context = orchestrator
                    .memory
                    .assemble_context(&request.user_id, Some(&request.conversation_id))
                    .await;
                let system_prompt = format!(
                    "{}\n\n{}",
                    orchestrator.prompts.main_system_prompt.trim(),
                    context.block
                );

                let mut session = orchestrator
                    .sessions
                    .get_or_create(&request.conversation_id, &request.user_id);

                // === REASON / ACT / OBSERVE LOOP ===
                let budget = orchestrator.agent_cfg.step_budget;
                let mut steps = 0usize;
                let mut verifier_rounds = 0usize;
                let mut truncated = false;
                let mut model_chain: Vec<ModelAttempt> = Vec::new();
                let mut sources: Vec<SourceInfo> = Vec::new();
                let mut observations: Vec<String> = Vec::new();
                let mut executed: HashSet<String> = HashSet::new();
                let mut duplicate_strikes = 0usize;
                let mut route_used: Option<String> = None;
                let mut route_cached = false;
                let mut verifier_info: Option<VerifierInfo> = None;
                let mut messages: Vec<ChatMessage> = vec![ChatMessage::user(&request.message)];

                let mut final_draft: Option<String> = None;
                let mut loop_terminal: Option<Terminal> = None;

                'turn: while final_draft.is_none() && loop_terminal.is_none() {
                    if Self::is_cancelled(&cancel) {
                        loop_terminal = Some(Terminal::Cancelled);
                        break 'turn;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        loop_terminal = Some(Terminal::Failed(ApiError::Timeout(
                            "Turn time budget exceeded".to_string(),
                        )));
                        break 'turn;
                    }

                    // Budget exhausted: one last generation, no tools.
                    let force_final = steps >= budget;
                    if force_final && !truncated {
                        truncated = true;
                        orchestrator.audit.log(
                            AuditRecord::builder(&request.request_id, Component::Orchestrator, RecordKind::TurnTruncated)
                                .conversation(&request.conversation_id)
                                .status(AuditStatus::Warning)
                                .steps(steps as i32)
                                .build(),
                        );
                        messages.push(ChatMessage::user(
                            "Step budget reached. Answer now with the information you already \
                             have, and say explicitly which parts remain unverified.",
                        ));
                    }

                    let generation_request = GenerationRequest {
                        system_prompt: system_prompt.clone(),
                        messages: messages.clone(),
                        tools: if force_final {
                            Vec::new()
                        } else {
                            orchestrator.tools.specs()
                        },
                        max_tokens: None,
                        temperature: None,
                        preferred_model: request.preferred_model.clone(),
                    };

                    let llm_timeout =
                        Duration::from_secs(orchestrator.agent_cfg.llm_timeout_seconds);
                    let opened = match tokio::time::timeout(
                        llm_timeout,
                        orchestrator.gateway.generate_stream(&generation_request),
                    )
                    .await
                    {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            loop_terminal = Some(Terminal::Failed(e));
                            break 'turn;
                        }
                        Err(_) => {
                            loop_terminal = Some(Terminal::Failed(ApiError::Timeout(
                                "LLM call timed out".to_string(),
                            )));
                            break 'turn;
                        }
                    };

                    model_chain.extend(opened.attempts.clone());
                    let mut events = opened.events;

                    let mut round_text = String::new();
                    let mut round_tool_calls: Vec<ToolInvocation> = Vec::new();

                    let round_end = loop {
                        tokio::select! {
                            biased;

                            changed = cancel.changed() => {
                                // A closed channel means the client is gone.
                                let _ = changed;
                                break RoundEnd::Cancelled;
                            }

                            event = tokio::time::timeout_at(deadline, events.next()) => {
                                match event {
                                    Err(_) => break RoundEnd::TimedOut,
                                    Ok(None) => break RoundEnd::Complete,
                                    Ok(Some(Ok(LlmEvent::Token(token)))) => round_text.push_str(&token),
                                    Ok(Some(Ok(LlmEvent::ToolCall(invocation)))) => round_tool_calls.push(invocation),
                                    Ok(Some(Ok(LlmEvent::Done { .. }))) => break RoundEnd::Complete,
                                    Ok(Some(Err(message))) => break RoundEnd::ProviderError(message),
                                }
                            }
                        }
                    };

                    match round_end {
                        RoundEnd::Complete => {}
                        RoundEnd::Cancelled => {
                            loop_terminal = Some(Terminal::Cancelled);
                            break 'turn;
                        }
                        RoundEnd::TimedOut => {
                            loop_terminal = Some(Terminal::Failed(ApiError::Timeout(
                                "Turn time budget exceeded".to_string(),
                            )));
                            break 'turn;
                        }
                        RoundEnd::ProviderError(message) => {
                            loop_terminal =
                                Some(Terminal::Failed(ApiError::ProviderError(message)));
                            break 'turn;
                        }
                    }

                    if !round_tool_calls.is_empty() && !force_final {
                        // First-declared-wins; the rest are discarded.
                        let invocation = round_tool_calls.remove(0);
                        if !round_tool_calls.is_empty() {
                            warn!(
                                "Discarding {} extra tool calls declared in one turn",
                                round_tool_calls.len()
                            );
                        }

                        let key = Self::tool_call_key(&invocation);
                        if executed.contains(&key) {
                            debug!("Duplicate tool call {} deduplicated", invocation.name);
                            duplicate_strikes += 1;
                            if duplicate_strikes >= 2 {
                                // Model is stuck repeating itself; spend the
                                // remaining budget on a final answer instead.
                                steps = budget;
                            }
                            messages.push(ChatMessage::tool(format!(
                                "Tool '{}' was already called with identical arguments; \
                                 reuse the earlier observation instead of repeating it.",
                                invocation.name
                            )));
                            continue 'turn;
                        }

                        yield AgentEvent::ToolCall {
                            name: invocation.name.clone(),
                            args: invocation.arguments.clone(),
                        };

                        let tool_start = Instant::now();
                        let tool_timeout =
                            Duration::from_secs(orchestrator.agent_cfg.tool_timeout_seconds);
                        let observation = match tokio::time::timeout(
                            tool_timeout,
                            orchestrator
                                .tools
                                .execute(&invocation.name, invocation.arguments.clone()),
                        )
                        .await
                        {
                            Ok(Ok(output)) => {
                                orchestrator.metrics.record_tool(
                                    &invocation.name,
                                    tool_start.elapsed().as_millis() as u64,
                                );
                                orchestrator.audit.log(
                                    AuditRecord::builder(&request.request_id, Component::Tools, RecordKind::ToolExecuted)
                                        .conversation(&request.conversation_id)
                                        .message(&invocation.name)
                                        .duration(tool_start.elapsed().as_millis() as i32)
                                        .build(),
                                );

                                for source in output.sources {
                                    if !sources.iter().any(|s| s.passage_id == source.passage_id) {
                                        sources.push(source);
                                    }
                                }
                                if let Some(route) = output.route_used {
                                    route_used = Some(route);
                                    route_cached = route_cached || output.route_cached;
                                }
                                output.observation
                            }
                            Ok(Err(tool_error)) => {
                                // Tool errors become observations, never aborts.
                                orchestrator.audit.log(
                                    AuditRecord::builder(&request.request_id, Component::Tools, RecordKind::ToolFailed)
                                        .conversation(&request.conversation_id)
                                        .message(&invocation.name)
                                        .status(AuditStatus::Warning)
                                        .error(tool_error.to_string())
                                        .build(),
                                );
                                format!("Tool error: {}", tool_error)
                            }
                            Err(_) => {
                                orchestrator.audit.log(
                                    AuditRecord::builder(&request.request_id, Component::Tools, RecordKind::ToolFailed)
                                        .conversation(&request.conversation_id)
                                        .message(&invocation.name)
                                        .status(AuditStatus::Warning)
                                        .error("timeout")
                                        .build(),
                                );
                                format!(
                                    "Tool '{}' timed out after {}s",
                                    invocation.name,
                                    orchestrator.agent_cfg.tool_timeout_seconds
                                )
                            }
                        };

                        if let Err(e) = orchestrator
                            .conversations
                            .append_turn(
                                &request.conversation_id,
                                "tool",
                                &observation,
                                Some(&invocation.name),
                                Some(&invocation.arguments),
                            )
                            .await
                        {
                            warn!("Failed to persist tool turn: {}", e);
                        }

                        messages.push(ChatMessage::assistant(format!(
                            "Calling tool '{}' with arguments {}",
                            invocation.name, invocation.arguments
                        )));
                        messages.push(ChatMessage::tool(observation.clone()));
                        observations.push(observation);
                        executed.insert(key);
                        steps += 1;

                        session.scratchpad = messages.clone();
                        orchestrator.sessions.set(session.clone());
                        continue 'turn;
                    }

                    // === DRAFT READY ===
                    let draft = round_text.trim().to_string();
                    if draft.is_empty() {
                        if truncated {
                            final_draft = Some(
                                "Maaf, saya belum dapat menyusun jawaban lengkap dalam \
                                 batas langkah yang tersedia."
                                    .to_string(),
                            );
                            break 'turn;
                        }
                        loop_terminal = Some(Terminal::Failed(ApiError::ProviderError(
                            "Model returned an empty answer".to_string(),
                        )));
                        break 'turn;
                    }

                    // === VERIFICATION (feature-flagged) ===
                    if orchestrator.features.enable_verifier && !truncated {
                        match orchestrator
                            .verifier
                            .verify(&request.message, &draft, &observations)
                            .await
                        {
                            Ok(report) => {
                                orchestrator.audit.log(
                                    AuditRecord::builder(&request.request_id, Component::Verifier, RecordKind::VerifierVerdict)
                                        .conversation(&request.conversation_id)
                                        .message(report.status.as_str())
                                        .build(),
                                );
                                verifier_info = Some(VerifierInfo {
                                    status: report.status.as_str().to_string(),
                                    score: report.score,
                                });

                                if report.status == VerifierStatus::Fail {
                                    if verifier_rounds
                                        < orchestrator.agent_cfg.verifier_max_rounds
                                        && steps < budget
                                    {
                                        verifier_rounds += 1;
                                        steps += 1;
                                        info!(
                                            "Verifier rejected draft (round {}): {}",
                                            verifier_rounds, report.reasoning
                                        );
                                        messages.push(ChatMessage::user(format!(
                                            "Your previous draft failed a groundedness check: \
                                             {}. Revise it using only claims supported by the \
                                             observations, or call a tool to gather evidence.",
                                            report.reasoning
                                        )));
                                        continue 'turn;
                                    }

                                    // Out of budget: ship hedged, low-confidence.
                                    final_draft = Some(format!(
                                        "(Jawaban ini belum sepenuhnya terverifikasi terhadap \
                                         sumber / this answer could not be fully verified \
                                         against sources.)\n\n{}",
                                        draft
                                    ));
                                    break 'turn;
                                }
                                // `warn` passes through, marked in metadata.
                            }
                            Err(e) => {
                                warn!("Verifier unavailable, passing draft through: {}", e);
                            }
                        }
                    }

                    final_draft = Some(draft);
                }

                if let Some(terminal) = loop_terminal {
                    break 'run Some(terminal);
                }
                let Some(draft) = final_draft else {
                    break 'run Some(Terminal::Failed(ApiError::InternalError(
                        "Loop ended without a draft".to_string(),
                    )));
                };

                // === FINALIZE: stream deltas, metadata, persist, done ===
                let mut interrupted = false;
                for delta in Self::text_as_deltas(&draft, DELTA_CHARS) {
                    if Self::is_cancelled(&cancel) {
                        interrupted = true;
                        break;
                    }
                    yield AgentEvent::Token { delta };
                }
                if interrupted {
                    // Mid-answer cancellation: terminal event, no assistant
                    // turn is stored.
                    break 'run Some(Terminal::Cancelled);
                }

                let latency = start_time.elapsed().as_millis() as u64;
                let metadata = TurnMetadata {
                    sources: sources.clone(),
                    route_used: route_used.unwrap_or_else(|| "none".to_string()),
                    route_cached,
                    model_chain,
                    steps,
                    truncated,
                    verifier: verifier_info,
                    prompt_tokens_estimate: token_estimator::estimate_tokens(&system_prompt)
                        + messages.iter().map(|m| m.estimate_tokens()).sum::<usize>(),
                    completion_tokens_estimate: token_estimator::estimate_tokens(&draft),
                    latency_ms: latency,
                };
                yield AgentEvent::Metadata(Box::new(metadata));

                if let Err(e) = orchestrator
                    .conversations
                    .append_turn(&request.conversation_id, "assistant", &draft, None, None)
                    .await
                {
                    warn!("Failed to persist assistant turn: {}", e);
                }

                session.scratchpad.clear();
                orchestrator.sessions.set(session);

                orchestrator.audit.log(
                    AuditRecord::builder(&request.request_id, Component::Orchestrator, RecordKind::TurnCompleted)
                        .conversation(&request.conversation_id)
                        .user(&request.user_id)
                        .steps(steps as i32)
                        .duration(latency as i32)
                        .custom("sources", sources.len() as i64)
                        .custom("truncated", truncated)
                        .build(),
                );
                orchestrator.metrics.record_request(latency, false);

                // Fire-and-forget fact extraction; never blocks the response.
                {
                    let memory = orchestrator.memory.clone();
                    let user_id = request.user_id.clone();
                    let message = request.message.clone();
                    let answer = draft.clone();
                    tokio::spawn(async move {
                        if let Err(e) = memory.extract_facts(&user_id, &message, &answer).await {
                            debug!("Fact extraction skipped: {}", e);
                        }
                    });
                }

                yield AgentEvent::Done;
                None
            };

            if let Some(terminal) = terminal {
                orchestrator.log_terminal(&request, start_time, &terminal);
                yield Self::terminal_event(terminal);
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_as_deltas_roundtrip() {
        let text = "a".repeat(100);
        let deltas = AgentOrchestrator::text_as_deltas(&text, 48);
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas.concat(), text);
    }

    #[test]
    fn test_text_as_deltas_empty() {
        assert!(AgentOrchestrator::text_as_deltas("", 48).is_empty());
    }

    #[test]
    fn test_tool_call_key_ignores_argument_order() {
        let a = ToolInvocation {
            name: "vector_search".into(),
            arguments: json!({"query": "kitas", "top_k": 5}),
        };
        let b = ToolInvocation {
            name: "vector_search".into(),
            arguments: json!({"top_k": 5, "query": "kitas"}),
        };
        assert_eq!(
            AgentOrchestrator::tool_call_key(&a),
            AgentOrchestrator::tool_call_key(&b)
        );
    }

    #[test]
    fn test_tool_call_key_distinguishes_args() {
        let a = ToolInvocation {
            name: "vector_search".into(),
            arguments: json!({"query": "kitas"}),
        };
        let b = ToolInvocation {
            name: "vector_search".into(),
            arguments: json!({"query": "kitap"}),
        };
        assert_ne!(
            AgentOrchestrator::tool_call_key(&a),
            AgentOrchestrator::tool_call_key(&b)
        );
    }

    #[test]
    fn test_tool_call_key_canonicalizes_nested_objects() {
        let a = ToolInvocation {
            name: "t".into(),
            arguments: json!({"filter": {"tier": "public", "lang": "id"}}),
        };
        let b = ToolInvocation {
            name: "t".into(),
            arguments: json!({"filter": {"lang": "id", "tier": "public"}}),
        };
        assert_eq!(
            AgentOrchestrator::tool_call_key(&a),
            AgentOrchestrator::tool_call_key(&b)
        );
    }

    #[test]
    fn test_identity_answer_uses_profile_language() {
        let context = UserContext {
            block: String::new(),
            profile: Some(crate::database::UserProfile {
                user_id: "zero".into(),
                name: "Zero".into(),
                role: "Founder".into(),
                department: None,
                language: "en".into(),
                notes: None,
            }),
            degraded: false,
        };

        let answer = AgentOrchestrator::identity_answer(&context);
        assert!(answer.contains("Zero"));
        assert!(answer.contains("Founder"));
        assert!(answer.starts_with("You are"));
    }

    #[test]
    fn test_identity_answer_degrades_without_profile() {
        let context = UserContext {
            block: String::new(),
            profile: None,
            degraded: true,
        };
        let answer = AgentOrchestrator::identity_answer(&context);
        assert!(answer.contains("profil"));
    }
}
