use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Component that produced the record.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Orchestrator,
    Retriever,
    VectorStore,
    Embedding,
    Reranker,
    Gateway,
    Tools,
    Memory,
    Verifier,
    Conversation,
    Scheduler,
    Ingest,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Retriever => "retriever",
            Self::VectorStore => "vector_store",
            Self::Embedding => "embedding",
            Self::Reranker => "reranker",
            Self::Gateway => "gateway",
            Self::Tools => "tools",
            Self::Memory => "memory",
            Self::Verifier => "verifier",
            Self::Conversation => "conversation",
            Self::Scheduler => "scheduler",
            Self::Ingest => "ingest",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    RequestReceived,
    PrefilterShortcut,
    ToolExecuted,
    ToolFailed,
    RetrievalExecuted,
    RouteCacheHit,
    OrphanChildFiltered,
    ProviderFallback,
    VerifierVerdict,
    TurnCompleted,
    TurnCancelled,
    TurnTruncated,
    FatalInvariant,
    TaskRun,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestReceived => "request_received",
            Self::PrefilterShortcut => "prefilter_shortcut",
            Self::ToolExecuted => "tool_executed",
            Self::ToolFailed => "tool_failed",
            Self::RetrievalExecuted => "retrieval_executed",
            Self::RouteCacheHit => "route_cache_hit",
            Self::OrphanChildFiltered => "orphan_child_filtered",
            Self::ProviderFallback => "provider_fallback",
            Self::VerifierVerdict => "verifier_verdict",
            Self::TurnCompleted => "turn_completed",
            Self::TurnCancelled => "turn_cancelled",
            Self::TurnTruncated => "turn_truncated",
            Self::FatalInvariant => "fatal_invariant",
            Self::TaskRun => "task_run",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub component: Component,
    pub kind: RecordKind,
    pub status: AuditStatus,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i32>,
    pub steps: Option<i32>,
    pub custom_fields: Option<HashMap<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn builder(
        request_id: impl Into<String>,
        component: Component,
        kind: RecordKind,
    ) -> AuditRecordBuilder {
        AuditRecordBuilder {
            record: AuditRecord {
                request_id: request_id.into(),
                conversation_id: None,
                user_id: None,
                component,
                kind,
                status: AuditStatus::Success,
                message: None,
                error_message: None,
                duration_ms: None,
                steps: None,
                custom_fields: None,
                created_at: Utc::now(),
            },
        }
    }
}

pub struct AuditRecordBuilder {
    record: AuditRecord,
}

impl AuditRecordBuilder {
    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.record.conversation_id = Some(id.into());
        self
    }

    pub fn user(mut self, id: impl Into<String>) -> Self {
        self.record.user_id = Some(id.into());
        self
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.record.status = status;
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.record.message = Some(content.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.record.error_message = Some(message.into());
        self.record.status = AuditStatus::Error;
        self
    }

    pub fn duration(mut self, ms: i32) -> Self {
        self.record.duration_ms = Some(ms);
        self
    }

    pub fn steps(mut self, steps: i32) -> Self {
        self.record.steps = Some(steps);
        self
    }

    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.record
            .custom_fields
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> AuditRecord {
        self.record
    }
}
