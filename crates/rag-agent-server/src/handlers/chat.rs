use crate::logging::{AuditLogger, AuditRecord, AuditStatus, Component, RecordKind};
use crate::models::chat::{AgentEvent, ChatRequest};
use crate::services::agent::orchestrator::AgentEventStream;
use crate::services::{AgentOrchestrator, AgentRequest};
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Handle streaming chat request
/// POST /api/chat/stream
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<
    (
        [(axum::http::HeaderName, String); 1],
        Sse<impl Stream<Item = Result<Event, Infallible>>>,
    ),
    ApiError,
> {
    let conversation_id = req
        .conversation_id
        .clone()
        .unwrap_or_else(AgentOrchestrator::new_conversation_id);
    let request_id = Uuid::new_v4().to_string();

    info!(
        "Chat stream request: request_id={}, conversation_id={}, user_id={}",
        request_id, conversation_id, req.user_id
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let agent_request = AgentRequest {
        request_id: request_id.clone(),
        user_id: req.user_id.clone(),
        conversation_id: conversation_id.clone(),
        message: req.message,
        preferred_model: req.model,
    };

    let events = state
        .orchestrator
        .clone()
        .handle_message(agent_request, cancel_rx)
        .await?;

    let stream = GuardedEventStream {
        inner: events,
        guard: DisconnectGuard {
            cancel_tx,
            completed: false,
            audit: state.audit.clone(),
            request_id,
            conversation_id: conversation_id.clone(),
        },
    };

    Ok((
        [(
            axum::http::HeaderName::from_static("x-conversation-id"),
            conversation_id,
        )],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

/// Signals cancellation when the client disconnects before the stream
/// finished: the watch flips, in-flight futures are dropped, and the
/// disconnect is recorded.
struct DisconnectGuard {
    cancel_tx: watch::Sender<bool>,
    completed: bool,
    audit: AuditLogger,
    request_id: String,
    conversation_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.cancel_tx.send(true);
            self.audit.log(
                AuditRecord::builder(
                    &self.request_id,
                    Component::Orchestrator,
                    RecordKind::TurnCancelled,
                )
                .conversation(&self.conversation_id)
                .status(AuditStatus::Warning)
                .message("client disconnected")
                .build(),
            );
        }
    }
}

struct GuardedEventStream {
    inner: AgentEventStream,
    guard: DisconnectGuard,
}

impl Stream for GuardedEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(agent_event)) => {
                if matches!(agent_event, AgentEvent::Done | AgentEvent::Error { .. }) {
                    self.guard.completed = true;
                }

                let data = serde_json::to_string(&agent_event).unwrap_or_else(|_| {
                    "{\"type\":\"error\",\"kind\":\"internal_error\",\
                     \"message\":\"event serialization failed\"}"
                        .to_string()
                });
                Poll::Ready(Some(Ok(Event::default().data(data))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
