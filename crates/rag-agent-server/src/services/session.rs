use crate::models::chat::ChatMessage;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, info, warn};

/// Short-lived per-conversation state: loop scratchpad and TTL bookkeeping.
/// Lives in process memory only and must never be treated as durable; the
/// conversation store is the record of truth.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub conversation_id: String,
    pub user_id: String,
    /// Loop scratchpad carried across suspensions within a turn.
    pub scratchpad: Vec<ChatMessage>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub ttl: Duration,
}

impl SessionState {
    pub fn new(conversation_id: String, user_id: String, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            conversation_id,
            user_id,
            scratchpad: Vec::new(),
            created_at: now,
            last_activity: now,
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() > self.ttl
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Exported session snapshot (for the export endpoint / debugging).
#[derive(Debug, Clone, Serialize)]
pub struct SessionExport {
    pub conversation_id: String,
    pub user_id: String,
    pub scratchpad: Vec<ChatMessage>,
    pub age_seconds: u64,
    pub ttl_seconds: u64,
}

/// Thread-safe in-memory session cache with lazy TTL expiry and a RAM guard.
#[derive(Clone)]
pub struct SessionCache {
    storage: Arc<DashMap<String, SessionState>>,
    system: Arc<parking_lot::Mutex<System>>,
    default_ttl: Duration,
}

impl SessionCache {
    pub fn new(default_ttl: Duration) -> Self {
        info!("Initializing session cache (ttl {:?})", default_ttl);
        Self {
            storage: Arc::new(DashMap::new()),
            system: Arc::new(parking_lot::Mutex::new(System::new_all())),
            default_ttl,
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<SessionState> {
        let entry = self.storage.get(conversation_id)?;
        let state = entry.value().clone();

        // Lazy deletion
        if state.is_expired() {
            drop(entry);
            self.remove(conversation_id);
            debug!("Session {} expired, removed from cache", conversation_id);
            return None;
        }

        Some(state)
    }

    pub fn get_or_create(&self, conversation_id: &str, user_id: &str) -> SessionState {
        if let Some(state) = self.get(conversation_id) {
            return state;
        }

        let state = SessionState::new(
            conversation_id.to_string(),
            user_id.to_string(),
            self.default_ttl,
        );
        self.set(state.clone());
        state
    }

    pub fn set(&self, mut state: SessionState) {
        state.touch();
        self.storage.insert(state.conversation_id.clone(), state);
    }

    pub fn remove(&self, conversation_id: &str) -> Option<SessionState> {
        self.storage.remove(conversation_id).map(|(_, state)| state)
    }

    pub fn extend_ttl(&self, conversation_id: &str, extra: Duration) -> bool {
        match self.storage.get_mut(conversation_id) {
            Some(mut entry) => {
                entry.ttl += extra;
                entry.touch();
                true
            }
            None => false,
        }
    }

    pub fn export(&self, conversation_id: &str) -> Option<SessionExport> {
        let state = self.get(conversation_id)?;
        Some(SessionExport {
            conversation_id: state.conversation_id.clone(),
            user_id: state.user_id.clone(),
            scratchpad: state.scratchpad.clone(),
            age_seconds: state.created_at.elapsed().as_secs(),
            ttl_seconds: state.ttl.as_secs(),
        })
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Reject new sessions when system memory is nearly exhausted.
    pub fn can_create_new_session(&self) -> bool {
        let mut sys = self.system.lock();
        sys.refresh_memory();

        let total_memory = sys.total_memory();
        let used_memory = sys.used_memory();
        let usage_percent = (used_memory as f64 / total_memory as f64) * 100.0;

        if usage_percent >= 90.0 {
            warn!(
                "Memory usage at {:.2}%, rejecting new session",
                usage_percent
            );
            return false;
        }

        true
    }

    /// Returns number of sessions removed.
    pub fn cleanup_expired(&self) -> usize {
        let start_len = self.storage.len();
        self.storage
            .retain(|_, state: &mut SessionState| !state.is_expired());
        let count = start_len.saturating_sub(self.storage.len());

        if count > 0 {
            info!("Cleaned up {} expired sessions", count);
        }

        count
    }

    pub fn stats(&self) -> SessionCacheStats {
        let mut sys = self.system.lock();
        sys.refresh_memory();

        SessionCacheStats {
            active_sessions: self.len(),
            memory_usage_mb: sys.used_memory() / 1024 / 1024,
            memory_total_mb: sys.total_memory() / 1024 / 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCacheStats {
    pub active_sessions: usize,
    pub memory_usage_mb: u64,
    pub memory_total_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let state = SessionState::new("conv-1".into(), "zero".into(), Duration::from_secs(60));

        cache.set(state);
        assert_eq!(cache.len(), 1);

        let retrieved = cache.get("conv-1").unwrap();
        assert_eq!(retrieved.user_id, "zero");

        cache.remove("conv-1");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_session_is_lazily_dropped() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let mut state = SessionState::new("conv-1".into(), "zero".into(), Duration::ZERO);
        state.last_activity = Instant::now() - Duration::from_secs(1);
        cache.storage.insert("conv-1".into(), state);

        assert!(cache.get("conv-1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_extend_ttl() {
        let cache = SessionCache::new(Duration::from_secs(1));
        cache.set(SessionState::new(
            "conv-1".into(),
            "zero".into(),
            Duration::from_secs(1),
        ));

        assert!(cache.extend_ttl("conv-1", Duration::from_secs(600)));
        assert!(!cache.extend_ttl("missing", Duration::from_secs(600)));

        let state = cache.get("conv-1").unwrap();
        assert!(state.ttl >= Duration::from_secs(601));
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let mut expired = SessionState::new("old".into(), "a".into(), Duration::ZERO);
        expired.last_activity = Instant::now() - Duration::from_secs(1);
        cache.storage.insert("old".into(), expired);
        cache.set(SessionState::new(
            "fresh".into(),
            "b".into(),
            Duration::from_secs(60),
        ));

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_export() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set(SessionState::new(
            "conv-1".into(),
            "zero".into(),
            Duration::from_secs(60),
        ));

        let export = cache.export("conv-1").unwrap();
        assert_eq!(export.user_id, "zero");
        assert_eq!(export.ttl_seconds, 60);
    }
}
