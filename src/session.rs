//! Session registry.
//!
//! A session owns exactly one optional index reference and one
//! conversation memory; neither is ever shared across sessions. The
//! answering gate enforces that at most one answer is being generated for
//! a session at any moment (contenders are rejected, not queued).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::QaError;
use crate::index::SessionIndex;
use crate::memory::ConversationMemory;

pub struct Session {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// The current index, if one has been built or attached. Replaced
    /// wholesale on rebuild.
    pub index: RwLock<Option<Arc<SessionIndex>>>,
    pub memory: Mutex<ConversationMemory>,
    /// Held for the duration of one answer; `try_lock` contention maps to
    /// [`QaError::SessionBusy`].
    pub answer_gate: Arc<Mutex<()>>,
}

impl Session {
    fn new(id: String, label: String) -> Self {
        Self {
            id,
            label,
            created_at: Utc::now(),
            index: RwLock::new(None),
            memory: Mutex::new(ConversationMemory::new()),
            answer_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Bind (or replace) this session's index.
    pub async fn attach_index(&self, index: Arc<SessionIndex>) {
        *self.index.write().await = Some(index);
    }

    /// Rehydrate one committed turn into memory, e.g. when reloading a
    /// session's history from the persistence store.
    pub async fn attach_turn(
        &self,
        question: String,
        answer: String,
        edited: bool,
        supersedes: Option<i64>,
    ) {
        self.memory
            .lock()
            .await
            .append(question, answer, edited, supersedes);
    }
}

/// All live sessions, keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh UUIDv4 id.
    pub async fn create(&self, label: String) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        self.create_with_id(id, label).await
    }

    /// Create a session under a caller-supplied id (rehydration path).
    /// Replaces any existing session with the same id.
    pub async fn create_with_id(&self, id: String, label: String) -> Arc<Session> {
        let session = Arc::new(Session::new(id.clone(), label));
        self.sessions.write().await.insert(id, session.clone());
        session
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, QaError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| QaError::SessionNotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
