//! Core data types used throughout ThreadQA.
//!
//! These types represent the chunks, retrieval results, conversation turns,
//! and stored rows that flow through the indexing and answering pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of source a session's index was built from. Determines the
/// index storage location (`{session_id}_{file|url}`), so locations never
/// collide across sessions or source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Url,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Url => "url",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk of extracted text stored in a session index.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk returned from a similarity query, best matches first.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    /// Cosine similarity against the query embedding, in [-1, 1].
    pub score: f32,
    pub chunk_index: i64,
}

/// One question/answer pair in a session's conversation log.
///
/// Turns are append-only. An edit never mutates an existing turn; it appends
/// a new turn with `edited = true` and `supersedes` pointing at the sequence
/// position of the turn it corrects.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    /// Position in the log, assigned at append time, starting at 0.
    pub seq: i64,
    pub question: String,
    pub answer: String,
    pub edited: bool,
    pub supersedes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A stored Q&A row in the `thread_qa` persistence table.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRow {
    pub id: i64,
    pub session_id: String,
    pub label: String,
    pub question: String,
    pub answer: Option<String>,
    /// Set when this row supersedes an earlier one (edit/regenerate flow).
    pub original_msg_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Payload for inserting a new Q&A row.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChatRow {
    pub session_id: String,
    pub label: String,
    pub question: String,
    pub answer: Option<String>,
    #[serde(default)]
    pub original_msg_id: Option<i64>,
}
