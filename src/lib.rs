//! # ThreadQA
//!
//! Session-scoped document question answering. Upload a document (PDF,
//! TXT, DOCX) or point at a URL; ThreadQA extracts the text, builds a
//! per-session semantic index, and answers follow-up questions against
//! that index with streamed, conversation-aware generation.
//!
//! ## Architecture
//!
//! ```text
//!  file / URL
//!      │
//!      ▼
//!  ┌─────────┐   ┌─────────┐   ┌───────────┐   ┌──────────────┐
//!  │ extract │ → │  chunk  │ → │ embedding │ → │ SessionIndex │
//!  └─────────┘   └─────────┘   └───────────┘   │   (SQLite)   │
//!                                              └──────┬───────┘
//!                                                     │ top-k
//!  question ──► rag orchestrator ◄── conversation memory
//!                     │
//!                     ▼
//!               language model ──► token stream ──► committed turn
//! ```
//!
//! Each session owns exactly one index and one conversation memory; the
//! index lives in its own SQLite database under
//! `{storage.index_dir}/{session_id}_{file|url}/index.db`, so sessions
//! never observe each other's documents or history. Committed turns are
//! additionally persisted in a shared chat store (`thread_qa` table) that
//! the HTTP API and CLI read back on restart.
//!
//! The `tqa` binary exposes the pipeline as CLI commands (`init`, `serve`,
//! `build`, `ask`, `history`); the [`server`] module serves the same
//! surface over HTTP with SSE token streaming.

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod llm;
pub mod memory;
pub mod models;
pub mod rag;
pub mod server;
pub mod session;
pub mod store;
