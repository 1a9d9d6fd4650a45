//! End-to-end pipeline tests: build an index from text, ask questions
//! through the orchestrator, and check the turn lifecycle (streaming,
//! commits, cancellation, edits, busy rejection) with deterministic
//! in-process providers.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use threadqa::config::{ChatDbConfig, ChunkingConfig, Config, ServerConfig, StorageConfig};
use threadqa::embedding::Embedder;
use threadqa::error::QaError;
use threadqa::index::SessionIndex;
use threadqa::llm::{LanguageModel, TokenStream};
use threadqa::models::SourceKind;
use threadqa::rag::{self, AnswerEvent};
use threadqa::session::SessionRegistry;

// ============ Deterministic test providers ============

/// Bag-of-words embedder: each word hashes into one of 32 buckets, so
/// texts sharing words point in similar directions.
struct WordBagEmbedder;

#[async_trait]
impl Embedder for WordBagEmbedder {
    fn model_name(&self) -> &str {
        "word-bag-test"
    }
    fn dims(&self) -> usize {
        32
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 32];
                for word in t.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
                    if word.is_empty() {
                        continue;
                    }
                    let mut h = DefaultHasher::new();
                    word.hash(&mut h);
                    v[(h.finish() % 32) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// A language model that replays scripted token sequences, one script per
/// `generate` call, with an optional delay before each token.
struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<Result<String>>>>,
    calls: AtomicUsize,
    token_delay: Duration,
}

impl ScriptedLlm {
    fn new(scripts: Vec<Vec<Result<String>>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
            token_delay: Duration::ZERO,
        })
    }

    fn with_delay(scripts: Vec<Vec<Result<String>>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
            token_delay: delay,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn ok_tokens(tokens: &[&str]) -> Vec<Result<String>> {
    tokens.iter().map(|t| Ok(t.to_string())).collect()
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted-test"
    }

    async fn generate(&self, _prompt: &str) -> Result<TokenStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(script) = self.scripts.lock().await.pop_front() else {
            bail!("no scripted response left");
        };

        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for item in script {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(TokenStream::new(rx))
    }
}

fn test_config(dir: &Path) -> Config {
    Config {
        chat_db: ChatDbConfig {
            path: dir.join("chat.sqlite"),
        },
        storage: StorageConfig {
            index_dir: dir.join("indexes"),
        },
        // Small enough that each test paragraph becomes its own chunk.
        chunking: ChunkingConfig { max_tokens: 20 },
        retrieval: Default::default(),
        embedding: Default::default(),
        llm: Default::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

const SKY_DOC: &str = "Zebras graze on the savanna at dawn.\n\n\
The sky is blue because sunlight scatters off air molecules.\n\n\
Frogs lay their eggs in shallow ponds.";

/// Drain an answer stream into (concatenated tokens, committed turn).
async fn collect_answer(
    mut events: rag::AnswerStream,
) -> (String, Option<threadqa::models::ConversationTurn>) {
    let mut text = String::new();
    let mut done = None;
    while let Some(event) = events.next().await {
        match event {
            AnswerEvent::Token(t) => text.push_str(&t),
            AnswerEvent::Done(turn) => done = Some(turn),
        }
    }
    (text, done)
}

// ============ Tests ============

#[tokio::test]
async fn build_then_ask_streams_and_commits() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);
    let llm = ScriptedLlm::new(vec![ok_tokens(&["The sky ", "is ", "blue."])]);

    let registry = SessionRegistry::new();
    let session = registry.create("sky".into()).await;

    let (index, summary) = SessionIndex::build(
        &cfg,
        embedder.as_ref(),
        &session.id,
        SourceKind::File,
        SKY_DOC,
    )
    .await
    .unwrap();
    assert_eq!(summary.chunks, 3);
    session.attach_index(Arc::new(index)).await;

    // Retrieval ranks the sky passage first for a sky question.
    let retrieved = session
        .index
        .read()
        .await
        .clone()
        .unwrap()
        .query(embedder.as_ref(), "why is the sky blue?", 3)
        .await
        .unwrap();
    assert!(retrieved[0].text.contains("sky is blue"));

    let events = rag::answer(
        session.clone(),
        embedder.clone(),
        llm.clone(),
        &cfg,
        "why is the sky blue?",
    )
    .await
    .unwrap();

    let (text, done) = collect_answer(events).await;
    assert_eq!(text, "The sky is blue.");

    let turn = done.expect("stream must end with a committed turn");
    assert_eq!(turn.seq, 0);
    assert_eq!(turn.answer, text);
    assert_eq!(turn.question, "why is the sky blue?");
    assert!(!turn.edited);
    assert!(turn.supersedes.is_none());

    let memory = session.memory.lock().await;
    assert_eq!(memory.len(), 1);
    assert_eq!(memory.get(0).unwrap().answer, "The sky is blue.");
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn ask_without_index_fails_before_generation() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);
    let llm = ScriptedLlm::new(vec![ok_tokens(&["never used"])]);

    let registry = SessionRegistry::new();
    let session = registry.create("empty".into()).await;

    let err = rag::answer(session.clone(), embedder, llm.clone(), &cfg, "anything?")
        .await
        .err()
        .expect("must fail without an index");
    assert!(matches!(err, QaError::NoIndexBound));
    assert_eq!(llm.call_count(), 0);
    assert!(session.memory.lock().await.is_empty());
}

#[tokio::test]
async fn sessions_never_observe_each_other() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);
    let llm = ScriptedLlm::new(vec![ok_tokens(&["about the sky"])]);

    let registry = SessionRegistry::new();
    let sky = registry.create("sky".into()).await;
    let frogs = registry.create("frogs".into()).await;

    let (sky_index, _) = SessionIndex::build(
        &cfg,
        embedder.as_ref(),
        &sky.id,
        SourceKind::File,
        "The sky is blue because sunlight scatters.",
    )
    .await
    .unwrap();
    let (frog_index, _) = SessionIndex::build(
        &cfg,
        embedder.as_ref(),
        &frogs.id,
        SourceKind::File,
        "Frogs lay their eggs in shallow ponds.",
    )
    .await
    .unwrap();
    sky.attach_index(Arc::new(sky_index)).await;
    frogs.attach_index(Arc::new(frog_index)).await;

    // Each index only ever returns its own document's chunks.
    let from_frogs = frogs
        .index
        .read()
        .await
        .clone()
        .unwrap()
        .query(embedder.as_ref(), "why is the sky blue?", 5)
        .await
        .unwrap();
    assert!(from_frogs.iter().all(|c| !c.text.contains("sky")));

    // A committed turn in one session leaves the other memory untouched.
    let events = rag::answer(sky.clone(), embedder, llm, &cfg, "sky?")
        .await
        .unwrap();
    collect_answer(events).await;
    assert_eq!(sky.memory.lock().await.len(), 1);
    assert!(frogs.memory.lock().await.is_empty());
}

#[tokio::test]
async fn rebuild_replaces_the_index_for_the_session() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);

    let (first, _) = SessionIndex::build(
        &cfg,
        embedder.as_ref(),
        "s1",
        SourceKind::File,
        "original document about zebras",
    )
    .await
    .unwrap();
    drop(first);

    let (_second, summary) = SessionIndex::build(
        &cfg,
        embedder.as_ref(),
        "s1",
        SourceKind::File,
        "replacement passage one describing mountain ranges in detail.\n\n\
         replacement passage two describing deep ocean currents in detail.",
    )
    .await
    .unwrap();
    assert_eq!(summary.chunks, 2);

    // Reopening from disk sees only the replacement content.
    let reopened = SessionIndex::open(&cfg, "s1", SourceKind::File)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reopened.chunk_count().await.unwrap(), 2);
    let results = reopened
        .query(embedder.as_ref(), "zebras", 10)
        .await
        .unwrap();
    assert!(results.iter().all(|c| !c.text.contains("zebras")));
}

#[tokio::test]
async fn midstream_failure_commits_partial_answer_with_marker() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);
    let llm = ScriptedLlm::new(vec![
        vec![Ok("The sky ".to_string()), Err(anyhow::anyhow!("connection reset"))],
        ok_tokens(&["recovered fine"]),
    ]);

    let registry = SessionRegistry::new();
    let session = registry.create("sky".into()).await;
    let (index, _) = SessionIndex::build(&cfg, embedder.as_ref(), &session.id, SourceKind::File, SKY_DOC)
        .await
        .unwrap();
    session.attach_index(Arc::new(index)).await;

    let events = rag::answer(session.clone(), embedder.clone(), llm.clone(), &cfg, "sky?")
        .await
        .unwrap();
    let (text, done) = collect_answer(events).await;

    assert!(text.starts_with("The sky "));
    assert!(text.contains("generation interrupted"));
    assert!(text.contains("connection reset"));

    // The failure is contained in this turn, which still commits.
    let turn = done.expect("interrupted turn must still commit");
    assert_eq!(turn.answer, text);
    assert_eq!(session.memory.lock().await.len(), 1);

    // And the session is immediately usable again.
    let events = rag::answer(session.clone(), embedder, llm, &cfg, "again?")
        .await
        .unwrap();
    let (text, done) = collect_answer(events).await;
    assert_eq!(text, "recovered fine");
    assert_eq!(done.unwrap().seq, 1);
}

#[tokio::test]
async fn dropping_the_stream_cancels_without_commit() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);
    let llm = ScriptedLlm::with_delay(
        vec![
            ok_tokens(&["a", "b", "c", "d", "e", "f"]),
            ok_tokens(&["second answer"]),
        ],
        Duration::from_millis(30),
    );

    let registry = SessionRegistry::new();
    let session = registry.create("sky".into()).await;
    let (index, _) = SessionIndex::build(&cfg, embedder.as_ref(), &session.id, SourceKind::File, SKY_DOC)
        .await
        .unwrap();
    session.attach_index(Arc::new(index)).await;

    let mut events = rag::answer(session.clone(), embedder.clone(), llm.clone(), &cfg, "sky?")
        .await
        .unwrap();

    // Take one token, then walk away mid-stream.
    let first = events.next().await;
    assert!(matches!(first, Some(AnswerEvent::Token(_))));
    drop(events);

    // Give the forwarding task time to notice and exit.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(session.memory.lock().await.is_empty());

    // The gate was released; the next question proceeds normally.
    let events = rag::answer(session.clone(), embedder, llm, &cfg, "again?")
        .await
        .unwrap();
    let (text, done) = collect_answer(events).await;
    assert_eq!(text, "second answer");
    assert_eq!(done.unwrap().seq, 0);
}

#[tokio::test]
async fn regenerate_appends_a_superseding_turn() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);
    let llm = ScriptedLlm::new(vec![
        ok_tokens(&["first answer"]),
        ok_tokens(&["revised answer"]),
    ]);

    let registry = SessionRegistry::new();
    let session = registry.create("sky".into()).await;
    let (index, _) = SessionIndex::build(&cfg, embedder.as_ref(), &session.id, SourceKind::File, SKY_DOC)
        .await
        .unwrap();
    session.attach_index(Arc::new(index)).await;

    let events = rag::answer(session.clone(), embedder.clone(), llm.clone(), &cfg, "sky?")
        .await
        .unwrap();
    collect_answer(events).await;

    // Editing a turn that does not exist is rejected up front.
    let err = rag::regenerate(session.clone(), embedder.clone(), llm.clone(), &cfg, 42, "x")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, QaError::TurnNotFound(42)));

    let events = rag::regenerate(
        session.clone(),
        embedder,
        llm,
        &cfg,
        0,
        "sky, but more precisely?",
    )
    .await
    .unwrap();
    let (text, done) = collect_answer(events).await;
    assert_eq!(text, "revised answer");

    let turn = done.unwrap();
    assert_eq!(turn.seq, 1);
    assert!(turn.edited);
    assert_eq!(turn.supersedes, Some(0));

    // Append-only: the original turn is intact and the log grew.
    let memory = session.memory.lock().await;
    assert_eq!(memory.len(), 2);
    let original = memory.get(0).unwrap();
    assert_eq!(original.answer, "first answer");
    assert!(!original.edited);
}

#[tokio::test]
async fn concurrent_answer_on_one_session_is_rejected() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let embedder: Arc<dyn Embedder> = Arc::new(WordBagEmbedder);
    let llm = ScriptedLlm::with_delay(
        vec![
            ok_tokens(&["slow", " ", "answer"]),
            ok_tokens(&["after the first finished"]),
        ],
        Duration::from_millis(100),
    );

    let registry = SessionRegistry::new();
    let session = registry.create("sky".into()).await;
    let (index, _) = SessionIndex::build(&cfg, embedder.as_ref(), &session.id, SourceKind::File, SKY_DOC)
        .await
        .unwrap();
    session.attach_index(Arc::new(index)).await;

    let in_flight = rag::answer(session.clone(), embedder.clone(), llm.clone(), &cfg, "one?")
        .await
        .unwrap();

    // While the first answer streams, a second ask is rejected, not queued.
    let err = rag::answer(session.clone(), embedder.clone(), llm.clone(), &cfg, "two?")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, QaError::SessionBusy));

    let (text, done) = collect_answer(in_flight).await;
    assert_eq!(text, "slow answer");
    assert!(done.is_some());

    // Once the turn committed, the session answers again.
    let events = rag::answer(session.clone(), embedder, llm, &cfg, "three?")
        .await
        .unwrap();
    let (text, _) = collect_answer(events).await;
    assert_eq!(text, "after the first finished");
    assert_eq!(session.memory.lock().await.len(), 2);
}

#[tokio::test]
async fn unsupported_upload_is_rejected_before_any_work() {
    let err = threadqa::extract::kind_for_path("slides.pptx").unwrap_err();
    assert!(matches!(err, QaError::UnsupportedFormat(_)));
    assert_eq!(err.code(), "unsupported_format");
}
