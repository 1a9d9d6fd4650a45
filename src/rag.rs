//! Retrieval-augmented answer orchestration.
//!
//! `answer()` runs one full turn for a session: take the answering gate,
//! retrieve the most relevant chunks, compose a prompt with the recent
//! conversation window, stream tokens from the language model, and commit
//! the finished turn to the session's memory.
//!
//! Failure containment:
//! - anything that goes wrong before the first token (no index, busy
//!   session, retrieval or generation setup) is returned as `Err` and the
//!   session stays ready;
//! - a mid-stream generation failure is folded into the partial answer as
//!   an inline marker and the turn is still committed;
//! - the caller dropping the stream cancels the turn: the forwarding task
//!   notices the failed send and exits without committing.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::QaError;
use crate::llm::LanguageModel;
use crate::models::{ConversationTurn, RetrievedChunk};
use crate::session::Session;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// What the caller observes while an answer is generated.
#[derive(Debug)]
pub enum AnswerEvent {
    Token(String),
    /// Terminal event: the turn as committed to memory.
    Done(ConversationTurn),
}

/// Stream of [`AnswerEvent`]s for one turn. Dropping it cancels the turn
/// if tokens are still in flight.
pub struct AnswerStream {
    rx: mpsc::Receiver<AnswerEvent>,
}

impl Stream for AnswerStream {
    type Item = AnswerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Answer `question` against the session's index and conversation memory.
pub async fn answer(
    session: Arc<Session>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    config: &Config,
    question: &str,
) -> Result<AnswerStream, QaError> {
    run_turn(session, embedder, llm, config, question, false, None).await
}

/// Re-answer an edited question, superseding an earlier turn.
///
/// The original turn is left untouched; the new turn is appended with
/// `edited = true` and a back-reference to `turn_seq`.
pub async fn regenerate(
    session: Arc<Session>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    config: &Config,
    turn_seq: i64,
    new_question: &str,
) -> Result<AnswerStream, QaError> {
    if session.memory.lock().await.get(turn_seq).is_none() {
        return Err(QaError::TurnNotFound(turn_seq));
    }
    run_turn(
        session,
        embedder,
        llm,
        config,
        new_question,
        true,
        Some(turn_seq),
    )
    .await
}

async fn run_turn(
    session: Arc<Session>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    config: &Config,
    question: &str,
    edited: bool,
    supersedes: Option<i64>,
) -> Result<AnswerStream, QaError> {
    // One answer per session at a time; contenders are rejected outright.
    let gate = session
        .answer_gate
        .clone()
        .try_lock_owned()
        .map_err(|_| QaError::SessionBusy)?;

    let index = session
        .index
        .read()
        .await
        .clone()
        .ok_or(QaError::NoIndexBound)?;

    let retrieved = index
        .query(embedder.as_ref(), question, config.retrieval.top_k)
        .await?;

    let history: Vec<ConversationTurn> = session
        .memory
        .lock()
        .await
        .window(config.retrieval.history_turns)
        .to_vec();

    let prompt = compose_prompt(&retrieved, &history, question);

    let mut tokens = llm
        .generate(&prompt)
        .await
        .map_err(|e| QaError::GenerationFailed(e.to_string()))?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let question = question.to_string();

    tokio::spawn(async move {
        let _gate = gate; // held until this turn finishes or is cancelled
        let mut answer_text = String::new();

        loop {
            match tokens.next().await {
                Some(Ok(token)) => {
                    answer_text.push_str(&token);
                    if tx.send(AnswerEvent::Token(token)).await.is_err() {
                        return; // caller cancelled, nothing is committed
                    }
                }
                Some(Err(e)) => {
                    // Contain the failure in this turn: keep the partial
                    // answer, mark the interruption, and commit.
                    let marker = format!("\n[error: generation interrupted: {}]", e);
                    answer_text.push_str(&marker);
                    if tx.send(AnswerEvent::Token(marker)).await.is_err() {
                        return;
                    }
                    break;
                }
                None => break,
            }
        }

        let turn = session
            .memory
            .lock()
            .await
            .append(question, answer_text, edited, supersedes)
            .clone();
        let _ = tx.send(AnswerEvent::Done(turn)).await;
    });

    Ok(AnswerStream { rx })
}

/// Compose the generation prompt from retrieved context, the recent
/// conversation window, and the current question.
pub fn compose_prompt(
    retrieved: &[RetrievedChunk],
    history: &[ConversationTurn],
    question: &str,
) -> String {
    let mut prompt = String::from(
        "Answer the question using only the context passages below. \
         If the context does not contain the answer, say so.\n\n",
    );

    for (i, chunk) in retrieved.iter().enumerate() {
        prompt.push_str(&format!("[Passage {}]\n{}\n\n", i + 1, chunk.text));
    }

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for turn in history {
            prompt.push_str(&format!("User: {}\nAssistant: {}\n", turn.question, turn.answer));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("Question: {}\nAnswer:", question));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            text: text.to_string(),
            score: 0.9,
            chunk_index: 0,
        }
    }

    fn turn(q: &str, a: &str) -> ConversationTurn {
        ConversationTurn {
            seq: 0,
            question: q.to_string(),
            answer: a.to_string(),
            edited: false,
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prompt_orders_passages_before_history_before_question() {
        let prompt = compose_prompt(
            &[chunk("the sky is blue"), chunk("grass is green")],
            &[turn("hi", "hello")],
            "what color is the sky?",
        );

        let passage = prompt.find("the sky is blue").unwrap();
        let second = prompt.find("grass is green").unwrap();
        let history = prompt.find("User: hi").unwrap();
        let question = prompt.find("Question: what color is the sky?").unwrap();

        assert!(passage < second);
        assert!(second < history);
        assert!(history < question);
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn prompt_omits_history_section_when_empty() {
        let prompt = compose_prompt(&[chunk("ctx")], &[], "q?");
        assert!(!prompt.contains("Conversation so far"));
        assert!(prompt.contains("[Passage 1]"));
    }
}
