//! Per-session conversation memory.
//!
//! The log is append-only: turns are never mutated or removed once
//! committed. An edit appends a fresh turn with `edited = true` and a
//! `supersedes` back-reference, so the full audit trail survives. Prompt
//! composition reads a bounded recency window; the whole log stays
//! available for inspection.

use chrono::Utc;

use crate::models::ConversationTurn;

#[derive(Debug, Default)]
pub struct ConversationMemory {
    turns: Vec<ConversationTurn>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a committed turn and return a reference to it.
    ///
    /// `seq` is assigned here from the current log length, so sequence
    /// numbers are dense and reflect commit order.
    pub fn append(
        &mut self,
        question: String,
        answer: String,
        edited: bool,
        supersedes: Option<i64>,
    ) -> &ConversationTurn {
        let turn = ConversationTurn {
            seq: self.turns.len() as i64,
            question,
            answer,
            edited,
            supersedes,
            created_at: Utc::now(),
        };
        let idx = self.turns.len();
        self.turns.push(turn);
        &self.turns[idx]
    }

    /// The full log in insertion order.
    pub fn snapshot(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The most recent `n` turns, insertion order preserved.
    pub fn window(&self, n: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// Look up a turn by its sequence number.
    pub fn get(&self, seq: i64) -> Option<&ConversationTurn> {
        if seq < 0 {
            return None;
        }
        self.turns.get(seq as usize)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(n: usize) -> ConversationMemory {
        let mut m = ConversationMemory::new();
        for i in 0..n {
            m.append(format!("q{}", i), format!("a{}", i), false, None);
        }
        m
    }

    #[test]
    fn append_assigns_dense_sequence_numbers() {
        let m = memory_with(3);
        let seqs: Vec<i64> = m.snapshot().iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn edit_appends_and_never_mutates_original() {
        let mut m = memory_with(2);
        let original_answer = m.get(1).unwrap().answer.clone();

        let turn = m.append("q1 revised".into(), "a1 revised".into(), true, Some(1));
        assert_eq!(turn.seq, 2);
        assert!(turn.edited);
        assert_eq!(turn.supersedes, Some(1));

        let original = m.get(1).unwrap();
        assert_eq!(original.answer, original_answer);
        assert!(!original.edited);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn window_returns_most_recent_in_order() {
        let m = memory_with(5);
        let w = m.window(2);
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].question, "q3");
        assert_eq!(w[1].question, "q4");
    }

    #[test]
    fn window_larger_than_log_returns_everything() {
        let m = memory_with(2);
        assert_eq!(m.window(100).len(), 2);
        assert!(ConversationMemory::new().window(3).is_empty());
    }

    #[test]
    fn get_out_of_range_is_none() {
        let m = memory_with(1);
        assert!(m.get(-1).is_none());
        assert!(m.get(1).is_none());
        assert_eq!(m.get(0).unwrap().question, "q0");
    }
}
