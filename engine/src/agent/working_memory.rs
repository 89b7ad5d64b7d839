//! Working memory for a turn
//!
//! Bounds the history handed to the reasoning collaborator by an estimated
//! token budget. Audit turns are never shown to the collaborator. Trimming
//! drops the oldest turns first but never the current user message or
//! anything recorded after it.

use sdk::types::{Turn, TurnRole};

/// Default context limit in tokens
const DEFAULT_CONTEXT_LIMIT: usize = 8000;

/// Rough estimate: 1 token ≈ 4 characters
const CHARS_PER_TOKEN: usize = 4;

/// Per-message overhead for role and structure
const MESSAGE_OVERHEAD: usize = 10;

#[derive(Debug, Clone)]
pub struct WorkingMemory {
    turns: Vec<Turn>,
    context_limit: usize,
    token_count: usize,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_CONTEXT_LIMIT)
    }

    pub fn with_limit(context_limit: usize) -> Self {
        Self {
            turns: Vec::new(),
            context_limit,
            token_count: 0,
        }
    }

    /// Build the bounded view of a stored history
    pub fn from_turns<'a>(turns: impl IntoIterator<Item = &'a Turn>, context_limit: usize) -> Self {
        let mut memory = Self::with_limit(context_limit);
        for turn in turns {
            memory.add_turn(turn.clone());
        }
        memory
    }

    /// Add a turn, trimming old ones if the budget is exceeded
    pub fn add_turn(&mut self, turn: Turn) {
        if turn.role == TurnRole::Audit {
            return;
        }

        self.token_count += Self::estimate_tokens(&turn);
        self.turns.push(turn);

        if self.token_count > self.context_limit {
            self.trim();
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    fn trim(&mut self) {
        // Everything from the last user message on belongs to the turn in progress.
        let protected_from = self
            .turns
            .iter()
            .rposition(|t| t.role == TurnRole::User)
            .unwrap_or(self.turns.len().saturating_sub(1));

        let mut removable = protected_from;
        while self.token_count > self.context_limit && removable > 0 {
            let removed = self.turns.remove(0);
            self.token_count = self
                .token_count
                .saturating_sub(Self::estimate_tokens(&removed));
            removable -= 1;
        }
    }

    fn estimate_tokens(turn: &Turn) -> usize {
        turn.content.len().div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}
