//! Per-slot sequence tracking.
//!
//! A [`BatchSlot`] binds one prompt's [`Sequence`] to a cache region and the
//! slot's generation state. Slots live exactly as long as one session.

/// Reason a slot stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The generation limit for the slot was reached.
    MaxTokens,
    /// The end-of-sequence token was sampled.
    EosToken,
    /// A stop string appeared in the decoded continuation.
    StopString,
}

impl StopReason {
    /// Get the reason name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::EosToken => "eos_token",
            Self::StopString => "stop_string",
        }
    }
}

/// Prompt tokens plus the continuation generated so far.
///
/// # Example
///
/// ```
/// use nano_batchgen::core::sequence::Sequence;
///
/// let mut seq = Sequence::new(vec![1, 2, 3, 4]);
/// assert_eq!(seq.prompt_len(), 4);
/// assert_eq!(seq.output_len(), 0);
///
/// seq.append_token(5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.total_len(), 5);
/// assert_eq!(seq.last_token_id(), Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generated output token IDs.
    output_token_ids: Vec<u32>,
    /// Prompt followed by output, kept contiguous for the repetition penalty.
    all_token_ids: Vec<u32>,
}

impl Sequence {
    /// Create a new sequence from prompt tokens.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            all_token_ids: prompt_token_ids.clone(),
            prompt_token_ids,
            output_token_ids: Vec::new(),
        }
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> &[u32] {
        &self.all_token_ids
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.all_token_ids.len()
    }

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
        self.all_token_ids.push(token_id);
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.all_token_ids.last().copied()
    }
}

/// Generation state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    /// Whether the slot still takes part in decode steps.
    pub active: bool,
    /// Number of tokens generated so far.
    pub emitted_count: usize,
    /// Why the slot stopped (None while active or if the session was aborted).
    pub stop_reason: Option<StopReason>,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            active: true,
            emitted_count: 0,
            stop_reason: None,
        }
    }
}

/// One prompt's place in a batched session.
#[derive(Debug, Clone)]
pub struct BatchSlot {
    /// Cache region index, equal to the prompt's position in the input.
    index: usize,
    /// Tokens owned by this slot.
    sequence: Sequence,
    /// Generation state.
    state: SlotState,
    /// Maximum number of tokens this slot may emit.
    limit: usize,
}

impl BatchSlot {
    /// Create an active slot with a generation limit.
    pub fn new(index: usize, prompt_token_ids: Vec<u32>, limit: usize) -> Self {
        Self {
            index,
            sequence: Sequence::new(prompt_token_ids),
            state: SlotState::default(),
            limit,
        }
    }

    /// Get the slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Get the slot's sequence.
    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// Get the generation state.
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Get the generation limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether the slot still generates.
    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// Whether the slot has used up its generation limit.
    pub fn is_exhausted(&self) -> bool {
        self.state.emitted_count >= self.limit
    }

    /// Get the stop reason.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.stop_reason
    }

    /// Record a sampled token.
    pub fn push_token(&mut self, token_id: u32) {
        debug_assert!(self.state.active, "push_token on inactive slot {}", self.index);
        self.sequence.append_token(token_id);
        self.state.emitted_count += 1;
    }

    /// Deactivate the slot. The first recorded reason wins.
    pub fn stop(&mut self, reason: StopReason) {
        if self.state.active {
            self.state.active = false;
            self.state.stop_reason = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_creation() {
        let seq = Sequence::new(vec![10, 20, 30, 40]);

        assert_eq!(seq.prompt_len(), 4);
        assert_eq!(seq.output_len(), 0);
        assert_eq!(seq.total_len(), 4);
        assert_eq!(seq.last_token_id(), Some(40));
    }

    #[test]
    fn test_all_token_ids() {
        let mut seq = Sequence::new(vec![1, 2, 3]);
        seq.append_token(10);
        seq.append_token(20);

        assert_eq!(seq.all_token_ids(), &[1, 2, 3, 10, 20]);
        assert_eq!(seq.output_token_ids(), &[10, 20]);
    }

    #[test]
    fn test_slot_stop_keeps_first_reason() {
        let mut slot = BatchSlot::new(0, vec![1, 2], 4);
        slot.push_token(3);
        slot.stop(StopReason::EosToken);
        slot.stop(StopReason::MaxTokens);

        assert!(!slot.is_active());
        assert_eq!(slot.stop_reason(), Some(StopReason::EosToken));
        assert_eq!(slot.state().emitted_count, 1);
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut slot = BatchSlot::new(1, vec![1], 2);
        assert!(!slot.is_exhausted());
        slot.push_token(5);
        slot.push_token(6);
        assert!(slot.is_exhausted());

        let empty = BatchSlot::new(2, vec![1], 0);
        assert!(empty.is_exhausted());
    }
}
