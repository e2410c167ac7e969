use tracing::debug;

use crate::api::ChatMessage;
use crate::core::session::SessionStore;

/// Phase of the in-flight turn. `Idle` doubles as the settled state; a
/// settled error is carried in [`TurnState::error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    AwaitingFirstToken,
    Streaming,
}

/// Per-turn state owned by the event loop and threaded through the
/// controller. The stream id distinguishes deltas of the active stream from
/// stragglers of superseded ones.
#[derive(Debug, Default)]
pub struct TurnState {
    pub phase: TurnPhase,
    pub stream_id: u64,
    pub error: Option<String>,
}

impl TurnState {
    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, TurnPhase::AwaitingFirstToken | TurnPhase::Streaming)
    }
}

/// Drives one user turn end-to-end over the session store: user append,
/// placeholder creation, in-order delta application, and success/error
/// settlement. At most one turn is active at a time.
pub struct ConversationController<'a> {
    store: &'a mut SessionStore,
    turn: &'a mut TurnState,
}

impl<'a> ConversationController<'a> {
    pub fn new(store: &'a mut SessionStore, turn: &'a mut TurnState) -> Self {
        Self { store, turn }
    }

    /// Start a turn: guard the input, create a session when none is
    /// current, append the user message, open the assistant placeholder,
    /// and return the outbound request messages.
    ///
    /// Returns `None` when the input is empty or a turn is already in
    /// flight; both guards are silent no-ops rather than errors.
    pub fn begin_turn(&mut self, input: &str) -> Option<Vec<ChatMessage>> {
        let input = input.trim();
        if input.is_empty() || self.turn.is_streaming() {
            return None;
        }

        if self.store.current_session_id().is_none() {
            self.store.create_session();
        }

        self.store.append_user_message(input);
        let api_messages = self.outbound_messages();
        self.store.push_assistant_placeholder();

        self.turn.error = None;
        self.turn.stream_id += 1;
        self.turn.phase = TurnPhase::AwaitingFirstToken;
        debug!(stream_id = self.turn.stream_id, "turn started");
        Some(api_messages)
    }

    /// Request payload for the turn: the active buffer, optionally prefixed
    /// with a system message built from the configured system prompt. The
    /// prompt is injected only into the outbound call, never into the
    /// buffer itself.
    fn outbound_messages(&self) -> Vec<ChatMessage> {
        let mut api_messages = Vec::new();
        let system_prompt = self.store.system_prompt().trim();
        if !system_prompt.is_empty() {
            api_messages.push(ChatMessage {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        api_messages.extend(self.store.messages().iter().map(ChatMessage::from));
        api_messages
    }

    /// Apply one streamed delta to the assistant placeholder, in arrival
    /// order. Deltas from superseded streams are discarded.
    pub fn apply_delta(&mut self, stream_id: u64, content: &str) {
        if stream_id != self.turn.stream_id || !self.turn.is_streaming() {
            return;
        }
        self.turn.phase = TurnPhase::Streaming;
        self.store.append_to_last_assistant(content);
    }

    /// Settle the turn successfully, leaving the finalized assistant
    /// message in place. Returns true when this ended the active turn; the
    /// caller then schedules the debounced auto-save.
    pub fn finish_turn(&mut self, stream_id: u64) -> bool {
        if stream_id != self.turn.stream_id || !self.turn.is_streaming() {
            return false;
        }
        self.turn.phase = TurnPhase::Idle;
        debug!(stream_id, "turn finished");
        true
    }

    /// Settle the turn with an error: discard the assistant placeholder
    /// (the user message is retained) and record the error for display.
    pub fn fail_turn(&mut self, stream_id: u64, error: String) -> bool {
        if stream_id != self.turn.stream_id || !self.turn.is_streaming() {
            return false;
        }
        self.store.drop_trailing_assistant();
        self.turn.error = Some(error);
        self.turn.phase = TurnPhase::Idle;
        true
    }
}
