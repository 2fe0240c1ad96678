use std::collections::HashMap;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the UI event channel. Slow subscribers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status of a stream lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Completed,
    Truncated,
    Discarded,
    Cancelled,
    Error(String),
}

/// Phase of one send-message interaction.
///
/// `Idle → UserMessageSubmitting → UserMessagePersisted → AssistantStreaming
/// → AssistantFinalizing → Idle`, with `Failed` reachable from any phase.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    UserMessageSubmitting,
    UserMessagePersisted,
    AssistantStreaming,
    AssistantFinalizing,
    Failed(String),
}

impl SendPhase {
    pub fn is_busy(&self) -> bool {
        !matches!(self, SendPhase::Idle | SendPhase::Failed(_))
    }
}

/// Events emitted for decoupled UI updates.
/// Each variant is tagged with `conversation_id` so subscribers can filter.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    PhaseChanged {
        conversation_id: String,
        phase: SendPhase,
    },
    StreamStarted {
        conversation_id: String,
        message_id: String,
    },
    /// Throttled re-render of the message being streamed
    TextRendered {
        conversation_id: String,
        message_id: String,
        text: String,
        html: String,
    },
    StreamEnded {
        conversation_id: String,
        status: StreamStatus,
    },
    ConversationsChanged,
    FoldersChanged,
    OperationFailed {
        operation: &'static str,
        error: String,
    },
}

/// Handle for one registered interaction.
///
/// Phase updates carry the generation so a superseded interaction cannot
/// overwrite the phase of the one that replaced it.
#[derive(Clone, Debug)]
pub struct StreamTicket {
    pub conversation_id: String,
    generation: u64,
    cancel: CancellationToken,
}

impl StreamTicket {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct StreamState {
    generation: u64,
    phase: SendPhase,
    cancel: CancellationToken,
}

/// Per-conversation lifecycle of send-message interactions.
///
/// Does NOT hold message text; rendered content lives in `ConversationsStore`.
/// Tracks phase and cancellation only, and emits `ChatEvent`s.
pub struct StreamManager {
    streams: HashMap<String, StreamState>,
    last_phase: HashMap<String, SendPhase>,
    next_generation: u64,
    events: broadcast::Sender<ChatEvent>,
}

impl StreamManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            streams: HashMap::new(),
            last_phase: HashMap::new(),
            next_generation: 0,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    /// Register an interaction for a conversation.
    /// If one is already running for this conversation, it is cancelled first.
    pub fn register(&mut self, conversation_id: &str) -> StreamTicket {
        if let Some(existing) = self.streams.remove(conversation_id) {
            existing.cancel.cancel();
            debug!(conv_id = %conversation_id, "Cancelled existing stream before registering new one");
        }

        self.next_generation += 1;
        let cancel = CancellationToken::new();
        self.streams.insert(
            conversation_id.to_string(),
            StreamState {
                generation: self.next_generation,
                phase: SendPhase::Idle,
                cancel: cancel.clone(),
            },
        );

        StreamTicket {
            conversation_id: conversation_id.to_string(),
            generation: self.next_generation,
            cancel,
        }
    }

    /// Whether `ticket` belongs to the interaction currently registered
    pub fn is_current(&self, ticket: &StreamTicket) -> bool {
        self.streams
            .get(&ticket.conversation_id)
            .is_some_and(|s| s.generation == ticket.generation)
    }

    /// Move a registered interaction to `phase`. Stale tickets are ignored.
    pub fn set_phase(&mut self, ticket: &StreamTicket, phase: SendPhase) {
        if !self.is_current(ticket) {
            debug!(conv_id = %ticket.conversation_id, ?phase, "Ignoring phase change from superseded stream");
            return;
        }

        if let Some(state) = self.streams.get_mut(&ticket.conversation_id) {
            state.phase = phase.clone();
        }
        self.emit(ChatEvent::PhaseChanged {
            conversation_id: ticket.conversation_id.clone(),
            phase,
        });
    }

    /// Retire an interaction, recording the phase it ended in
    pub fn finish(&mut self, ticket: &StreamTicket, phase: SendPhase, status: StreamStatus) {
        if !self.is_current(ticket) {
            return;
        }

        self.streams.remove(&ticket.conversation_id);
        self.last_phase
            .insert(ticket.conversation_id.clone(), phase.clone());
        self.emit(ChatEvent::PhaseChanged {
            conversation_id: ticket.conversation_id.clone(),
            phase,
        });
        self.emit(ChatEvent::StreamEnded {
            conversation_id: ticket.conversation_id.clone(),
            status,
        });
    }

    /// Current phase for a conversation (`Idle` when nothing ran)
    pub fn phase(&self, conversation_id: &str) -> SendPhase {
        if let Some(state) = self.streams.get(conversation_id) {
            return state.phase.clone();
        }
        self.last_phase
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Request cancellation of the interaction running for a conversation
    pub fn stop_stream(&mut self, conversation_id: &str) -> bool {
        match self.streams.get(conversation_id) {
            Some(state) => {
                state.cancel.cancel();
                debug!(conv_id = %conversation_id, "Stream cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Check if a conversation has an interaction in flight
    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.streams.contains_key(conversation_id)
    }

    pub fn has_active_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Cancel everything (shutdown)
    pub fn stop_all(&mut self) {
        for (conv_id, state) in &self.streams {
            state.cancel.cancel();
            debug!(conv_id = %conv_id, "Stream cancelled on shutdown");
        }
    }

    /// Drop bookkeeping for a deleted conversation
    pub fn forget(&mut self, conversation_id: &str) {
        if let Some(state) = self.streams.remove(conversation_id) {
            state.cancel.cancel();
        }
        self.last_phase.remove(conversation_id);
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}
