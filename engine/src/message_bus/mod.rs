//! Message Bus for session events
//!
//! Pub/sub channel through which the session manager reports what it is
//! doing: preparation, run lifecycle, flushed text, cancellation requests
//! and pressure signals. Observers (the CLI, tests) subscribe without the
//! manager knowing about them.
//!
//! Every subscriber gets a bounded channel. `publish` never blocks: a
//! subscriber whose channel is full misses the event, and subscribers that
//! dropped their receiver are pruned.

use sdk::types::PressureEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::session::RunOutcome;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// Session finished preparing
    SessionPrepared,
    /// A generation run was accepted
    GenerationStarted,
    /// Buffered run output was committed to the conversation
    GenerationFlushed,
    /// A run reached its terminal outcome
    GenerationFinished,
    /// Cancellation of the active run was requested
    CancellationRequested,
    /// The pressure monitor raised a signal
    PressureSignal,
    /// The conversation was reset
    ConversationReset,
    /// A system note was added
    NoteAppended,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Session prepared with the named schema
    SessionPrepared { schema: String },
    /// Run accepted; the task is about to pull fragments
    GenerationStarted { run_id: u64 },
    /// Text appended to the conversation by a flush
    GenerationFlushed { run_id: u64, text: String },
    /// Run ended
    GenerationFinished { run_id: u64, outcome: RunOutcome },
    /// Cancel flag set on a run
    CancellationRequested { run_id: u64 },
    /// Host pressure reported
    PressureSignal { event: PressureEvent },
    /// Conversation replaced with a fresh system prompt
    ConversationReset { epoch: u64 },
    /// System note appended at `seq`
    NoteAppended { seq: u64 },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::SessionPrepared { .. } => EventType::SessionPrepared,
            Event::GenerationStarted { .. } => EventType::GenerationStarted,
            Event::GenerationFlushed { .. } => EventType::GenerationFlushed,
            Event::GenerationFinished { .. } => EventType::GenerationFinished,
            Event::CancellationRequested { .. } => EventType::CancellationRequested,
            Event::PressureSignal { .. } => EventType::PressureSignal,
            Event::ConversationReset { .. } => EventType::ConversationReset,
            Event::NoteAppended { .. } => EventType::NoteAppended,
        }
    }
}

/// Message bus for pub/sub communication between components
///
/// Subscribers choose one event type or `EventType::All`. Cloning the bus
/// shares its subscriber table.
#[derive(Clone, Default)]
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    /// Each subscriber gets a bounded channel with CHANNEL_BUFFER_SIZE capacity
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<EventType, Vec<mpsc::Sender<Event>>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to a specific event type
    ///
    /// # Arguments
    /// * `event_type` - The type of events to subscribe to, or EventType::All for all events
    ///
    /// # Returns
    /// A bounded receiver for the matching events
    pub fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        self.channels().entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to all subscribers without waiting
    ///
    /// The event goes to subscribers of its type and to `EventType::All`
    /// subscribers.
    pub fn publish(&self, event: Event) {
        let mut channels = self.channels();
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!("Subscriber lagging, dropped {:?} event", event_type);
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscribers across all event types
    pub fn subscriber_count(&self) -> usize {
        self.channels()
            .values()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}
