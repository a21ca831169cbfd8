//! One generation run
//!
//! A run owns its accumulation buffer exclusively. The only state shared
//! with the outside world is the cancel flag, which the manager and the
//! pressure monitor may set at any time; the streaming loop checks it before
//! every pull and again when a fragment arrives.

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use super::GenerationSettings;
use crate::conversation::{ConversationStore, FlushResult};
use crate::llm::{BackendError, Message, ModelBackend, ModelSession};
use crate::message_bus::{Event, MessageBus};

/// Why the streaming loop stopped early
#[derive(Debug)]
pub(crate) enum RunInterrupt {
    /// Cancel flag observed; becomes `RunOutcome::Canceled`
    Canceled,

    /// Backend failed to start or failed mid-stream
    Backend(BackendError),
}

pub(crate) struct GenerationRun {
    pub(crate) id: u64,
    epoch: u64,
    cancel: Arc<AtomicBool>,
    started_at: Instant,
    buffer: String,
    last_flush: Instant,
    flushes: usize,
}

impl GenerationRun {
    pub(crate) fn new(id: u64, epoch: u64, cancel: Arc<AtomicBool>) -> Self {
        let now = Instant::now();
        Self {
            id,
            epoch,
            cancel,
            started_at: now,
            buffer: String::new(),
            last_flush: now,
            flushes: 0,
        }
    }

    fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn flushes(&self) -> usize {
        self.flushes
    }

    pub(crate) fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Pull fragments until the stream ends, fails, or the run is canceled
    pub(crate) async fn stream(
        &mut self,
        backend: &ModelSession,
        messages: &[Message],
        store: &ConversationStore,
        bus: &MessageBus,
        settings: &GenerationSettings,
    ) -> Result<(), RunInterrupt> {
        let mut fragments = backend
            .generate(messages)
            .await
            .map_err(RunInterrupt::Backend)?;
        self.last_flush = Instant::now();

        loop {
            if self.is_canceled() {
                return Err(RunInterrupt::Canceled);
            }

            let fragment = match fragments.next().await {
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => return Err(RunInterrupt::Backend(e)),
                None => break,
            };

            // Anything still buffered is dropped on cancellation
            if self.is_canceled() {
                return Err(RunInterrupt::Canceled);
            }

            self.buffer.push_str(&fragment);
            if self.buffer.chars().count() >= settings.flush_min_chars
                || self.last_flush.elapsed() >= settings.flush_interval
            {
                self.flush(store, bus);
            }
        }

        if self.is_canceled() {
            return Err(RunInterrupt::Canceled);
        }
        if !self.buffer.is_empty() {
            self.flush(store, bus);
        }
        Ok(())
    }

    fn flush(&mut self, store: &ConversationStore, bus: &MessageBus) {
        let text = std::mem::take(&mut self.buffer);
        match store.flush_assistant(self.id, self.epoch, &text) {
            FlushResult::Applied => {
                tracing::trace!("Run {} flushed {} chars", self.id, text.chars().count());
                bus.publish(Event::GenerationFlushed {
                    run_id: self.id,
                    text,
                });
            }
            FlushResult::Stale => {
                tracing::debug!(
                    "Run {} output discarded: conversation was reset",
                    self.id
                );
            }
        }
        self.last_flush = Instant::now();
        self.flushes += 1;
    }
}
