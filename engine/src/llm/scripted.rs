//! Scripted Model Backend
//!
//! Deterministic in-process backend. Emits a fixed list of fragments with a
//! constant delay before each one. Powers the offline demo mode
//! (`backend.kind = "scripted"`) and the session tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{BackendError, FragmentStream, Message, ModelBackend, Result, SessionSchema};

/// Backend that replays a canned reply
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    fragments: Vec<String>,
    delay: Duration,

    /// Emit this many fragments, then fail with the message
    fail_after: Option<(usize, String)>,

    /// Reject `setup` with this message
    setup_failure: Option<String>,

    /// Panic instead of emitting the fragment at this index
    panic_at: Option<usize>,

    generate_calls: Arc<AtomicUsize>,
    reset_calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Create a backend emitting exactly these fragments
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            fail_after: None,
            setup_failure: None,
            panic_at: None,
            generate_calls: Arc::new(AtomicUsize::new(0)),
            reset_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Split a reply into word fragments, each keeping its trailing whitespace
    pub fn from_reply(reply: &str) -> Self {
        let mut fragments = Vec::new();
        let mut current = String::new();
        for ch in reply.chars() {
            if !ch.is_whitespace() && current.ends_with(char::is_whitespace) {
                fragments.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() {
            fragments.push(current);
        }
        Self::new(fragments)
    }

    /// Wait this long before emitting each fragment
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the stream after `count` fragments
    pub fn fail_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    /// Make `setup` fail
    pub fn failing_setup(mut self, message: impl Into<String>) -> Self {
        self.setup_failure = Some(message.into());
        self
    }

    /// Panic in the stream instead of emitting fragment `index`
    #[cfg(test)]
    pub(crate) fn panic_at(mut self, index: usize) -> Self {
        self.panic_at = Some(index);
        self
    }

    /// Fragments this backend emits
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Number of `generate` calls so far (shared across clones)
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Number of `reset_context` calls so far (shared across clones)
    pub fn reset_calls(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn setup(&self, schema: &SessionSchema) -> Result<()> {
        if let Some(message) = &self.setup_failure {
            return Err(BackendError::Setup(message.clone()));
        }
        tracing::debug!("Scripted backend ready for session '{}'", schema.name);
        Ok(())
    }

    async fn generate(&self, messages: &[Message]) -> Result<FragmentStream> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "Scripted generation over {} messages, {} fragments",
            messages.len(),
            self.fragments.len()
        );

        let delay = self.delay;
        let panic_at = self.panic_at;
        let mut items: Vec<Result<String>> = Vec::with_capacity(self.fragments.len() + 1);
        match &self.fail_after {
            Some((count, message)) => {
                items.extend(self.fragments.iter().take(*count).cloned().map(Ok));
                items.push(Err(BackendError::Model(message.clone())));
            }
            None => items.extend(self.fragments.iter().cloned().map(Ok)),
        }

        let stream = stream::iter(items.into_iter().enumerate()).then(
            move |(index, item)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if panic_at == Some(index) {
                    panic!("scripted backend panicked at fragment {}", index);
                }
                item
            },
        );

        Ok(stream.boxed())
    }

    async fn reset_context(&self) -> Result<()> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
