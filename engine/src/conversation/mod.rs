//! Conversation Store
//!
//! Ordered, role-tagged chat history shared between the session manager, the
//! streaming task, and readers such as the CLI. Every mutation goes through
//! one mutex, so writers are serialized (last writer wins) and readers always
//! see a consistent snapshot.
//!
//! The store tracks two counters:
//! - `epoch` grows on every reset. A generation run remembers the epoch it
//!   started in; flushes carrying an older epoch are discarded.
//! - `revision` grows on every mutation, so observers can cheaply tell
//!   whether anything changed.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::llm::{Message, MessageRole};

/// Default number of messages kept by trimming
pub const DEFAULT_MAX_MESSAGES: usize = 12;

/// Default assistant character budget kept by trimming
pub const DEFAULT_MAX_ASSISTANT_CHARS: usize = 16_000;

/// Bounds applied to the conversation before every generation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimPolicy {
    /// Keep at most this many of the most recent messages
    pub max_messages: usize,

    /// Assistant content budget in characters, counted newest to oldest
    pub max_assistant_chars: usize,
}

impl Default for TrimPolicy {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_assistant_chars: DEFAULT_MAX_ASSISTANT_CHARS,
        }
    }
}

/// Result of committing buffered run output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    /// Text was written into the conversation
    Applied,

    /// The conversation was reset after the run began; text was discarded
    Stale,
}

/// Conversation state guarded by the store
#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<Message>,
    epoch: u64,
    revision: u64,
    next_seq: u64,
}

impl Conversation {
    fn push(&mut self, role: MessageRole, content: String, run_id: Option<u64>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push(Message {
            seq,
            role,
            content,
            run_id,
        });
        self.revision += 1;
        seq
    }

    fn append(&mut self, role: MessageRole, content: String) -> u64 {
        self.push(role, content, None)
    }

    fn reset_with_system(&mut self, prompt: String) {
        self.messages.clear();
        self.epoch += 1;
        self.push(MessageRole::System, prompt, None);
    }

    fn flush_assistant(&mut self, run_id: u64, epoch: u64, text: &str) -> FlushResult {
        if epoch != self.epoch {
            return FlushResult::Stale;
        }

        match self.messages.last_mut() {
            Some(last) if last.role == MessageRole::Assistant && last.run_id == Some(run_id) => {
                last.content.push_str(text);
                self.revision += 1;
            }
            _ => {
                self.push(MessageRole::Assistant, text.to_string(), Some(run_id));
            }
        }

        FlushResult::Applied
    }

    /// Apply the two-stage bound
    ///
    /// 1. Keep the most recent `max_messages` messages.
    /// 2. Walk assistant messages newest to oldest, summing their length in
    ///    characters. At the first message that pushes the sum over
    ///    `max_assistant_chars`, drop everything older than that message.
    ///
    /// User and system messages do not count toward the character budget.
    /// Returns the number of messages removed.
    fn trim(&mut self, policy: &TrimPolicy) -> usize {
        let before = self.messages.len();

        if self.messages.len() > policy.max_messages {
            let excess = self.messages.len() - policy.max_messages;
            self.messages.drain(..excess);
        }

        let mut assistant_chars = 0usize;
        let mut overflow_at = None;
        for (idx, message) in self.messages.iter().enumerate().rev() {
            if message.role != MessageRole::Assistant {
                continue;
            }
            assistant_chars += message.char_len();
            if assistant_chars > policy.max_assistant_chars {
                overflow_at = Some(idx);
                break;
            }
        }
        if let Some(idx) = overflow_at {
            self.messages.drain(..idx);
        }

        let removed = before - self.messages.len();
        if removed > 0 {
            self.revision += 1;
        }
        removed
    }
}

/// Shared handle to one conversation
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    inner: Arc<Mutex<Conversation>>,
}

impl ConversationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Conversation> {
        // A panic while holding the lock cannot leave the Vec half-written,
        // so the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one message and return its sequence number
    pub fn append(&self, role: MessageRole, content: impl Into<String>) -> u64 {
        self.lock().append(role, content.into())
    }

    /// Replace the whole conversation with a single system message
    pub fn reset_with_system(&self, prompt: impl Into<String>) {
        self.lock().reset_with_system(prompt.into());
    }

    /// Commit run output, extending the run's trailing assistant message
    pub fn flush_assistant(&self, run_id: u64, epoch: u64, text: &str) -> FlushResult {
        self.lock().flush_assistant(run_id, epoch, text)
    }

    /// Bound the conversation; returns how many messages were removed
    pub fn trim(&self, policy: &TrimPolicy) -> usize {
        self.lock().trim(policy)
    }

    /// Copy of the messages in chat order
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// Epoch and messages read under one lock
    pub fn snapshot_with_epoch(&self) -> (u64, Vec<Message>) {
        let conversation = self.lock();
        (conversation.epoch, conversation.messages.clone())
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Whether the conversation has no messages
    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Number of resets so far
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(messages: &[(MessageRole, &str)]) -> ConversationStore {
        let store = ConversationStore::new();
        for (role, content) in messages {
            store.append(*role, *content);
        }
        store
    }

    #[test]
    fn test_append_assigns_increasing_seq() {
        let store = ConversationStore::new();
        assert!(store.is_empty());

        let a = store.append(MessageRole::User, "one");
        let b = store.append(MessageRole::User, "two");
        assert!(b > a);
        assert_eq!(store.len(), 2);
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_reset_with_system() {
        let store = store_with(&[(MessageRole::User, "hi"), (MessageRole::Assistant, "hello")]);

        store.reset_with_system("prompt");

        let messages = store.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[0].content, "prompt");
        assert_eq!(store.epoch(), 1);
    }

    #[test]
    fn test_seq_not_reused_after_reset() {
        let store = store_with(&[(MessageRole::User, "a"), (MessageRole::User, "b")]);
        store.reset_with_system("p");
        assert_eq!(store.snapshot()[0].seq, 2);
    }

    #[test]
    fn test_flush_extends_same_run() {
        let store = ConversationStore::new();
        store.reset_with_system("sys");
        let epoch = store.epoch();

        assert_eq!(store.flush_assistant(7, epoch, "Hel"), FlushResult::Applied);
        assert_eq!(store.flush_assistant(7, epoch, "lo"), FlushResult::Applied);

        let messages = store.snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hello");
        assert_eq!(messages[1].run_id, Some(7));
    }

    #[test]
    fn test_flush_after_interleaved_note_starts_new_message() {
        let store = ConversationStore::new();
        store.reset_with_system("sys");
        let epoch = store.epoch();

        store.flush_assistant(1, epoch, "part one");
        store.append(MessageRole::System, "note");
        store.flush_assistant(1, epoch, " part two");

        let messages = store.snapshot();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].content, " part two");
        assert_eq!(messages[3].run_id, Some(1));
    }

    #[test]
    fn test_stale_flush_is_discarded() {
        let store = ConversationStore::new();
        store.reset_with_system("old");
        let epoch = store.epoch();

        store.reset_with_system("new");
        let revision = store.revision();

        assert_eq!(store.flush_assistant(1, epoch, "late"), FlushResult::Stale);
        assert_eq!(store.len(), 1);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_trim_keeps_most_recent_in_order() {
        let store = ConversationStore::new();
        for i in 0..20 {
            store.append(MessageRole::User, format!("m{}", i));
        }

        let removed = store.trim(&TrimPolicy::default());

        assert_eq!(removed, 8);
        let contents: Vec<String> = store.snapshot().into_iter().map(|m| m.content).collect();
        let expected: Vec<String> = (8..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_trim_character_budget() {
        let long = "x".repeat(100);
        let long = long.as_str();
        let store = store_with(&[
            (MessageRole::System, "sys"),
            (MessageRole::Assistant, long),
            (MessageRole::User, "q1"),
            (MessageRole::Assistant, long),
            (MessageRole::User, "q2"),
            (MessageRole::Assistant, long),
        ]);

        let policy = TrimPolicy {
            max_messages: 12,
            max_assistant_chars: 150,
        };
        let removed = store.trim(&policy);

        // The second-newest reply crosses the budget; it stays, older ones go
        let messages = store.snapshot();
        assert_eq!(removed, 3);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "q2");
    }

    #[test]
    fn test_trim_ignores_user_and_system_length() {
        let huge = "y".repeat(1000);
        let huge = huge.as_str();
        let store = store_with(&[
            (MessageRole::System, huge),
            (MessageRole::User, huge),
            (MessageRole::Assistant, "short"),
        ]);

        let policy = TrimPolicy {
            max_messages: 12,
            max_assistant_chars: 10,
        };
        assert_eq!(store.trim(&policy), 0);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_noop_trim_keeps_revision() {
        let store = store_with(&[(MessageRole::User, "a")]);
        let revision = store.revision();

        assert_eq!(store.trim(&TrimPolicy::default()), 0);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let store = ConversationStore::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.append(MessageRole::User, format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let messages = store.snapshot();
        assert_eq!(messages.len(), 400);
        let mut seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
        seqs.dedup();
        assert_eq!(seqs.len(), 400);
    }
}
