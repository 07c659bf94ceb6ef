use std::collections::HashSet;
use std::sync::Arc;

use breeze_llm::{EngineMessage, Role};
use breeze_storage::{MessageId, PersistentStore, PersistentStoreExt};

use crate::message::ChatMessage;

/// Store key of the persisted transcript array.
pub const MESSAGES_KEY: &str = "messages";

/// Ordered chat transcript, written through to a [`PersistentStore`] after every mutation.
///
/// Persistence failures never reach the caller: the in-memory transcript stays
/// authoritative and [`TranscriptStore::last_persist_succeeded`] reports the last outcome.
pub struct TranscriptStore {
    store: Arc<dyn PersistentStore>,
    messages: Vec<ChatMessage>,
    last_persist_ok: bool,
}

impl TranscriptStore {
    /// Loads the persisted transcript, starting empty when nothing usable is stored.
    pub fn open(store: Arc<dyn PersistentStore>) -> Self {
        let stored: Vec<ChatMessage> = store.load_json(MESSAGES_KEY, Vec::new());

        let mut seen = HashSet::with_capacity(stored.len());
        let mut messages = Vec::with_capacity(stored.len());
        for message in stored {
            if seen.insert(message.id) {
                messages.push(message);
            } else {
                tracing::warn!(message_id = %message.id, "dropping duplicate persisted message");
            }
        }

        tracing::debug!(
            namespace = %store.namespace(),
            message_count = messages.len(),
            "transcript restored"
        );

        Self {
            store,
            messages,
            last_persist_ok: true,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_persist_succeeded(&self) -> bool {
        self.last_persist_ok
    }

    pub fn find_by_id(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Appends a message with a fresh id and returns that id.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> MessageId {
        let message = ChatMessage::new(role, content);
        let id = message.id;
        self.messages.push(message);
        self.persist();
        id
    }

    /// Replaces the content of `id`. Returns false when no such message exists.
    pub fn update_content(&mut self, id: MessageId, content: impl Into<String>) -> bool {
        let Some(message) = self.find_mut(id) else {
            return false;
        };
        message.content = content.into();
        self.persist();
        true
    }

    /// Appends streamed text to the content of `id`.
    pub fn append_content(&mut self, id: MessageId, delta: &str) -> bool {
        let Some(message) = self.find_mut(id) else {
            return false;
        };
        message.content.push_str(delta);
        self.persist();
        true
    }

    /// Splits reasoning out of assistant message `id`.
    ///
    /// Returns true when the message changed. Running it again is a no-op.
    pub fn post_process(&mut self, id: MessageId) -> bool {
        let changed = self
            .find_mut(id)
            .is_some_and(|message| message.split_reasoning());
        if changed {
            self.persist();
        }
        changed
    }

    /// Post-processes every assistant message that still carries unsplit reasoning.
    ///
    /// Persists once, and only when something changed. Returns the number of messages split.
    pub fn split_think_in_all(&mut self) -> usize {
        let mut split = 0;
        for message in &mut self.messages {
            if message.needs_reasoning_split() && message.split_reasoning() {
                split += 1;
            }
        }

        if split > 0 {
            tracing::info!(message_count = split, "split reasoning out of stored replies");
            self.persist();
        }
        split
    }

    /// Transcript in engine form, in order.
    pub fn history(&self) -> Vec<EngineMessage> {
        self.messages
            .iter()
            .map(ChatMessage::to_engine_message)
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.persist();
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn persist(&mut self) {
        self.last_persist_ok = self.store.save_json(MESSAGES_KEY, &self.messages);
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use breeze_storage::{DEFAULT_NAMESPACE, MemoryStore, StorageError, StorageResult};
    use serde_json::{Value, json};

    use super::*;

    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl PersistentStore for ReadOnlyStore {
        fn namespace(&self) -> &str {
            self.inner.namespace()
        }

        fn write(&self, key: &str, _value: &Value) -> StorageResult<()> {
            Err(StorageError::WriteFile {
                stage: "test-write",
                path: key.into(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
            })
        }

        fn read(&self, key: &str) -> StorageResult<Option<Value>> {
            self.inner.read(key)
        }
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(DEFAULT_NAMESPACE))
    }

    #[test]
    fn mutations_survive_a_reopen() {
        let store = memory_store();
        let mut transcript = TranscriptStore::open(store.clone());

        let user_id = transcript.add_message(Role::User, "Hi");
        let reply_id = transcript.add_message(Role::Assistant, "");
        assert!(transcript.append_content(reply_id, "<think>greet</think>"));
        assert!(transcript.append_content(reply_id, "Hello!"));
        assert!(transcript.post_process(reply_id));

        let reopened = TranscriptStore::open(store);

        assert_eq!(reopened.messages(), transcript.messages());
        assert_eq!(reopened.find_by_id(user_id).map(|m| m.content.as_str()), Some("Hi"));
        let reply = reopened.find_by_id(reply_id).expect("reply should persist");
        assert_eq!(reply.content, "Hello!");
        assert_eq!(reply.think.as_deref(), Some("greet"));
    }

    #[test]
    fn persisted_array_uses_flat_message_objects() {
        let store = memory_store();
        let mut transcript = TranscriptStore::open(store.clone());
        let id = transcript.add_message(Role::User, "Hi");

        let raw = store.load(MESSAGES_KEY, Value::Null);

        assert_eq!(raw, json!([{"id": id.to_string(), "role": "user", "content": "Hi"}]));
    }

    #[test]
    fn post_process_is_idempotent() {
        let mut transcript = TranscriptStore::open(memory_store());
        let id = transcript.add_message(Role::Assistant, "<think>reasoning here</think>Hello!");

        assert!(transcript.post_process(id));
        let once = transcript.messages().to_vec();
        assert!(!transcript.post_process(id));

        assert_eq!(transcript.messages(), once.as_slice());
        let message = transcript.find_by_id(id).expect("message exists");
        assert_eq!(message.content, "Hello!");
        assert_eq!(message.think.as_deref(), Some("reasoning here"));
    }

    #[test]
    fn unterminated_reasoning_is_not_post_processed() {
        let mut transcript = TranscriptStore::open(memory_store());
        let id = transcript.add_message(Role::Assistant, "<think>partial reasoning cut by stop");

        assert!(!transcript.post_process(id));
        assert_eq!(transcript.split_think_in_all(), 0);

        let message = transcript.find_by_id(id).expect("message exists");
        assert_eq!(message.content, "<think>partial reasoning cut by stop");
        assert_eq!(message.think, None);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut transcript = TranscriptStore::open(memory_store());
        let missing = MessageId::new_v7();

        assert!(!transcript.update_content(missing, "x"));
        assert!(!transcript.append_content(missing, "x"));
        assert!(!transcript.post_process(missing));
        assert!(transcript.find_by_id(missing).is_none());
    }

    #[test]
    fn bulk_split_only_touches_unsplit_assistant_replies() {
        let store = memory_store();
        let user = ChatMessage::new(Role::User, "<think>not mine</think>question");
        let reply = ChatMessage::new(Role::Assistant, "<THINK>plan</THINK>Answer");
        let mut done = ChatMessage::new(Role::Assistant, "<think>x</think>Kept");
        done.think = Some("earlier".to_string());
        let plain = ChatMessage::new(Role::Assistant, "No reasoning");
        assert!(store.save_json(MESSAGES_KEY, &vec![user.clone(), reply.clone(), done.clone(), plain.clone()]));

        let mut transcript = TranscriptStore::open(store);

        assert_eq!(transcript.split_think_in_all(), 1);
        assert_eq!(transcript.split_think_in_all(), 0);
        let messages = transcript.messages();
        assert_eq!(messages[0], user);
        assert_eq!(messages[1].content, "Answer");
        assert_eq!(messages[1].think.as_deref(), Some("plan"));
        assert_eq!(messages[2], done);
        assert_eq!(messages[3], plain);
    }

    #[test]
    fn duplicate_ids_are_dropped_on_open() {
        let store = memory_store();
        let first = ChatMessage::new(Role::User, "first");
        let mut copy = ChatMessage::new(Role::Assistant, "copy");
        copy.id = first.id;
        assert!(store.save_json(MESSAGES_KEY, &vec![first.clone(), copy]));

        let transcript = TranscriptStore::open(store);

        assert_eq!(transcript.messages(), &[first]);
    }

    #[test]
    fn write_failures_keep_the_in_memory_transcript() {
        let store = Arc::new(ReadOnlyStore {
            inner: MemoryStore::new(DEFAULT_NAMESPACE),
        });
        let mut transcript = TranscriptStore::open(store);

        let id = transcript.add_message(Role::User, "Hi");

        assert!(!transcript.last_persist_succeeded());
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.find_by_id(id).map(|m| m.content.as_str()), Some("Hi"));
    }

    #[test]
    fn history_follows_transcript_order() {
        let mut transcript = TranscriptStore::open(memory_store());
        transcript.add_message(Role::User, "Hi");
        transcript.add_message(Role::Assistant, "Hello!");

        assert_eq!(
            transcript.history(),
            vec![EngineMessage::user("Hi"), EngineMessage::assistant("Hello!")]
        );
    }

    #[test]
    fn clear_persists_an_empty_transcript() {
        let store = memory_store();
        let mut transcript = TranscriptStore::open(store.clone());
        transcript.add_message(Role::User, "Hi");

        transcript.clear();

        assert!(transcript.is_empty());
        assert!(TranscriptStore::open(store).is_empty());
    }
}
