use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::Mutex;
use tracing::info;

use crate::session::conversation::Conversation;

/// A conversation behind its own lock; one writer at a time.
pub type ConversationHandle = Arc<Mutex<Conversation>>;

pub type ConversationStore = Arc<dyn ConversationStoreType>;

/// Keeps every conversation, finished ones included, and the binding from
/// (channel, client) to the open conversation of that client.
#[async_trait]
pub trait ConversationStoreType: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Option<ConversationHandle>;

    /// The open conversation of this client on this channel, if any.
    async fn find_open(&self, channel_id: &str, client_id: &str) -> Option<ConversationHandle>;

    /// Open conversation of the client, or a new one running `flow_version`
    /// of `flow_id`. The bool is true when the conversation was created by
    /// this call.
    async fn get_or_create(
        &self,
        channel_id: &str,
        client_id: &str,
        flow_id: &str,
        flow_version: u32,
    ) -> (ConversationHandle, bool);

    /// Drop the client binding so the next message starts a new conversation.
    async fn release(&self, channel_id: &str, client_id: &str, conversation_id: &str);

    async fn all(&self) -> Vec<ConversationHandle>;
}

fn client_key(channel_id: &str, client_id: &str) -> String {
    format!("{}|{}", channel_id, client_id)
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<String, ConversationHandle>,
    // channel|client → conversation id
    by_client: DashMap<String, String>,
}

impl InMemoryConversationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ConversationStoreType for InMemoryConversationStore {
    async fn get(&self, conversation_id: &str) -> Option<ConversationHandle> {
        self.conversations.get(conversation_id).map(|c| c.clone())
    }

    async fn find_open(&self, channel_id: &str, client_id: &str) -> Option<ConversationHandle> {
        let id = self.by_client.get(&client_key(channel_id, client_id))?.clone();
        self.get(&id).await
    }

    async fn get_or_create(
        &self,
        channel_id: &str,
        client_id: &str,
        flow_id: &str,
        flow_version: u32,
    ) -> (ConversationHandle, bool) {
        // the entry guard makes lookup-or-insert atomic per client
        match self.by_client.entry(client_key(channel_id, client_id)) {
            Entry::Occupied(mut existing) => {
                if let Some(handle) = self.conversations.get(existing.get()) {
                    return (handle.clone(), false);
                }
                let conversation = Conversation::new(channel_id, client_id, flow_id, flow_version);
                let id = conversation.id.clone();
                let handle = Arc::new(Mutex::new(conversation));
                self.conversations.insert(id.clone(), handle.clone());
                *existing.get_mut() = id;
                (handle, true)
            }
            Entry::Vacant(slot) => {
                let conversation = Conversation::new(channel_id, client_id, flow_id, flow_version);
                let id = conversation.id.clone();
                info!(conversation = %id, channel = channel_id, client = client_id, "New conversation");
                let handle = Arc::new(Mutex::new(conversation));
                self.conversations.insert(id.clone(), handle.clone());
                slot.insert(id);
                (handle, true)
            }
        }
    }

    async fn release(&self, channel_id: &str, client_id: &str, conversation_id: &str) {
        self.by_client
            .remove_if(&client_key(channel_id, client_id), |_, id| id == conversation_id);
    }

    async fn all(&self) -> Vec<ConversationHandle> {
        self.conversations.iter().map(|c| c.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_reuses_open_conversation() {
        let store = InMemoryConversationStore::new();
        let (first, created) = store.get_or_create("web", "c1", "support", 1).await;
        assert!(created);
        let (second, created) = store.get_or_create("web", "c1", "support", 1).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));

        let (other, created) = store.get_or_create("whatsapp", "c1", "support", 1).await;
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn release_keeps_history_but_frees_the_client() {
        let store = InMemoryConversationStore::new();
        let (handle, _) = store.get_or_create("web", "c1", "support", 1).await;
        let id = handle.lock().await.id.clone();

        store.release("web", "c1", &id).await;
        assert!(store.find_open("web", "c1").await.is_none());
        assert!(store.get(&id).await.is_some());

        let (next, created) = store.get_or_create("web", "c1", "support", 1).await;
        assert!(created);
        assert_ne!(next.lock().await.id, id);
        assert_eq!(store.all().await.len(), 2);
    }

    #[tokio::test]
    async fn stale_release_does_not_unbind_newer_conversation() {
        let store = InMemoryConversationStore::new();
        let (handle, _) = store.get_or_create("web", "c1", "support", 1).await;
        let newest = handle.lock().await.id.clone();

        store.release("web", "c1", "some-older-id").await;
        let open = store.find_open("web", "c1").await.unwrap();
        assert_eq!(open.lock().await.id, newest);
    }
}
