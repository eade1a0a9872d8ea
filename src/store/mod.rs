//! Conversation store contract and its backends.
//!
//! The store is the single source of truth shared by every agent. Writes are
//! plain partial updates (no concurrency token); every committed write is
//! published on the [`ChangeFeed`] so connected clients converge on the
//! latest snapshot.

mod feed;
mod memory;
mod postgres;

use async_trait::async_trait;

use crate::{
    error::ConsoleError,
    types::{
        Agent, Conversation, ConversationPatch, Message, MessagePatch, NewConversation,
        NewMessage, Settings,
    },
};

pub use feed::{ChangeFeed, FeedItem, Subscription, SubscriptionScope};
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, ConsoleError>;

    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ConsoleError>;

    async fn insert_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, ConsoleError>;

    /// Unconditional partial update. Returns the committed snapshot.
    async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation, ConsoleError>;

    /// Messages of one conversation ordered by `created_at`, ties by insertion order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ConsoleError>;

    /// Assigns the id and a `created_at` strictly after the conversation's last message.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, ConsoleError>;

    async fn update_message(&self, id: &str, patch: MessagePatch)
        -> Result<Message, ConsoleError>;

    fn subscribe(&self, scope: SubscriptionScope) -> Subscription;
}

/// Agent identities are owned elsewhere; the core only looks them up.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, ConsoleError>;
}

/// Process-wide settings record. Read on demand, never cached by callers.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn settings(&self) -> Result<Settings, ConsoleError>;

    async fn set_webhook_endpoint(&self, endpoint: Option<String>)
        -> Result<Settings, ConsoleError>;
}

/// Blank endpoints count as "not configured".
pub fn normalize_endpoint(endpoint: Option<String>) -> Option<String> {
    endpoint
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
