use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    feed::{ChangeFeed, Subscription, SubscriptionScope},
    normalize_endpoint, AgentDirectory, ConversationStore, SettingsSource,
};
use crate::{
    error::ConsoleError,
    types::{
        Agent, ChangeEvent, ChangeOperation, Conversation, ConversationPatch, ConversationStatus,
        Message, MessagePatch, NewConversation, NewMessage, Settings,
    },
};

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, Conversation>,
    /// Insertion order; `list_messages` sorts stably on `created_at`.
    messages: Vec<Message>,
    agents: HashMap<String, Agent>,
    settings: Settings,
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            tables: RwLock::new(Tables {
                settings,
                ..Tables::default()
            }),
            feed: ChangeFeed::new(),
        }
    }

    pub async fn add_agent(&self, agent: Agent) {
        let mut tables = self.tables.write().await;
        tables.agents.insert(agent.id.clone(), agent);
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, ConsoleError> {
        let tables = self.tables.read().await;
        Ok(tables.conversations.get(id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ConsoleError> {
        let tables = self.tables.read().await;
        let mut list = tables.conversations.values().cloned().collect::<Vec<_>>();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn insert_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, ConsoleError> {
        let now = Utc::now();
        let record = Conversation {
            id: Uuid::new_v4().to_string(),
            customer_name: conversation.customer_name,
            customer_address: conversation.customer_address,
            status: ConversationStatus::Open,
            owner_id: None,
            tag_id: conversation.tag_id,
            created_at: now,
            updated_at: now,
        };
        let mut tables = self.tables.write().await;
        tables
            .conversations
            .insert(record.id.clone(), record.clone());
        self.feed.publish(ChangeEvent::conversation(
            ChangeOperation::Insert,
            record.clone(),
        ));
        debug!(conversation_id = %record.id, "conversation inserted");
        Ok(record)
    }

    async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation, ConsoleError> {
        let patch = patch.normalized();
        let mut tables = self.tables.write().await;
        let record = tables
            .conversations
            .get_mut(id)
            .ok_or_else(|| ConsoleError::not_found("conversation", id))?;
        record.apply_patch(&patch, Utc::now());
        let snapshot = record.clone();
        self.feed.publish(ChangeEvent::conversation(
            ChangeOperation::Update,
            snapshot.clone(),
        ));
        Ok(snapshot)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ConsoleError> {
        let tables = self.tables.read().await;
        let mut list = tables
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, ConsoleError> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(ConsoleError::not_found(
                "conversation",
                &message.conversation_id,
            ));
        }
        let last = tables
            .messages
            .iter()
            .filter(|existing| existing.conversation_id == message.conversation_id)
            .map(|existing| existing.created_at)
            .max();
        let now = Utc::now();
        let created_at = match last {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        let record = message.into_message(Uuid::new_v4().to_string(), created_at);
        tables.messages.push(record.clone());
        self.feed
            .publish(ChangeEvent::message(ChangeOperation::Insert, record.clone()));
        Ok(record)
    }

    async fn update_message(
        &self,
        id: &str,
        patch: MessagePatch,
    ) -> Result<Message, ConsoleError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .messages
            .iter_mut()
            .find(|message| message.id == id)
            .ok_or_else(|| ConsoleError::not_found("message", id))?;
        if let Some(status) = patch.delivery_status {
            record.delivery_status = Some(status);
        }
        let snapshot = record.clone();
        self.feed
            .publish(ChangeEvent::message(ChangeOperation::Update, snapshot.clone()));
        Ok(snapshot)
    }

    fn subscribe(&self, scope: SubscriptionScope) -> Subscription {
        self.feed.subscribe(scope)
    }
}

#[async_trait]
impl AgentDirectory for MemoryStore {
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, ConsoleError> {
        let tables = self.tables.read().await;
        Ok(tables.agents.get(id).cloned())
    }
}

#[async_trait]
impl SettingsSource for MemoryStore {
    async fn settings(&self) -> Result<Settings, ConsoleError> {
        let tables = self.tables.read().await;
        Ok(tables.settings.clone())
    }

    async fn set_webhook_endpoint(
        &self,
        endpoint: Option<String>,
    ) -> Result<Settings, ConsoleError> {
        let mut tables = self.tables.write().await;
        tables.settings.webhook_endpoint = normalize_endpoint(endpoint);
        Ok(tables.settings.clone())
    }
}
