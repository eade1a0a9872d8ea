//! Per-client view of one conversation, kept live from change notifications.
//!
//! The projector has no authority over ownership. It folds committed store
//! events into a snapshot and derives what the local agent may do with it.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::ConsoleError,
    ownership::{can_claim, is_observer, is_owner, parse_access_request},
    store::{AgentDirectory, ConversationStore, FeedItem, Subscription, SubscriptionScope},
    types::{Agent, ChangeEvent, ChangeRecord, Conversation, Message, MessageKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    /// Nobody owns the conversation; the agent may claim it or answer directly.
    Unclaimed,
    /// The local agent owns it.
    Active,
    /// Someone else owns it; read-only.
    Observer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub conversation_id: String,
    pub mode: ViewMode,
    pub is_owner: bool,
    pub is_observer: bool,
    pub can_claim: bool,
    pub can_send: bool,
    pub can_force_claim: bool,
    pub owner_name: Option<String>,
    pub banner: Option<String>,
}

/// Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LocalNotice {
    AccessRequested {
        conversation_id: String,
        requester_name: String,
    },
}

pub struct PresenceProjector {
    agent: Agent,
    directory: Arc<dyn AgentDirectory>,
    conversation: Conversation,
    messages: Vec<Message>,
    owner_name: Option<String>,
}

impl PresenceProjector {
    /// Loads the snapshot and subscribes before reading so no event is missed.
    pub async fn open(
        store: &dyn ConversationStore,
        directory: Arc<dyn AgentDirectory>,
        agent: Agent,
        conversation_id: &str,
    ) -> Result<(Self, Subscription), ConsoleError> {
        let subscription =
            store.subscribe(SubscriptionScope::Conversation(conversation_id.to_string()));
        let conversation = store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ConsoleError::not_found("conversation", conversation_id))?;
        let messages = store.list_messages(conversation_id).await?;

        let mut projector = Self {
            agent,
            directory,
            conversation,
            messages,
            owner_name: None,
        };
        projector.refresh_owner_name().await;
        Ok((projector, subscription))
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Folds one change event. Returns a notice when an access request is
    /// addressed to the local agent as current owner.
    pub async fn apply(&mut self, event: &ChangeEvent) -> Option<LocalNotice> {
        match &event.record {
            ChangeRecord::Conversation(conversation) => {
                if conversation.id != self.conversation.id {
                    return None;
                }
                let owner_changed = conversation.owner_id != self.conversation.owner_id;
                self.conversation = conversation.clone();
                if owner_changed {
                    debug!(
                        conversation_id = %conversation.id,
                        owner_id = conversation.owner_id.as_deref().unwrap_or("none"),
                        "owner changed"
                    );
                    self.refresh_owner_name().await;
                }
                None
            }
            ChangeRecord::Message(message) => {
                if message.conversation_id != self.conversation.id {
                    return None;
                }
                let is_new = self.upsert_message(message.clone());
                if !is_new || message.kind != MessageKind::System {
                    return None;
                }
                if !is_owner(&self.conversation, &self.agent.id) {
                    return None;
                }
                parse_access_request(&message.body).map(|requester_name| {
                    LocalNotice::AccessRequested {
                        conversation_id: self.conversation.id.clone(),
                        requester_name,
                    }
                })
            }
        }
    }

    /// Folds one subscription step. A lag marker means events were dropped, so
    /// the snapshot is re-read from the store. Returns whether it resynced,
    /// plus any notice raised by the event.
    pub async fn apply_item(
        &mut self,
        store: &dyn ConversationStore,
        item: &FeedItem,
    ) -> Result<(bool, Option<LocalNotice>), ConsoleError> {
        match item {
            FeedItem::Change(event) => Ok((false, self.apply(event).await)),
            FeedItem::Lagged(_) => {
                self.resync(store).await?;
                Ok((true, None))
            }
        }
    }

    /// Replaces the cached snapshot with the store's current state.
    pub async fn resync(&mut self, store: &dyn ConversationStore) -> Result<(), ConsoleError> {
        let conversation = store
            .get_conversation(&self.conversation.id)
            .await?
            .ok_or_else(|| ConsoleError::not_found("conversation", &self.conversation.id))?;
        self.messages = store.list_messages(&conversation.id).await?;
        self.conversation = conversation;
        debug!(conversation_id = %self.conversation.id, "projector resynced from store");
        self.refresh_owner_name().await;
        Ok(())
    }

    /// Applies the sender's own final message state without waiting for the
    /// notification round-trip.
    pub fn apply_local(&mut self, message: Message) {
        if message.conversation_id == self.conversation.id {
            self.upsert_message(message);
        }
    }

    pub fn view(&self) -> ViewState {
        let agent_id = self.agent.id.as_str();
        let owner = is_owner(&self.conversation, agent_id);
        let observer = is_observer(&self.conversation, agent_id);
        let mode = if owner {
            ViewMode::Active
        } else if observer {
            ViewMode::Observer
        } else {
            ViewMode::Unclaimed
        };
        let banner = observer.then(|| {
            let name = self.owner_name.as_deref().unwrap_or("Another agent");
            format!("{name} is handling this conversation")
        });

        ViewState {
            conversation_id: self.conversation.id.clone(),
            mode,
            is_owner: owner,
            is_observer: observer,
            can_claim: can_claim(&self.conversation),
            can_send: !observer,
            can_force_claim: observer && self.agent.is_admin(),
            owner_name: self.owner_name.clone(),
            banner,
        }
    }

    /// Returns `true` if the message was not known yet.
    fn upsert_message(&mut self, message: Message) -> bool {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
            return false;
        }
        let position = self
            .messages
            .iter()
            .rposition(|m| m.created_at <= message.created_at)
            .map(|index| index + 1)
            .unwrap_or(0);
        self.messages.insert(position, message);
        true
    }

    async fn refresh_owner_name(&mut self) {
        self.owner_name = match self.conversation.owner_id.as_deref() {
            None => None,
            Some(owner) if owner == self.agent.id => None,
            Some(owner) => match self.directory.get_agent(owner).await {
                Ok(agent) => agent.map(|agent| agent.name),
                Err(err) => {
                    warn!(owner_id = owner, error = %err, "failed to resolve owner name");
                    None
                }
            },
        };
    }
}
