use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{atomic::AtomicUsize, Arc},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::{
    dispatcher::MessageDispatcher,
    error::ConsoleError,
    gateway::DeliveryGateway,
    ownership::OwnershipController,
    store::{AgentDirectory, ConversationStore, SettingsSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    InProgress,
    Waiting,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Waiting => "waiting",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = ConsoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "waiting" => Ok(Self::Waiting),
            "closed" => Ok(Self::Closed),
            other => Err(ConsoleError::Validation(format!(
                "unknown conversation status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Inbound,
    Outbound,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ConsoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            "system" => Ok(Self::System),
            other => Err(ConsoleError::Validation(format!(
                "unknown message kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = ConsoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "error" => Ok(Self::Error),
            other => Err(ConsoleError::Validation(format!(
                "unknown delivery status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Marketing,
    Sales,
    Support,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Marketing => "marketing",
            Self::Sales => "sales",
            Self::Support => "support",
        }
    }
}

impl FromStr for Role {
    type Err = ConsoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "marketing" => Ok(Self::Marketing),
            "sales" => Ok(Self::Sales),
            "support" => Ok(Self::Support),
            other => Err(ConsoleError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }

    /// Only admins may override another agent's claim.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub customer_name: String,
    pub customer_address: String,
    pub status: ConversationStatus,
    pub owner_id: Option<String>,
    pub tag_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn apply_patch(&mut self, patch: &ConversationPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(owner_id) = &patch.owner_id {
            self.owner_id = owner_id.clone();
        }
        if let Some(tag_id) = &patch.tag_id {
            self.tag_id = tag_id.clone();
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub customer_name: String,
    pub customer_address: String,
    pub tag_id: Option<String>,
}

/// Partial update of a conversation. `None` leaves a field untouched; for the
/// nullable columns `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPatch {
    pub status: Option<ConversationStatus>,
    pub owner_id: Option<Option<String>>,
    pub tag_id: Option<Option<String>>,
}

impl ConversationPatch {
    pub fn assign_owner(agent_id: &str) -> Self {
        Self {
            status: Some(ConversationStatus::InProgress),
            owner_id: Some(Some(agent_id.to_string())),
            tag_id: None,
        }
    }

    pub fn release() -> Self {
        Self {
            status: Some(ConversationStatus::Open),
            owner_id: Some(None),
            tag_id: None,
        }
    }

    pub fn status(status: ConversationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn tag(tag_id: Option<String>) -> Self {
        Self {
            tag_id: Some(tag_id),
            ..Self::default()
        }
    }

    /// Setting an owner without a status moves the conversation to in_progress.
    pub fn normalized(mut self) -> Self {
        if matches!(self.owner_id, Some(Some(_))) && self.status.is_none() {
            self.status = Some(ConversationStatus::InProgress);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub sender_id: Option<String>,
    #[serde(default)]
    pub delivery_status: Option<DeliveryStatus>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Outbound messages stored before delivery tracking existed read as sent.
    /// Inbound and system messages have no delivery status at all.
    pub fn effective_delivery_status(&self) -> Option<DeliveryStatus> {
        match self.kind {
            MessageKind::Outbound => Some(self.delivery_status.unwrap_or(DeliveryStatus::Sent)),
            MessageKind::Inbound | MessageKind::System => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub sender_id: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
}

impl NewMessage {
    pub fn outbound(conversation_id: &str, sender_id: &str, body: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            body: body.to_string(),
            kind: MessageKind::Outbound,
            sender_id: Some(sender_id.to_string()),
            delivery_status: Some(DeliveryStatus::Pending),
        }
    }

    pub fn system(conversation_id: &str, body: String) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            body,
            kind: MessageKind::System,
            sender_id: None,
            delivery_status: None,
        }
    }

    pub fn inbound(conversation_id: &str, body: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            body: body.to_string(),
            kind: MessageKind::Inbound,
            sender_id: None,
            delivery_status: None,
        }
    }

    pub fn stored_delivery_status(&self) -> Option<DeliveryStatus> {
        match self.kind {
            MessageKind::Outbound => self.delivery_status,
            MessageKind::Inbound | MessageKind::System => None,
        }
    }

    pub fn into_message(self, id: String, created_at: DateTime<Utc>) -> Message {
        let delivery_status = self.stored_delivery_status();
        Message {
            id,
            conversation_id: self.conversation_id,
            body: self.body,
            kind: self.kind,
            sender_id: self.sender_id,
            delivery_status,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub delivery_status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub webhook_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "newRecord", rename_all = "snake_case")]
pub enum ChangeRecord {
    Conversation(Conversation),
    Message(Message),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    #[serde(flatten)]
    pub record: ChangeRecord,
}

impl ChangeEvent {
    pub fn conversation(operation: ChangeOperation, conversation: Conversation) -> Self {
        Self {
            operation,
            record: ChangeRecord::Conversation(conversation),
        }
    }

    pub fn message(operation: ChangeOperation, message: Message) -> Self {
        Self {
            operation,
            record: ChangeRecord::Message(message),
        }
    }
}

/// A client's live projector task for one conversation.
pub struct ConversationWatch {
    pub conversation_id: String,
    /// Final message states the sender already knows, applied ahead of the
    /// change notification.
    pub local: mpsc::UnboundedSender<Message>,
    pub task: JoinHandle<()>,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub agent_by_client: HashMap<usize, Agent>,
    pub list_tasks: HashMap<usize, JoinHandle<()>>,
    pub watches: HashMap<usize, ConversationWatch>,
}

pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub agents: Arc<dyn AgentDirectory>,
    pub settings: Arc<dyn SettingsSource>,
    pub gateway: Arc<dyn DeliveryGateway>,
    pub ownership: OwnershipController,
    pub dispatcher: MessageDispatcher,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    pub customer_name: String,
    pub customer_address: String,
    #[serde(default)]
    pub tag_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagBody {
    #[serde(default)]
    pub tag_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsBody {
    #[serde(default)]
    pub webhook_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestWebhookBody {
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
