//! Conversation ownership: claim, release, forced takeover and access requests.
//!
//! Every operation re-checks the caller against the stored conversation before
//! writing. The write itself is an unconditional partial update, so two claims
//! racing on an unclaimed conversation resolve last-write-wins at the store and
//! both clients converge through the next change notification.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info};

use crate::{
    error::ConsoleError,
    store::ConversationStore,
    types::{Agent, Conversation, ConversationPatch, ConversationStatus, Message, NewMessage},
};

pub fn is_owner(conversation: &Conversation, agent_id: &str) -> bool {
    conversation.owner_id.as_deref() == Some(agent_id)
}

/// Owned by someone else: read-only for this agent.
pub fn is_observer(conversation: &Conversation, agent_id: &str) -> bool {
    matches!(conversation.owner_id.as_deref(), Some(owner) if owner != agent_id)
}

pub fn can_claim(conversation: &Conversation) -> bool {
    conversation.owner_id.is_none()
}

pub fn access_request_body(requester_name: &str) -> String {
    format!("{requester_name} requested access to this conversation")
}

pub fn force_claim_body(admin_name: &str) -> String {
    format!("{admin_name} took over this conversation")
}

static ACCESS_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>.+?) requested access to this conversation$").expect("hardcoded regex")
});

/// Returns the requester's name when `body` is an access-request notice.
pub fn parse_access_request(body: &str) -> Option<String> {
    ACCESS_REQUEST
        .captures(body.trim())
        .and_then(|caps| caps.name("name"))
        .map(|name| name.as_str().to_string())
}

#[derive(Clone)]
pub struct OwnershipController {
    store: Arc<dyn ConversationStore>,
}

impl OwnershipController {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation, ConsoleError> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ConsoleError::not_found("conversation", conversation_id))
    }

    /// Claims an unclaimed conversation. Claiming one already owned by the
    /// caller is a no-op.
    pub async fn claim(
        &self,
        conversation_id: &str,
        agent: &Agent,
    ) -> Result<Conversation, ConsoleError> {
        let conversation = self.load(conversation_id).await?;
        if is_owner(&conversation, &agent.id) {
            debug!(conversation_id, agent_id = %agent.id, "claim by current owner ignored");
            return Ok(conversation);
        }
        if is_observer(&conversation, &agent.id) {
            return Err(ConsoleError::Forbidden(
                "conversation is already claimed by another agent".to_string(),
            ));
        }

        let updated = self
            .store
            .update_conversation(conversation_id, ConversationPatch::assign_owner(&agent.id))
            .await?;
        info!(conversation_id, agent_id = %agent.id, "conversation claimed");
        Ok(updated)
    }

    pub async fn release(
        &self,
        conversation_id: &str,
        agent: &Agent,
    ) -> Result<Conversation, ConsoleError> {
        let conversation = self.load(conversation_id).await?;
        if !is_owner(&conversation, &agent.id) {
            return Err(ConsoleError::Forbidden(
                "only the current owner can release a conversation".to_string(),
            ));
        }

        let updated = self
            .store
            .update_conversation(conversation_id, ConversationPatch::release())
            .await?;
        info!(conversation_id, agent_id = %agent.id, "conversation released");
        Ok(updated)
    }

    /// Leaves a system message for the current owner. Ownership is untouched.
    pub async fn request_access(
        &self,
        conversation_id: &str,
        requester: &Agent,
    ) -> Result<Message, ConsoleError> {
        let conversation = self.load(conversation_id).await?;
        if can_claim(&conversation) {
            return Err(ConsoleError::Validation(
                "conversation is unclaimed; claim it instead".to_string(),
            ));
        }
        if is_owner(&conversation, &requester.id) {
            return Err(ConsoleError::Validation(
                "you already own this conversation".to_string(),
            ));
        }

        let message = self
            .store
            .insert_message(NewMessage::system(
                conversation_id,
                access_request_body(&requester.name),
            ))
            .await?;
        info!(conversation_id, requester_id = %requester.id, "access requested");
        Ok(message)
    }

    /// Admin-only takeover. The audit message is written before the owner changes.
    pub async fn force_claim(
        &self,
        conversation_id: &str,
        admin: &Agent,
    ) -> Result<Conversation, ConsoleError> {
        if !admin.is_admin() {
            return Err(ConsoleError::Forbidden(
                "only admins can take over a conversation".to_string(),
            ));
        }
        let previous = self.load(conversation_id).await?;

        self.store
            .insert_message(NewMessage::system(
                conversation_id,
                force_claim_body(&admin.name),
            ))
            .await?;
        let updated = self
            .store
            .update_conversation(conversation_id, ConversationPatch::assign_owner(&admin.id))
            .await?;
        info!(
            conversation_id,
            admin_id = %admin.id,
            previous_owner = previous.owner_id.as_deref().unwrap_or("none"),
            "conversation taken over"
        );
        Ok(updated)
    }

    /// Triage edit; independent of ownership.
    pub async fn set_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, ConsoleError> {
        let updated = self
            .store
            .update_conversation(conversation_id, ConversationPatch::status(status))
            .await?;
        debug!(conversation_id, status = %status, "status changed");
        Ok(updated)
    }

    pub async fn set_tag(
        &self,
        conversation_id: &str,
        tag_id: Option<String>,
    ) -> Result<Conversation, ConsoleError> {
        let tag_id = tag_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self.store
            .update_conversation(conversation_id, ConversationPatch::tag(tag_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FeedItem, MemoryStore, SubscriptionScope};
    use crate::types::{ChangeRecord, MessageKind, NewConversation, Role};

    fn agent(id: &str, role: Role) -> Agent {
        Agent::new(id, format!("Agent {id}"), role)
    }

    async fn setup() -> (Arc<MemoryStore>, OwnershipController, Conversation) {
        let store = Arc::new(MemoryStore::new());
        let conversation = store
            .insert_conversation(NewConversation {
                customer_name: "Maria".to_string(),
                customer_address: "+5511999990000".to_string(),
                tag_id: None,
            })
            .await
            .unwrap();
        let controller = OwnershipController::new(store.clone());
        (store, controller, conversation)
    }

    #[test]
    fn view_predicates() {
        let mut conversation = Conversation {
            id: "c1".to_string(),
            customer_name: "Maria".to_string(),
            customer_address: "+55".to_string(),
            status: ConversationStatus::Open,
            owner_id: None,
            tag_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(can_claim(&conversation));
        assert!(!is_observer(&conversation, "a1"));

        conversation.owner_id = Some("a1".to_string());
        assert!(is_owner(&conversation, "a1"));
        assert!(!is_observer(&conversation, "a1"));
        assert!(is_observer(&conversation, "a2"));
        assert!(!can_claim(&conversation));
    }

    #[test]
    fn access_request_round_trips_through_the_body() {
        let body = access_request_body("Carla Dias");
        assert_eq!(parse_access_request(&body).as_deref(), Some("Carla Dias"));
        assert_eq!(parse_access_request(&force_claim_body("Admin")), None);
        assert_eq!(parse_access_request("hello"), None);
    }

    #[tokio::test]
    async fn claim_sets_owner_and_in_progress() {
        let (_store, controller, conversation) = setup().await;
        let alice = agent("alice", Role::Support);

        let claimed = controller.claim(&conversation.id, &alice).await.unwrap();
        assert_eq!(claimed.owner_id.as_deref(), Some("alice"));
        assert_eq!(claimed.status, ConversationStatus::InProgress);
    }

    #[tokio::test]
    async fn second_claim_by_same_agent_changes_nothing() {
        let (store, controller, conversation) = setup().await;
        let alice = agent("alice", Role::Sales);

        let first = controller.claim(&conversation.id, &alice).await.unwrap();
        let mut feed = store.subscribe(SubscriptionScope::Conversation(conversation.id.clone()));
        let second = controller.claim(&conversation.id, &alice).await.unwrap();

        assert_eq!(first, second);
        assert!(feed.drain().is_empty());
    }

    #[tokio::test]
    async fn claim_of_owned_conversation_is_forbidden() {
        let (_store, controller, conversation) = setup().await;
        controller
            .claim(&conversation.id, &agent("alice", Role::Support))
            .await
            .unwrap();

        let result = controller
            .claim(&conversation.id, &agent("bob", Role::Marketing))
            .await;
        assert!(matches!(result, Err(ConsoleError::Forbidden(_))));
    }

    #[tokio::test]
    async fn release_by_owner_reopens_regardless_of_status() {
        let (_store, controller, conversation) = setup().await;
        let alice = agent("alice", Role::Support);
        controller.claim(&conversation.id, &alice).await.unwrap();
        controller
            .set_status(&conversation.id, ConversationStatus::Waiting)
            .await
            .unwrap();

        let released = controller.release(&conversation.id, &alice).await.unwrap();
        assert_eq!(released.owner_id, None);
        assert_eq!(released.status, ConversationStatus::Open);
    }

    #[tokio::test]
    async fn release_by_non_owner_is_forbidden() {
        let (store, controller, conversation) = setup().await;
        controller
            .claim(&conversation.id, &agent("alice", Role::Support))
            .await
            .unwrap();

        let result = controller
            .release(&conversation.id, &agent("mallory", Role::Admin))
            .await;
        assert!(matches!(result, Err(ConsoleError::Forbidden(_))));
        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.owner_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn force_claim_writes_one_system_message_before_the_owner_update() {
        let (store, controller, conversation) = setup().await;
        controller
            .claim(&conversation.id, &agent("alice", Role::Support))
            .await
            .unwrap();
        let mut feed = store.subscribe(SubscriptionScope::Conversation(conversation.id.clone()));
        let admin = Agent::new("root", "Rita", Role::Admin);

        let updated = controller.force_claim(&conversation.id, &admin).await.unwrap();
        assert_eq!(updated.owner_id.as_deref(), Some("root"));
        assert_eq!(updated.status, ConversationStatus::InProgress);

        let events = feed
            .drain()
            .into_iter()
            .filter_map(FeedItem::into_change)
            .collect::<Vec<_>>();
        assert_eq!(events.len(), 2);
        match (&events[0].record, &events[1].record) {
            (ChangeRecord::Message(message), ChangeRecord::Conversation(conversation)) => {
                assert_eq!(message.kind, MessageKind::System);
                assert_eq!(message.body, "Rita took over this conversation");
                assert_eq!(conversation.owner_id.as_deref(), Some("root"));
            }
            other => panic!("unexpected event order: {other:?}"),
        }
    }

    #[tokio::test]
    async fn force_claim_requires_admin() {
        let (store, controller, conversation) = setup().await;
        let result = controller
            .force_claim(&conversation.id, &agent("bob", Role::Sales))
            .await;
        assert!(matches!(result, Err(ConsoleError::Forbidden(_))));
        assert!(store.list_messages(&conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_access_appends_system_message_only() {
        let (store, controller, conversation) = setup().await;
        controller
            .claim(&conversation.id, &agent("alice", Role::Support))
            .await
            .unwrap();

        let message = controller
            .request_access(&conversation.id, &Agent::new("bob", "Bruno", Role::Sales))
            .await
            .unwrap();
        assert_eq!(message.kind, MessageKind::System);
        assert_eq!(message.sender_id, None);
        assert_eq!(parse_access_request(&message.body).as_deref(), Some("Bruno"));

        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.owner_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn request_access_needs_another_owner() {
        let (_store, controller, conversation) = setup().await;
        let alice = agent("alice", Role::Support);
        let unclaimed = controller.request_access(&conversation.id, &alice).await;
        assert!(matches!(unclaimed, Err(ConsoleError::Validation(_))));

        controller.claim(&conversation.id, &alice).await.unwrap();
        let own = controller.request_access(&conversation.id, &alice).await;
        assert!(matches!(own, Err(ConsoleError::Validation(_))));
    }

    #[tokio::test]
    async fn simultaneous_claims_settle_on_one_owner() {
        let (store, controller, conversation) = setup().await;
        let mut feed = store.subscribe(SubscriptionScope::Conversation(conversation.id.clone()));
        let alice = agent("alice", Role::Support);
        let bob = agent("bob", Role::Support);

        let (a, b) = tokio::join!(
            controller.claim(&conversation.id, &alice),
            controller.claim(&conversation.id, &bob)
        );
        assert!(a.is_ok() || b.is_ok());

        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        let owner = stored.owner_id.clone().unwrap();
        assert!(owner == "alice" || owner == "bob");

        let last = feed
            .drain()
            .into_iter()
            .filter_map(FeedItem::into_change)
            .filter_map(|event| match event.record {
                ChangeRecord::Conversation(conversation) => Some(conversation),
                ChangeRecord::Message(_) => None,
            })
            .last()
            .unwrap();
        assert_eq!(last.owner_id.as_deref(), Some(owner.as_str()));
    }

    #[tokio::test]
    async fn triage_edits_leave_ownership_alone() {
        let (_store, controller, conversation) = setup().await;
        controller
            .claim(&conversation.id, &agent("alice", Role::Support))
            .await
            .unwrap();

        let closed = controller
            .set_status(&conversation.id, ConversationStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.owner_id.as_deref(), Some("alice"));

        let tagged = controller
            .set_tag(&conversation.id, Some(" vip ".to_string()))
            .await
            .unwrap();
        assert_eq!(tagged.tag_id.as_deref(), Some("vip"));
        assert_eq!(tagged.status, ConversationStatus::Closed);

        let untagged = controller.set_tag(&conversation.id, None).await.unwrap();
        assert_eq!(untagged.tag_id, None);
    }
}
