//! Outbound message lifecycle: persist, bootstrap ownership, relay, reconcile.
//!
//! A failed relay never removes the message. It stays in the conversation with
//! `delivery_status = error` so the attempted send remains visible.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::ConsoleError,
    gateway::{DeliveryGateway, DeliveryPayload},
    ownership::{can_claim, is_observer},
    store::{ConversationStore, SettingsSource},
    types::{
        Agent, Conversation, ConversationPatch, DeliveryStatus, Message, MessagePatch, NewMessage,
    },
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    /// Final state of the persisted message.
    pub message: Message,
    pub conversation: Conversation,
    /// User-facing failure notice when the relay did not accept the message.
    pub notice: Option<String>,
}

#[derive(Clone)]
pub struct MessageDispatcher {
    store: Arc<dyn ConversationStore>,
    settings: Arc<dyn SettingsSource>,
    gateway: Arc<dyn DeliveryGateway>,
}

impl MessageDispatcher {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        settings: Arc<dyn SettingsSource>,
        gateway: Arc<dyn DeliveryGateway>,
    ) -> Self {
        Self {
            store,
            settings,
            gateway,
        }
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender: &Agent,
        body: &str,
    ) -> Result<SendOutcome, ConsoleError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ConsoleError::Validation("message body is empty".to_string()));
        }
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ConsoleError::not_found("conversation", conversation_id))?;
        if is_observer(&conversation, &sender.id) {
            return Err(ConsoleError::Forbidden(
                "conversation is handled by another agent".to_string(),
            ));
        }

        let pending = self
            .store
            .insert_message(NewMessage::outbound(conversation_id, &sender.id, body))
            .await?;
        debug!(conversation_id, message_id = %pending.id, "outbound message persisted");

        match self.relay_and_reconcile(conversation_id, conversation, sender, &pending).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The attempted send stays visible, recorded as failed.
                if let Err(mark_err) = self
                    .store
                    .update_message(
                        &pending.id,
                        MessagePatch {
                            delivery_status: Some(DeliveryStatus::Error),
                        },
                    )
                    .await
                {
                    warn!(message_id = %pending.id, error = %mark_err, "failed to mark message as error");
                }
                warn!(conversation_id, message_id = %pending.id, error = %err, "send aborted after persist");
                Err(err)
            }
        }
    }

    async fn relay_and_reconcile(
        &self,
        conversation_id: &str,
        conversation: Conversation,
        sender: &Agent,
        pending: &Message,
    ) -> Result<SendOutcome, ConsoleError> {
        // Answering an unclaimed conversation claims it.
        let conversation = if can_claim(&conversation) {
            let claimed = self
                .store
                .update_conversation(conversation_id, ConversationPatch::assign_owner(&sender.id))
                .await?;
            info!(conversation_id, agent_id = %sender.id, "conversation claimed by first reply");
            claimed
        } else {
            conversation
        };

        let settings = self.settings.settings().await?;
        let (status, notice) = match settings.webhook_endpoint.as_deref() {
            None => (DeliveryStatus::Sent, None),
            Some(endpoint) => {
                let payload = DeliveryPayload {
                    conversation_id: conversation.id.clone(),
                    customer_address: conversation.customer_address.clone(),
                    body: pending.body.clone(),
                    sender_id: sender.id.clone(),
                    message_id: pending.id.clone(),
                };
                match self.gateway.deliver(endpoint, &payload).await {
                    Ok(()) => (DeliveryStatus::Sent, None),
                    Err(err) => {
                        warn!(conversation_id, message_id = %pending.id, error = %err, "delivery failed");
                        (
                            DeliveryStatus::Error,
                            Some(format!("Message saved but not delivered: {err}")),
                        )
                    }
                }
            }
        };

        let message = self
            .store
            .update_message(
                &pending.id,
                MessagePatch {
                    delivery_status: Some(status),
                },
            )
            .await?;
        debug!(message_id = %message.id, status = status.as_str(), "delivery status recorded");

        Ok(SendOutcome {
            message,
            conversation,
            notice,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::gateway::{ProbeResult, WebhookGateway};
    use crate::store::{FeedItem, MemoryStore, SubscriptionScope};
    use crate::types::{
        ChangeRecord, ConversationStatus, MessageKind, NewConversation, Role, Settings,
    };

    #[derive(Default)]
    struct RecordingGateway {
        calls: Mutex<Vec<(String, DeliveryPayload)>>,
    }

    #[async_trait]
    impl DeliveryGateway for RecordingGateway {
        async fn deliver(
            &self,
            endpoint: &str,
            payload: &DeliveryPayload,
        ) -> Result<(), ConsoleError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), payload.clone()));
            Ok(())
        }

        async fn probe(&self, _endpoint: &str) -> ProbeResult {
            ProbeResult {
                ok: true,
                status_code: Some(200),
                detail: "200 OK".to_string(),
            }
        }
    }

    struct UnavailableSettings;

    #[async_trait]
    impl SettingsSource for UnavailableSettings {
        async fn settings(&self) -> Result<Settings, ConsoleError> {
            Err(ConsoleError::Store("settings table unavailable".to_string()))
        }

        async fn set_webhook_endpoint(
            &self,
            _endpoint: Option<String>,
        ) -> Result<Settings, ConsoleError> {
            Err(ConsoleError::Store("settings table unavailable".to_string()))
        }
    }

    async fn setup(
        endpoint: Option<String>,
        gateway: Arc<dyn DeliveryGateway>,
    ) -> (Arc<MemoryStore>, MessageDispatcher, Conversation) {
        let store = Arc::new(MemoryStore::with_settings(Settings {
            webhook_endpoint: endpoint,
        }));
        let conversation = store
            .insert_conversation(NewConversation {
                customer_name: "Maria".to_string(),
                customer_address: "+5511999990000".to_string(),
                tag_id: None,
            })
            .await
            .unwrap();
        let dispatcher = MessageDispatcher::new(store.clone(), store.clone(), gateway);
        (store, dispatcher, conversation)
    }

    fn alice() -> Agent {
        Agent::new("alice", "Alice", Role::Support)
    }

    #[tokio::test]
    async fn blank_body_is_rejected_without_side_effects() {
        let gateway = Arc::new(RecordingGateway::default());
        let (store, dispatcher, conversation) =
            setup(Some("http://relay.invalid".to_string()), gateway.clone()).await;
        let mut feed = store.subscribe(SubscriptionScope::Conversation(conversation.id.clone()));

        for body in ["", "   ", "\n\t"] {
            let result = dispatcher.send_message(&conversation.id, &alice(), body).await;
            assert!(matches!(result, Err(ConsoleError::Validation(_))));
        }

        assert!(store.list_messages(&conversation.id).await.unwrap().is_empty());
        assert!(feed.drain().is_empty());
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn without_endpoint_the_message_is_sent_locally() {
        let gateway = Arc::new(RecordingGateway::default());
        let (store, dispatcher, conversation) = setup(None, gateway.clone()).await;

        let outcome = dispatcher
            .send_message(&conversation.id, &alice(), "  hello  ")
            .await
            .unwrap();
        assert_eq!(outcome.message.body, "hello");
        assert_eq!(outcome.message.delivery_status, Some(DeliveryStatus::Sent));
        assert_eq!(outcome.notice, None);

        let stored = store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delivery_status, Some(DeliveryStatus::Sent));
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gateway_failure_keeps_message_marked_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "body": "hello",
                "customerAddress": "+5511999990000",
                "senderId": "alice"
            })))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let gateway = Arc::new(WebhookGateway::new(None).unwrap());
        let (store, dispatcher, conversation) = setup(Some(server.uri()), gateway).await;
        let mut feed = store.subscribe(SubscriptionScope::Conversation(conversation.id.clone()));

        let outcome = dispatcher
            .send_message(&conversation.id, &alice(), "hello")
            .await
            .unwrap();
        assert_eq!(outcome.message.kind, MessageKind::Outbound);
        assert_eq!(outcome.message.delivery_status, Some(DeliveryStatus::Error));
        assert!(outcome.notice.is_some());
        assert_eq!(outcome.conversation.owner_id.as_deref(), Some("alice"));
        assert_eq!(outcome.conversation.status, ConversationStatus::InProgress);

        let stored = store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].body, "hello");
        assert_eq!(stored[0].delivery_status, Some(DeliveryStatus::Error));

        let statuses = feed
            .drain()
            .into_iter()
            .filter_map(FeedItem::into_change)
            .filter_map(|event| match event.record {
                ChangeRecord::Message(message) => message.delivery_status,
                ChangeRecord::Conversation(_) => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(statuses, vec![DeliveryStatus::Pending, DeliveryStatus::Error]);
    }

    #[tokio::test]
    async fn gateway_success_marks_message_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let gateway = Arc::new(WebhookGateway::new(None).unwrap());
        let (_store, dispatcher, conversation) = setup(Some(server.uri()), gateway).await;

        let outcome = dispatcher
            .send_message(&conversation.id, &alice(), "hello")
            .await
            .unwrap();
        assert_eq!(outcome.message.delivery_status, Some(DeliveryStatus::Sent));
    }

    #[tokio::test]
    async fn observer_cannot_send() {
        let gateway = Arc::new(RecordingGateway::default());
        let (store, dispatcher, conversation) = setup(None, gateway).await;
        store
            .update_conversation(&conversation.id, ConversationPatch::assign_owner("bob"))
            .await
            .unwrap();

        let result = dispatcher.send_message(&conversation.id, &alice(), "hi").await;
        assert!(matches!(result, Err(ConsoleError::Forbidden(_))));
        assert!(store.list_messages(&conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_reply_keeps_existing_status() {
        let gateway = Arc::new(RecordingGateway::default());
        let (store, dispatcher, conversation) = setup(None, gateway).await;
        store
            .update_conversation(&conversation.id, ConversationPatch::assign_owner("alice"))
            .await
            .unwrap();
        store
            .update_conversation(
                &conversation.id,
                ConversationPatch::status(ConversationStatus::Waiting),
            )
            .await
            .unwrap();

        let outcome = dispatcher
            .send_message(&conversation.id, &alice(), "still here")
            .await
            .unwrap();
        assert_eq!(outcome.conversation.status, ConversationStatus::Waiting);
    }

    #[tokio::test]
    async fn endpoint_is_read_fresh_on_every_send() {
        let gateway = Arc::new(RecordingGateway::default());
        let (store, dispatcher, conversation) = setup(None, gateway.clone()).await;

        dispatcher
            .send_message(&conversation.id, &alice(), "one")
            .await
            .unwrap();
        store
            .set_webhook_endpoint(Some("https://relay.example/hook".to_string()))
            .await
            .unwrap();
        let outcome = dispatcher
            .send_message(&conversation.id, &alice(), "two")
            .await
            .unwrap();

        let calls = gateway.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "https://relay.example/hook");
        assert_eq!(calls[0].1.message_id, outcome.message.id);
        assert_eq!(calls[0].1.conversation_id, conversation.id);
    }

    #[tokio::test]
    async fn settings_failure_after_persist_marks_message_error() {
        let gateway = Arc::new(RecordingGateway::default());
        let (store, _dispatcher, conversation) = setup(None, gateway.clone()).await;
        let dispatcher =
            MessageDispatcher::new(store.clone(), Arc::new(UnavailableSettings), gateway.clone());

        let result = dispatcher
            .send_message(&conversation.id, &alice(), "hello")
            .await;
        assert!(matches!(result, Err(ConsoleError::Store(_))));

        let stored = store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delivery_status, Some(DeliveryStatus::Error));
        assert!(gateway.calls.lock().unwrap().is_empty());
    }
}
