use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{
    postgres::{PgListener, PgPoolOptions, PgRow},
    PgPool, Row,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    feed::{ChangeFeed, Subscription, SubscriptionScope},
    normalize_endpoint, AgentDirectory, ConversationStore, SettingsSource,
};
use crate::{
    error::ConsoleError,
    types::{
        Agent, ChangeEvent, ChangeOperation, Conversation, ConversationPatch, Message,
        MessagePatch, NewConversation, NewMessage, Settings,
    },
};

/// Channel the row triggers in `migrations/` notify on.
const CHANGE_CHANNEL: &str = "console_changes";

const CONVERSATION_COLUMNS: &str =
    "id, customer_name, customer_address, status, owner_id, tag_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, body, kind, sender_id, delivery_status, created_at";

/// Postgres-backed store. Change events come from `pg_notify` triggers, so
/// writes made by other server processes reach this process's subscribers too.
pub struct PgStore {
    pool: PgPool,
    feed: ChangeFeed,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, ConsoleError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let store = Self {
            pool,
            feed: ChangeFeed::new(),
        };
        store.spawn_change_listener().await?;
        info!("postgres store ready");
        Ok(store)
    }

    async fn spawn_change_listener(&self) -> Result<(), ConsoleError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        let pool = self.pool.clone();
        let feed = self.feed.clone();

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<ChangeNotice>(notification.payload()) {
                            Ok(notice) => {
                                if let Err(err) = publish_notice(&pool, &feed, &notice).await {
                                    warn!(error = %err, id = %notice.id, "failed to publish change");
                                }
                            }
                            Err(err) => warn!(error = %err, "malformed change notification"),
                        }
                    }
                    Err(err) => {
                        // PgListener reconnects on the next recv.
                        error!(error = %err, "change listener connection lost");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ChangeNotice {
    table: String,
    operation: String,
    id: String,
}

fn parse_operation(raw: &str) -> Option<ChangeOperation> {
    match raw {
        "INSERT" => Some(ChangeOperation::Insert),
        "UPDATE" => Some(ChangeOperation::Update),
        _ => None,
    }
}

/// Re-reads the notified row; the latest committed snapshot is what subscribers get.
async fn publish_notice(
    pool: &PgPool,
    feed: &ChangeFeed,
    notice: &ChangeNotice,
) -> Result<(), ConsoleError> {
    let Some(operation) = parse_operation(&notice.operation) else {
        return Ok(());
    };
    let event = match notice.table.as_str() {
        "conversations" => fetch_conversation(pool, &notice.id)
            .await?
            .map(|conversation| ChangeEvent::conversation(operation, conversation)),
        "messages" => fetch_message(pool, &notice.id)
            .await?
            .map(|message| ChangeEvent::message(operation, message)),
        _ => None,
    };
    if let Some(event) = event {
        debug!(table = %notice.table, id = %notice.id, "publishing change");
        feed.publish(event);
    }
    Ok(())
}

fn decode<T: FromStr>(row: &PgRow, column: &str) -> Result<T, ConsoleError> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|_| ConsoleError::Store(format!("unexpected {column} value '{raw}'")))
}

fn decode_optional<T: FromStr>(row: &PgRow, column: &str) -> Result<Option<T>, ConsoleError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|_| ConsoleError::Store(format!("unexpected {column} value '{value}'")))
    })
    .transpose()
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation, ConsoleError> {
    Ok(Conversation {
        id: row.try_get("id")?,
        customer_name: row.try_get("customer_name")?,
        customer_address: row.try_get("customer_address")?,
        status: decode(row, "status")?,
        owner_id: row.try_get("owner_id")?,
        tag_id: row.try_get("tag_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, ConsoleError> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        body: row.try_get("body")?,
        kind: decode(row, "kind")?,
        sender_id: row.try_get("sender_id")?,
        delivery_status: decode_optional(row, "delivery_status")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn fetch_conversation(pool: &PgPool, id: &str) -> Result<Option<Conversation>, ConsoleError> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(conversation_from_row).transpose()
}

async fn fetch_message(pool: &PgPool, id: &str) -> Result<Option<Message>, ConsoleError> {
    let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, ConsoleError> {
        fetch_conversation(&self.pool, id).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ConsoleError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY updated_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn insert_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, ConsoleError> {
        let row = sqlx::query(&format!(
            "INSERT INTO conversations (id, customer_name, customer_address, tag_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&conversation.customer_name)
        .bind(&conversation.customer_address)
        .bind(&conversation.tag_id)
        .fetch_one(&self.pool)
        .await?;
        conversation_from_row(&row)
    }

    async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation, ConsoleError> {
        let patch = patch.normalized();
        let row = sqlx::query(&format!(
            "UPDATE conversations SET \
                 status = COALESCE($1, status), \
                 owner_id = CASE WHEN $2 THEN $3 ELSE owner_id END, \
                 tag_id = CASE WHEN $4 THEN $5 ELSE tag_id END, \
                 updated_at = now() \
             WHERE id = $6 \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(patch.status.map(|status| status.as_str()))
        .bind(patch.owner_id.is_some())
        .bind(patch.owner_id.clone().flatten())
        .bind(patch.tag_id.is_some())
        .bind(patch.tag_id.clone().flatten())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConsoleError::not_found("conversation", id))?;
        conversation_from_row(&row)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ConsoleError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 \
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, ConsoleError> {
        let delivery_status = message.stored_delivery_status();
        let result = sqlx::query(&format!(
            "INSERT INTO messages (id, conversation_id, body, kind, sender_id, delivery_status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, GREATEST( \
                 clock_timestamp(), \
                 COALESCE((SELECT MAX(created_at) FROM messages WHERE conversation_id = $2), '-infinity'::timestamptz) \
                     + INTERVAL '1 microsecond')) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&message.conversation_id)
        .bind(&message.body)
        .bind(message.kind.as_str())
        .bind(&message.sender_id)
        .bind(delivery_status.map(|status| status.as_str()))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => message_from_row(&row),
            Err(sqlx::Error::Database(err)) if err.is_foreign_key_violation() => Err(
                ConsoleError::not_found("conversation", &message.conversation_id),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_message(
        &self,
        id: &str,
        patch: MessagePatch,
    ) -> Result<Message, ConsoleError> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET delivery_status = COALESCE($1, delivery_status) \
             WHERE id = $2 \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(patch.delivery_status.map(|status| status.as_str()))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConsoleError::not_found("message", id))?;
        message_from_row(&row)
    }

    fn subscribe(&self, scope: SubscriptionScope) -> Subscription {
        self.feed.subscribe(scope)
    }
}

#[async_trait]
impl AgentDirectory for PgStore {
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, ConsoleError> {
        let row = sqlx::query("SELECT id, name, role FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Agent {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            role: decode(&row, "role")?,
        }))
    }
}

#[async_trait]
impl SettingsSource for PgStore {
    async fn settings(&self) -> Result<Settings, ConsoleError> {
        let endpoint = sqlx::query_scalar::<_, Option<String>>(
            "SELECT webhook_endpoint FROM app_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(Settings {
            webhook_endpoint: normalize_endpoint(endpoint),
        })
    }

    async fn set_webhook_endpoint(
        &self,
        endpoint: Option<String>,
    ) -> Result<Settings, ConsoleError> {
        let endpoint = sqlx::query_scalar::<_, Option<String>>(
            "INSERT INTO app_settings (id, webhook_endpoint) VALUES (1, $1) \
             ON CONFLICT (id) DO UPDATE SET webhook_endpoint = EXCLUDED.webhook_endpoint \
             RETURNING webhook_endpoint",
        )
        .bind(normalize_endpoint(endpoint))
        .fetch_one(&self.pool)
        .await?;
        Ok(Settings {
            webhook_endpoint: endpoint,
        })
    }
}
