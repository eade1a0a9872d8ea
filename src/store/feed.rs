use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::types::{ChangeEvent, ChangeRecord};

const FEED_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Insert/update events of every conversation record.
    AllConversations,
    /// One conversation's record plus its messages.
    Conversation(String),
}

impl SubscriptionScope {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, &event.record) {
            (Self::AllConversations, ChangeRecord::Conversation(_)) => true,
            (Self::AllConversations, ChangeRecord::Message(_)) => false,
            (Self::Conversation(id), ChangeRecord::Conversation(conversation)) => {
                &conversation.id == id
            }
            (Self::Conversation(id), ChangeRecord::Message(message)) => {
                &message.conversation_id == id
            }
        }
    }
}

/// Fan-out of committed store changes, in commit order.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, scope: SubscriptionScope) -> Subscription {
        Subscription {
            scope,
            rx: self.tx.subscribe(),
        }
    }
}

/// One step of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Change(ChangeEvent),
    /// The receiver fell behind and `skipped` events were dropped. Anything
    /// folded from the feed so far is stale and must be re-read from the store.
    Lagged(u64),
}

impl FeedItem {
    pub fn into_change(self) -> Option<ChangeEvent> {
        match self {
            Self::Change(event) => Some(event),
            Self::Lagged(_) => None,
        }
    }
}

pub struct Subscription {
    scope: SubscriptionScope,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Next event in scope, or a lag marker; `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.scope.matches(&event) => return Some(FeedItem::Change(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, scope = ?self.scope, "change subscription lagged");
                    return Some(FeedItem::Lagged(skipped));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.scope.matches(&event) => return Some(FeedItem::Change(event)),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, scope = ?self.scope, "change subscription lagged");
                    return Some(FeedItem::Lagged(skipped));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drains everything currently buffered for this scope.
    pub fn drain(&mut self) -> Vec<FeedItem> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}
