use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    dispatcher::MessageDispatcher,
    error::ConsoleError,
    gateway::{DeliveryGateway, WebhookGateway},
    ownership::OwnershipController,
    projector::PresenceProjector,
    store::{
        AgentDirectory, ConversationStore, FeedItem, MemoryStore, PgStore, SettingsSource,
        SubscriptionScope,
    },
    types::*,
};

/// Caller identity, resolved upstream and forwarded by the proxy.
pub const AGENT_HEADER: &str = "x-agent-id";

type ApiResult = Result<(StatusCode, Json<Value>), ConsoleError>;

fn ok(body: Value) -> ApiResult {
    Ok((StatusCode::OK, Json(body)))
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

fn send_event<T: Serialize>(tx: &mpsc::UnboundedSender<String>, event: &str, data: T) -> bool {
    match event_payload(event, data) {
        Some(payload) => tx.send(payload).is_ok(),
        None => true,
    }
}

/// Outbound messages written before delivery tracking existed are shown as sent.
fn present(mut message: Message) -> Message {
    message.delivery_status = message.effective_delivery_status();
    message
}

pub fn build_state<S>(store: Arc<S>, gateway: Arc<dyn DeliveryGateway>) -> Arc<AppState>
where
    S: ConversationStore + AgentDirectory + SettingsSource + 'static,
{
    let conversations: Arc<dyn ConversationStore> = store.clone();
    let agents: Arc<dyn AgentDirectory> = store.clone();
    let settings: Arc<dyn SettingsSource> = store;
    Arc::new(AppState {
        ownership: OwnershipController::new(conversations.clone()),
        dispatcher: MessageDispatcher::new(
            conversations.clone(),
            settings.clone(),
            gateway.clone(),
        ),
        store: conversations,
        agents,
        settings,
        gateway,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
    })
}

async fn agent_from_headers(state: &AppState, headers: &HeaderMap) -> Result<Agent, ConsoleError> {
    let agent_id = headers
        .get(AGENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConsoleError::Unauthorized(format!("missing {AGENT_HEADER} header")))?;
    state
        .agents
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| ConsoleError::Unauthorized(format!("unknown agent '{agent_id}'")))
}

async fn admin_from_headers(state: &AppState, headers: &HeaderMap) -> Result<Agent, ConsoleError> {
    let agent = agent_from_headers(state, headers).await?;
    if !agent.is_admin() {
        return Err(ConsoleError::Forbidden("admin role required".to_string()));
    }
    Ok(agent)
}

async fn emit_to_clients<T: Serialize>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn client_ids_for_agent(state: &Arc<AppState>, agent_id: &str) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.agent_by_client
        .iter()
        .filter_map(|(client_id, agent)| (agent.id == agent_id).then_some(*client_id))
        .collect()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn get_conversations(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    agent_from_headers(&state, &headers).await?;
    let conversations = state.store.list_conversations().await?;
    ok(json!({ "conversations": conversations }))
}

async fn post_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationBody>,
) -> ApiResult {
    let agent = agent_from_headers(&state, &headers).await?;
    let customer_name = body.customer_name.trim().to_string();
    let customer_address = body.customer_address.trim().to_string();
    if customer_name.is_empty() || customer_address.is_empty() {
        return Err(ConsoleError::Validation(
            "customerName and customerAddress are required".to_string(),
        ));
    }
    let tag_id = body
        .tag_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let conversation = state
        .store
        .insert_conversation(NewConversation {
            customer_name,
            customer_address,
            tag_id,
        })
        .await?;
    info!(conversation_id = %conversation.id, agent_id = %agent.id, "conversation created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "conversation": conversation })),
    ))
}

async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    agent_from_headers(&state, &headers).await?;
    let conversation = state
        .store
        .get_conversation(&conversation_id)
        .await?
        .ok_or_else(|| ConsoleError::not_found("conversation", &conversation_id))?;
    ok(json!({ "conversation": conversation }))
}

async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    agent_from_headers(&state, &headers).await?;
    if state.store.get_conversation(&conversation_id).await?.is_none() {
        return Err(ConsoleError::not_found("conversation", &conversation_id));
    }
    let messages = state
        .store
        .list_messages(&conversation_id)
        .await?
        .into_iter()
        .map(present)
        .collect::<Vec<_>>();
    ok(json!({ "messages": messages }))
}

async fn post_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> ApiResult {
    let agent = agent_from_headers(&state, &headers).await?;
    let outcome = state
        .dispatcher
        .send_message(&conversation_id, &agent, &body.body)
        .await?;
    apply_to_sender_watches(&state, &agent.id, &outcome.message).await;

    if let Some(notice) = &outcome.notice {
        let clients = client_ids_for_agent(&state, &agent.id).await;
        emit_to_clients(
            &state,
            &clients,
            "delivery:error",
            json!({
                "conversationId": conversation_id,
                "messageId": outcome.message.id,
                "error": notice,
            }),
        )
        .await;
    }

    ok(json!({
        "message": outcome.message,
        "conversation": outcome.conversation,
        "notice": outcome.notice,
    }))
}

async fn post_claim(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let agent = agent_from_headers(&state, &headers).await?;
    let conversation = state.ownership.claim(&conversation_id, &agent).await?;
    ok(json!({ "conversation": conversation }))
}

async fn post_release(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let agent = agent_from_headers(&state, &headers).await?;
    let conversation = state.ownership.release(&conversation_id, &agent).await?;
    ok(json!({ "conversation": conversation }))
}

async fn post_force_claim(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let agent = agent_from_headers(&state, &headers).await?;
    let conversation = state
        .ownership
        .force_claim(&conversation_id, &agent)
        .await?;
    ok(json!({ "conversation": conversation }))
}

async fn post_request_access(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let agent = agent_from_headers(&state, &headers).await?;
    let message = state
        .ownership
        .request_access(&conversation_id, &agent)
        .await?;
    ok(json!({ "message": message }))
}

async fn patch_status(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> ApiResult {
    agent_from_headers(&state, &headers).await?;
    let status = body.status.parse::<ConversationStatus>()?;
    let conversation = state
        .ownership
        .set_status(&conversation_id, status)
        .await?;
    ok(json!({ "conversation": conversation }))
}

async fn patch_tag(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TagBody>,
) -> ApiResult {
    agent_from_headers(&state, &headers).await?;
    let conversation = state
        .ownership
        .set_tag(&conversation_id, body.tag_id)
        .await?;
    ok(json!({ "conversation": conversation }))
}

async fn get_view(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let agent = agent_from_headers(&state, &headers).await?;
    let (projector, _subscription) = PresenceProjector::open(
        state.store.as_ref(),
        state.agents.clone(),
        agent,
        &conversation_id,
    )
    .await?;
    ok(json!({ "view": projector.view() }))
}

async fn get_settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    admin_from_headers(&state, &headers).await?;
    let settings = state.settings.settings().await?;
    ok(json!({ "settings": settings }))
}

async fn patch_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SettingsBody>,
) -> ApiResult {
    let admin = admin_from_headers(&state, &headers).await?;
    let settings = state
        .settings
        .set_webhook_endpoint(body.webhook_endpoint)
        .await?;
    info!(
        admin_id = %admin.id,
        configured = settings.webhook_endpoint.is_some(),
        "webhook endpoint updated"
    );
    ok(json!({ "settings": settings }))
}

async fn post_test_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<TestWebhookBody>>,
) -> ApiResult {
    admin_from_headers(&state, &headers).await?;
    let requested = body
        .map(|Json(body)| body)
        .unwrap_or_default()
        .endpoint
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let endpoint = match requested {
        Some(endpoint) => endpoint,
        None => state
            .settings
            .settings()
            .await?
            .webhook_endpoint
            .ok_or_else(|| ConsoleError::Validation("no webhook endpoint configured".to_string()))?,
    };

    let result = state.gateway.probe(&endpoint).await;
    debug!(ok = result.ok, status = ?result.status_code, "webhook probe finished");
    ok(json!({ "result": result }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn stop_watch(state: &Arc<AppState>, client_id: usize) {
    let mut rt = state.realtime.lock().await;
    if let Some(watch) = rt.watches.remove(&client_id) {
        watch.task.abort();
    }
}

/// Hands the sender's final message state to each of their sockets watching
/// the conversation.
async fn apply_to_sender_watches(state: &Arc<AppState>, agent_id: &str, message: &Message) {
    let rt = state.realtime.lock().await;
    for (client_id, watch) in &rt.watches {
        let is_sender = rt
            .agent_by_client
            .get(client_id)
            .is_some_and(|agent| agent.id == agent_id);
        if is_sender && watch.conversation_id == message.conversation_id {
            let _ = watch.local.send(message.clone());
        }
    }
}

fn snapshot_payload(projector: &PresenceProjector) -> Value {
    json!({
        "conversation": projector.conversation(),
        "messages": projector.messages().iter().cloned().map(present).collect::<Vec<_>>(),
        "view": projector.view(),
    })
}

async fn join_agent(
    state: &Arc<AppState>,
    client_id: usize,
    tx: &mpsc::UnboundedSender<String>,
    data: &Value,
) {
    let agent_id = data.get("agentId").and_then(Value::as_str).unwrap_or("");
    let agent = match state.agents.get_agent(agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            send_event(tx, "error", json!({ "message": "unknown agent" }));
            return;
        }
        Err(err) => {
            send_event(tx, "error", json!({ "message": err.to_string() }));
            return;
        }
    };

    // Subscribe before the first snapshot so nothing committed in between is lost.
    let mut subscription = state.store.subscribe(SubscriptionScope::AllConversations);
    match state.store.list_conversations().await {
        Ok(list) => {
            send_event(tx, "conversations:list", list);
        }
        Err(err) => {
            send_event(tx, "error", json!({ "message": err.to_string() }));
        }
    }

    let store = state.store.clone();
    let list_tx = tx.clone();
    let task = tokio::spawn(async move {
        // Every step, lag included, refetches the whole list.
        while subscription.next().await.is_some() {
            match store.list_conversations().await {
                Ok(list) => {
                    if !send_event(&list_tx, "conversations:list", list) {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "failed to refresh conversation list"),
            }
        }
    });

    let mut rt = state.realtime.lock().await;
    info!(client_id, agent_id = %agent.id, "agent joined");
    rt.agent_by_client.insert(client_id, agent);
    if let Some(previous) = rt.list_tasks.insert(client_id, task) {
        previous.abort();
    }
}

async fn watch_conversation(
    state: &Arc<AppState>,
    client_id: usize,
    tx: &mpsc::UnboundedSender<String>,
    data: &Value,
) {
    let agent = {
        let rt = state.realtime.lock().await;
        rt.agent_by_client.get(&client_id).cloned()
    };
    let Some(agent) = agent else {
        send_event(tx, "error", json!({ "message": "join as an agent first" }));
        return;
    };
    let Some(conversation_id) = data.get("conversationId").and_then(Value::as_str) else {
        send_event(tx, "error", json!({ "message": "conversationId is required" }));
        return;
    };

    stop_watch(state, client_id).await;
    let opened = PresenceProjector::open(
        state.store.as_ref(),
        state.agents.clone(),
        agent,
        conversation_id,
    )
    .await;
    let (mut projector, mut subscription) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            send_event(tx, "error", json!({ "message": err.to_string() }));
            return;
        }
    };

    send_event(tx, "conversation:snapshot", snapshot_payload(&projector));

    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Message>();
    let store = state.store.clone();
    let watch_tx = tx.clone();
    let task = tokio::spawn(async move {
        loop {
            let delivered = tokio::select! {
                item = subscription.next() => {
                    let Some(item) = item else { break };
                    emit_feed_item(&mut projector, store.as_ref(), &item, &watch_tx).await
                }
                Some(message) = local_rx.recv() => {
                    projector.apply_local(message.clone());
                    send_event(&watch_tx, "message:updated", present(message))
                }
            };
            if !delivered {
                break;
            }
        }
    });

    let mut rt = state.realtime.lock().await;
    rt.watches.insert(
        client_id,
        ConversationWatch {
            conversation_id: conversation_id.to_string(),
            local: local_tx,
            task,
        },
    );
}

/// Folds one feed step into the projector and forwards it to the socket.
/// Returns `false` once the socket is gone.
async fn emit_feed_item(
    projector: &mut PresenceProjector,
    store: &dyn ConversationStore,
    item: &FeedItem,
    tx: &mpsc::UnboundedSender<String>,
) -> bool {
    let notice = match projector.apply_item(store, item).await {
        Ok((true, _)) => return send_event(tx, "conversation:snapshot", snapshot_payload(projector)),
        Ok((false, notice)) => notice,
        Err(err) => {
            warn!(error = %err, "failed to resync watched conversation");
            return send_event(tx, "error", json!({ "message": err.to_string() }));
        }
    };
    let FeedItem::Change(event) = item else {
        return true;
    };

    let delivered = match (&event.record, event.operation) {
        (ChangeRecord::Conversation(conversation), _) => {
            send_event(tx, "conversation:updated", conversation)
                && send_event(tx, "view:state", projector.view())
        }
        (ChangeRecord::Message(message), ChangeOperation::Insert) => {
            send_event(tx, "message:new", present(message.clone()))
        }
        (ChangeRecord::Message(message), ChangeOperation::Update) => {
            send_event(tx, "message:updated", present(message.clone()))
        }
    };
    if let Some(notice) = notice {
        send_event(tx, "access:requested", notice);
    }
    delivered
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx.clone());
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "agent:join" => join_agent(&state, client_id, &tx, &envelope.data).await,
            "conversation:watch" => {
                watch_conversation(&state, client_id, &tx, &envelope.data).await
            }
            "conversation:unwatch" => stop_watch(&state, client_id).await,
            other => debug!(client_id, event = other, "ignoring unknown event"),
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.agent_by_client.remove(&client_id);
        if let Some(task) = rt.list_tasks.remove(&client_id) {
            task.abort();
        }
        if let Some(watch) = rt.watches.remove(&client_id) {
            watch.task.abort();
        }
    }
    debug!(client_id, "client disconnected");

    send_task.abort();
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/conversations",
            get(get_conversations).post(post_conversation),
        )
        .route("/api/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_messages).post(post_message),
        )
        .route(
            "/api/conversations/{conversation_id}/claim",
            post(post_claim),
        )
        .route(
            "/api/conversations/{conversation_id}/release",
            post(post_release),
        )
        .route(
            "/api/conversations/{conversation_id}/force-claim",
            post(post_force_claim),
        )
        .route(
            "/api/conversations/{conversation_id}/request-access",
            post(post_request_access),
        )
        .route(
            "/api/conversations/{conversation_id}/status",
            patch(patch_status),
        )
        .route("/api/conversations/{conversation_id}/tag", patch(patch_tag))
        .route("/api/conversations/{conversation_id}/view", get(get_view))
        .route("/api/settings", get(get_settings).patch(patch_settings))
        .route("/api/settings/webhook/test", post(post_test_webhook))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), ConsoleError> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("console_server=info,tower_http=info,warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

pub async fn run() -> Result<(), ConsoleError> {
    let config = Config::from_env()?;
    init_tracing();

    let gateway: Arc<dyn DeliveryGateway> = Arc::new(WebhookGateway::new(config.gateway_timeout)?);
    let state = match &config.database_url {
        Some(url) => build_state(Arc::new(PgStore::connect(url).await?), gateway),
        None => {
            warn!("no database configured, conversations live in memory only");
            let store = MemoryStore::with_settings(Settings {
                webhook_endpoint: config.webhook_endpoint.clone(),
            });
            for agent in config.seed_agents.iter().cloned() {
                store.add_agent(agent).await;
            }
            build_state(Arc::new(store), gateway)
        }
    };

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("console server running at http://{addr}");
    serve(listener, state).await
}
