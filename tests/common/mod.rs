//! Test harness: serve the console on a free port backed by the in-memory
//! store, with three agents (support, sales, admin).
#![allow(dead_code)]

use std::sync::Arc;

use console_server::app::{build_state, serve, AGENT_HEADER};
use console_server::gateway::WebhookGateway;
use console_server::store::MemoryStore;
use console_server::types::{Agent, Role, Settings};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub struct Console {
    pub addr: String,
    pub base: String,
    client: reqwest::Client,
}

impl Console {
    pub async fn start(webhook_endpoint: Option<String>) -> Self {
        let store = MemoryStore::with_settings(Settings { webhook_endpoint });
        store.add_agent(Agent::new("alice", "Alice", Role::Support)).await;
        store.add_agent(Agent::new("bob", "Bruno", Role::Sales)).await;
        store.add_agent(Agent::new("root", "Rita", Role::Admin)).await;
        let gateway = Arc::new(WebhookGateway::new(None).expect("http client"));
        let state = build_state(Arc::new(store), gateway);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind free port");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let _ = serve(listener, state).await;
        });

        Self {
            addr: addr.to_string(),
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }

    pub async fn call(
        &self,
        method: reqwest::Method,
        route: &str,
        agent: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = self.client.request(method, format!("{}{route}", self.base));
        if let Some(agent) = agent {
            request = request.header(AGENT_HEADER, agent);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.expect("request");
        let status = response.status();
        let json = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn get(&self, route: &str, agent: &str) -> (StatusCode, Value) {
        self.call(reqwest::Method::GET, route, Some(agent), None).await
    }

    pub async fn post(&self, route: &str, agent: &str, body: Value) -> (StatusCode, Value) {
        self.call(reqwest::Method::POST, route, Some(agent), Some(body))
            .await
    }

    pub async fn patch(&self, route: &str, agent: &str, body: Value) -> (StatusCode, Value) {
        self.call(reqwest::Method::PATCH, route, Some(agent), Some(body))
            .await
    }

    pub async fn create_conversation(&self) -> String {
        let (status, json) = self
            .post(
                "/api/conversations",
                "alice",
                json!({ "customerName": " Maria ", "customerAddress": "+5511999990000" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        json["conversation"]["id"]
            .as_str()
            .expect("conversation id")
            .to_string()
    }
}
