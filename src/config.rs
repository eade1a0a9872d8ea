use std::{env, time::Duration};

use crate::{error::ConsoleError, types::Agent};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    /// `None` runs the in-memory store.
    pub database_url: Option<String>,
    /// Initial webhook endpoint for the in-memory settings record.
    pub webhook_endpoint: Option<String>,
    pub gateway_timeout: Option<Duration>,
    /// Agents preloaded into the in-memory directory.
    pub seed_agents: Vec<Agent>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConsoleError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConsoleError> {
        let port = lookup("PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(4000);
        let bind_addr = lookup("BIND_ADDR")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let webhook_endpoint = lookup("WEBHOOK_ENDPOINT")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let gateway_timeout = lookup("GATEWAY_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let seed_agents = match lookup("SEED_AGENTS") {
            Some(raw) => parse_seed_agents(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            port,
            bind_addr,
            database_url: resolve_database_url(&lookup),
            webhook_endpoint,
            gateway_timeout,
            seed_agents,
        })
    }
}

fn resolve_database_url(lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
        return Some(url);
    }
    let var = |primary: &str, alias: &str| lookup(primary).or_else(|| lookup(alias));
    let host = var("POSTGRES_HOST", "PGHOST");
    let db = var("POSTGRES_DB", "PGDATABASE");
    if host.is_none() && db.is_none() {
        return None;
    }
    let host = host.unwrap_or_else(|| "localhost".to_string());
    let port = var("POSTGRES_PORT", "PGPORT").unwrap_or_else(|| "5432".to_string());
    let user = var("POSTGRES_USER", "PGUSER").unwrap_or_else(|| "postgres".to_string());
    let password = var("POSTGRES_PASSWORD", "PGPASSWORD").unwrap_or_default();
    let db = db.unwrap_or_else(|| "console".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

/// `id:name:role` entries separated by commas.
fn parse_seed_agents(raw: &str) -> Result<Vec<Agent>, ConsoleError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts = entry.split(':').map(str::trim).collect::<Vec<_>>();
            match parts.as_slice() {
                [id, name, role] if !id.is_empty() && !name.is_empty() => {
                    Ok(Agent::new(*id, *name, role.parse()?))
                }
                _ => Err(ConsoleError::Validation(format!(
                    "invalid SEED_AGENTS entry '{entry}', expected id:name:role"
                ))),
            }
        })
        .collect()
}
