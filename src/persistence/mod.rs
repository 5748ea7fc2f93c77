use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

use crate::execution::{Portfolio, Position};
use crate::risk::{RiskGovernor, RiskState};
use crate::Result;

const STATE_KEY: &str = "scalpbot:state";

/// Snapshots older than this are ignored on startup
pub const MAX_SNAPSHOT_AGE_HOURS: i64 = 24;

/// Everything needed to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotStateSnapshot {
    pub risk: RiskState,
    pub positions: Vec<Position>, // open positions only
    pub saved_at: DateTime<Utc>,
}

impl BotStateSnapshot {
    pub fn capture(risk: &RiskGovernor, portfolio: &Portfolio) -> Self {
        Self {
            risk: risk.snapshot(),
            positions: portfolio.open_positions(),
            saved_at: Utc::now(),
        }
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now - self.saved_at < ChronoDuration::hours(MAX_SNAPSHOT_AGE_HOURS)
    }
}

/// Durable home for the bot's state snapshot
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, snapshot: &BotStateSnapshot) -> Result<()>;

    /// The last saved snapshot, if there is one
    async fn load(&self) -> Result<Option<BotStateSnapshot>>;
}

/// Load the saved snapshot, discarding it when it is too old to trust
pub async fn restore_state(store: &dyn StateStore) -> Result<Option<BotStateSnapshot>> {
    let Some(snapshot) = store.load().await? else {
        tracing::info!("No saved state found, starting fresh");
        return Ok(None);
    };

    if !snapshot.is_fresh_at(Utc::now()) {
        tracing::warn!(
            "Saved state from {} is older than {}h, ignoring it",
            snapshot.saved_at.format("%Y-%m-%d %H:%M"),
            MAX_SNAPSHOT_AGE_HOURS
        );
        return Ok(None);
    }

    tracing::info!(
        "Restored state from {} ({} open positions, {} trades today)",
        snapshot.saved_at.format("%Y-%m-%d %H:%M"),
        snapshot.positions.len(),
        snapshot.risk.daily_trade_count
    );
    Ok(Some(snapshot))
}

/// Redis persistence for the state snapshot
///
/// Stores one JSON document under `scalpbot:state`
pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redact(redis_url));

        Ok(Self { conn })
    }

    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(STATE_KEY).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn save(&self, snapshot: &BotStateSnapshot) -> Result<()> {
        let value = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(STATE_KEY, value).await?;

        tracing::debug!(
            "Saved state to Redis ({} open positions)",
            snapshot.positions.len()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<BotStateSnapshot>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(STATE_KEY).await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Hide the password part of a connection URL
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***@{}", &url[..scheme], &url[at + 1..]),
        _ => url.to_string(),
    }
}
