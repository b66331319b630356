use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::config::Config;
use crate::money::Money;

/// Cached balances expire after an hour; the account store stays the source
/// of truth.
const BALANCE_TTL: Duration = Duration::from_secs(60 * 60);
/// Bound on the in-process tier.
const LOCAL_CAPACITY: u64 = 1000;

/// Write-through balance cache: a shared redis tier behind a small local
/// TinyLFU tier. A derived view only; failures are logged and swallowed so
/// they never disturb the payment pipeline.
#[derive(Clone)]
pub struct BalanceCache {
    redis: ConnectionManager,
    local: moka::future::Cache<i64, Money>,
}

impl BalanceCache {
    pub async fn connect(cfg: &Config) -> Result<Self, redis::RedisError> {
        info!("connecting to redis");

        let url = if cfg.cache_password.is_empty() {
            format!("redis://{}:{}/", cfg.cache_host, cfg.cache_port)
        } else {
            format!(
                "redis://:{}@{}:{}/",
                cfg.cache_password, cfg.cache_host, cfg.cache_port
            )
        };
        let client = redis::Client::open(url)?;
        let mut redis = client.get_connection_manager().await?;

        redis::cmd("PING").query_async::<_, ()>(&mut redis).await?;
        info!("verified redis connection");

        let local = moka::future::Cache::builder()
            .max_capacity(LOCAL_CAPACITY)
            .time_to_live(BALANCE_TTL)
            .build();

        Ok(Self { redis, local })
    }

    pub async fn get(&self, account_id: i64) -> Option<Money> {
        if let Some(balance) = self.local.get(&account_id).await {
            return Some(balance);
        }

        let mut redis = self.redis.clone();
        let raw: Option<String> = match redis.get(account_id.to_string()).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to get balance from cache for account id {account_id}: {err}");
                return None;
            }
        };

        let balance: Money = serde_json::from_str(&raw?).ok()?;
        self.local.insert(account_id, balance).await;
        Some(balance)
    }

    pub async fn set(&self, account_id: i64, balance: Money) {
        let raw = match serde_json::to_string(&balance) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to encode cached balance for account id {account_id}: {err}");
                return;
            }
        };

        let mut redis = self.redis.clone();
        if let Err(err) = redis
            .set_ex::<_, _, ()>(account_id.to_string(), raw, BALANCE_TTL.as_secs())
            .await
        {
            warn!("failed to cache balance for account id {account_id}: {err}");
            return;
        }
        self.local.insert(account_id, balance).await;
    }
}
