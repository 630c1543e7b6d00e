//! Strike accounting and IP banning.
//!
//! The durable store (Redis in production, in-memory in tests) is the source
//! of truth for bans and strike counters; an in-process cache keeps the
//! per-request ban check O(1). Store lookups are bounded by a short timeout
//! and fail open: an unreachable store means "assume not banned", never a
//! stalled request.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use super::security_log::{SecurityEvent, SecurityLogger};

/// Upper bound on a single durable-store round trip in the request path.
const STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a "not banned" answer (including fail-open answers) is cached.
const NEGATIVE_CACHE_SECS: i64 = 30;

/// Cap on retained security event rows in the durable store.
const EVENT_LOG_CAP: isize = 10_000;

/// Thresholds governing strike accumulation and auto-bans.
#[derive(Debug, Clone, Copy)]
pub struct StrikePolicy {
    pub max_strikes: u64,
    pub ban_duration_secs: u64,
    /// Strikes decay by expiring after this long without a new violation.
    pub strike_ttl_secs: u64,
}

/// Durable reputation record for one client IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip_address: String,
    pub reason: String,
    pub strike_count: u64,
    pub auto_banned: bool,
    pub permanent: bool,
    pub banned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_request_path: String,
    pub last_user_agent: String,
}

impl BanRecord {
    /// Permanent bans never expire; a temporary ban is active until
    /// `expires_at`. A record without an expiry stays active until removed.
    pub fn is_active(&self) -> bool {
        if self.permanent {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => Utc::now() <= expires_at,
            None => true,
        }
    }
}

/// Storage seam for ban records, strike counters, and event rows.
#[async_trait]
pub trait BanStore: Send + Sync {
    async fn get_ban(&self, ip: &str) -> Result<Option<BanRecord>>;
    async fn put_ban(&self, record: &BanRecord, ttl_secs: Option<u64>) -> Result<()>;
    async fn delete_ban(&self, ip: &str) -> Result<()>;
    async fn list_bans(&self) -> Result<Vec<BanRecord>>;
    /// Atomically increment the strike counter, refreshing its TTL.
    async fn incr_strikes(&self, ip: &str, ttl_secs: u64) -> Result<u64>;
    async fn clear_strikes(&self, ip: &str) -> Result<()>;
    async fn append_event(&self, event: &SecurityEvent) -> Result<()>;
}

/// Redis-backed store. One async connection per call, as the rest of the
/// service does.
pub struct RedisBanStore {
    client: redis::Client,
}

impl RedisBanStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn ban_key(ip: &str) -> String {
        format!("waf:ban:{ip}")
    }

    fn strikes_key(ip: &str) -> String {
        format!("waf:strikes:{ip}")
    }
}

#[async_trait]
impl BanStore for RedisBanStore {
    async fn get_ban(&self, ip: &str) -> Result<Option<BanRecord>> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = conn.get(Self::ban_key(ip)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_ban(&self, record: &BanRecord, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let json = serde_json::to_string(record)?;
        let key = Self::ban_key(&record.ip_address);
        match ttl_secs {
            Some(ttl) => {
                let _: () = redis::pipe()
                    .atomic()
                    .set(&key, json)
                    .ignore()
                    .expire(&key, ttl as i64)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                let _: () = conn.set(key, json).await?;
            }
        }
        Ok(())
    }

    async fn delete_ban(&self, ip: &str) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.del(Self::ban_key(ip)).await?;
        Ok(())
    }

    async fn list_bans(&self) -> Result<Vec<BanRecord>> {
        let mut conn = self.client.get_async_connection().await?;
        let keys: Vec<String> = conn.keys("waf:ban:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(json) = raw {
                if let Ok(record) = serde_json::from_str(&json) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn incr_strikes(&self, ip: &str, ttl_secs: u64) -> Result<u64> {
        let mut conn = self.client.get_async_connection().await?;
        let key = Self::strikes_key(ip);
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn clear_strikes(&self, ip: &str) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.del(Self::strikes_key(ip)).await?;
        Ok(())
    }

    async fn append_event(&self, event: &SecurityEvent) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let json = serde_json::to_string(event)?;
        let _: () = redis::pipe()
            .atomic()
            .lpush("waf:events", json)
            .ignore()
            .ltrim("waf:events", 0, EVENT_LOG_CAP - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-memory store for tests and single-process deployments without Redis.
#[derive(Default)]
pub struct MemoryBanStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    bans: HashMap<String, BanRecord>,
    strikes: HashMap<String, u64>,
    events: Vec<SecurityEvent>,
}

impl MemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl BanStore for MemoryBanStore {
    async fn get_ban(&self, ip: &str) -> Result<Option<BanRecord>> {
        Ok(self.inner.lock().await.bans.get(ip).cloned())
    }

    async fn put_ban(&self, record: &BanRecord, _ttl_secs: Option<u64>) -> Result<()> {
        self.inner
            .lock()
            .await
            .bans
            .insert(record.ip_address.clone(), record.clone());
        Ok(())
    }

    async fn delete_ban(&self, ip: &str) -> Result<()> {
        self.inner.lock().await.bans.remove(ip);
        Ok(())
    }

    async fn list_bans(&self) -> Result<Vec<BanRecord>> {
        Ok(self.inner.lock().await.bans.values().cloned().collect())
    }

    async fn incr_strikes(&self, ip: &str, _ttl_secs: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let count = inner.strikes.entry(ip.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn clear_strikes(&self, ip: &str) -> Result<()> {
        self.inner.lock().await.strikes.remove(ip);
        Ok(())
    }

    async fn append_event(&self, event: &SecurityEvent) -> Result<()> {
        self.inner.lock().await.events.push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    banned: bool,
    valid_until: DateTime<Utc>,
}

/// Per-IP reputation: strike counting, auto-bans, and the cached ban check
/// that runs before everything else on every request.
pub struct ReputationStore {
    store: Box<dyn BanStore>,
    cache: RwLock<HashMap<String, CachedVerdict>>,
    logger: Arc<SecurityLogger>,
}

impl ReputationStore {
    pub fn new(store: Box<dyn BanStore>, logger: Arc<SecurityLogger>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            logger,
        }
    }

    /// Cache-first ban check. Store errors and timeouts fail open.
    pub async fn is_banned(&self, ip: &str, ban_duration_secs: u64) -> bool {
        {
            let cache = self.cache.read().await;
            if let Some(verdict) = cache.get(ip) {
                if Utc::now() < verdict.valid_until {
                    return verdict.banned;
                }
            }
        }

        let (banned, ban_expires_at) =
            match tokio::time::timeout(STORE_TIMEOUT, self.store.get_ban(ip)).await {
                Ok(Ok(Some(record))) => {
                    let expires_at = record.expires_at.filter(|_| !record.permanent);
                    (record.is_active(), expires_at)
                }
                Ok(Ok(None)) => (false, None),
                Ok(Err(e)) => {
                    warn!(ip = ip, error = %e, "ban lookup failed, assuming not banned");
                    (false, None)
                }
                Err(_) => {
                    warn!(ip = ip, "ban lookup timed out, assuming not banned");
                    (false, None)
                }
            };

        let ttl = if banned {
            ChronoDuration::seconds(ban_duration_secs.max(1) as i64)
        } else {
            ChronoDuration::seconds(NEGATIVE_CACHE_SECS)
        };
        let mut valid_until = Utc::now() + ttl;
        if banned {
            // A cached "banned" must not outlive the ban itself
            if let Some(expires_at) = ban_expires_at {
                valid_until = valid_until.min(expires_at);
            }
        }
        self.cache.write().await.insert(
            ip.to_string(),
            CachedVerdict {
                banned,
                valid_until,
            },
        );
        banned
    }

    /// Record one violation. Returns the accumulated strike count and
    /// auto-bans once it reaches the policy threshold. A store failure
    /// degrades strike accounting without affecting the caller's
    /// allow/deny decision.
    pub async fn record_strike(
        &self,
        ip: &str,
        mut event: SecurityEvent,
        policy: StrikePolicy,
    ) -> u64 {
        let strikes = match tokio::time::timeout(
            STORE_TIMEOUT,
            self.store.incr_strikes(ip, policy.strike_ttl_secs),
        )
        .await
        {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                warn!(ip = ip, error = %e, "strike increment failed");
                0
            }
            Err(_) => {
                warn!(ip = ip, "strike increment timed out");
                0
            }
        };

        let banning = strikes >= policy.max_strikes && strikes > 0;
        if banning {
            event.action_taken = super::security_log::ActionTaken::Banned;
        }
        if let Err(e) = self.store.append_event(&event).await {
            warn!(ip = ip, error = %e, "security event row not persisted");
        }

        if banning {
            let reason = format!(
                "Auto-banned after {strikes} strikes ({})",
                event.event_type
            );
            self.ban(BanParams {
                ip,
                reason: &reason,
                duration_secs: Some(policy.ban_duration_secs),
                permanent: false,
                auto_banned: true,
                strike_count: strikes,
                last_request_path: &event.path,
                last_user_agent: &event.user_agent,
            })
            .await;
        }
        strikes
    }

    /// Write a ban record, prime the cache, and emit the IP_BANNED line.
    pub async fn ban(&self, params: BanParams<'_>) {
        let now = Utc::now();
        let expires_at = if params.permanent {
            None
        } else {
            params
                .duration_secs
                .map(|d| now + ChronoDuration::seconds(d as i64))
        };
        let record = BanRecord {
            ip_address: params.ip.to_string(),
            reason: params.reason.to_string(),
            strike_count: params.strike_count,
            auto_banned: params.auto_banned,
            permanent: params.permanent,
            banned_at: now,
            expires_at,
            last_request_path: params.last_request_path.to_string(),
            last_user_agent: params.last_user_agent.to_string(),
        };

        let ttl = if params.permanent {
            None
        } else {
            params.duration_secs
        };
        if let Err(e) = self.store.put_ban(&record, ttl).await {
            warn!(ip = params.ip, error = %e, "ban record not persisted");
        }

        let cache_ttl = params.duration_secs.unwrap_or(NEGATIVE_CACHE_SECS as u64);
        self.cache.write().await.insert(
            params.ip.to_string(),
            CachedVerdict {
                banned: true,
                valid_until: now + ChronoDuration::seconds(cache_ttl.max(1) as i64),
            },
        );

        crate::metrics::BANS_ISSUED_TOTAL.inc();
        self.logger
            .ip_banned(params.ip, params.reason, params.duration_secs);
    }

    /// Persist an event row without counting a strike (server-side faults
    /// such as outbound data leaks are not held against the client).
    pub async fn record_event(&self, event: SecurityEvent) {
        if let Err(e) = self.store.append_event(&event).await {
            warn!(ip = %event.ip_address, error = %e, "security event row not persisted");
        }
    }

    /// Lift a ban and clear accumulated strikes.
    pub async fn unban(&self, ip: &str) -> Result<()> {
        self.store.delete_ban(ip).await?;
        self.store.clear_strikes(ip).await?;
        self.cache.write().await.remove(ip);
        Ok(())
    }

    pub async fn get_ban(&self, ip: &str) -> Result<Option<BanRecord>> {
        self.store.get_ban(ip).await
    }

    pub async fn list_bans(&self) -> Result<Vec<BanRecord>> {
        self.store.list_bans().await
    }
}

/// Inputs for issuing a ban.
pub struct BanParams<'a> {
    pub ip: &'a str,
    pub reason: &'a str,
    pub duration_secs: Option<u64>,
    pub permanent: bool,
    pub auto_banned: bool,
    pub strike_count: u64,
    pub last_request_path: &'a str,
    pub last_user_agent: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::security_log::ActionTaken;

    fn test_policy() -> StrikePolicy {
        StrikePolicy {
            max_strikes: 3,
            ban_duration_secs: 900,
            strike_ttl_secs: 900,
        }
    }

    fn store() -> ReputationStore {
        ReputationStore::new(
            Box::new(MemoryBanStore::new()),
            Arc::new(SecurityLogger::stderr()),
        )
    }

    fn event(ip: &str, event_type: &str) -> SecurityEvent {
        SecurityEvent::new(event_type, ip, "/api/test/", "GET", ActionTaken::Logged)
    }

    #[tokio::test]
    async fn unknown_ip_is_not_banned() {
        let reputation = store();
        assert!(!reputation.is_banned("10.0.0.1", 900).await);
    }

    #[tokio::test]
    async fn strikes_accumulate_to_auto_ban() {
        let reputation = store();
        assert_eq!(
            reputation
                .record_strike("10.0.0.1", event("10.0.0.1", "sqli"), test_policy())
                .await,
            1
        );
        assert_eq!(
            reputation
                .record_strike("10.0.0.1", event("10.0.0.1", "sqli"), test_policy())
                .await,
            2
        );
        assert!(!reputation.is_banned("10.0.0.1", 900).await);

        // Third strike crosses the threshold
        assert_eq!(
            reputation
                .record_strike("10.0.0.1", event("10.0.0.1", "rate_limit"), test_policy())
                .await,
            3
        );
        assert!(reputation.is_banned("10.0.0.1", 900).await);

        let record = reputation.get_ban("10.0.0.1").await.unwrap().unwrap();
        assert!(record.auto_banned);
        assert!(!record.permanent);
        assert!(record.reason.contains("3 strikes"));
        assert!(record.reason.contains("rate_limit"));
    }

    #[tokio::test]
    async fn expired_temporary_ban_is_inactive() {
        let reputation = store();
        let record = BanRecord {
            ip_address: "10.0.0.2".to_string(),
            reason: "test".to_string(),
            strike_count: 5,
            auto_banned: true,
            permanent: false,
            banned_at: Utc::now() - ChronoDuration::hours(2),
            expires_at: Some(Utc::now() - ChronoDuration::hours(1)),
            last_request_path: String::new(),
            last_user_agent: String::new(),
        };
        reputation.store.put_ban(&record, None).await.unwrap();
        assert!(!record.is_active());
        assert!(!reputation.is_banned("10.0.0.2", 900).await);
    }

    #[tokio::test]
    async fn permanent_ban_never_expires() {
        let reputation = store();
        reputation
            .ban(BanParams {
                ip: "10.0.0.3",
                reason: "manual permanent",
                duration_secs: None,
                permanent: true,
                auto_banned: false,
                strike_count: 0,
                last_request_path: "",
                last_user_agent: "",
            })
            .await;
        let record = reputation.get_ban("10.0.0.3").await.unwrap().unwrap();
        assert!(record.permanent);
        assert!(record.expires_at.is_none());
        assert!(record.is_active());
        assert!(reputation.is_banned("10.0.0.3", 900).await);
    }

    #[tokio::test]
    async fn unban_lifts_the_ban_and_clears_strikes() {
        let reputation = store();
        for _ in 0..3 {
            reputation
                .record_strike("10.0.0.4", event("10.0.0.4", "xss"), test_policy())
                .await;
        }
        assert!(reputation.is_banned("10.0.0.4", 900).await);

        reputation.unban("10.0.0.4").await.unwrap();
        assert!(!reputation.is_banned("10.0.0.4", 900).await);

        // Strike counter restarts from zero
        assert_eq!(
            reputation
                .record_strike("10.0.0.4", event("10.0.0.4", "xss"), test_policy())
                .await,
            1
        );
    }

    #[tokio::test]
    async fn cached_ban_verdict_expires_with_the_ban() {
        let reputation = store();
        let record = BanRecord {
            ip_address: "10.0.0.7".to_string(),
            reason: "short ban".to_string(),
            strike_count: 0,
            auto_banned: false,
            permanent: false,
            banned_at: Utc::now(),
            expires_at: Some(Utc::now() + ChronoDuration::milliseconds(50)),
            last_request_path: String::new(),
            last_user_agent: String::new(),
        };
        reputation.store.put_ban(&record, None).await.unwrap();

        // Checked while active, so the verdict lands in the cache
        assert!(reputation.is_banned("10.0.0.7", 900).await);

        // Once the record expires the cached verdict must not outlive it,
        // even though the configured ban duration is much longer
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!reputation.is_banned("10.0.0.7", 900).await);
    }

    #[tokio::test]
    async fn ban_verdict_is_cached() {
        let logger = Arc::new(SecurityLogger::stderr());
        let memory = MemoryBanStore::new();
        let reputation = ReputationStore::new(Box::new(memory), logger);
        reputation
            .ban(BanParams {
                ip: "10.0.0.5",
                reason: "test",
                duration_secs: Some(900),
                permanent: false,
                auto_banned: false,
                strike_count: 0,
                last_request_path: "",
                last_user_agent: "",
            })
            .await;
        // Even after deleting the underlying record, the cached verdict holds
        reputation.store.delete_ban("10.0.0.5").await.unwrap();
        assert!(reputation.is_banned("10.0.0.5", 900).await);
    }

    #[tokio::test]
    async fn event_rows_are_appended() {
        let logger = Arc::new(SecurityLogger::stderr());
        let memory = Arc::new(MemoryBanStore::new());
        struct Shared(Arc<MemoryBanStore>);

        #[async_trait]
        impl BanStore for Shared {
            async fn get_ban(&self, ip: &str) -> Result<Option<BanRecord>> {
                self.0.get_ban(ip).await
            }
            async fn put_ban(&self, record: &BanRecord, ttl: Option<u64>) -> Result<()> {
                self.0.put_ban(record, ttl).await
            }
            async fn delete_ban(&self, ip: &str) -> Result<()> {
                self.0.delete_ban(ip).await
            }
            async fn list_bans(&self) -> Result<Vec<BanRecord>> {
                self.0.list_bans().await
            }
            async fn incr_strikes(&self, ip: &str, ttl: u64) -> Result<u64> {
                self.0.incr_strikes(ip, ttl).await
            }
            async fn clear_strikes(&self, ip: &str) -> Result<()> {
                self.0.clear_strikes(ip).await
            }
            async fn append_event(&self, event: &SecurityEvent) -> Result<()> {
                self.0.append_event(event).await
            }
        }

        let reputation = ReputationStore::new(Box::new(Shared(memory.clone())), logger);
        reputation
            .record_strike("10.0.0.6", event("10.0.0.6", "path_traversal"), test_policy())
            .await;
        let events = memory.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "path_traversal");
        assert_eq!(events[0].ip_address, "10.0.0.6");
    }
}
