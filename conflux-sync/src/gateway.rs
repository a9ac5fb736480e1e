//! Connection admission: token validation, per-address rate limiting,
//! and the process-wide connection table.
//!
//! The gateway authenticates a connection before it may join any
//! workspace. Token issuance itself is an external concern; the
//! validator only checks presented tokens against its table. Every
//! accepted connection is tracked with a last-activity instant so the
//! heartbeat sweep can force-close silent ones, which runs the same
//! cleanup as a voluntary disconnect.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::SyncError;

/// Gateway tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interval between liveness sweeps.
    pub heartbeat_interval: Duration,
    /// A connection silent for longer than this is force-closed.
    pub heartbeat_timeout: Duration,
    /// Admission attempts allowed per address inside the window.
    pub max_attempts_per_addr: usize,
    /// Sliding admission window.
    pub admission_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            max_attempts_per_addr: 32,
            admission_window: Duration::from_secs(10),
        }
    }
}

/// In-memory token table: token string → user id.
pub struct TokenValidator {
    tokens: RwLock<HashMap<String, Uuid>>,
}

impl TokenValidator {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Register a token for a user and return it. Test and embedding
    /// convenience; production tokens arrive from the auth service.
    pub async fn issue(&self, user_id: Uuid) -> String {
        let token = format!("tok-{}", Uuid::new_v4());
        self.insert(token.clone(), user_id).await;
        token
    }

    pub async fn insert(&self, token: String, user_id: Uuid) {
        self.tokens.write().await.insert(token, user_id);
    }

    /// Resolve a presented token to its user.
    pub async fn validate(&self, token: &str) -> Result<Uuid, SyncError> {
        self.tokens
            .read()
            .await
            .get(token)
            .copied()
            .ok_or(SyncError::Unauthenticated)
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.tokens.write().await.remove(token).is_some()
    }
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window admission limiter, per source address.
pub struct AdmissionLimiter {
    window: Duration,
    max_attempts: usize,
    attempts: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl AdmissionLimiter {
    pub fn new(window: Duration, max_attempts: usize) -> Self {
        Self {
            window,
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record an admission attempt; `RateLimited` once the window is
    /// saturated.
    pub async fn admit(&self, addr: IpAddr) -> Result<(), SyncError> {
        let mut attempts = self.attempts.lock().await;
        let window = self.window;
        let entry = attempts.entry(addr).or_default();

        while entry.front().is_some_and(|t| t.elapsed() > window) {
            entry.pop_front();
        }
        if entry.len() >= self.max_attempts {
            log::warn!("Admission rate limit hit for {addr}");
            return Err(SyncError::RateLimited);
        }
        entry.push_back(Instant::now());
        Ok(())
    }
}

/// One live authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub addr: IpAddr,
    pub opened: Instant,
    pub last_seen: Instant,
}

/// Process-wide table of authenticated connections.
pub struct ConnectionTable {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, user_id: Uuid, addr: IpAddr) -> Uuid {
        let connection_id = Uuid::new_v4();
        let now = Instant::now();
        self.connections.write().await.insert(
            connection_id,
            ConnectionEntry {
                connection_id,
                user_id,
                addr,
                opened: now,
                last_seen: now,
            },
        );
        connection_id
    }

    /// Record inbound activity (any frame counts as a heartbeat).
    pub async fn touch(&self, connection_id: Uuid) {
        if let Some(entry) = self.connections.write().await.get_mut(&connection_id) {
            entry.last_seen = Instant::now();
        }
    }

    pub async fn remove(&self, connection_id: Uuid) -> Option<ConnectionEntry> {
        self.connections.write().await.remove(&connection_id)
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<ConnectionEntry> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    /// Connections silent beyond `timeout`, for the liveness sweep.
    pub async fn idle(&self, timeout: Duration) -> Vec<Uuid> {
        self.connections
            .read()
            .await
            .values()
            .filter(|e| e.last_seen.elapsed() > timeout)
            .map(|e| e.connection_id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn test_token_validate_and_revoke() {
        let validator = TokenValidator::new();
        let user = Uuid::new_v4();
        let token = validator.issue(user).await;

        assert_eq!(validator.validate(&token).await.unwrap(), user);
        assert_eq!(
            validator.validate("tok-bogus").await,
            Err(SyncError::Unauthenticated)
        );

        assert!(validator.revoke(&token).await);
        assert_eq!(validator.validate(&token).await, Err(SyncError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_admission_limiter_saturates() {
        let limiter = AdmissionLimiter::new(Duration::from_secs(60), 3);
        let addr = localhost();

        for _ in 0..3 {
            limiter.admit(addr).await.unwrap();
        }
        assert_eq!(limiter.admit(addr).await, Err(SyncError::RateLimited));
    }

    #[tokio::test]
    async fn test_admission_limiter_window_expires() {
        let limiter = AdmissionLimiter::new(Duration::from_millis(20), 1);
        let addr = localhost();

        limiter.admit(addr).await.unwrap();
        assert_eq!(limiter.admit(addr).await, Err(SyncError::RateLimited));

        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.admit(addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_admission_limiter_is_per_address() {
        let limiter = AdmissionLimiter::new(Duration::from_secs(60), 1);
        limiter.admit(localhost()).await.unwrap();
        limiter
            .admit(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_table_lifecycle() {
        let table = ConnectionTable::new();
        let user = Uuid::new_v4();

        let conn = table.register(user, localhost()).await;
        assert_eq!(table.len().await, 1);
        assert_eq!(table.get(conn).await.unwrap().user_id, user);

        let removed = table.remove(conn).await.unwrap();
        assert_eq!(removed.connection_id, conn);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_detection_and_touch() {
        let table = ConnectionTable::new();
        let conn = table.register(Uuid::new_v4(), localhost()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(table.idle(Duration::from_millis(10)).await, vec![conn]);

        table.touch(conn).await;
        assert!(table.idle(Duration::from_millis(10)).await.is_empty());
    }
}
