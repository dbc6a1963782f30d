/*
[INPUT]:  Request sender capability and token timing configuration
[OUTPUT]: Acquired session tokens kept alive by a background task
[POS]:    Auth layer - orchestrates the listen key lifecycle
[UPDATE]: When token endpoints or keepalive scheduling change
*/

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use reqwest::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::error::CODE_INVALID_LISTEN_KEY;
use crate::http::{BinanceError, RequestSender, Result};
use crate::types::{ListenKeyResponse, SignedRequestSpec};

use super::token::{SessionToken, TokenState, TokenStatus, mask_token};

pub const DEFAULT_LISTEN_KEY_PATH: &str = "/api/v3/userDataStream";
const LISTEN_KEY_PARAM: &str = "listenKey";

/// Timing for the token lifecycle
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// How long a token stays valid after issuance or keepalive
    pub validity: Duration,
    /// Must be shorter than `validity`
    pub keepalive_interval: Duration,
    /// Delay before retrying a failed keepalive
    pub retry_delay: Duration,
    pub endpoint: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self::with_validity(Duration::from_secs(60 * 60))
    }
}

impl TokenConfig {
    /// Keepalive at half the validity window
    pub fn with_validity(validity: Duration) -> Self {
        Self {
            validity,
            keepalive_interval: validity / 2,
            retry_delay: Duration::from_secs(30),
            endpoint: DEFAULT_LISTEN_KEY_PATH.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.validity.is_zero() {
            return Err(BinanceError::Config("token validity must be positive".to_string()));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.validity {
            return Err(BinanceError::Config(format!(
                "keepalive interval {:?} must be positive and shorter than validity {:?}",
                self.keepalive_interval, self.validity
            )));
        }
        if self.retry_delay.is_zero() {
            return Err(BinanceError::Config("keepalive retry delay must be positive".to_string()));
        }
        Ok(())
    }
}

struct TokenSlot {
    token: SessionToken,
    state: TokenState,
    deadline: Instant,
}

struct KeepaliveTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepaliveTask {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct Inner {
    sender: Arc<dyn RequestSender>,
    config: TokenConfig,
    slot: RwLock<Option<TokenSlot>>,
    status_tx: watch::Sender<Option<TokenStatus>>,
    keepalive: Mutex<Option<KeepaliveTask>>,
}

/// Owns the current session token and keeps it alive
///
/// Cheap to clone; clones share the same token. Read-mostly, the token slot
/// sits behind a single `RwLock`.
#[derive(Clone)]
pub struct SessionTokenManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionTokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokenManager")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionTokenManager {
    pub fn new(sender: Arc<dyn RequestSender>, config: TokenConfig) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Inner {
                sender,
                config,
                slot: RwLock::new(None),
                status_tx,
                keepalive: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.inner.config
    }

    /// Create a token and start its keepalive schedule
    ///
    /// Replaces any token held before; watchers see the new value.
    pub async fn acquire(&self) -> Result<SessionToken> {
        let validity = chrono::Duration::from_std(self.inner.config.validity)
            .map_err(|err| BinanceError::Config(format!("token validity out of range: {err}")))?;

        let spec = SignedRequestSpec::new(Method::POST, self.inner.config.endpoint.clone());
        let response: ListenKeyResponse =
            serde_json::from_value(self.inner.sender.send_signed(spec).await?)?;
        if response.listen_key.is_empty() {
            return Err(BinanceError::Authentication {
                message: "exchange returned an empty listen key".to_string(),
            });
        }

        let issued_at = Utc::now();
        let token = SessionToken {
            value: response.listen_key,
            issued_at,
            expires_at: issued_at + validity,
            last_keep_alive_at: None,
        };

        let previous = self.inner.write_slot().replace(TokenSlot {
            token: token.clone(),
            state: TokenState::Valid,
            deadline: Instant::now() + self.inner.config.validity,
        });
        if let Some(previous) = previous
            && previous.token.value != token.value
        {
            debug!(
                previous = %previous.token.masked(),
                listen_key = %token.masked(),
                "session token replaced"
            );
        }

        self.inner.status_tx.send_replace(Some(TokenStatus {
            value: token.value.clone(),
            state: TokenState::Valid,
        }));
        self.restart_keepalive(&token.value);

        info!(
            listen_key = %token.masked(),
            expires_at = %token.expires_at,
            "session token acquired"
        );
        Ok(token)
    }

    /// Extend validity now, ahead of the background schedule
    pub async fn keep_alive(&self, token: &SessionToken) -> Result<SessionToken> {
        self.inner.keep_alive_value(&token.value).await
    }

    /// Invalidate the token locally and on the exchange
    ///
    /// Releasing an already released token is a no-op.
    pub async fn release(&self, token: &SessionToken) -> Result<()> {
        let state = self
            .inner
            .state_of(&token.value)
            .ok_or_else(|| unmanaged_token(&token.value))?;
        if state == TokenState::Released {
            return Ok(());
        }

        self.stop_keepalive();
        self.inner.transition(&token.value, TokenState::Released);
        info!(listen_key = %token.masked(), "session token released");

        let spec = SignedRequestSpec::new(Method::DELETE, self.inner.config.endpoint.clone())
            .param(LISTEN_KEY_PARAM, &token.value);
        match self.inner.sender.send_signed(spec).await {
            Ok(_) => Ok(()),
            Err(BinanceError::Api { code, .. }) if code == CODE_INVALID_LISTEN_KEY => Ok(()),
            Err(err) => {
                warn!(listen_key = %token.masked(), error = %err, "session token close request failed");
                Err(err)
            }
        }
    }

    /// Current token, only while it is valid
    pub fn current(&self) -> Option<SessionToken> {
        let value = {
            let guard = self.inner.read_slot();
            let slot = guard.as_ref()?;
            if slot.state != TokenState::Valid {
                return None;
            }
            if Instant::now() < slot.deadline {
                return Some(slot.token.clone());
            }
            slot.token.value.clone()
        };
        self.inner.expire(&value);
        None
    }

    pub fn state(&self) -> Option<TokenState> {
        let value = self.inner.read_slot().as_ref()?.token.value.clone();
        // Lazily flips an overdue token to Expired.
        let _ = self.current();
        self.inner.state_of(&value)
    }

    /// Watch token changes: acquisition, replacement, expiry, release
    pub fn subscribe_status(&self) -> watch::Receiver<Option<TokenStatus>> {
        self.inner.status_tx.subscribe()
    }

    /// Stop the background keepalive without touching the token
    pub fn stop_keepalive(&self) {
        if let Some(task) = self.inner.lock_keepalive().take() {
            task.stop();
        }
    }

    /// The exchange declared `value` dead; stop refreshing it
    pub(crate) fn mark_expired(&self, value: &str) {
        if self.inner.state_of(value).is_none() {
            return;
        }
        self.stop_keepalive();
        self.inner.expire(value);
    }

    fn restart_keepalive(&self, value: &str) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_keepalive(
            Arc::downgrade(&self.inner),
            value.to_string(),
            cancel.clone(),
        ));
        if let Some(previous) = self
            .inner
            .lock_keepalive()
            .replace(KeepaliveTask { cancel, handle })
        {
            previous.stop();
        }
    }
}

impl Inner {
    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<TokenSlot>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<TokenSlot>> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_keepalive(&self) -> std::sync::MutexGuard<'_, Option<KeepaliveTask>> {
        self.keepalive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_of(&self, value: &str) -> Option<TokenState> {
        self.read_slot()
            .as_ref()
            .filter(|slot| slot.token.value == value)
            .map(|slot| slot.state)
    }

    fn deadline_of(&self, value: &str) -> Option<Instant> {
        self.read_slot()
            .as_ref()
            .filter(|slot| slot.token.value == value && slot.state == TokenState::Valid)
            .map(|slot| slot.deadline)
    }

    fn transition(&self, value: &str, next: TokenState) -> bool {
        {
            let mut guard = self.write_slot();
            let Some(slot) = guard.as_mut() else {
                return false;
            };
            if slot.token.value != value || !slot.state.can_transition_to(next) {
                return false;
            }
            slot.state = next;
        }
        self.status_tx.send_replace(Some(TokenStatus {
            value: value.to_string(),
            state: next,
        }));
        true
    }

    fn expire(&self, value: &str) {
        if self.transition(value, TokenState::Expired) {
            warn!(listen_key = %mask_token(value), "session token expired");
        }
    }

    fn check_usable(&self, value: &str) -> Result<()> {
        let overdue = {
            let guard = self.read_slot();
            let slot = guard
                .as_ref()
                .filter(|slot| slot.token.value == value)
                .ok_or_else(|| unmanaged_token(value))?;
            match slot.state {
                TokenState::Released => return Err(BinanceError::TokenReleased),
                TokenState::Expired => return Err(BinanceError::TokenExpired),
                TokenState::Valid => Instant::now() >= slot.deadline,
            }
        };
        if overdue {
            self.expire(value);
            return Err(BinanceError::TokenExpired);
        }
        Ok(())
    }

    async fn keep_alive_value(&self, value: &str) -> Result<SessionToken> {
        self.check_usable(value)?;

        let spec = SignedRequestSpec::new(Method::PUT, self.config.endpoint.clone())
            .param(LISTEN_KEY_PARAM, value);
        match self.sender.send_signed(spec).await {
            Ok(_) => {}
            Err(BinanceError::Api { code, .. }) if code == CODE_INVALID_LISTEN_KEY => {
                self.expire(value);
                return Err(BinanceError::TokenExpired);
            }
            Err(err) => return Err(err),
        }

        let now = Utc::now();
        let validity = chrono::Duration::from_std(self.config.validity)
            .map_err(|err| BinanceError::Config(format!("token validity out of range: {err}")))?;
        let refreshed = {
            let mut guard = self.write_slot();
            match guard.as_mut() {
                Some(slot) if slot.token.value == value && slot.state == TokenState::Valid => {
                    slot.deadline = Instant::now() + self.config.validity;
                    slot.token.expires_at = now + validity;
                    slot.token.last_keep_alive_at = Some(now);
                    slot.token.clone()
                }
                Some(slot) if slot.token.value == value && slot.state == TokenState::Released => {
                    return Err(BinanceError::TokenReleased);
                }
                _ => return Err(BinanceError::TokenExpired),
            }
        };
        self.status_tx.send_replace(Some(TokenStatus {
            value: value.to_string(),
            state: TokenState::Valid,
        }));
        Ok(refreshed)
    }

    fn next_keepalive(&self, deadline: Instant) -> Instant {
        (Instant::now() + self.config.keepalive_interval).min(deadline)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let task = self
            .keepalive
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop();
        }
    }
}

fn unmanaged_token(value: &str) -> BinanceError {
    BinanceError::Authentication {
        message: format!("session token {} is not managed here", mask_token(value)),
    }
}

async fn run_keepalive(inner: Weak<Inner>, value: String, cancel: CancellationToken) {
    let mut next_fire = {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let Some(deadline) = strong.deadline_of(&value) else {
            return;
        };
        strong.next_keepalive(deadline)
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next_fire) => {}
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        match strong.keep_alive_value(&value).await {
            Ok(token) => {
                debug!(
                    listen_key = %token.masked(),
                    expires_at = %token.expires_at,
                    "session token kept alive"
                );
                let Some(deadline) = strong.deadline_of(&value) else {
                    return;
                };
                next_fire = strong.next_keepalive(deadline);
            }
            Err(err) if err.is_auth_error() => {
                strong.expire(&value);
                return;
            }
            Err(err) => {
                let Some(deadline) = strong.deadline_of(&value) else {
                    return;
                };
                let retry_at = Instant::now() + strong.config.retry_delay;
                if retry_at < deadline {
                    warn!(
                        listen_key = %mask_token(&value),
                        error = %err,
                        retry_in_ms = strong.config.retry_delay.as_millis() as u64,
                        "session token keepalive failed, retrying"
                    );
                    next_fire = retry_at;
                    continue;
                }

                warn!(
                    listen_key = %mask_token(&value),
                    error = %err,
                    "session token keepalive failed, no retry fits before expiry"
                );
                drop(strong);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                if let Some(strong) = inner.upgrade() {
                    strong.expire(&value);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Call {
        method: Method,
        params: Vec<(String, String)>,
        at: Instant,
    }

    #[derive(Default)]
    struct MockSender {
        calls: Mutex<Vec<Call>>,
        keepalive_error: Mutex<Option<i32>>,
        issued: AtomicUsize,
    }

    impl MockSender {
        fn calls_with(&self, method: Method) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.method == method)
                .cloned()
                .collect()
        }

        fn fail_keepalive_with(&self, code: i32) {
            *self.keepalive_error.lock().unwrap() = Some(code);
        }
    }

    #[async_trait]
    impl RequestSender for MockSender {
        async fn send_signed(&self, spec: SignedRequestSpec) -> Result<serde_json::Value> {
            self.calls.lock().unwrap().push(Call {
                method: spec.method.clone(),
                params: spec.params.clone(),
                at: Instant::now(),
            });
            if spec.method == Method::PUT
                && let Some(code) = *self.keepalive_error.lock().unwrap()
            {
                return Err(BinanceError::Api {
                    code,
                    message: "mock failure".to_string(),
                });
            }
            if spec.method == Method::POST {
                let n = self.issued.fetch_add(1, Ordering::SeqCst);
                return Ok(json!({ "listenKey": format!("listen-key-{n}") }));
            }
            Ok(json!({}))
        }
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test(start_paused = true)]
    async fn test_mark_expired_stops_keepalive() {
        let sender = Arc::new(MockSender::default());
        let manager =
            SessionTokenManager::new(sender.clone(), TokenConfig::default()).unwrap();
        let token = manager.acquire().await.unwrap();

        manager.mark_expired("some-other-key");
        assert_eq!(manager.state(), Some(TokenState::Valid));

        manager.mark_expired(&token.value);
        assert_eq!(manager.state(), Some(TokenState::Expired));
        assert!(manager.current().is_none());

        tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
        assert!(sender.calls_with(Method::PUT).is_empty());
        assert!(matches!(
            manager.keep_alive(&token).await,
            Err(BinanceError::TokenExpired)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_fires_before_expiry() {
        let sender = Arc::new(MockSender::default());
        let manager =
            SessionTokenManager::new(sender.clone(), TokenConfig::with_validity(DAY)).unwrap();

        let issued = Instant::now();
        let token = manager.acquire().await.unwrap();
        assert_eq!(token.expires_at - token.issued_at, chrono::Duration::hours(24));

        tokio::time::sleep(DAY - Duration::from_secs(1)).await;

        let keepalives = sender.calls_with(Method::PUT);
        assert!(!keepalives.is_empty(), "no keepalive before expiry");
        assert!(keepalives[0].at < issued + DAY);
        assert_eq!(
            keepalives[0].params,
            vec![("listenKey".to_string(), token.value.clone())]
        );
        assert_eq!(manager.state(), Some(TokenState::Valid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_stays_valid_across_many_windows() {
        let sender = Arc::new(MockSender::default());
        let manager =
            SessionTokenManager::new(sender.clone(), TokenConfig::with_validity(DAY)).unwrap();
        manager.acquire().await.unwrap();

        tokio::time::sleep(DAY * 3).await;

        assert!(sender.calls_with(Method::PUT).len() >= 5);
        let current = manager.current().unwrap();
        assert!(current.last_keep_alive_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_keepalive_expires_token() {
        let sender = Arc::new(MockSender::default());
        sender.fail_keepalive_with(-1001);
        let config = TokenConfig {
            retry_delay: Duration::from_secs(10 * 60),
            ..TokenConfig::default()
        };
        let manager = SessionTokenManager::new(sender.clone(), config).unwrap();
        let mut status = manager.subscribe_status();
        let token = manager.acquire().await.unwrap();

        tokio::time::sleep(Duration::from_secs(61 * 60)).await;

        // Fires at 30m, then retries at 40m and 50m.
        assert_eq!(sender.calls_with(Method::PUT).len(), 3);
        assert_eq!(manager.state(), Some(TokenState::Expired));
        assert!(manager.current().is_none());
        assert_eq!(
            status.borrow_and_update().as_ref().map(|s| s.state),
            Some(TokenState::Expired)
        );

        let err = manager.keep_alive(&token).await.unwrap_err();
        assert!(matches!(err, BinanceError::TokenExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_listen_key_expires_immediately() {
        let sender = Arc::new(MockSender::default());
        sender.fail_keepalive_with(CODE_INVALID_LISTEN_KEY);
        let manager = SessionTokenManager::new(sender.clone(), TokenConfig::default()).unwrap();
        let token = manager.acquire().await.unwrap();

        let err = manager.keep_alive(&token).await.unwrap_err();
        assert!(matches!(err, BinanceError::TokenExpired));
        assert_eq!(manager.state(), Some(TokenState::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_terminal_and_idempotent() {
        let sender = Arc::new(MockSender::default());
        let manager = SessionTokenManager::new(sender.clone(), TokenConfig::default()).unwrap();
        let token = manager.acquire().await.unwrap();

        manager.release(&token).await.unwrap();
        manager.release(&token).await.unwrap();

        assert_eq!(sender.calls_with(Method::DELETE).len(), 1);
        assert_eq!(manager.state(), Some(TokenState::Released));
        let err = manager.keep_alive(&token).await.unwrap_err();
        assert!(matches!(err, BinanceError::TokenReleased));

        // Keepalive task is gone.
        tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
        assert!(sender.calls_with(Method::PUT).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_replaces_previous_token() {
        let sender = Arc::new(MockSender::default());
        let manager = SessionTokenManager::new(sender.clone(), TokenConfig::default()).unwrap();
        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();

        assert_ne!(first.value, second.value);
        assert_eq!(manager.current().unwrap().value, second.value);
        assert!(manager.keep_alive(&first).await.unwrap_err().is_auth_error());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TokenConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keepalive_interval, Duration::from_secs(30 * 60));

        config.keepalive_interval = config.validity;
        assert!(matches!(config.validate(), Err(BinanceError::Config(_))));
    }
}
