/*
[INPUT]:  Stream configuration, stream specs with callback bundles, token manager
[OUTPUT]: Public streaming entry point (subscribe / unsubscribe / user data / close)
[POS]:    WebSocket layer - streaming client facade
[UPDATE]: When changing the public streaming API or user-data supervision
*/

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{SessionToken, SessionTokenManager, TokenState, TokenStatus};
use crate::http::{BinanceError, Result};
use crate::types::Environment;
use crate::ws::backoff::{BackoffConfig, MAX_JITTER_RATIO};
use crate::ws::callbacks::CallbackBundle;
use crate::ws::connection::{ConnectionConfig, ConnectionHandle, ConnectionState};
use crate::ws::registry::{
    CombinedPolicy, GroupingPolicy, RegistryConfig, SubscriptionHandle, SubscriptionRegistry,
};
use crate::ws::sink::ErrorSink;
use crate::ws::stream::{StreamSpec, USER_DATA_STREAM_ID, parse_ws_base};
use crate::ws::transport::{Connector, TungsteniteConnector};

/// Streaming client configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub environment: Environment,
    /// Overrides the environment's WebSocket base
    pub ws_base_url: Option<String>,
    pub grouping: Arc<dyn GroupingPolicy>,
    pub backoff: BackoffConfig,
    pub idle_timeout: Duration,
    pub ping_interval: Option<Duration>,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    pub dispatch_capacity: usize,
    pub dispatch_timeout: Duration,
    pub max_reconnect_attempts: Option<u32>,
    /// Buffer of the global error channel
    pub error_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            environment: Environment::default(),
            ws_base_url: None,
            grouping: Arc::new(CombinedPolicy::default()),
            backoff: connection.backoff,
            idle_timeout: connection.idle_timeout,
            ping_interval: connection.ping_interval,
            send_timeout: connection.send_timeout,
            connect_timeout: connection.connect_timeout,
            dispatch_capacity: 1024,
            dispatch_timeout: connection.dispatch_timeout,
            max_reconnect_attempts: connection.max_reconnect_attempts,
            error_capacity: 256,
        }
    }
}

impl StreamConfig {
    pub fn ws_base(&self) -> String {
        self.ws_base_url
            .clone()
            .unwrap_or_else(|| self.environment.ws_base_url().to_string())
    }

    pub fn validate(&self) -> Result<()> {
        parse_ws_base(&self.ws_base())?;
        if self.dispatch_capacity == 0 {
            return Err(BinanceError::Config(
                "dispatch capacity must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() || self.send_timeout.is_zero() {
            return Err(BinanceError::Config(
                "idle and send timeouts must be non-zero".to_string(),
            ));
        }
        if let Some(ping) = self.ping_interval
            && (ping.is_zero() || ping >= self.idle_timeout)
        {
            return Err(BinanceError::Config(format!(
                "ping interval {}ms must be non-zero and shorter than idle timeout {}ms",
                ping.as_millis(),
                self.idle_timeout.as_millis()
            )));
        }
        if self.backoff.initial.is_zero() || self.backoff.max < self.backoff.initial {
            return Err(BinanceError::Config(
                "backoff needs a non-zero initial delay no larger than its cap".to_string(),
            ));
        }
        if !self.backoff.jitter.is_valid() {
            return Err(BinanceError::Config(format!(
                "backoff jitter {:?} must be a finite ratio within 0..={MAX_JITTER_RATIO}",
                self.backoff.jitter
            )));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(BinanceError::Config(
                "max reconnect attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            backoff: self.backoff,
            idle_timeout: self.idle_timeout,
            ping_interval: self.ping_interval,
            send_timeout: self.send_timeout,
            connect_timeout: self.connect_timeout,
            dispatch_timeout: self.dispatch_timeout,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

struct UserDataSession {
    token: SessionToken,
    handle: SubscriptionHandle,
    supervisor: CancellationToken,
}

/// Streaming client for market and user data
///
/// Owns one [`SubscriptionRegistry`] and, through it, every connection.
/// Everything a caller must know after setup arrives through callbacks or
/// the global error channel.
pub struct StreamingClient {
    config: StreamConfig,
    registry: SubscriptionRegistry,
    errors: ErrorSink,
    error_rx: Mutex<Option<mpsc::Receiver<BinanceError>>>,
    tokens: Option<SessionTokenManager>,
    user_data: tokio::sync::Mutex<Option<UserDataSession>>,
}

impl std::fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingClient")
            .field("ws_base", &self.config.ws_base())
            .field("registry", &self.registry)
            .field("user_data", &self.tokens.is_some())
            .finish()
    }
}

impl StreamingClient {
    /// Client dialing real sockets
    pub fn new(config: StreamConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(config: StreamConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let (errors, error_rx) = ErrorSink::channel(config.error_capacity);
        let registry = SubscriptionRegistry::new(
            RegistryConfig {
                ws_base_url: config.ws_base(),
                connection: config.connection_config(),
                dispatch_capacity: config.dispatch_capacity,
            },
            config.grouping.clone(),
            connector,
            errors.clone(),
        );

        Ok(Self {
            config,
            registry,
            errors,
            error_rx: Mutex::new(Some(error_rx)),
            tokens: None,
            user_data: tokio::sync::Mutex::new(None),
        })
    }

    /// Enable the user-data pathway
    pub fn with_token_manager(mut self, tokens: SessionTokenManager) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn token_manager(&self) -> Option<&SessionTokenManager> {
        self.tokens.as_ref()
    }

    /// Subscribe `spec`; conflicts and bad specs fail here, synchronously
    pub fn subscribe(
        &self,
        spec: StreamSpec,
        bundle: Arc<CallbackBundle>,
    ) -> Result<SubscriptionHandle> {
        self.registry.subscribe(spec, bundle)
    }

    pub fn unsubscribe(&self, stream_id: &str) -> bool {
        self.registry.unsubscribe(stream_id)
    }

    /// Errors no subscription owns. Can be taken once.
    pub fn take_error_receiver(&self) -> Option<mpsc::Receiver<BinanceError>> {
        self.error_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn active_streams(&self) -> Vec<String> {
        self.registry.active_streams()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn connection_state(&self, stream_id: &str) -> Option<ConnectionState> {
        self.registry.connection_state(stream_id)
    }

    pub fn connection(&self, stream_id: &str) -> Option<ConnectionHandle> {
        self.registry.connection_for(stream_id)
    }

    /// Acquire a session token and stream private account events
    ///
    /// The stream is torn down when the token expires, is released or
    /// replaced, or the exchange sends `listenKeyExpired`; the bundle then
    /// receives `TokenExpired` or `TokenReleased` through `on_error`.
    pub async fn subscribe_user_data(
        &self,
        bundle: Arc<CallbackBundle>,
    ) -> Result<SubscriptionHandle> {
        let tokens = self.tokens.as_ref().ok_or_else(|| {
            BinanceError::Config("user-data stream needs a session token manager".to_string())
        })?;

        let mut session = self.user_data.lock().await;
        if let Some(existing) = session.as_ref() {
            if existing.handle.is_active() {
                return Err(BinanceError::AlreadySubscribed {
                    stream: USER_DATA_STREAM_ID.to_string(),
                });
            }
            existing.supervisor.cancel();
        }

        let token = tokens.acquire().await?;
        let expired = Arc::new(Notify::new());
        let signal = expired.clone();
        let bundle = Arc::new(
            (*bundle)
                .clone()
                .with_listen_key_expired_hook(move |_| signal.notify_one()),
        );

        let handle = match self
            .registry
            .subscribe(StreamSpec::user_data(token.value.clone()), bundle.clone())
        {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(release_err) = tokens.release(&token).await {
                    warn!(error = %release_err, "session token release after failed subscribe");
                }
                return Err(err);
            }
        };

        let supervisor = CancellationToken::new();
        tokio::spawn(supervise_user_data(UserDataWatch {
            tokens: tokens.clone(),
            status: tokens.subscribe_status(),
            expired,
            cancel: supervisor.clone(),
            token_value: token.value.clone(),
            handle: handle.clone(),
            bundle,
            errors: self.errors.clone(),
        }));

        info!(listen_key = %token.masked(), "user-data stream subscribed");
        *session = Some(UserDataSession {
            token,
            handle: handle.clone(),
            supervisor,
        });
        Ok(handle)
    }

    /// Unsubscribe the user-data stream and release its token
    pub async fn close_user_data(&self) -> Result<()> {
        let Some(session) = self.user_data.lock().await.take() else {
            return Ok(());
        };
        session.supervisor.cancel();
        session.handle.unsubscribe();

        let Some(tokens) = &self.tokens else {
            return Ok(());
        };
        let still_held = tokens
            .subscribe_status()
            .borrow()
            .as_ref()
            .is_some_and(|status| status.value == session.token.value);
        if !still_held {
            // Replaced by a newer acquire; nothing of ours left to release.
            return Ok(());
        }
        tokens.release(&session.token).await
    }

    /// Close every stream and wait for the connections to finish
    pub async fn close(&self) {
        if let Err(err) = self.close_user_data().await {
            warn!(error = %err, "user-data stream close failed");
        }
        self.registry.close_all().await;
        info!("streaming client closed");
    }
}

struct UserDataWatch {
    tokens: SessionTokenManager,
    status: watch::Receiver<Option<TokenStatus>>,
    expired: Arc<Notify>,
    cancel: CancellationToken,
    token_value: String,
    handle: SubscriptionHandle,
    bundle: Arc<CallbackBundle>,
    errors: ErrorSink,
}

async fn supervise_user_data(mut watch: UserDataWatch) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = watch.cancel.cancelled() => return,
            _ = watch.expired.notified() => {
                watch.tokens.mark_expired(&watch.token_value);
                break BinanceError::TokenExpired;
            }
            changed = watch.status.changed() => {
                if changed.is_err() {
                    break BinanceError::TokenExpired;
                }
                let status = watch.status.borrow_and_update().clone();
                match status {
                    Some(status) if status.value == watch.token_value => match status.state {
                        TokenState::Valid => continue,
                        TokenState::Expired => break BinanceError::TokenExpired,
                        TokenState::Released => break BinanceError::TokenReleased,
                    },
                    // Replaced by a new token or cleared.
                    _ => break BinanceError::TokenExpired,
                }
            }
        }
    };

    warn!(stream = USER_DATA_STREAM_ID, error = %reason, "user-data stream torn down");
    watch.handle.unsubscribe();
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| watch.bundle.fire_error(&reason)))
        .unwrap_or(true);
    if !delivered {
        watch.errors.report(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;
    use crate::ws::backoff::JitterPolicy;
    use crate::ws::transport::MemoryConnector;

    #[test]
    fn test_stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.ws_base(), "wss://stream.binance.com:9443");
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());

        let testnet = StreamConfig {
            environment: Environment::Testnet,
            ..StreamConfig::default()
        };
        assert_eq!(testnet.ws_base(), "wss://testnet.binance.vision");
    }

    #[test]
    fn test_stream_config_rejects_ping_beyond_idle() {
        let config = StreamConfig {
            ping_interval: Some(Duration::from_secs(90)),
            ..StreamConfig::default()
        };
        assert!(matches!(config.validate(), Err(BinanceError::Config(_))));

        let config = StreamConfig {
            dispatch_capacity: 0,
            ..StreamConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stream_config_rejects_bad_base_and_jitter() {
        let relative = StreamConfig {
            ws_base_url: Some("stream.binance.com".to_string()),
            ..StreamConfig::default()
        };
        assert!(matches!(relative.validate(), Err(BinanceError::UrlParse(_))));
        assert!(
            StreamingClient::with_connector(relative, Arc::new(MemoryConnector::new())).is_err()
        );

        let https = StreamConfig {
            ws_base_url: Some("https://stream.binance.com".to_string()),
            ..StreamConfig::default()
        };
        assert!(matches!(https.validate(), Err(BinanceError::Config(_))));

        for ratio in [1e300, f64::INFINITY, f64::NAN, -0.5] {
            let config = StreamConfig {
                backoff: BackoffConfig {
                    jitter: JitterPolicy::Proportional(ratio),
                    ..BackoffConfig::default()
                },
                ..StreamConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(BinanceError::Config(_))),
                "ratio {ratio} accepted"
            );
        }
    }

    #[test]
    fn test_error_receiver_taken_once() {
        let client =
            StreamingClient::with_connector(StreamConfig::default(), Arc::new(MemoryConnector::new()))
                .unwrap();
        assert!(client.take_error_receiver().is_some());
        assert!(client.take_error_receiver().is_none());
    }

    #[tokio::test]
    async fn test_user_data_requires_token_manager() {
        let client =
            StreamingClient::with_connector(StreamConfig::default(), Arc::new(MemoryConnector::new()))
                .unwrap();
        let result = client
            .subscribe_user_data(CallbackBundle::builder().build())
            .await;
        assert!(matches!(result, Err(BinanceError::Config(_))));
        assert!(client.close_user_data().await.is_ok());
    }
}
