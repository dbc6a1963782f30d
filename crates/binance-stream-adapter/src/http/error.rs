/*
[INPUT]:  Error sources (HTTP, API, serialization, auth, WebSocket, dispatch)
[OUTPUT]: Structured error types with context and retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or improving error messages
*/

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Provider code: internal error, unable to process request.
pub const CODE_DISCONNECTED: i32 = -1001;
/// Provider code: too many requests queued.
pub const CODE_TOO_MANY_REQUESTS: i32 = -1003;
/// Provider code: timeout waiting for backend.
pub const CODE_TIMEOUT: i32 = -1007;
/// Provider code: timestamp outside of recvWindow.
pub const CODE_INVALID_TIMESTAMP: i32 = -1021;
/// Provider code: signature not valid.
pub const CODE_INVALID_SIGNATURE: i32 = -1022;
/// Provider code: listen key does not exist.
pub const CODE_INVALID_LISTEN_KEY: i32 = -1125;
/// Provider code: invalid API key, IP, or permissions.
pub const CODE_REJECTED_API_KEY: i32 = -2015;

/// Main error type for the Binance stream adapter
#[derive(Error, Debug)]
pub enum BinanceError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error (code {code}): {message}")]
    Api { code: i32, message: String },

    /// Authentication failed
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Session token expired before it was kept alive
    #[error("Session token expired, a new token must be acquired")]
    TokenExpired,

    /// Session token was explicitly released
    #[error("Session token released")]
    TokenReleased,

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation needs a connected socket
    #[error("Connection is not connected")]
    NotConnected,

    /// Operation timed out
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: &'static str, duration_ms: u64 },

    /// Stream already registered with a different callback bundle
    #[error("Stream {stream} is already subscribed with a different callback bundle")]
    AlreadySubscribed { stream: String },

    /// Reconnect attempts exhausted, connection closed for good
    #[error("Reconnect gave up after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Inbound frame could not be decoded
    #[error("Failed to decode frame{}: {message}", stream_suffix(.stream))]
    Decode { stream: Option<String>, message: String },

    /// A subscription handler returned an error
    #[error("Handler for {stream} failed: {message}")]
    Handler { stream: String, message: String },

    /// Frame arrived for a stream with no registered subscription
    #[error("Unroutable frame{}", stream_suffix(.stream))]
    UnroutableFrame { stream: Option<String> },

    /// Dispatch queue stayed full for longer than the enqueue timeout
    #[error("Dispatch queue full, dropped frame on connection {connection_id}")]
    DispatchOverflow { connection_id: String },
}

fn stream_suffix(stream: &Option<String>) -> String {
    match stream {
        Some(stream) => format!(" on stream {stream}"),
        None => String::new(),
    }
}

/// Provider error body: `{"code": -1121, "msg": "Invalid symbol."}`
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i32,
    msg: String,
}

impl BinanceError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            BinanceError::Http(_)
            | BinanceError::Timeout { .. }
            | BinanceError::WebSocket(_)
            | BinanceError::NotConnected => true,
            // Positive codes are HTTP statuses from non-provider bodies.
            BinanceError::Api { code, .. } => matches!(
                *code,
                CODE_DISCONNECTED | CODE_TOO_MANY_REQUESTS | CODE_TIMEOUT | 429 | 500..=599
            ),
            _ => false,
        }
    }

    /// Get retry delay in seconds (if retryable)
    pub fn retry_delay(&self) -> Option<u64> {
        match self {
            BinanceError::Api { code, .. } if matches!(*code, CODE_TOO_MANY_REQUESTS | 429) => {
                Some(60)
            }
            BinanceError::Timeout { .. } => Some(1),
            _ if self.is_retryable() => Some(1),
            _ => None,
        }
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        match self {
            BinanceError::Authentication { .. }
            | BinanceError::TokenExpired
            | BinanceError::TokenReleased => true,
            BinanceError::Api { code, .. } => matches!(
                *code,
                CODE_INVALID_SIGNATURE | CODE_INVALID_LISTEN_KEY | CODE_REJECTED_API_KEY
            ),
            _ => false,
        }
    }

    /// Errors that must not be retried with the same inputs
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BinanceError::Config(_) | BinanceError::ReconnectExhausted { .. }
        ) || self.is_auth_error()
    }

    /// Create an API error from status code and message
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        BinanceError::Api {
            code: status.as_u16() as i32,
            message: message.into(),
        }
    }

    /// Map a non-success response body to a structured API error.
    ///
    /// Falls back to the HTTP status when the body is not a provider error.
    pub fn from_api_body(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ApiErrorBody>(body) {
            Ok(parsed) => BinanceError::Api {
                code: parsed.code,
                message: parsed.msg,
            },
            Err(_) => BinanceError::api_error(status, body.trim()),
        }
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, BinanceError>;
