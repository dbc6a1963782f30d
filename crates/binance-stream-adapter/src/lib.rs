/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public Binance streaming adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod auth;
pub mod http;
pub mod types;
pub mod ws;

// Re-export commonly used types from auth
pub use auth::{SessionToken, SessionTokenManager, TokenConfig, TokenState, TokenStatus};

// Re-export commonly used types from http
pub use http::{
    BinanceClient,
    BinanceError,
    ClientConfig,
    Credentials,
    RequestSender,
    RequestSigner,
    Result,
};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    CallbackBundle,
    CombinedPolicy,
    ConnectionState,
    DedicatedPolicy,
    StreamConfig,
    StreamEvent,
    StreamSpec,
    StreamingClient,
    SubscriptionHandle,
};
