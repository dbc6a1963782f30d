/*
[INPUT]:  HTTP client configuration and API endpoints
[OUTPUT]: HTTP responses, signed requests and crate-wide errors
[POS]:    HTTP layer - REST API communication
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod client;
pub mod error;
pub mod signature;

pub use error::{BinanceError, Result};
pub use signature::{FixedClock, RequestSigner, SignedParams, SystemClock, TimestampProvider};

pub use client::{BinanceClient, ClientConfig, Credentials, RequestSender};
