/*
[INPUT]:  Request sender and token timing configuration
[OUTPUT]: Session tokens (listen keys) and their lifecycle state
[POS]:    Auth layer - handles private stream authorization
[UPDATE]: When auth flow or token lifecycle changes
*/

pub mod manager;
pub mod token;

pub use manager::{DEFAULT_LISTEN_KEY_PATH, SessionTokenManager, TokenConfig};
pub use token::{SessionToken, TokenState, TokenStatus};
