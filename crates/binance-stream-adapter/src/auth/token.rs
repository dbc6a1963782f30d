/*
[INPUT]:  Listen key value and validity window
[OUTPUT]: SessionToken data and its lifecycle state
[POS]:    Auth layer - session token model
[UPDATE]: When token lifecycle rules change
*/

use chrono::{DateTime, Utc};

/// Lifecycle of a session token
///
/// `Valid -> Valid` is a keepalive. Nothing returns to `Valid` once it has
/// left it; a fresh token has to be acquired instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    Expired,
    Released,
}

impl TokenState {
    pub fn can_transition_to(self, next: TokenState) -> bool {
        matches!(
            (self, next),
            (TokenState::Valid, TokenState::Valid)
                | (TokenState::Valid, TokenState::Expired)
                | (TokenState::Valid, TokenState::Released)
                | (TokenState::Expired, TokenState::Released)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TokenState::Valid)
    }
}

/// Authorization for the private user-data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_keep_alive_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Prefix safe to put in logs
    pub fn masked(&self) -> String {
        mask_token(&self.value)
    }
}

pub(crate) fn mask_token(value: &str) -> String {
    let prefix: String = value.chars().take(8).collect();
    format!("{prefix}...")
}

/// Snapshot published to watchers of the token manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub value: String,
    pub state: TokenState,
}
