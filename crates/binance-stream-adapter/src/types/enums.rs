/*
[INPUT]:  Exchange naming rules and environment selection
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use serde::{Deserialize, Serialize};

const PRODUCTION_REST_URL: &str = "https://api.binance.com";
const PRODUCTION_WS_URL: &str = "wss://stream.binance.com:9443";
const TESTNET_REST_URL: &str = "https://testnet.binance.vision";
const TESTNET_WS_URL: &str = "wss://testnet.binance.vision";

/// Exchange environment, selects REST and WebSocket bases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    #[serde(alias = "sandbox")]
    Testnet,
}

impl Environment {
    pub fn rest_base_url(self) -> &'static str {
        match self {
            Environment::Production => PRODUCTION_REST_URL,
            Environment::Testnet => TESTNET_REST_URL,
        }
    }

    pub fn ws_base_url(self) -> &'static str {
        match self {
            Environment::Production => PRODUCTION_WS_URL,
            Environment::Testnet => TESTNET_WS_URL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl KlineInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            KlineInterval::S1 => "1s",
            KlineInterval::M1 => "1m",
            KlineInterval::M3 => "3m",
            KlineInterval::M5 => "5m",
            KlineInterval::M15 => "15m",
            KlineInterval::M30 => "30m",
            KlineInterval::H1 => "1h",
            KlineInterval::H2 => "2h",
            KlineInterval::H4 => "4h",
            KlineInterval::H6 => "6h",
            KlineInterval::H8 => "8h",
            KlineInterval::H12 => "12h",
            KlineInterval::D1 => "1d",
            KlineInterval::D3 => "3d",
            KlineInterval::W1 => "1w",
            KlineInterval::Mo1 => "1M",
        }
    }
}

/// Depth stream push cadence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthSpeed {
    #[default]
    #[serde(rename = "1000ms")]
    Standard,
    #[serde(rename = "100ms")]
    Fast,
}

/// Decoded event kind, keyed by the `e` discriminator on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Kline,
    Trade,
    AggTrade,
    Ticker,
    MiniTicker,
    BookTicker,
    DepthUpdate,
    PartialDepth,
    ExecutionReport,
    AccountPosition,
    BalanceUpdate,
    ListStatus,
    ListenKeyExpired,
}

impl EventKind {
    /// Map the `e` field of a frame to its kind
    pub fn from_discriminator(tag: &str) -> Option<Self> {
        let kind = match tag {
            "kline" => EventKind::Kline,
            "trade" => EventKind::Trade,
            "aggTrade" => EventKind::AggTrade,
            "24hrTicker" => EventKind::Ticker,
            "24hrMiniTicker" => EventKind::MiniTicker,
            "bookTicker" => EventKind::BookTicker,
            "depthUpdate" => EventKind::DepthUpdate,
            "executionReport" => EventKind::ExecutionReport,
            "outboundAccountPosition" => EventKind::AccountPosition,
            "balanceUpdate" => EventKind::BalanceUpdate,
            "listStatus" => EventKind::ListStatus,
            "listenKeyExpired" => EventKind::ListenKeyExpired,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Kline => "kline",
            EventKind::Trade => "trade",
            EventKind::AggTrade => "aggTrade",
            EventKind::Ticker => "24hrTicker",
            EventKind::MiniTicker => "24hrMiniTicker",
            EventKind::BookTicker => "bookTicker",
            EventKind::DepthUpdate => "depthUpdate",
            EventKind::PartialDepth => "partialDepth",
            EventKind::ExecutionReport => "executionReport",
            EventKind::AccountPosition => "outboundAccountPosition",
            EventKind::BalanceUpdate => "balanceUpdate",
            EventKind::ListStatus => "listStatus",
            EventKind::ListenKeyExpired => "listenKeyExpired",
        }
    }
}
