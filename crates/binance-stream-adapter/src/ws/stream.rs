/*
[INPUT]:  Symbol, event kind and stream options
[OUTPUT]: Canonical stream names and stream URLs
[POS]:    WebSocket layer - stream naming
[UPDATE]: When the exchange adds stream kinds or URL layouts
*/

use std::fmt;

use url::Url;

use crate::http::{BinanceError, Result};
use crate::types::{DepthSpeed, KlineInterval};

/// Registry key of the user-data stream
pub const USER_DATA_STREAM_ID: &str = "userData";

const PARTIAL_DEPTH_LEVELS: [u8; 3] = [5, 10, 20];

/// A logical stream to subscribe to
///
/// `id` is the registry key, `name` what goes on the wire. They only differ
/// for the user-data stream, whose wire name is the listen key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamSpec {
    id: String,
    name: String,
    dedicated: bool,
}

impl StreamSpec {
    /// Any stream name, used verbatim
    pub fn raw(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            dedicated: false,
        }
    }

    pub fn kline(symbol: &str, interval: KlineInterval) -> Self {
        Self::raw(format!("{}@kline_{}", symbol.to_lowercase(), interval.as_str()))
    }

    pub fn trade(symbol: &str) -> Self {
        Self::raw(format!("{}@trade", symbol.to_lowercase()))
    }

    pub fn agg_trade(symbol: &str) -> Self {
        Self::raw(format!("{}@aggTrade", symbol.to_lowercase()))
    }

    pub fn ticker(symbol: &str) -> Self {
        Self::raw(format!("{}@ticker", symbol.to_lowercase()))
    }

    pub fn mini_ticker(symbol: &str) -> Self {
        Self::raw(format!("{}@miniTicker", symbol.to_lowercase()))
    }

    pub fn book_ticker(symbol: &str) -> Self {
        Self::raw(format!("{}@bookTicker", symbol.to_lowercase()))
    }

    /// Top 5, 10 or 20 levels
    pub fn partial_depth(symbol: &str, levels: u8, speed: DepthSpeed) -> Result<Self> {
        if !PARTIAL_DEPTH_LEVELS.contains(&levels) {
            return Err(BinanceError::Config(format!(
                "partial depth levels must be one of 5, 10, 20 (got {levels})"
            )));
        }
        Ok(Self::raw(format!(
            "{}@depth{levels}{}",
            symbol.to_lowercase(),
            speed_suffix(speed)
        )))
    }

    pub fn diff_depth(symbol: &str, speed: DepthSpeed) -> Self {
        Self::raw(format!("{}@depth{}", symbol.to_lowercase(), speed_suffix(speed)))
    }

    /// Private stream, always on its own connection
    pub fn user_data(listen_key: impl Into<String>) -> Self {
        Self {
            id: USER_DATA_STREAM_ID.to_string(),
            name: listen_key.into(),
            dedicated: true,
        }
    }

    /// Ask for a connection of its own
    pub fn dedicated(mut self) -> Self {
        self.dedicated = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }
}

impl From<&str> for StreamSpec {
    fn from(name: &str) -> Self {
        Self::raw(name)
    }
}

impl fmt::Display for StreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

fn speed_suffix(speed: DepthSpeed) -> &'static str {
    match speed {
        DepthSpeed::Standard => "",
        DepthSpeed::Fast => "@100ms",
    }
}

/// Parse a WebSocket base, which must be an absolute `ws`/`wss` URL
pub fn parse_ws_base(base: &str) -> Result<Url> {
    let url = Url::parse(base.trim_end_matches('/'))?;
    match url.scheme() {
        "ws" | "wss" if url.has_host() => Ok(url),
        scheme => Err(BinanceError::Config(format!(
            "websocket base {base} needs a ws or wss scheme and a host, got scheme {scheme}"
        ))),
    }
}

/// `{base}/ws/{name}`
pub fn single_stream_url(base: &str, name: &str) -> Result<Url> {
    Ok(Url::parse(&format!("{}/ws/{name}", base.trim_end_matches('/')))?)
}

/// `{base}/stream?streams={a}/{b}/...`
pub fn combined_stream_url(base: &str, names: &[String]) -> Result<Url> {
    if names.is_empty() {
        return Err(BinanceError::Config(
            "combined stream URL needs at least one stream".to_string(),
        ));
    }
    Ok(Url::parse(&format!(
        "{}/stream?streams={}",
        base.trim_end_matches('/'),
        names.join("/")
    ))?)
}
