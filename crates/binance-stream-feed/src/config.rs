/*
[INPUT]:  YAML configuration file plus BINANCE_STREAM__* environment overrides
[OUTPUT]: Validated feed configuration and the adapter's library configs
[POS]:    Configuration layer - feed setup
[UPDATE]: When adding new configuration options
*/

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config::{Config, Environment as EnvSource, File, FileFormat};
use serde::Deserialize;

use binance_stream_adapter::ws::{BackoffConfig, GroupingPolicy, JitterPolicy};
use binance_stream_adapter::{
    ClientConfig, CombinedPolicy, Credentials, DedicatedPolicy, DepthSpeed, Environment,
    KlineInterval, StreamConfig, StreamSpec, TokenConfig,
};

pub const ENV_PREFIX: &str = "BINANCE_STREAM";
const ENV_SEPARATOR: &str = "__";

/// Top-level configuration for the stream feed
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Only needed for the user-data stream
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    /// Subscribe the account's user-data stream
    #[serde(default)]
    pub user_data: bool,
    #[serde(default)]
    pub streams: Vec<StreamEntry>,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub token: TokenSettings,
}

#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Kline,
    Trade,
    AggTrade,
    Ticker,
    MiniTicker,
    BookTicker,
    PartialDepth,
    DiffDepth,
    Raw,
}

/// One market stream to subscribe
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEntry {
    pub kind: StreamKind,
    #[serde(default)]
    pub symbol: Option<String>,
    /// Kline interval, e.g. "1m"
    #[serde(default)]
    pub interval: Option<KlineInterval>,
    /// Partial depth levels: 5, 10 or 20
    #[serde(default)]
    pub levels: Option<u8>,
    #[serde(default)]
    pub speed: DepthSpeed,
    /// Wire name for `raw` streams
    #[serde(default)]
    pub name: Option<String>,
    /// Give this stream its own connection
    #[serde(default)]
    pub dedicated: bool,
}

impl StreamEntry {
    pub fn to_spec(&self) -> Result<StreamSpec> {
        let spec = match self.kind {
            StreamKind::Kline => {
                let interval = self
                    .interval
                    .with_context(|| format!("kline stream for {:?} needs an interval", self.symbol))?;
                StreamSpec::kline(self.symbol()?, interval)
            }
            StreamKind::Trade => StreamSpec::trade(self.symbol()?),
            StreamKind::AggTrade => StreamSpec::agg_trade(self.symbol()?),
            StreamKind::Ticker => StreamSpec::ticker(self.symbol()?),
            StreamKind::MiniTicker => StreamSpec::mini_ticker(self.symbol()?),
            StreamKind::BookTicker => StreamSpec::book_ticker(self.symbol()?),
            StreamKind::PartialDepth => {
                let levels = self.levels.unwrap_or(5);
                StreamSpec::partial_depth(self.symbol()?, levels, self.speed)
                    .context("partial depth stream")?
            }
            StreamKind::DiffDepth => StreamSpec::diff_depth(self.symbol()?, self.speed),
            StreamKind::Raw => match self.name.as_deref() {
                Some(name) if !name.trim().is_empty() => StreamSpec::raw(name.trim()),
                _ => bail!("raw stream needs a name"),
            },
        };
        Ok(if self.dedicated { spec.dedicated() } else { spec })
    }

    fn symbol(&self) -> Result<&str> {
        match self.symbol.as_deref() {
            Some(symbol) if !symbol.trim().is_empty() => Ok(symbol.trim()),
            _ => bail!("{:?} stream needs a symbol", self.kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    #[default]
    Combined,
    Dedicated,
}

/// Connection tuning; durations are whole seconds unless the name says otherwise
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub ws_base_url: Option<String>,
    #[serde(default)]
    pub grouping: GroupingMode,
    #[serde(default = "default_combined_capacity")]
    pub combined_capacity: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 0 disables client pings
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub backoff_jitter: f64,
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ws_base_url: None,
            grouping: GroupingMode::default(),
            combined_capacity: default_combined_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: 0.0,
            max_reconnect_attempts: None,
            dispatch_capacity: default_dispatch_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSettings {
    #[serde(default = "default_token_validity_secs")]
    pub validity_secs: u64,
    /// Defaults to half the validity window
    #[serde(default)]
    pub keepalive_secs: Option<u64>,
    #[serde(default)]
    pub rest_base_url: Option<String>,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            validity_secs: default_token_validity_secs(),
            keepalive_secs: None,
            rest_base_url: None,
        }
    }
}

fn default_combined_capacity() -> usize {
    binance_stream_adapter::ws::registry::DEFAULT_COMBINED_CAPACITY
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_dispatch_capacity() -> usize {
    1024
}

fn default_token_validity_secs() -> u64 {
    60 * 60
}

impl FeedConfig {
    /// Load the YAML file, then apply `BINANCE_STREAM__*` overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml).required(true))
            .add_source(env_source(None))
            .build()
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::finish(config)
    }

    /// Same layering with an inline document and an explicit variable set
    pub fn from_yaml_str(yaml: &str, env: HashMap<String, String>) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .add_source(env_source(Some(env)))
            .build()
            .context("parse config document")?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self> {
        let parsed: Self = config.try_deserialize().context("deserialize feed config")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() && !self.user_data {
            bail!("nothing to subscribe: configure streams or enable user_data");
        }
        self.stream_specs()?;
        if self.user_data {
            self.credentials()?
                .context("user_data needs credentials.api_key and credentials.api_secret")?;
            self.token_config().validate().context("token settings")?;
        }
        self.stream_config().validate().context("connection settings")?;
        Ok(())
    }

    pub fn stream_specs(&self) -> Result<Vec<StreamSpec>> {
        self.streams
            .iter()
            .enumerate()
            .map(|(index, entry)| entry.to_spec().with_context(|| format!("streams[{index}]")))
            .collect()
    }

    /// `None` when no credentials are configured; a half-filled pair is an error
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        if credentials.api_key.trim().is_empty() && credentials.api_secret.trim().is_empty() {
            return Ok(None);
        }
        if credentials.api_key.trim().is_empty() || credentials.api_secret.trim().is_empty() {
            bail!("credentials need both api_key and api_secret");
        }
        Ok(Some(Credentials {
            api_key: credentials.api_key.trim().to_string(),
            api_secret: credentials.api_secret.trim().to_string(),
        }))
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            environment: self.environment,
            base_url: self.token.rest_base_url.clone(),
            ..ClientConfig::default()
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        let connection = &self.connection;
        let grouping: Arc<dyn GroupingPolicy> = match connection.grouping {
            GroupingMode::Combined => Arc::new(CombinedPolicy {
                capacity: connection.combined_capacity,
            }),
            GroupingMode::Dedicated => Arc::new(DedicatedPolicy),
        };
        let jitter = if connection.backoff_jitter == 0.0 {
            JitterPolicy::None
        } else {
            JitterPolicy::Proportional(connection.backoff_jitter)
        };

        StreamConfig {
            environment: self.environment,
            ws_base_url: connection.ws_base_url.clone(),
            grouping,
            backoff: BackoffConfig {
                initial: Duration::from_millis(connection.backoff_initial_ms),
                max: Duration::from_millis(connection.backoff_max_ms),
                jitter,
                ..BackoffConfig::default()
            },
            idle_timeout: Duration::from_secs(connection.idle_timeout_secs),
            ping_interval: (connection.ping_interval_secs > 0)
                .then(|| Duration::from_secs(connection.ping_interval_secs)),
            dispatch_capacity: connection.dispatch_capacity,
            max_reconnect_attempts: connection.max_reconnect_attempts,
            ..StreamConfig::default()
        }
    }

    pub fn token_config(&self) -> TokenConfig {
        let mut config = TokenConfig::with_validity(Duration::from_secs(self.token.validity_secs));
        if let Some(keepalive) = self.token.keepalive_secs {
            config.keepalive_interval = Duration::from_secs(keepalive);
        }
        config
    }
}

fn env_source(vars: Option<HashMap<String, String>>) -> EnvSource {
    EnvSource::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .source(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
environment: testnet
streams:
  - kind: kline
    symbol: BTCUSDT
    interval: 1m
  - kind: trade
    symbol: ethusdt
  - kind: partial_depth
    symbol: bnbusdt
    levels: 10
    speed: 100ms
  - kind: raw
    name: "!miniTicker@arr"
    dedicated: true
connection:
  grouping: dedicated
  ping_interval_secs: 0
"#;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_streams_and_settings() {
        let config = FeedConfig::from_yaml_str(BASIC, HashMap::new()).unwrap();
        assert_eq!(config.environment, Environment::Testnet);
        assert!(!config.user_data);

        let names: Vec<String> = config
            .stream_specs()
            .unwrap()
            .iter()
            .map(|spec| spec.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "btcusdt@kline_1m",
                "ethusdt@trade",
                "bnbusdt@depth10@100ms",
                "!miniTicker@arr"
            ]
        );
        assert!(config.stream_specs().unwrap()[3].is_dedicated());

        let stream = config.stream_config();
        assert_eq!(stream.ws_base(), "wss://testnet.binance.vision");
        assert!(stream.ping_interval.is_none());
        assert_eq!(stream.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_env_overrides_file() {
        let config = FeedConfig::from_yaml_str(
            BASIC,
            env(&[
                ("BINANCE_STREAM__ENVIRONMENT", "production"),
                ("BINANCE_STREAM__CONNECTION__IDLE_TIMEOUT_SECS", "90"),
            ]),
        )
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.connection.idle_timeout_secs, 90);
    }

    #[test]
    fn test_user_data_requires_secret() {
        let yaml = "user_data: true\ncredentials:\n  api_key: key\n";
        let err = FeedConfig::from_yaml_str(yaml, HashMap::new()).unwrap_err();
        assert!(format!("{err:#}").contains("api_secret"));

        let config = FeedConfig::from_yaml_str(
            yaml,
            env(&[("BINANCE_STREAM__CREDENTIALS__API_SECRET", "secret")]),
        )
        .unwrap();
        let credentials = config.credentials().unwrap().unwrap();
        assert_eq!(credentials.api_secret, "secret");
        assert!(!format!("{:?}", config.credentials).contains("\"secret\""));
    }

    #[test]
    fn test_rejects_bad_entries() {
        let cases = [
            "streams:\n  - kind: kline\n    symbol: btcusdt\n",
            "streams:\n  - kind: trade\n",
            "streams:\n  - kind: partial_depth\n    symbol: btcusdt\n    levels: 7\n",
            "streams:\n  - kind: raw\n",
            "streams: []\n",
        ];
        for yaml in cases {
            assert!(
                FeedConfig::from_yaml_str(yaml, HashMap::new()).is_err(),
                "accepted {yaml:?}"
            );
        }
    }

    #[test]
    fn test_invalid_connection_settings() {
        let yaml = "streams:\n  - kind: trade\n    symbol: btcusdt\nconnection:\n  idle_timeout_secs: 10\n  ping_interval_secs: 20\n";
        assert!(FeedConfig::from_yaml_str(yaml, HashMap::new()).is_err());

        for jitter in ["1e300", "2.5", "-0.5"] {
            let yaml = format!(
                "streams:\n  - kind: trade\n    symbol: btcusdt\nconnection:\n  backoff_jitter: {jitter}\n"
            );
            assert!(
                FeedConfig::from_yaml_str(&yaml, HashMap::new()).is_err(),
                "jitter {jitter} accepted"
            );
        }

        let yaml = "streams:\n  - kind: trade\n    symbol: btcusdt\nconnection:\n  ws_base_url: stream.binance.com\n";
        assert!(FeedConfig::from_yaml_str(yaml, HashMap::new()).is_err());
    }

    #[test]
    fn test_token_settings() {
        let yaml = "streams:\n  - kind: trade\n    symbol: btcusdt\ntoken:\n  validity_secs: 86400\n";
        let config = FeedConfig::from_yaml_str(yaml, HashMap::new()).unwrap();
        let token = config.token_config();
        assert_eq!(token.validity, Duration::from_secs(86_400));
        assert_eq!(token.keepalive_interval, Duration::from_secs(43_200));
    }
}
