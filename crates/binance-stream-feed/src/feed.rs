/*
[INPUT]:  Feed configuration, a socket connector, a shutdown token
[OUTPUT]: Live subscriptions logging decoded events + latest-price snapshots
[POS]:    Runtime layer - wires configuration into the streaming client
[UPDATE]: When adding stream kinds to the feed or changing shutdown order
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use binance_stream_adapter::ws::{
    CallbackBundleBuilder, Connector, HandlerResult, TungsteniteConnector, USER_DATA_STREAM_ID,
};
use binance_stream_adapter::{
    AccountPositionEvent, AggTradeEvent, BalanceUpdateEvent, BinanceClient, BinanceError,
    BookTickerEvent, CallbackBundle, DepthUpdateEvent, ExecutionReportEvent, KlineEvent,
    ListStatusEvent, MiniTickerEvent, PartialDepthEvent, SessionTokenManager, StreamingClient,
    SubscriptionHandle, TickerEvent, TradeEvent,
};

use crate::config::FeedConfig;

const EVENT_LOG_LIMIT: usize = 20;
static EVENT_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Per-stream event counts and the latest price per symbol
#[derive(Debug, Default)]
pub struct FeedStats {
    events: Mutex<HashMap<String, u64>>,
    prices: Mutex<HashMap<String, watch::Sender<Option<Decimal>>>>,
    errors: AtomicU64,
}

impl FeedStats {
    pub fn events(&self, stream_id: &str) -> u64 {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_events(&self) -> u64 {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn latest_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&symbol.to_uppercase())
            .and_then(|tx| *tx.borrow())
    }

    /// Watch a symbol's price; `None` until the first update
    pub fn subscribe_price(&self, symbol: &str) -> watch::Receiver<Option<Decimal>> {
        self.prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(symbol.to_uppercase())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn record(&self, stream_id: &str) {
        *self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stream_id.to_string())
            .or_default() += 1;
    }

    fn record_price(&self, symbol: &str, price: Decimal) {
        self.prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(symbol.to_uppercase())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(price));
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// A running feed: the client, its subscriptions and the error drain
pub struct Feed {
    client: Arc<StreamingClient>,
    stats: Arc<FeedStats>,
    handles: Vec<SubscriptionHandle>,
    error_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("client", &self.client)
            .field("subscriptions", &self.handles.len())
            .finish()
    }
}

impl Feed {
    /// Start against the real exchange sockets
    pub async fn connect(config: &FeedConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector)).await
    }

    pub async fn with_connector(config: &FeedConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let client = build_client(config, connector)?;
        Self::start(client, config).await
    }

    /// Subscribe every configured stream on `client`
    pub async fn start(client: StreamingClient, config: &FeedConfig) -> Result<Self> {
        let client = Arc::new(client);
        let stats = Arc::new(FeedStats::default());
        let error_task = client
            .take_error_receiver()
            .map(|errors| spawn_error_drain(errors, stats.clone()));

        let mut feed = Self {
            client,
            stats,
            handles: Vec::new(),
            error_task,
        };

        for spec in config.stream_specs()? {
            let stream_id = spec.id().to_string();
            let bundle = market_bundle(&stream_id, feed.stats.clone());
            let handle = feed
                .client
                .subscribe(spec, bundle)
                .with_context(|| format!("subscribe {stream_id}"))?;
            feed.handles.push(handle);
        }

        if config.user_data {
            let handle = feed
                .client
                .subscribe_user_data(user_data_bundle(feed.stats.clone()))
                .await
                .context("subscribe user data")?;
            feed.handles.push(handle);
        }

        info!(
            streams = feed.handles.len(),
            connections = feed.client.connection_count(),
            "feed started"
        );
        Ok(feed)
    }

    pub fn client(&self) -> &StreamingClient {
        &self.client
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` fires, then close everything
    pub async fn run(self, shutdown: CancellationToken) {
        shutdown.cancelled().await;
        info!("feed shutdown requested");
        self.shutdown().await;
    }

    pub async fn shutdown(mut self) {
        self.client.close().await;
        if let Some(task) = self.error_task.take() {
            task.abort();
        }
        info!(
            events = self.stats.total_events(),
            errors = self.stats.errors(),
            "feed stopped"
        );
    }
}

/// Streaming client with a token manager when user data is enabled
pub fn build_client(config: &FeedConfig, connector: Arc<dyn Connector>) -> Result<StreamingClient> {
    let client = StreamingClient::with_connector(config.stream_config(), connector)
        .context("build streaming client")?;
    if !config.user_data {
        return Ok(client);
    }

    let credentials = config
        .credentials()?
        .context("user_data needs credentials")?;
    let rest = BinanceClient::with_config(config.client_config())
        .and_then(|rest| rest.with_credentials(credentials))
        .context("build REST client")?;
    let tokens = SessionTokenManager::new(Arc::new(rest), config.token_config())
        .context("build session token manager")?;
    Ok(client.with_token_manager(tokens))
}

fn spawn_error_drain(
    mut errors: tokio::sync::mpsc::Receiver<BinanceError>,
    stats: Arc<FeedStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            stats.record_error();
            if err.is_fatal() {
                error!(error = %err, "stream failure");
            } else {
                warn!(error = %err, "stream error");
            }
        }
    })
}

fn log_event_sample(stream_id: &str, summary: std::fmt::Arguments<'_>) {
    let count = EVENT_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < EVENT_LOG_LIMIT {
        info!(stream = %stream_id, "{summary}");
    } else {
        debug!(stream = %stream_id, "{summary}");
    }
}

fn lifecycle(stats: Arc<FeedStats>) -> CallbackBundleBuilder {
    CallbackBundle::builder()
        .on_connect(|stream| info!(stream = %stream, "stream connected"))
        .on_reconnect(|stream| info!(stream = %stream, "stream resubscribed"))
        .on_disconnect(|stream, reason| warn!(stream = %stream, reason = %reason, "stream dropped"))
        .on_error(move |err| {
            stats.record_error();
            error!(error = %err, "stream handler error");
        })
}

fn market_bundle(stream_id: &str, stats: Arc<FeedStats>) -> Arc<CallbackBundle> {
    let id: Arc<str> = Arc::from(stream_id);

    let (s, i) = (stats.clone(), id.clone());
    let on_kline = move |event: &KlineEvent| -> HandlerResult {
        s.record(&i);
        s.record_price(&event.symbol, event.kline.close);
        log_event_sample(
            &i,
            format_args!("kline {} close={} closed={}", event.symbol, event.kline.close, event.kline.closed),
        );
        Ok(())
    };
    let (s, i) = (stats.clone(), id.clone());
    let on_trade = move |event: &TradeEvent| -> HandlerResult {
        s.record(&i);
        s.record_price(&event.symbol, event.price);
        log_event_sample(&i, format_args!("trade {} {}@{}", event.symbol, event.quantity, event.price));
        Ok(())
    };
    let (s, i) = (stats.clone(), id.clone());
    let on_agg_trade = move |event: &AggTradeEvent| -> HandlerResult {
        s.record(&i);
        s.record_price(&event.symbol, event.price);
        log_event_sample(&i, format_args!("aggTrade {} {}@{}", event.symbol, event.quantity, event.price));
        Ok(())
    };
    let (s, i) = (stats.clone(), id.clone());
    let on_ticker = move |event: &TickerEvent| -> HandlerResult {
        s.record(&i);
        s.record_price(&event.symbol, event.last_price);
        log_event_sample(
            &i,
            format_args!("ticker {} last={} change={}%", event.symbol, event.last_price, event.price_change_percent),
        );
        Ok(())
    };
    let (s, i) = (stats.clone(), id.clone());
    let on_mini_ticker = move |event: &MiniTickerEvent| -> HandlerResult {
        s.record(&i);
        s.record_price(&event.symbol, event.close_price);
        log_event_sample(&i, format_args!("miniTicker {} close={}", event.symbol, event.close_price));
        Ok(())
    };
    let (s, i) = (stats.clone(), id.clone());
    let on_book_ticker = move |event: &BookTickerEvent| -> HandlerResult {
        s.record(&i);
        log_event_sample(
            &i,
            format_args!("bookTicker {} {} / {}", event.symbol, event.best_bid_price, event.best_ask_price),
        );
        Ok(())
    };
    let (s, i) = (stats.clone(), id.clone());
    let on_depth_update = move |event: &DepthUpdateEvent| -> HandlerResult {
        s.record(&i);
        log_event_sample(
            &i,
            format_args!(
                "depthUpdate {} {}..{} bids={} asks={}",
                event.symbol,
                event.first_update_id,
                event.final_update_id,
                event.bids.len(),
                event.asks.len()
            ),
        );
        Ok(())
    };
    let (s, i) = (stats.clone(), id);
    let on_partial_depth = move |event: &PartialDepthEvent| -> HandlerResult {
        s.record(&i);
        log_event_sample(
            &i,
            format_args!("depth snapshot {} levels={}", event.last_update_id, event.bids.len()),
        );
        Ok(())
    };

    lifecycle(stats)
        .on_kline(on_kline)
        .on_trade(on_trade)
        .on_agg_trade(on_agg_trade)
        .on_ticker(on_ticker)
        .on_mini_ticker(on_mini_ticker)
        .on_book_ticker(on_book_ticker)
        .on_depth_update(on_depth_update)
        .on_partial_depth(on_partial_depth)
        .build()
}

fn user_data_bundle(stats: Arc<FeedStats>) -> Arc<CallbackBundle> {
    let id = USER_DATA_STREAM_ID;

    let s = stats.clone();
    let on_execution_report = move |event: &ExecutionReportEvent| -> HandlerResult {
        s.record(id);
        info!(
            symbol = %event.symbol,
            order_id = event.order_id,
            side = %event.side,
            execution = %event.execution_type,
            status = %event.order_status,
            filled = %event.cumulative_filled_quantity,
            "execution report"
        );
        Ok(())
    };
    let s = stats.clone();
    let on_account_position = move |event: &AccountPositionEvent| -> HandlerResult {
        s.record(id);
        for balance in &event.balances {
            info!(asset = %balance.asset, free = %balance.free, locked = %balance.locked, "balance");
        }
        Ok(())
    };
    let s = stats.clone();
    let on_balance_update = move |event: &BalanceUpdateEvent| -> HandlerResult {
        s.record(id);
        info!(asset = %event.asset, delta = %event.delta, "balance update");
        Ok(())
    };
    let s = stats.clone();
    let on_list_status = move |event: &ListStatusEvent| -> HandlerResult {
        s.record(id);
        info!(
            symbol = %event.symbol,
            list_id = event.order_list_id,
            status = %event.list_order_status,
            "order list status"
        );
        Ok(())
    };

    lifecycle(stats)
        .on_execution_report(on_execution_report)
        .on_account_position(on_account_position)
        .on_balance_update(on_balance_update)
        .on_list_status(on_list_status)
        .on_listen_key_expired(|_| {
            warn!("listen key expired");
            Ok(())
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_stats_record_and_watch() {
        let stats = FeedStats::default();
        let mut rx = stats.subscribe_price("btcusdt");
        assert!(rx.borrow().is_none());

        stats.record("btcusdt@trade");
        stats.record("btcusdt@trade");
        stats.record_price("BTCUSDT", Decimal::from_str("42000.5").unwrap());

        assert_eq!(stats.events("btcusdt@trade"), 2);
        assert_eq!(stats.events("ethusdt@trade"), 0);
        assert_eq!(stats.total_events(), 2);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Some(Decimal::from_str("42000.5").unwrap()));
        assert_eq!(stats.latest_price("BtcUsdt"), Some(Decimal::from_str("42000.5").unwrap()));
    }
}
