/*
[INPUT]:  Caller-supplied handler closures
[OUTPUT]: Immutable callback bundle keyed by event kind
[POS]:    WebSocket layer - subscription handlers
[UPDATE]: When adding event kinds or lifecycle hooks
*/

use std::fmt;
use std::sync::Arc;

use crate::http::BinanceError;
use crate::types::{
    AccountPositionEvent, AggTradeEvent, BalanceUpdateEvent, BookTickerEvent, DepthUpdateEvent,
    EventKind, ExecutionReportEvent, KlineEvent, ListStatusEvent, ListenKeyExpiredEvent,
    MiniTickerEvent, PartialDepthEvent, TickerEvent, TradeEvent,
};
use crate::ws::message::StreamEvent;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;

type DataHandler<T> = Arc<dyn Fn(&T) -> HandlerResult + Send + Sync>;
type LifecycleHandler = Arc<dyn Fn(&str) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&BinanceError) + Send + Sync>;

/// Typed handlers for one subscription
///
/// Built once through [`CallbackBundleBuilder`] and shared as an `Arc`; the
/// registry compares bundles by pointer. At most one handler per event kind,
/// unset handlers are no-ops.
#[derive(Clone, Default)]
pub struct CallbackBundle {
    on_connect: Option<LifecycleHandler>,
    on_reconnect: Option<LifecycleHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_error: Option<ErrorHandler>,
    on_kline: Option<DataHandler<KlineEvent>>,
    on_trade: Option<DataHandler<TradeEvent>>,
    on_agg_trade: Option<DataHandler<AggTradeEvent>>,
    on_ticker: Option<DataHandler<TickerEvent>>,
    on_mini_ticker: Option<DataHandler<MiniTickerEvent>>,
    on_book_ticker: Option<DataHandler<BookTickerEvent>>,
    on_depth_update: Option<DataHandler<DepthUpdateEvent>>,
    on_partial_depth: Option<DataHandler<PartialDepthEvent>>,
    on_execution_report: Option<DataHandler<ExecutionReportEvent>>,
    on_account_position: Option<DataHandler<AccountPositionEvent>>,
    on_balance_update: Option<DataHandler<BalanceUpdateEvent>>,
    on_list_status: Option<DataHandler<ListStatusEvent>>,
    on_listen_key_expired: Option<DataHandler<ListenKeyExpiredEvent>>,
}

impl CallbackBundle {
    pub fn builder() -> CallbackBundleBuilder {
        CallbackBundleBuilder::default()
    }

    /// Whether a data handler is set for `kind`
    pub fn handles(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Kline => self.on_kline.is_some(),
            EventKind::Trade => self.on_trade.is_some(),
            EventKind::AggTrade => self.on_agg_trade.is_some(),
            EventKind::Ticker => self.on_ticker.is_some(),
            EventKind::MiniTicker => self.on_mini_ticker.is_some(),
            EventKind::BookTicker => self.on_book_ticker.is_some(),
            EventKind::DepthUpdate => self.on_depth_update.is_some(),
            EventKind::PartialDepth => self.on_partial_depth.is_some(),
            EventKind::ExecutionReport => self.on_execution_report.is_some(),
            EventKind::AccountPosition => self.on_account_position.is_some(),
            EventKind::BalanceUpdate => self.on_balance_update.is_some(),
            EventKind::ListStatus => self.on_list_status.is_some(),
            EventKind::ListenKeyExpired => self.on_listen_key_expired.is_some(),
        }
    }

    /// Run the handler matching the event kind
    pub fn dispatch(&self, event: &StreamEvent) -> HandlerResult {
        fn call<T: 'static>(handler: &Option<DataHandler<T>>, payload: &T) -> HandlerResult {
            match handler {
                Some(handler) => handler(payload),
                None => Ok(()),
            }
        }

        match event {
            StreamEvent::Kline(e) => call(&self.on_kline, e),
            StreamEvent::Trade(e) => call(&self.on_trade, e),
            StreamEvent::AggTrade(e) => call(&self.on_agg_trade, e),
            StreamEvent::Ticker(e) => call(&self.on_ticker, e),
            StreamEvent::MiniTicker(e) => call(&self.on_mini_ticker, e),
            StreamEvent::BookTicker(e) => call(&self.on_book_ticker, e),
            StreamEvent::DepthUpdate(e) => call(&self.on_depth_update, e),
            StreamEvent::PartialDepth(e) => call(&self.on_partial_depth, e),
            StreamEvent::ExecutionReport(e) => call(&self.on_execution_report, e),
            StreamEvent::AccountPosition(e) => call(&self.on_account_position, e),
            StreamEvent::BalanceUpdate(e) => call(&self.on_balance_update, e),
            StreamEvent::ListStatus(e) => call(&self.on_list_status, e),
            StreamEvent::ListenKeyExpired(e) => call(&self.on_listen_key_expired, e),
        }
    }

    pub fn fire_connect(&self, stream: &str) {
        if let Some(handler) = &self.on_connect {
            handler(stream);
        }
    }

    pub fn fire_reconnect(&self, stream: &str) {
        if let Some(handler) = &self.on_reconnect {
            handler(stream);
        }
    }

    pub fn fire_disconnect(&self, stream: &str, reason: &str) {
        if let Some(handler) = &self.on_disconnect {
            handler(stream, reason);
        }
    }

    /// Returns false when no error handler is set
    pub fn fire_error(&self, error: &BinanceError) -> bool {
        match &self.on_error {
            Some(handler) => {
                handler(error);
                true
            }
            None => false,
        }
    }

    /// Chain an extra hook after the caller's `listenKeyExpired` handler
    pub(crate) fn with_listen_key_expired_hook(
        mut self,
        hook: impl Fn(&ListenKeyExpiredEvent) + Send + Sync + 'static,
    ) -> Self {
        let previous = self.on_listen_key_expired.take();
        self.on_listen_key_expired = Some(Arc::new(move |event: &ListenKeyExpiredEvent| {
            let result = match &previous {
                Some(handler) => handler(event),
                None => Ok(()),
            };
            hook(event);
            result
        }));
        self
    }
}

impl fmt::Debug for CallbackBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = [
            EventKind::Kline,
            EventKind::Trade,
            EventKind::AggTrade,
            EventKind::Ticker,
            EventKind::MiniTicker,
            EventKind::BookTicker,
            EventKind::DepthUpdate,
            EventKind::PartialDepth,
            EventKind::ExecutionReport,
            EventKind::AccountPosition,
            EventKind::BalanceUpdate,
            EventKind::ListStatus,
            EventKind::ListenKeyExpired,
        ]
        .into_iter()
        .filter(|kind| self.handles(*kind))
        .map(EventKind::as_str)
        .collect();

        f.debug_struct("CallbackBundle")
            .field("data_handlers", &kinds)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Builds a [`CallbackBundle`]; setting a handler twice keeps the last one
#[derive(Default)]
pub struct CallbackBundleBuilder {
    bundle: CallbackBundle,
}

macro_rules! data_setter {
    ($name:ident, $field:ident, $payload:ty) => {
        pub fn $name(mut self, handler: impl Fn(&$payload) -> HandlerResult + Send + Sync + 'static) -> Self {
            self.bundle.$field = Some(Arc::new(handler));
            self
        }
    };
}

impl CallbackBundleBuilder {
    pub fn on_connect(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.bundle.on_connect = Some(Arc::new(handler));
        self
    }

    pub fn on_reconnect(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.bundle.on_reconnect = Some(Arc::new(handler));
        self
    }

    /// Receives the stream id and the disconnect reason
    pub fn on_disconnect(mut self, handler: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.bundle.on_disconnect = Some(Arc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&BinanceError) + Send + Sync + 'static) -> Self {
        self.bundle.on_error = Some(Arc::new(handler));
        self
    }

    data_setter!(on_kline, on_kline, KlineEvent);
    data_setter!(on_trade, on_trade, TradeEvent);
    data_setter!(on_agg_trade, on_agg_trade, AggTradeEvent);
    data_setter!(on_ticker, on_ticker, TickerEvent);
    data_setter!(on_mini_ticker, on_mini_ticker, MiniTickerEvent);
    data_setter!(on_book_ticker, on_book_ticker, BookTickerEvent);
    data_setter!(on_depth_update, on_depth_update, DepthUpdateEvent);
    data_setter!(on_partial_depth, on_partial_depth, PartialDepthEvent);
    data_setter!(on_execution_report, on_execution_report, ExecutionReportEvent);
    data_setter!(on_account_position, on_account_position, AccountPositionEvent);
    data_setter!(on_balance_update, on_balance_update, BalanceUpdateEvent);
    data_setter!(on_list_status, on_list_status, ListStatusEvent);
    data_setter!(on_listen_key_expired, on_listen_key_expired, ListenKeyExpiredEvent);

    pub fn build(self) -> Arc<CallbackBundle> {
        Arc::new(self.bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ListenKeyExpiredEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn expired_event() -> StreamEvent {
        StreamEvent::ListenKeyExpired(ListenKeyExpiredEvent {
            event_time: 1,
            listen_key: Some("abc".to_string()),
        })
    }

    #[test]
    fn test_unset_handlers_are_noops() {
        let bundle = CallbackBundle::builder().build();
        assert!(bundle.dispatch(&expired_event()).is_ok());
        assert!(!bundle.fire_error(&BinanceError::NotConnected));
        bundle.fire_connect("x");
    }

    #[test]
    fn test_dispatch_reaches_matching_handler_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let bundle = CallbackBundle::builder()
            .on_listen_key_expired(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_kline(|_| Err("never called".into()))
            .build();

        assert!(bundle.handles(EventKind::ListenKeyExpired));
        assert!(!bundle.handles(EventKind::Trade));
        bundle.dispatch(&expired_event()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expiry_hook_runs_after_caller_handler() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let caller = order.clone();
        let bundle = CallbackBundle::builder()
            .on_listen_key_expired(move |_| {
                caller.lock().unwrap().push("caller");
                Err("caller failed".into())
            })
            .build();
        let hook_order = order.clone();
        let wrapped = (*bundle)
            .clone()
            .with_listen_key_expired_hook(move |_| hook_order.lock().unwrap().push("hook"));

        assert!(wrapped.dispatch(&expired_event()).is_err());
        assert_eq!(*order.lock().unwrap(), vec!["caller", "hook"]);
    }
}
