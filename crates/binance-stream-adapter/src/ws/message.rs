/*
[INPUT]:  Raw text frames (combined envelope or bare payload)
[OUTPUT]: Control replies or typed stream events
[POS]:    WebSocket layer - frame decoding
[UPDATE]: When adding event kinds or envelope shapes
*/

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::http::BinanceError;
use crate::types::{
    AccountPositionEvent, AggTradeEvent, BalanceUpdateEvent, BookTickerEvent, DepthUpdateEvent,
    EventKind, ExecutionReportEvent, KlineEvent, ListStatusEvent, ListenKeyExpiredEvent,
    MiniTickerEvent, PartialDepthEvent, TickerEvent, TradeEvent,
};

/// A decoded stream payload
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Kline(KlineEvent),
    Trade(TradeEvent),
    AggTrade(AggTradeEvent),
    Ticker(TickerEvent),
    MiniTicker(MiniTickerEvent),
    BookTicker(BookTickerEvent),
    DepthUpdate(DepthUpdateEvent),
    PartialDepth(PartialDepthEvent),
    ExecutionReport(ExecutionReportEvent),
    AccountPosition(AccountPositionEvent),
    BalanceUpdate(BalanceUpdateEvent),
    ListStatus(ListStatusEvent),
    ListenKeyExpired(ListenKeyExpiredEvent),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Kline(_) => EventKind::Kline,
            StreamEvent::Trade(_) => EventKind::Trade,
            StreamEvent::AggTrade(_) => EventKind::AggTrade,
            StreamEvent::Ticker(_) => EventKind::Ticker,
            StreamEvent::MiniTicker(_) => EventKind::MiniTicker,
            StreamEvent::BookTicker(_) => EventKind::BookTicker,
            StreamEvent::DepthUpdate(_) => EventKind::DepthUpdate,
            StreamEvent::PartialDepth(_) => EventKind::PartialDepth,
            StreamEvent::ExecutionReport(_) => EventKind::ExecutionReport,
            StreamEvent::AccountPosition(_) => EventKind::AccountPosition,
            StreamEvent::BalanceUpdate(_) => EventKind::BalanceUpdate,
            StreamEvent::ListStatus(_) => EventKind::ListStatus,
            StreamEvent::ListenKeyExpired(_) => EventKind::ListenKeyExpired,
        }
    }

    /// Stream name this event would arrive on, for bare frames that carry
    /// no envelope. Depth updates yield a prefix, the speed suffix is unknown.
    pub fn route_key(&self) -> Option<String> {
        let key = match self {
            StreamEvent::Kline(event) => format!(
                "{}@kline_{}",
                event.symbol.to_lowercase(),
                event.kline.interval
            ),
            StreamEvent::Trade(event) => format!("{}@trade", event.symbol.to_lowercase()),
            StreamEvent::AggTrade(event) => format!("{}@aggTrade", event.symbol.to_lowercase()),
            StreamEvent::Ticker(event) => format!("{}@ticker", event.symbol.to_lowercase()),
            StreamEvent::MiniTicker(event) => {
                format!("{}@miniTicker", event.symbol.to_lowercase())
            }
            StreamEvent::BookTicker(event) => {
                format!("{}@bookTicker", event.symbol.to_lowercase())
            }
            StreamEvent::DepthUpdate(event) => format!("{}@depth", event.symbol.to_lowercase()),
            _ => return None,
        };
        Some(key)
    }
}

/// Error body inside a control reply
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlError {
    pub code: i32,
    pub msg: String,
}

/// Reply to a SUBSCRIBE / UNSUBSCRIBE request
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReply {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<ControlError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Control(ControlReply),
    /// `stream` is set when the frame came wrapped in a combined envelope
    Event {
        stream: Option<String>,
        event: StreamEvent,
    },
}

/// Decode one text frame
///
/// The `e` discriminator is read first and picks exactly one payload type.
/// Frames without it are classified by shape (partial depth, book ticker).
pub fn decode_frame(text: &str) -> Result<InboundMessage, BinanceError> {
    let value: Value = serde_json::from_str(text).map_err(|err| BinanceError::Decode {
        stream: None,
        message: err.to_string(),
    })?;

    if let Some(reply) = control_reply(&value)? {
        return Ok(InboundMessage::Control(reply));
    }

    let (stream, payload) = match value {
        Value::Object(mut map) if map.contains_key("stream") && map.contains_key("data") => {
            let stream = match map.remove("stream") {
                Some(Value::String(stream)) => stream,
                _ => {
                    return Err(BinanceError::Decode {
                        stream: None,
                        message: "envelope `stream` is not a string".to_string(),
                    });
                }
            };
            let data = map.remove("data").unwrap_or(Value::Null);
            (Some(stream), data)
        }
        other => (None, other),
    };

    let event = decode_event(payload, stream.as_deref())?;
    Ok(InboundMessage::Event { stream, event })
}

fn control_reply(value: &Value) -> Result<Option<ControlReply>, BinanceError> {
    let Some(map) = value.as_object() else {
        return Ok(None);
    };
    if map.contains_key("e") || map.contains_key("stream") {
        return Ok(None);
    }
    if !map.contains_key("result") && !map.contains_key("error") {
        return Ok(None);
    }

    let error = match map.get("error") {
        Some(Value::Null) | None => None,
        Some(raw) => Some(serde_json::from_value::<ControlError>(raw.clone()).map_err(|err| {
            BinanceError::Decode {
                stream: None,
                message: format!("malformed control error: {err}"),
            }
        })?),
    };
    Ok(Some(ControlReply {
        id: map.get("id").and_then(Value::as_u64),
        result: map.get("result").cloned(),
        error,
    }))
}

/// Decode a bare payload into a typed event
pub fn decode_event(payload: Value, stream: Option<&str>) -> Result<StreamEvent, BinanceError> {
    let decode_error = |message: String| BinanceError::Decode {
        stream: stream.map(str::to_string),
        message,
    };

    let kind = match payload.get("e").and_then(Value::as_str) {
        Some(tag) => EventKind::from_discriminator(tag)
            .ok_or_else(|| decode_error(format!("unknown event type `{tag}`")))?,
        None if payload.get("lastUpdateId").is_some() => EventKind::PartialDepth,
        None if ["u", "s", "b", "a"].iter().all(|key| payload.get(key).is_some()) => {
            EventKind::BookTicker
        }
        None => return Err(decode_error("missing event discriminator `e`".to_string())),
    };

    fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, serde_json::Error> {
        serde_json::from_value(payload)
    }

    let event = match kind {
        EventKind::Kline => parse(payload).map(StreamEvent::Kline),
        EventKind::Trade => parse(payload).map(StreamEvent::Trade),
        EventKind::AggTrade => parse(payload).map(StreamEvent::AggTrade),
        EventKind::Ticker => parse(payload).map(StreamEvent::Ticker),
        EventKind::MiniTicker => parse(payload).map(StreamEvent::MiniTicker),
        EventKind::BookTicker => parse(payload).map(StreamEvent::BookTicker),
        EventKind::DepthUpdate => parse(payload).map(StreamEvent::DepthUpdate),
        EventKind::PartialDepth => parse(payload).map(StreamEvent::PartialDepth),
        EventKind::ExecutionReport => parse(payload).map(StreamEvent::ExecutionReport),
        EventKind::AccountPosition => parse(payload).map(StreamEvent::AccountPosition),
        EventKind::BalanceUpdate => parse(payload).map(StreamEvent::BalanceUpdate),
        EventKind::ListStatus => parse(payload).map(StreamEvent::ListStatus),
        EventKind::ListenKeyExpired => parse(payload).map(StreamEvent::ListenKeyExpired),
    };
    event.map_err(|err| decode_error(format!("{} payload: {err}", kind.as_str())))
}
