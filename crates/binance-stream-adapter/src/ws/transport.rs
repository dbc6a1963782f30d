/*
[INPUT]:  Stream URL to dial
[OUTPUT]: Frame-level transport (tungstenite or in-memory)
[POS]:    WebSocket layer - physical socket abstraction
[UPDATE]: When changing socket library or test transport behavior
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::http::{BinanceError, Result};

/// One WebSocket frame, independent of the socket library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<String>),
}

/// An open socket
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next inbound frame; `None` once the peer has gone away.
    /// Must be cancel-safe, it is raced against timers and commands.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>>;
}

/// Real sockets through tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| BinanceError::WebSocket(err.to_string()))?;
        Ok(Box::new(TungsteniteTransport { inner: stream }))
    }
}

struct TungsteniteTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
            Frame::Ping(payload) => WsMessage::Ping(payload.into()),
            Frame::Pong(payload) => WsMessage::Pong(payload.into()),
            Frame::Close(reason) => WsMessage::Close(reason.map(|reason| CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            })),
        };
        self.inner
            .send(message)
            .await
            .map_err(|err| BinanceError::WebSocket(err.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(BinanceError::WebSocket(err.to_string()))),
            };
            let frame = match message {
                WsMessage::Text(text) => Frame::Text(text.to_string()),
                WsMessage::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                WsMessage::Ping(payload) => Frame::Ping(payload.to_vec()),
                WsMessage::Pong(payload) => Frame::Pong(payload.to_vec()),
                WsMessage::Close(close) => Frame::Close(close.map(|frame| frame.reason.to_string())),
                WsMessage::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.inner.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(err) => Err(BinanceError::WebSocket(err.to_string())),
        }
    }
}

enum Injected {
    Frame(Frame),
    Fail(String),
}

/// Server side of one in-memory connection
///
/// Lets tests push frames, drop the socket and inspect what the client sent.
#[derive(Clone)]
pub struct MemorySession {
    url: Url,
    inbound: mpsc::UnboundedSender<Injected>,
    outbound: Arc<Mutex<Vec<Frame>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .send(Injected::Frame(Frame::Text(text.into())))
            .is_ok()
    }

    pub fn push_frame(&self, frame: Frame) -> bool {
        self.inbound.send(Injected::Frame(frame)).is_ok()
    }

    pub fn push_ping(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.push_frame(Frame::Ping(payload.into()))
    }

    /// Abnormal drop: the client sees a read error
    pub fn disconnect(&self) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound
            .send(Injected::Fail("connection reset by peer".to_string()))
            .is_ok()
    }

    /// Frames written by the client, oldest first
    pub fn sent(&self) -> Vec<Frame> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Injected>,
    outbound: Arc<Mutex<Vec<Frame>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BinanceError::WebSocket("socket is closed".to_string()));
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        match self.inbound.recv().await? {
            Injected::Frame(frame) => Some(Ok(frame)),
            Injected::Fail(reason) => Some(Err(BinanceError::WebSocket(reason))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    dialed: Vec<String>,
    sessions: Vec<MemorySession>,
    pending_failures: usize,
}

/// In-memory connector for driving connections without a network
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    dialed: Arc<Notify>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `count` dials
    pub fn fail_next(&self, count: usize) {
        self.lock().pending_failures += count;
    }

    /// Every URL dialed, failed attempts included
    pub fn dialed_urls(&self) -> Vec<String> {
        self.lock().dialed.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.lock().dialed.len()
    }

    /// Successful sessions in dial order
    pub fn sessions(&self) -> Vec<MemorySession> {
        self.lock().sessions.clone()
    }

    pub fn last_session(&self) -> Option<MemorySession> {
        self.lock().sessions.last().cloned()
    }

    /// Wait until at least `count` sessions were established
    pub async fn wait_for_sessions(&self, count: usize) -> MemorySession {
        loop {
            let notified = self.dialed.notified();
            {
                let state = self.lock();
                if state.sessions.len() >= count {
                    return state.sessions[count - 1].clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>> {
        let transport = {
            let mut state = self.lock();
            state.dialed.push(url.to_string());
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                None
            } else {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let outbound = Arc::new(Mutex::new(Vec::new()));
                let closed = Arc::new(AtomicBool::new(false));
                state.sessions.push(MemorySession {
                    url: url.clone(),
                    inbound: inbound_tx,
                    outbound: outbound.clone(),
                    closed: closed.clone(),
                });
                Some(MemoryTransport {
                    inbound: inbound_rx,
                    outbound,
                    closed,
                })
            }
        };
        self.dialed.notify_waiters();

        match transport {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(BinanceError::WebSocket(format!("dial refused: {url}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_connector_records_traffic() {
        let connector = MemoryConnector::new();
        let url = Url::parse("wss://example.test/ws/btcusdt@trade").unwrap();
        let mut transport = connector.connect(&url).await.unwrap();
        let session = connector.last_session().unwrap();

        transport.send(Frame::Text("hello".to_string())).await.unwrap();
        assert_eq!(session.sent_texts(), vec!["hello".to_string()]);

        session.push_text("world");
        assert_eq!(
            transport.next_frame().await.unwrap().unwrap(),
            Frame::Text("world".to_string())
        );

        session.disconnect();
        assert!(transport.next_frame().await.unwrap().is_err());
        assert!(transport.send(Frame::Pong(Vec::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_connector_fail_next() {
        let connector = MemoryConnector::new();
        connector.fail_next(1);
        let url = Url::parse("wss://example.test/ws/a").unwrap();
        assert!(connector.connect(&url).await.is_err());
        assert!(connector.connect(&url).await.is_ok());
        assert_eq!(connector.dial_count(), 2);
        assert_eq!(connector.sessions().len(), 1);
    }
}
