/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities, fixtures, and mock helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for binance-stream-adapter tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use binance_stream_adapter::{BinanceClient, ClientConfig, Credentials, StreamConfig};
use wiremock::MockServer;

pub const TEST_API_KEY: &str = "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A";
pub const TEST_API_SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
pub const TEST_LISTEN_KEY: &str = "pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1";

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Signed client pointed at the mock server
pub fn signed_client(server: &MockServer) -> BinanceClient {
    let config = ClientConfig {
        base_url: Some(server.uri()),
        ..ClientConfig::default()
    };
    BinanceClient::with_config(config)
        .and_then(|client| {
            client.with_credentials(Credentials {
                api_key: TEST_API_KEY.to_string(),
                api_secret: TEST_API_SECRET.to_string(),
            })
        })
        .expect("client should build")
}

/// No client pings and a long idle window, so only the test drives the socket
pub fn quiet_stream_config() -> StreamConfig {
    StreamConfig {
        ws_base_url: Some("wss://stream.test".to_string()),
        ping_interval: None,
        idle_timeout: Duration::from_secs(3600),
        ..StreamConfig::default()
    }
}

/// Ordered record of callback activity shared across handlers
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Poll until at least `len` entries were recorded
    pub async fn wait_for_len(&self, len: usize) -> Vec<String> {
        for _ in 0..500 {
            let entries = self.entries();
            if entries.len() >= len {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {len} entries, got {:?}", self.entries());
    }

    pub async fn wait_for(&self, entry: &str) {
        for _ in 0..500 {
            if self.count(entry) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never saw {entry}, got {:?}", self.entries());
    }
}

pub fn envelope(stream: &str, data: &str) -> String {
    format!(r#"{{"stream":"{stream}","data":{data}}}"#)
}

pub fn kline_payload(symbol: &str, interval: &str) -> String {
    format!(
        r#"{{"e":"kline","E":1672515782136,"s":"{symbol}","k":{{"t":1672515780000,
        "T":1672515839999,"s":"{symbol}","i":"{interval}","f":100,"L":200,"o":"0.0010",
        "c":"0.0020","h":"0.0025","l":"0.0015","v":"1000","n":100,"x":false,"q":"1.0000",
        "V":"500","Q":"0.500","B":"123456"}}}}"#
    )
}

pub fn trade_payload(symbol: &str, trade_id: u64) -> String {
    format!(
        r#"{{"e":"trade","E":1672515782136,"s":"{symbol}","t":{trade_id},"p":"0.001",
        "q":"100","T":1672515782136,"m":true,"M":true}}"#
    )
}

pub fn listen_key_expired_payload(listen_key: &str) -> String {
    format!(r#"{{"e":"listenKeyExpired","E":1699596037418,"listenKey":"{listen_key}"}}"#)
}
