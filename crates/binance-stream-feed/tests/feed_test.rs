/*
[INPUT]:  Feed configurations driven over in-memory sockets and a mock REST server
[OUTPUT]: End-to-end feed behavior verification
[POS]:    Integration test layer - feed startup, delivery and shutdown
[UPDATE]: When changing feed wiring or shutdown order
*/

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use binance_stream_adapter::ws::MemoryConnector;
use binance_stream_feed::{Feed, FeedConfig, FeedStats};
use rust_decimal::Decimal;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LISTEN_KEY: &str = "pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1";

const MARKET_CONFIG: &str = r#"
streams:
  - kind: trade
    symbol: BTCUSDT
  - kind: book_ticker
    symbol: ethusdt
connection:
  ws_base_url: wss://stream.test
  ping_interval_secs: 0
  idle_timeout_secs: 3600
"#;

async fn wait_until(stats: &FeedStats, check: impl Fn(&FeedStats) -> bool) {
    for _ in 0..500 {
        if check(stats) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "condition not reached: events={} errors={}",
        stats.total_events(),
        stats.errors()
    );
}

#[tokio::test(start_paused = true)]
async fn test_market_feed_delivers_and_shuts_down() {
    let config = assert_ok!(FeedConfig::from_yaml_str(MARKET_CONFIG, HashMap::new()));
    let connector = MemoryConnector::new();
    let feed = assert_ok!(Feed::with_connector(&config, Arc::new(connector.clone())).await);
    assert_eq!(feed.client().connection_count(), 1);

    let session = connector.wait_for_sessions(1).await;
    assert_eq!(
        connector.dialed_urls(),
        vec!["wss://stream.test/stream?streams=btcusdt@trade/ethusdt@bookTicker"]
    );

    session.push_text(
        r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1,"s":"BTCUSDT","t":7,"p":"42000.10","q":"0.5","T":1,"m":false,"M":true}}"#,
    );
    session.push_text(
        r#"{"stream":"ethusdt@bookTicker","data":{"u":400900217,"s":"ETHUSDT","b":"2500.01","B":"31.2","a":"2500.02","A":"40.6"}}"#,
    );
    session.push_text(r#"{"stream":"dogeusdt@trade","data":{"e":"trade"}}"#);

    let stats = feed.stats();
    wait_until(&stats, |s| s.total_events() == 2 && s.errors() == 1).await;
    assert_eq!(stats.events("btcusdt@trade"), 1);
    assert_eq!(stats.events("ethusdt@bookTicker"), 1);
    assert_eq!(
        stats.latest_price("BTCUSDT"),
        Some(Decimal::from_str("42000.10").unwrap())
    );

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    feed.run(shutdown).await;
    assert!(session.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_dedicated_grouping_opens_one_connection_per_stream() {
    let mut env = HashMap::new();
    env.insert(
        "BINANCE_STREAM__CONNECTION__GROUPING".to_string(),
        "dedicated".to_string(),
    );
    let config = assert_ok!(FeedConfig::from_yaml_str(MARKET_CONFIG, env));
    let connector = MemoryConnector::new();
    let feed = assert_ok!(Feed::with_connector(&config, Arc::new(connector.clone())).await);

    connector.wait_for_sessions(2).await;
    assert_eq!(feed.client().connection_count(), 2);
    let mut urls = connector.dialed_urls();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "wss://stream.test/ws/btcusdt@trade",
            "wss://stream.test/ws/ethusdt@bookTicker"
        ]
    );
    feed.shutdown().await;
}

#[tokio::test]
async fn test_user_data_feed_releases_token_on_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/userDataStream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "listenKey": LISTEN_KEY })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/v3/userDataStream"))
        .and(query_param("listenKey", LISTEN_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = format!(
        "user_data: true\ncredentials:\n  api_key: key\ntoken:\n  rest_base_url: {}\nconnection:\n  ws_base_url: wss://stream.test\n  ping_interval_secs: 0\n",
        server.uri()
    );
    let mut env = HashMap::new();
    env.insert(
        "BINANCE_STREAM__CREDENTIALS__API_SECRET".to_string(),
        "secret".to_string(),
    );
    let config = assert_ok!(FeedConfig::from_yaml_str(&yaml, env));

    let connector = MemoryConnector::new();
    let feed = assert_ok!(Feed::with_connector(&config, Arc::new(connector.clone())).await);
    let session = connector.wait_for_sessions(1).await;
    assert_eq!(
        connector.dialed_urls(),
        vec![format!("wss://stream.test/ws/{LISTEN_KEY}")]
    );

    session.push_text(r#"{"e":"balanceUpdate","E":1573200697110,"a":"BTC","d":"100.00000000","T":1573200697068}"#);
    let stats = feed.stats();
    wait_until(&stats, |s| s.events("userData") == 1).await;

    feed.shutdown().await;
    assert!(session.is_closed());
}
