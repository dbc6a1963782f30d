/*
[INPUT]:  Public Binance market streams
[OUTPUT]: Trades and klines printed for a short while
[POS]:    Examples - combined market stream handling
[UPDATE]: When the streaming client API changes
*/

use std::sync::Arc;

use binance_stream_adapter::*;
use tokio::time::{Duration, sleep};

/// Example: two market streams sharing one combined connection
#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Binance Stream Example ===\n");

    let client = StreamingClient::new(StreamConfig::default())?;
    let mut errors = client.take_error_receiver().expect("error receiver already taken");
    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            println!("  ! {err}");
        }
    });

    let bundle: Arc<CallbackBundle> = CallbackBundle::builder()
        .on_connect(|stream| println!("✓ {stream} connected"))
        .on_reconnect(|stream| println!("↻ {stream} resubscribed"))
        .on_disconnect(|stream, reason| println!("✗ {stream} dropped: {reason}"))
        .on_trade(|trade| {
            println!("  trade {} {} @ {}", trade.symbol, trade.quantity, trade.price);
            Ok(())
        })
        .on_kline(|event| {
            println!("  kline {} close {}", event.symbol, event.kline.close);
            Ok(())
        })
        .build();

    client.subscribe(StreamSpec::trade("BTCUSDT"), bundle.clone())?;
    client.subscribe(StreamSpec::kline("BTCUSDT", KlineInterval::M1), bundle)?;
    println!("Active streams: {:?}\n", client.active_streams());

    sleep(Duration::from_secs(10)).await;

    client.close().await;
    println!("\n✓ Stream example complete");
    Ok(())
}
