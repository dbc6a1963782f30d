/*
[INPUT]:  Errors no single subscription owns
[OUTPUT]: Global error channel for the streaming client
[POS]:    WebSocket layer - registry-level error reporting
[UPDATE]: When changing how unroutable failures surface
*/

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::http::BinanceError;

const REPORT_LOG_LIMIT: usize = 20;

static REPORT_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Sender half of the global error channel
///
/// Never blocks: when the receiver lags or was never taken, errors are
/// dropped after logging.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<BinanceError>,
}

impl ErrorSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BinanceError>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn report(&self, error: BinanceError) {
        let count = REPORT_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
        if count < REPORT_LOG_LIMIT {
            warn!(
                sample_index = count + 1,
                sample_limit = REPORT_LOG_LIMIT,
                error = %error,
                "stream error reported"
            );
        }
        if let Err(err) = self.tx.try_send(error) {
            debug!(error = %err, "global error channel unavailable, dropping error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_never_blocks_when_full() {
        let (sink, mut rx) = ErrorSink::channel(1);
        sink.report(BinanceError::NotConnected);
        sink.report(BinanceError::TokenExpired);

        assert!(matches!(rx.try_recv(), Ok(BinanceError::NotConnected)));
        assert!(rx.try_recv().is_err());
    }
}
