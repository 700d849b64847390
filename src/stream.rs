//! Bybit public WebSocket client.
//!
//! Owns one connection: subscribes every topic, keeps it alive with the
//! `{"op":"ping"}` heartbeat Bybit expects, and feeds every frame to the
//! [`FrameRouter`]. A dropped connection is logged and reported through
//! [`StreamClient::closed`]; reconnecting is up to whoever runs the process.

use crate::config::Config;
use crate::detector::ChangeDetector;
use crate::errors::{CollectorError, Result};
use crate::persistence::{PersistenceHandle, WorkerStats};
use crate::router::FrameRouter;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// How long `disconnect` waits for the server to acknowledge the close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;

struct Connection {
    writer: WsWriter,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
}

/// Streaming client for tickers plus optional orderbook/trade/kline channels.
pub struct StreamClient {
    url: String,
    channels: Vec<String>,
    ping_interval: Duration,
    router: Arc<FrameRouter>,
    persistence: Option<PersistenceHandle>,
    connection: Option<Connection>,
}

impl StreamClient {
    /// Build a client that feeds the given persistence worker.
    pub fn new(config: &Config, persistence: PersistenceHandle) -> Self {
        let router = FrameRouter::new(
            config.ticker_batch_size,
            ChangeDetector::new(config.change_detection),
            persistence.intake(),
        );

        Self {
            url: config.stream_url.clone(),
            channels: config.channels.clone(),
            ping_interval: config.ping_interval,
            router: Arc::new(router),
            persistence: Some(persistence),
            connection: None,
        }
    }

    /// Open the connection and subscribe the ticker stream (plus every
    /// configured channel) for each symbol, one request per topic.
    pub async fn connect(&mut self, symbols: &[String]) -> Result<()> {
        if self.connection.is_some() {
            return Err(CollectorError::channel("stream client is already connected"));
        }

        info!("Connecting to Bybit WebSocket: {}", self.url);
        let (ws_stream, response) = connect_async(self.url.as_str()).await.map_err(|e| {
            error!("Failed to connect to WebSocket: {}", e);
            CollectorError::from(e)
        })?;
        info!("WebSocket connected, status: {}", response.status());

        let (mut write, read) = ws_stream.split();

        let topics = subscription_topics(symbols, &self.channels);
        for topic in &topics {
            let request = serde_json::json!({ "op": "subscribe", "args": [topic] });
            write.send(Message::Text(request.to_string())).await?;
            debug!("Subscription requested for {}", topic);
        }
        info!("Requested {} subscriptions for {} symbols", topics.len(), symbols.len());

        let writer: WsWriter = Arc::new(Mutex::new(write));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(read, self.router.clone(), shutdown.clone(), closed_tx));
        let heartbeat = tokio::spawn(heartbeat_loop(writer.clone(), self.ping_interval));

        self.connection = Some(Connection {
            writer,
            reader,
            heartbeat,
            shutdown,
            closed: closed_rx,
        });
        Ok(())
    }

    /// Resolves once the connection has ended, for whatever reason.
    pub async fn closed(&self) {
        let Some(conn) = self.connection.as_ref() else {
            return;
        };
        let mut closed = conn.closed.clone();
        // An Err means the reader is gone, which is also closed.
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Close the connection, then stop the persistence worker and wait for it
    /// to write everything already queued.
    pub async fn disconnect(&mut self) -> Result<WorkerStats> {
        let close_result = match self.connection.take() {
            Some(conn) => close_connection(conn).await,
            None => Ok(()),
        };

        let stats = match self.persistence.take() {
            Some(handle) => handle.stop().await?,
            None => WorkerStats::default(),
        };

        let pending = self.router.pending_tickers();
        if pending > 0 {
            info!("{} buffered tickers below batch size were not written", pending);
        }

        close_result?;
        Ok(stats)
    }
}

/// `tickers.<SYMBOL>` for every symbol, then `<channel>.<SYMBOL>` per channel.
pub fn subscription_topics(symbols: &[String], channels: &[String]) -> Vec<String> {
    let mut topics = Vec::with_capacity(symbols.len() * (channels.len() + 1));
    topics.extend(symbols.iter().map(|symbol| format!("tickers.{}", symbol)));
    for channel in channels {
        topics.extend(symbols.iter().map(|symbol| format!("{}.{}", channel, symbol)));
    }
    topics
}

async fn close_connection(conn: Connection) -> Result<()> {
    conn.shutdown.store(true, Ordering::SeqCst);
    conn.heartbeat.abort();

    let sent = conn.writer.lock().await.send(Message::Close(None)).await;
    let result = match sent {
        Ok(()) => Ok(()),
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
        Err(e) => {
            error!("Error disconnecting from WebSocket: {}", e);
            Err(CollectorError::from(e))
        }
    };

    let mut reader = conn.reader;
    if tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
        warn!("Server did not acknowledge close within {:?}", CLOSE_TIMEOUT);
        reader.abort();
    }

    info!("Disconnected from Bybit WebSocket API");
    result
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    router: Arc<FrameRouter>,
    shutdown: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => router.on_frame(&text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => router.on_frame(text),
                Err(_) => warn!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
            },
            Ok(Message::Ping(_)) => {
                // Pong is handled automatically by tungstenite
                debug!("Received ping");
            }
            Ok(Message::Pong(_)) => debug!("Received pong"),
            Ok(Message::Close(frame)) => {
                info!("WebSocket closed: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!("WebSocket read error: {}", e);
                }
                break;
            }
        }
    }

    if !shutdown.load(Ordering::SeqCst) {
        error!("WebSocket connection lost");
    }
    let _ = closed.send(true);
}

async fn heartbeat_loop(writer: WsWriter, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let ping = serde_json::json!({ "op": "ping" }).to_string();
        if let Err(e) = writer.lock().await.send(Message::Text(ping)).await {
            warn!("Heartbeat failed: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_topics() {
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let channels = vec!["orderbook.50".to_string(), "kline.1".to_string()];

        assert_eq!(
            subscription_topics(&symbols, &channels),
            vec![
                "tickers.BTCUSDT",
                "tickers.ETHUSDT",
                "orderbook.50.BTCUSDT",
                "orderbook.50.ETHUSDT",
                "kline.1.BTCUSDT",
                "kline.1.ETHUSDT",
            ]
        );
        assert_eq!(subscription_topics(&symbols, &[]), vec!["tickers.BTCUSDT", "tickers.ETHUSDT"]);
    }
}
