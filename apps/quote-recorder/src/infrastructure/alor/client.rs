//! Quote Stream Client
//!
//! WebSocket transport for the ALOR quote-dispatch endpoint. Turns socket
//! activity into [`ChannelEvent`]s for the [`ConnectionSupervisor`] and
//! reconnects with backoff until cancelled.
//!
//! # Frame Mapping
//!
//! | Socket | Event |
//! |---|---|
//! | handshake done | `Opened(WsSender)` |
//! | dial failure or timeout, read error | `Error` |
//! | text, UTF-8 binary | `Message` |
//! | close frame, end of stream, shutdown | `Closed` |
//!
//! Pings are answered with pongs. Non-UTF-8 binary frames are dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{ChannelSender, QuoteSink, SendError};
use crate::application::services::supervisor::{
    ChannelEvent, ConnectionState, ConnectionSupervisor, SupervisorError,
};
use crate::infrastructure::metrics;

/// Default bound on one TCP/TLS/WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Write half of a live connection.
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end the client.
#[derive(Debug, thiserror::Error)]
pub enum StreamClientError {
    /// The endpoint can never be reached (bad URL or scheme).
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The supervisor refused to start a connection attempt.
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),
}

// =============================================================================
// Sender
// =============================================================================

/// Send capability for one connection.
///
/// Writes from the dispatch loop and the renewal ticker are serialized
/// through one lock. After [`WsSender::close`] every send fails with
/// `SendError::Closed`.
pub struct WsSender<W = WsSink> {
    sink: Mutex<Option<W>>,
}

impl<W> WsSender<W>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    /// Wrap the write half of a connection.
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Closed` after close, or `SendError::Transport` if
    /// the socket refuses the frame.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SendError::Closed)?;
        sink.send(message)
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    /// Close the write half. Later sends fail.
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink
            && let Err(e) = sink.close().await
        {
            tracing::debug!(error = %e, "Error closing WebSocket");
        }
    }

    /// Refuse further sends without touching the socket.
    pub async fn detach(&self) {
        self.sink.lock().await.take();
    }

    /// Whether sends are still accepted.
    pub async fn is_open(&self) -> bool {
        self.sink.lock().await.is_some()
    }
}

#[async_trait]
impl<W> ChannelSender for WsSender<W>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    async fn send_text(&self, text: String) -> Result<(), SendError> {
        self.send(Message::Text(text.into())).await
    }
}

// =============================================================================
// Client
// =============================================================================

/// Client configuration.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Backoff between connection attempts.
    pub reconnect: ReconnectConfig,
    /// How long one handshake may take before it counts as a failed dial.
    pub connect_timeout: Duration,
}

/// How one connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown was requested.
    Cancelled,
    /// The connection dropped or never came up.
    Disconnected {
        /// Whether the channel reached `Open`.
        opened: bool,
    },
}

/// Drives one [`ConnectionSupervisor`] over a WebSocket.
pub struct QuoteStreamClient<S> {
    config: StreamClientConfig,
    supervisor: ConnectionSupervisor<S>,
    cancel: CancellationToken,
}

impl<S: QuoteSink> QuoteStreamClient<S> {
    /// Create a client. Cancelling `cancel` closes the socket and ends
    /// [`run`](Self::run).
    pub const fn new(
        config: StreamClientConfig,
        supervisor: ConnectionSupervisor<S>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            supervisor,
            cancel,
        }
    }

    /// The supervisor this client drives.
    pub const fn supervisor(&self) -> &ConnectionSupervisor<S> {
        &self.supervisor
    }

    /// Connect, stream, and reconnect until cancelled.
    ///
    /// Dropping the client at the end releases the sink, which lets a queued
    /// writer drain.
    ///
    /// # Errors
    ///
    /// Returns `MaxReconnectAttemptsExceeded` when the backoff gives up and
    /// `WebSocket` when the endpoint URL is unusable.
    pub async fn run(mut self) -> Result<(), StreamClientError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        let status = self.supervisor.status();

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Quote stream client cancelled");
                return Ok(());
            }

            match self.connect_and_run().await? {
                SessionEnd::Cancelled => {
                    tracing::info!("Quote stream client stopped");
                    return Ok(());
                }
                SessionEnd::Disconnected { opened } => {
                    if opened {
                        policy.reset();
                    }
                }
            }

            let Some(delay) = policy.next_delay() else {
                tracing::error!(
                    attempts = policy.attempt_count(),
                    "Giving up on quote stream"
                );
                return Err(StreamClientError::MaxReconnectAttemptsExceeded(
                    policy.max_attempts(),
                ));
            };

            status.increment_reconnect_attempts();
            metrics::record_reconnect();
            tracing::info!(
                attempt = policy.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to quote stream"
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Quote stream client cancelled during reconnect delay");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_and_run(&mut self) -> Result<SessionEnd, StreamClientError> {
        self.supervisor.connect()?;
        tracing::info!(url = %self.config.url, "Connecting to quote stream");

        let dial = tokio::select! {
            () = self.cancel.cancelled() => {
                self.supervisor.handle_event(ChannelEvent::Closed).await;
                return Ok(SessionEnd::Cancelled);
            }
            dial = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(self.config.url.as_str()),
            ) => dial,
        };

        let ws_stream = match dial {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Err(_elapsed) => {
                let timeout_ms =
                    u64::try_from(self.config.connect_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(timeout_ms, "Quote stream handshake timed out");
                self.supervisor
                    .handle_event(ChannelEvent::Error(format!(
                        "connect timed out after {timeout_ms}ms"
                    )))
                    .await;
                return Ok(SessionEnd::Disconnected { opened: false });
            }
            Ok(Err(e)) => {
                let fatal = matches!(e, tungstenite::Error::Url(_));
                self.supervisor
                    .handle_event(ChannelEvent::Error(e.to_string()))
                    .await;
                if fatal {
                    return Err(e.into());
                }
                return Ok(SessionEnd::Disconnected { opened: false });
            }
        };

        let (write, mut read) = ws_stream.split();
        let sender = Arc::new(WsSender::new(write));
        let state = self
            .supervisor
            .handle_event(ChannelEvent::Opened(sender.clone()))
            .await;
        let opened = state == ConnectionState::Open;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    sender.close().await;
                    self.supervisor.handle_event(ChannelEvent::Closed).await;
                    return Ok(SessionEnd::Cancelled);
                }
                msg = read.next() => {
                    let event = match msg {
                        Some(Ok(Message::Text(text))) => ChannelEvent::Message(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => ChannelEvent::Message(text),
                            Err(_) => {
                                tracing::warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sender.send(Message::Pong(data)).await {
                                tracing::debug!(error = %e, "Failed to answer ping");
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(
                                reason = frame.as_ref().map_or("", |f| f.reason.as_str()),
                                "Server sent close frame"
                            );
                            ChannelEvent::Closed
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => ChannelEvent::Error(e.to_string()),
                        None => {
                            tracing::info!("WebSocket stream ended");
                            ChannelEvent::Closed
                        }
                    };

                    let ends = matches!(event, ChannelEvent::Closed | ChannelEvent::Error(_));
                    if ends {
                        sender.detach().await;
                    }
                    self.supervisor.handle_event(event).await;
                    if ends {
                        return Ok(SessionEnd::Disconnected { opened });
                    }
                }
            }
        }
    }
}
