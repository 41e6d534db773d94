//! # Upstream Link
//!
//! Keeps one WebSocket connection to the translation backend alive for the
//! whole process lifetime.
//!
//! ## Supervisor Loop:
//! A single task, started once with [`UpstreamLink::spawn`], repeats:
//! 1. **Connecting**: create a backend session (unless a direct URL is set)
//!    and open the socket
//! 2. **Configuring**: send the pipeline-configuration frame
//! 3. **Ready**: expose the write half to senders, feed inbound frames to the
//!    installed [`UpstreamHandler`]
//! 4. **Disconnected**: drop the write half, wait the fixed reconnect delay
//!
//! There is no backoff growth and no retry cap. Only shutdown ends the loop.
//!
//! ## Writes:
//! The write half lives behind an async mutex, so every frame from every
//! caller goes out whole and in lock order. A write that fails or times out
//! may leave a frame half-buffered in the sink, so the connection is dropped
//! and reported as `Disconnected` rather than reused.

use super::protocol::{OutboundMessage, TextRequest, UpstreamMessage};
use super::{session, LinkEvent, LinkState, UpstreamError, UpstreamHandler};
use crate::config::UpstreamConfig;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Write half of a `Ready` connection.
struct Writer {
    sink: WsSink,
    /// Cancelled once a write on this connection has failed.
    broken: CancellationToken,
}

/// Keepalive ping period on an idle backend connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct UpstreamLink {
    config: UpstreamConfig,
    http: reqwest::Client,
    /// Write half of the current connection; `None` unless `Ready`.
    writer: Mutex<Option<Writer>>,
    handler: RwLock<Option<Arc<dyn UpstreamHandler>>>,
    state: watch::Sender<LinkState>,
    attempts: AtomicU64,
    connections: AtomicU64,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl UpstreamLink {
    pub fn new(config: UpstreamConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            http: reqwest::Client::new(),
            writer: Mutex::new(None),
            handler: RwLock::new(None),
            state,
            attempts: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Install the handler for upstream events, replacing any previous one.
    pub fn on_message(&self, handler: Arc<dyn UpstreamHandler>) {
        match self.handler.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LinkState::Ready
    }

    /// Number of connection attempts made so far.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of connections that reached `Ready`.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Start the supervisor loop. Returns `None` if it is already running.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Upstream supervisor already running");
            return None;
        }
        let link = Arc::clone(self);
        Some(tokio::spawn(link.run()))
    }

    /// Stop the supervisor; an open connection is ended gracefully.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Write one frame on the current connection.
    ///
    /// Fails with [`UpstreamError::NotConnected`] when the link is not `Ready`
    /// and with [`UpstreamError::SendFailed`] when the write errors or times
    /// out. Failures are reported, never retried here; a failed write also
    /// ends the connection.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), UpstreamError> {
        let payload = message
            .to_json()
            .map_err(|e| UpstreamError::Encode(e.to_string()))?;
        self.send_frame(Message::Text(payload)).await
    }

    pub async fn send_text(&self, request: &TextRequest) -> Result<(), UpstreamError> {
        let message =
            OutboundMessage::text(request).map_err(|e| UpstreamError::Encode(e.to_string()))?;
        self.send(&message).await
    }

    pub async fn send_audio(&self, data: String) -> Result<(), UpstreamError> {
        self.send(&OutboundMessage::audio(data)).await
    }

    async fn send_frame(&self, frame: Message) -> Result<(), UpstreamError> {
        let mut writer = self.writer.lock().await;
        let current = writer.as_mut().ok_or(UpstreamError::NotConnected)?;

        let err = match timeout(self.config.send_timeout(), current.sink.send(frame)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Failed to write to translation backend");
                UpstreamError::SendFailed(e.to_string())
            }
            Err(_) => {
                error!("Write to translation backend timed out");
                UpstreamError::SendFailed("write timed out".to_string())
            }
        };

        if let Some(dead) = writer.take() {
            dead.broken.cancel();
        }
        Err(err)
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "Upstream link state changed");
        }
    }

    fn dispatch(&self, event: LinkEvent) {
        let handler = match self.handler.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        match handler {
            Some(handler) => handler.handle(event),
            None => debug!(?event, "No upstream handler installed, dropping event"),
        }
    }

    async fn run(self: Arc<Self>) {
        info!("Upstream supervisor started");

        loop {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.set_state(LinkState::Connecting);

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => self.serve(stream).await,
                Err(err) => warn!(error = %err, "Failed to connect to translation backend"),
            }

            self.set_state(LinkState::Disconnected);
            if self.shutdown.is_cancelled() {
                break;
            }

            let delay = self.config.reconnect_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting to translation backend after delay");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(LinkState::Disconnected);
        info!("Upstream supervisor stopped");
    }

    async fn connect(&self) -> Result<WsStream, UpstreamError> {
        let url = match self.config.direct_ws_url() {
            Some(url) => url.to_string(),
            None => session::create_session(&self.http, &self.config)
                .await?
                .connect_url(),
        };

        let (stream, _response) = timeout(self.config.connect_timeout(), connect_async(url.as_str()))
            .await
            .map_err(|_| UpstreamError::Connect("handshake timed out".to_string()))?
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        info!("Connected to translation backend");
        Ok(stream)
    }

    /// Configure a fresh connection and pump it until it ends.
    async fn serve(&self, stream: WsStream) {
        let (mut sink, mut read) = stream.split();

        self.set_state(LinkState::Configuring);
        if let Err(err) = self.configure(&mut sink).await {
            warn!(error = %err, "Failed to configure translation pipeline");
            return;
        }

        let broken = CancellationToken::new();
        *self.writer.lock().await = Some(Writer {
            sink,
            broken: broken.clone(),
        });
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.set_state(LinkState::Ready);
        self.dispatch(LinkEvent::Connected);

        let mut keepalive = tokio::time::interval(PING_INTERVAL);
        keepalive.tick().await;

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.close_gracefully().await;
                    break;
                }
                _ = broken.cancelled() => {
                    warn!("Dropping translation backend connection after a failed write");
                    break;
                }
                _ = keepalive.tick() => {
                    if let Err(err) = self.send_frame(Message::Ping(Vec::new())).await {
                        warn!(error = %err, "Keepalive ping failed");
                    }
                    continue;
                }
                frame = read.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                Some(Ok(Message::Close(reason))) => {
                    info!(?reason, "Translation backend closed the connection");
                    break;
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(bytes = data.len(), "Ignoring binary frame from translation backend");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Translation backend connection failed");
                    break;
                }
                None => {
                    info!("Translation backend stream ended");
                    break;
                }
            }
        }

        self.writer.lock().await.take();
        self.dispatch(LinkEvent::Disconnected);
    }

    async fn configure(&self, sink: &mut WsSink) -> Result<(), UpstreamError> {
        let payload = OutboundMessage::set_task(&self.config)
            .to_json()
            .map_err(|e| UpstreamError::Encode(e.to_string()))?;

        timeout(self.config.send_timeout(), sink.send(Message::Text(payload)))
            .await
            .map_err(|_| UpstreamError::SendFailed("configuration write timed out".to_string()))?
            .map_err(|e| UpstreamError::SendFailed(e.to_string()))?;

        info!(
            source = %self.config.source_language,
            target = %self.config.target_language,
            "Translation pipeline configured"
        );
        Ok(())
    }

    fn handle_frame(&self, raw: &str) {
        match UpstreamMessage::parse(raw) {
            Ok(UpstreamMessage::PartialTranscription { text, language }) => {
                debug!(%language, %text, "Partial transcription");
            }
            Ok(UpstreamMessage::Other { message_type }) => {
                debug!(%message_type, "Ignoring backend message");
            }
            Ok(message) => self.dispatch(LinkEvent::Message(message)),
            Err(e) => warn!(error = %e, "Dropping unparseable backend frame"),
        }
    }

    async fn close_gracefully(&self) {
        if let Err(err) = self.send(&OutboundMessage::end_task()).await {
            debug!(error = %err, "Could not send end_task");
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.sink.close().await {
                debug!(error = %e, "Error closing backend connection");
            }
        }
    }
}
