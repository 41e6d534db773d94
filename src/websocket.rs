//! # Client WebSocket Gateway
//!
//! One `RelaySocket` actor per browser connection on `/voice-translation`.
//!
//! ## Message Flow:
//! 1. On start the actor registers a session with the relay and attaches the
//!    session's outbox as a second actor stream
//! 2. `TRANSLATE` frames are parsed and submitted; the actor waits for each
//!    submission before reading the next frame, so one client's requests go
//!    upstream in the order they were sent
//! 3. Results pushed into the outbox by the router are written back as text
//!    frames
//!
//! ## Heartbeat:
//! A protocol ping goes out every `heartbeat_interval_secs`; a client that
//! stays silent for `client_timeout_secs` is disconnected.

use crate::config::RelayConfig;
use crate::relay::envelope::{ClientRequest, ServerEnvelope, TranslateRequest};
use crate::relay::{Relay, RelayError};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

pub struct RelaySocket {
    relay: Arc<Relay>,

    /// Assigned in `started`; `None` only before that and after `stopped`.
    session_id: Option<String>,

    heartbeat_interval: Duration,

    client_timeout: Duration,

    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(relay: Arc<Relay>, config: &RelayConfig) -> Self {
        Self {
            relay,
            session_id: None,
            heartbeat_interval: config.heartbeat_interval(),
            client_timeout: config.client_timeout(),
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, envelope: &ServerEnvelope) {
        match serde_json::to_string(envelope) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to encode envelope"),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = ?act.session_id, "Client heartbeat timed out, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match ClientRequest::parse(text) {
            Ok(ClientRequest::Translate(request)) => self.submit(request, ctx),
            Ok(ClientRequest::Unsupported(kind)) => {
                debug!(session_id = ?self.session_id, %kind, "Ignoring unsupported message type");
            }
            Err(err) => {
                warn!(session_id = ?self.session_id, error = %err, "Rejected client message");
                self.send(ctx, &ServerEnvelope::error(err.to_string()));
            }
        }
    }

    fn submit(&mut self, request: TranslateRequest, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        let relay = self.relay.clone();

        debug!(%session_id, text = %request.original_text, "Translation requested");

        // `wait` holds back the next frame until this one is on the wire.
        ctx.wait(
            async move { relay.submit(&session_id, request).await }
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(_) => {}
                    Err(err @ RelayError::QueueFull(_)) => {
                        act.send(ctx, &ServerEnvelope::error(err.to_string()));
                    }
                    Err(err) => {
                        warn!(session_id = ?act.session_id, error = %err, "Translation request dropped");
                    }
                }),
        );
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let session_id = self.relay.open_session(outbox);
        info!(%session_id, "Client connected");

        self.session_id = Some(session_id);
        ctx.add_stream(UnboundedReceiverStream::new(inbox));
        self.send(ctx, &ServerEnvelope::connected());
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session_id) = self.session_id.take() {
            if let Some(timestamp) = self.relay.registry().resolve(&session_id) {
                debug!(%session_id, %timestamp, "Client left with a translation outstanding");
            }
            self.relay.close_session(&session_id);
            info!(%session_id, "Client disconnected");
        }
    }
}

/// Envelopes routed to this session.
impl StreamHandler<ServerEnvelope> for RelaySocket {
    fn handle(&mut self, envelope: ServerEnvelope, ctx: &mut Self::Context) {
        self.send(ctx, &envelope);
    }

    // The outbox ends when the registry drops the session; the socket itself
    // decides when the actor stops.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => {
                debug!(bytes = data.len(), "Binary frame from client");
                self.send(
                    ctx,
                    &ServerEnvelope::error("Binary messages are not supported"),
                );
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Client closed the connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// `GET /voice-translation`: upgrade to a relay session.
pub async fn voice_translation(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "WebSocket upgrade requested");
    ws::start(
        RelaySocket::new(state.relay.clone(), &state.config.relay),
        &req,
        stream,
    )
}
