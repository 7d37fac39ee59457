//! # Voice Agent WebSocket
//!
//! Clients connect to `/ws/voice-agent`. The upgrade is refused with
//! `503 capacity_exceeded` when the Session Registry is full, so a rejected
//! client never gets a half-open session.
//!
//! ## Wire protocol:
//! - **Binary frames**: raw PCM audio, format fixed by the `audio` config
//! - **Text frames**: `start`, `stop`, `error` control tokens, or chat text
//!   (a literal control word is sent escaped as `\start`)
//!
//! ## Responsibilities:
//! The [`VoiceSocket`] actor is transport only. It decodes inbound frames
//! and queues them for the session's relay task, and encodes whatever the
//! relay sends back. It also owns the ping/pong heartbeat. All conversation
//! logic lives in [`crate::relay`].

use crate::codec::{self, DecodeError, Encoded, WireMessage};
use crate::error::{AppError, AppResult};
use crate::relay::{Inbound, Outbound, SessionRelay};
use crate::session::registry::SessionId;
use crate::state::{AppState, SessionCounters};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest inbound frame accepted (one audio chunk).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frames buffered from the relay to the socket.
const OUTBOUND_QUEUE: usize = 64;

pub struct VoiceSocket {
    id: SessionId,
    inbound: mpsc::Sender<Inbound>,
    outbound: Option<mpsc::Receiver<Outbound>>,
    cancel: CancellationToken,
    counters: Arc<SessionCounters>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl VoiceSocket {
    fn new(
        id: SessionId,
        inbound: mpsc::Sender<Inbound>,
        outbound: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
        counters: Arc<SessionCounters>,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            id,
            inbound,
            outbound: Some(outbound),
            cancel,
            counters,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    /// Hand a frame to the relay, preserving receipt order.
    ///
    /// When the queue is full the actor pauses (`ctx.wait`) until the relay
    /// catches up, which stops reading from the client. A relay that stays
    /// stuck for the whole client timeout ends the connection.
    fn forward(&mut self, item: Inbound, ctx: &mut ws::WebsocketContext<Self>) {
        match self.inbound.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                debug!(session_id = %self.id, "Relay queue full, pausing reads");
                let tx = self.inbound.clone();
                let limit = self.client_timeout;
                ctx.wait(
                    async move { tokio::time::timeout(limit, tx.send(item)).await }
                        .into_actor(self)
                        .map(|result, act, ctx| {
                            if !matches!(result, Ok(Ok(()))) {
                                warn!(session_id = %act.id, "Relay not draining frames, closing connection");
                                ctx.stop();
                            }
                        }),
                );
            }
            Err(TrySendError::Closed(_)) => ctx.stop(),
        }
    }

    fn receive(&mut self, message: WireMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match codec::decode(message) {
            Ok(Some(frame)) => self.forward(Ok(frame), ctx),
            Ok(None) => {}
            Err(err) => self.forward(Err(err), ctx),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.id, "WebSocket connection started");
        self.heartbeat(ctx);
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.id, "WebSocket connection stopped");
        self.cancel.cancel();
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Binary(data)) => self.receive(WireMessage::Binary(data), ctx),
            Ok(ws::Message::Text(text)) => self.receive(WireMessage::Text(text.into_bytes()), ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => match invalid_text(&err) {
                Some(decode_error) => self.forward(Err(decode_error), ctx),
                None => {
                    error!(session_id = %self.id, error = %err, "WebSocket protocol error");
                    ctx.stop();
                }
            },
        }
    }
}

/// Frames from the relay.
impl StreamHandler<Outbound> for VoiceSocket {
    fn handle(&mut self, item: Outbound, ctx: &mut Self::Context) {
        match item {
            Outbound::Frame(frame) => match codec::encode(&frame) {
                Encoded::Binary(data) => ctx.binary(data),
                Encoded::Text(text) => ctx.text(text),
            },
            Outbound::Close(reason) => {
                info!(session_id = %self.id, reason = %reason, "Closing WebSocket");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: Some(reason),
                }));
                ctx.stop();
            }
        }
    }

    /// The relay finished; nothing more will be sent.
    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

/// Text frames that are not UTF-8 surface from the transport as an I/O
/// protocol error carrying the UTF-8 failure.
fn invalid_text(err: &ws::ProtocolError) -> Option<DecodeError> {
    match err {
        ws::ProtocolError::Io(io) if io.to_string().to_ascii_lowercase().contains("utf-8") => {
            Some(DecodeError::InvalidText(io.to_string()))
        }
        _ => None,
    }
}

/// Upgrade handler for `/ws/voice-agent`.
pub async fn voice_agent_ws(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);

    let ticket = match app_state.registry.register(peer.clone()) {
        Ok(ticket) => ticket,
        Err(err) => {
            app_state.counters.session_rejected();
            warn!(peer = ?peer, error = %err, "Rejecting voice session");
            return Err(err.into());
        }
    };

    let config = app_state.get_config();
    let id = ticket.id.clone();
    let (inbound_tx, inbound_rx) = mpsc::channel(config.relay.inbound_queue);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

    let socket = VoiceSocket::new(
        id.clone(),
        inbound_tx,
        outbound_rx,
        ticket.cancel.clone(),
        app_state.counters.clone(),
        Duration::from_secs(config.relay.heartbeat_interval_secs),
        Duration::from_secs(config.relay.client_timeout_secs),
    );

    let response = match ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()
    {
        Ok(response) => response,
        Err(err) => {
            app_state.registry.unregister(&id);
            return Err(AppError::BadRequest(format!("WebSocket handshake failed: {}", err)));
        }
    };

    app_state.counters.session_opened();
    let relay = SessionRelay::new(
        ticket,
        &config.session_settings(),
        app_state.pipeline(),
        app_state.registry.clone(),
        app_state.counters.clone(),
        inbound_rx,
        outbound_tx,
    );
    tokio::spawn(relay.run());

    info!(session_id = %id, peer = ?peer, "Voice session opened");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_utf8_failures_become_decode_errors() {
        let utf8 = ws::ProtocolError::Io(io::Error::new(
            io::ErrorKind::Other,
            "invalid utf-8 sequence of 1 bytes from index 0",
        ));
        assert!(matches!(invalid_text(&utf8), Some(DecodeError::InvalidText(_))));
    }

    #[test]
    fn test_other_protocol_errors_are_fatal() {
        assert!(invalid_text(&ws::ProtocolError::UnmaskedFrame).is_none());

        let eof = ws::ProtocolError::Io(io::Error::new(io::ErrorKind::Other, "payload reached EOF"));
        assert!(invalid_text(&eof).is_none());
    }
}
