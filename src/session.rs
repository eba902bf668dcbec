//! One signaling connection from accept to teardown.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ChannelMessage, DataChannel, EngineAdapter, NatConfig, PeerEngine};
use crate::error::RelayError;
use crate::outbound::{self, Outbound, WriterGone};
use crate::protocol::IceCandidateInit;
use crate::registry::{IdSource, Registry, SessionId};
use crate::relay::{self, Handled};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Idle time allowed between two client messages.
    pub read_timeout: Duration,
    /// Largest accepted message, in bytes.
    pub max_message_size: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionLimits {
    /// WebSocket settings that stop oversized frames before they are buffered.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    PeerClosed,
    IdleTimeout,
    ReadFailed,
    TooLarge,
    Protocol,
    SendFailed,
    Shutdown,
    /// The engine could not be created or registered.
    InternalError,
}

/// Everything a session needs from the surrounding server.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub engines: Arc<dyn EngineAdapter>,
    pub ids: Arc<dyn IdSource>,
    pub nat: NatConfig,
    pub limits: SessionLimits,
    pub shutdown: CancellationToken,
}

/// Run one signaling session over an accepted WebSocket.
///
/// Returns once the session has ended, the engine has been closed and the
/// writer has flushed.
pub async fn start<S>(ctx: &SessionContext, ws: WebSocketStream<S>) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let writer_failed = CancellationToken::new();
    let (outbound, writer) = outbound::spawn_writer(sink, writer_failed.clone());

    let outcome = match ctx.engines.create_instance(&ctx.nat).await {
        Ok(engine) => {
            let id = ctx.ids.next_id();
            match ctx.registry.register_guarded(id.clone(), Arc::clone(&engine)) {
                Ok(registration) => {
                    info!(session_id = %id, "Session started");
                    let gate = Arc::new(CandidateGate::new());
                    wire_engine(&id, engine.as_ref(), &outbound, &gate);
                    let control = LoopControl {
                        id: &id,
                        limits: ctx.limits,
                        shutdown: &ctx.shutdown,
                        writer_failed: &writer_failed,
                    };
                    let outcome =
                        receive_loop(&control, engine.as_ref(), &mut stream, &outbound, &gate)
                            .await;
                    drop(registration);
                    info!(session_id = %id, ?outcome, "Session ended");
                    outcome
                }
                Err(e) => {
                    warn!(session_id = %id, "Failed to register session: {e}");
                    engine.close();
                    outbound.close(CloseCode::Error, "internal error");
                    SessionOutcome::InternalError
                }
            }
        }
        Err(e) => {
            warn!("Failed to initialize peer connection: {e}");
            outbound.close(CloseCode::Error, "internal error");
            SessionOutcome::InternalError
        }
    };

    outbound.finish();
    if let Err(e) = writer.await {
        warn!("Writer task failed: {e}");
    }
    outcome
}

/// Holds local candidates until the answer they belong to has been written,
/// so a client never sees a candidate before the description it refers to.
struct CandidateGate {
    /// `None` once the gate is open.
    held: Mutex<Option<Vec<String>>>,
}

impl CandidateGate {
    fn new() -> Self {
        Self {
            held: Mutex::new(Some(Vec::new())),
        }
    }

    fn send(&self, json: String, outbound: &Outbound) -> Result<(), WriterGone> {
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(queue) => {
                queue.push(json);
                Ok(())
            }
            None => outbound.send_text(json),
        }
    }

    fn open(&self, outbound: &Outbound) {
        let mut held = self.held.lock();
        let Some(queue) = held.take() else {
            return;
        };
        debug!(count = queue.len(), "Releasing held candidates");
        for json in queue {
            if outbound.send_text(json).is_err() {
                break;
            }
        }
    }
}

/// Forward local candidates to the client and echo every data-channel
/// message back on the channel it came from.
fn wire_engine(
    id: &SessionId,
    engine: &dyn PeerEngine,
    outbound: &Outbound,
    gate: &Arc<CandidateGate>,
) {
    let candidate_out = outbound.clone();
    let candidate_gate = Arc::clone(gate);
    let session_id = id.clone();
    engine.on_local_candidate(Box::new(move |candidate: IceCandidateInit| {
        let json = match serde_json::to_string(&candidate) {
            Ok(json) => json,
            Err(e) => {
                warn!(%session_id, "Failed to marshal ICE candidate: {e}");
                return;
            }
        };
        if let Err(e) = candidate_gate.send(json, &candidate_out) {
            warn!(%session_id, "Failed to send ICE candidate: {e}");
        }
    }));

    let session_id = id.clone();
    engine.on_data_channel(Box::new(move |channel: Arc<dyn DataChannel>| {
        info!(%session_id, label = channel.label(), "Data channel opened");
        let echo: Weak<dyn DataChannel> = Arc::downgrade(&channel);
        let session_id = session_id.clone();
        channel.on_message(Box::new(move |message: ChannelMessage| {
            let Some(channel) = echo.upgrade() else {
                return;
            };
            if let Err(e) = channel.send(message) {
                warn!(%session_id, "Failed to echo data channel message: {e}");
            }
        }));
    }));
}

/// What the receive loop reads against besides the stream itself.
#[derive(Clone, Copy)]
struct LoopControl<'a> {
    id: &'a SessionId,
    limits: SessionLimits,
    shutdown: &'a CancellationToken,
    writer_failed: &'a CancellationToken,
}

async fn receive_loop<St>(
    control: &LoopControl<'_>,
    engine: &dyn PeerEngine,
    stream: &mut St,
    outbound: &Outbound,
    gate: &CandidateGate,
) -> SessionOutcome
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let LoopControl {
        id,
        limits,
        shutdown,
        writer_failed,
    } = *control;

    loop {
        // The deadline is reset for every read, so only a silent client expires.
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                outbound.close(CloseCode::Away, "server shutting down");
                return SessionOutcome::Shutdown;
            }
            _ = writer_failed.cancelled() => return SessionOutcome::SendFailed,
            next = tokio::time::timeout(limits.read_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                info!(session_id = %id, "Read timed out after {:?}", limits.read_timeout);
                return SessionOutcome::IdleTimeout;
            }
            Ok(None) => {
                info!(session_id = %id, "Connection closed");
                return SessionOutcome::PeerClosed;
            }
            Ok(Some(Err(tungstenite::Error::Capacity(e)))) => {
                warn!(session_id = %id, "Message too large: {e}");
                outbound.close(CloseCode::Size, "message too large");
                return SessionOutcome::TooLarge;
            }
            Ok(Some(Err(e))) => {
                info!(session_id = %id, "Can't receive: {e}");
                return SessionOutcome::ReadFailed;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => {
                if text.len() > limits.max_message_size {
                    return too_large(id, text.len(), outbound);
                }
                text.to_string()
            }
            Message::Binary(data) => {
                if data.len() > limits.max_message_size {
                    return too_large(id, data.len(), outbound);
                }
                match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(session_id = %id, "Binary message is not UTF-8: {e}");
                        outbound.close(CloseCode::Invalid, "invalid message");
                        return SessionOutcome::Protocol;
                    }
                }
            }
            Message::Close(frame) => {
                debug!(session_id = %id, ?frame, "Close frame received");
                return SessionOutcome::PeerClosed;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        match relay::handle_message(engine, &text, outbound).await {
            Ok(Handled::Answered) => gate.open(outbound),
            Ok(Handled::RemoteApplied | Handled::Ignored) => {}
            Err(e) => {
                warn!(session_id = %id, "Failed to handle SDP: {e}");
                match e {
                    RelayError::Malformed(_) => {
                        outbound.close(CloseCode::Invalid, "malformed message")
                    }
                    RelayError::Engine { .. } => {
                        outbound.close(CloseCode::Error, "negotiation failed")
                    }
                    RelayError::Delivery(_) => {}
                }
                return SessionOutcome::Protocol;
            }
        }
    }
}

fn too_large(id: &SessionId, len: usize, outbound: &Outbound) -> SessionOutcome {
    warn!(session_id = %id, len, "Message too large");
    outbound.close(CloseCode::Size, "message too large");
    SessionOutcome::TooLarge
}
