//! WebSocket signaling client helpers.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::protocol::{IceCandidateInit, SessionDescription};

/// Anything the signaling server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ServerSignal {
    Description(SessionDescription),
    Candidate(IceCandidateInit),
}

/// Send a session description as JSON over the WebSocket.
pub async fn send_description(
    ws_stream: &mut (impl Sink<Message, Error = tungstenite::Error> + Unpin),
    desc: &SessionDescription,
) -> Result<(), ProbeError> {
    let json = serde_json::to_string(desc)?;
    info!(kind = desc.kind.as_str(), len = desc.sdp.len(), "Sending description");
    ws_stream.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Receive and parse the next signaling message from the WebSocket.
pub async fn recv_signal(
    ws_stream: &mut (impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin),
) -> Result<ServerSignal, ProbeError> {
    while let Some(msg) = ws_stream.next().await {
        match msg? {
            Message::Text(text) => {
                debug!("Received: {text}");
                return Ok(serde_json::from_str(&text)?);
            }
            Message::Close(frame) => {
                return Err(ProbeError::Closed(frame.map(|f| u16::from(f.code))));
            }
            other => {
                debug!("Ignoring non-text message: {other:?}");
            }
        }
    }
    Err(ProbeError::Closed(None))
}
