use tracing::{debug, info};

use crate::engine::PeerEngine;
use crate::error::RelayError;
use crate::outbound::Outbound;
use crate::protocol::SignalingMessage;

/// What [`handle_message`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// An offer was applied and the answer has been written.
    Answered,
    /// A remote answer was applied.
    RemoteApplied,
    Ignored,
}

/// Apply one client signaling message to `engine`.
///
/// Offers are answered through `outbound`, and the call returns only once
/// the answer has been written. Answers are applied silently. Anything else
/// is ignored, including client candidates: candidates only flow from the
/// engine to the client.
pub async fn handle_message(
    engine: &dyn PeerEngine,
    raw: &str,
    outbound: &Outbound,
) -> Result<Handled, RelayError> {
    let handled = match SignalingMessage::parse(raw)? {
        SignalingMessage::Offer(offer) => {
            info!("Received SDP offer ({} bytes)", offer.sdp.len());
            engine
                .set_remote_description(offer)
                .await
                .map_err(RelayError::engine("set remote description"))?;

            let answer = engine
                .create_answer()
                .await
                .map_err(RelayError::engine("create answer"))?;

            engine
                .set_local_description(answer.clone())
                .await
                .map_err(RelayError::engine("set local description"))?;

            let json =
                serde_json::to_string(&answer).map_err(|e| RelayError::Delivery(e.to_string()))?;
            outbound
                .deliver_text(json)
                .await
                .map_err(RelayError::Delivery)?;
            info!("Sent SDP answer ({} bytes)", answer.sdp.len());
            Handled::Answered
        }
        SignalingMessage::Answer(answer) => {
            info!("Received SDP answer ({} bytes)", answer.sdp.len());
            engine
                .set_remote_description(answer)
                .await
                .map_err(RelayError::engine("set remote description"))?;
            Handled::RemoteApplied
        }
        SignalingMessage::Unrecognized { kind } => {
            debug!(?kind, "Ignoring signaling message");
            Handled::Ignored
        }
    };
    Ok(handled)
}
