//! The seam between the signaling core and the WebRTC stack.
//!
//! The core only talks to [`EngineAdapter`], [`PeerEngine`] and
//! [`DataChannel`]. Handlers registered through them run on the engine's own
//! task, concurrently with the session that registered them, so they must
//! not block.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::protocol::{IceCandidateInit, SessionDescription};

pub type CandidateHandler = Box<dyn Fn(IceCandidateInit) + Send + Sync>;
pub type DataChannelHandler = Box<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;
pub type MessageHandler = Box<dyn Fn(ChannelMessage) + Send + Sync>;

/// NAT and port settings for a new engine instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatConfig {
    /// Public address to advertise with a 1:1 mapping to the local socket.
    pub public_ip: Option<IpAddr>,
    /// Inclusive UDP port range for the peer's socket.
    pub udp_port_range: Option<(u16, u16)>,
}

impl NatConfig {
    /// Both a public address and a port range are known, so STUN discovery
    /// is unnecessary.
    pub fn direct_mapping(&self) -> bool {
        self.public_ip.is_some() && self.udp_port_range.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub binary: bool,
    pub data: Vec<u8>,
}

impl ChannelMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            binary: false,
            data: text.into().into_bytes(),
        }
    }
}

/// Creates isolated peer-engine instances.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    async fn create_instance(&self, nat: &NatConfig) -> Result<Arc<dyn PeerEngine>, EngineError>;
}

/// One peer connection owned by one session.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    fn on_local_candidate(&self, handler: CandidateHandler);

    fn on_data_channel(&self, handler: DataChannelHandler);

    /// Release the instance. Must not block; calling it again is harmless.
    fn close(&self);
}

pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn on_message(&self, handler: MessageHandler);

    fn send(&self, message: ChannelMessage) -> Result<(), EngineError>;
}
