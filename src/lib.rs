pub mod client;
pub mod config;
pub mod engine;
pub mod error;
mod net;
pub mod outbound;
pub mod policy;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod rtc;
pub mod server;
pub mod session;
pub mod stun;

#[cfg(test)]
mod mock;

pub use config::Config;
pub use engine::{EngineAdapter, NatConfig, PeerEngine};
pub use error::{ConfigError, EngineError, ProbeError, RegistryError, RelayError};
pub use net::detect_local_ip;
pub use protocol::*;
pub use registry::{RandomIds, Registry, SessionId};
pub use rtc::{RtcAdapter, RtcEngineConfig, init_crypto, shared_dtls_cert};
pub use session::{SessionContext, SessionLimits, SessionOutcome};
