use thiserror::Error;

/// Failures reported by a WebRTC engine instance or its adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("no free UDP port in range {min}-{max}")]
    PortRangeExhausted { min: u16, max: u16 },

    #[error("invalid candidate: {0}")]
    Candidate(String),

    #[error("invalid session description: {0}")]
    Sdp(String),

    #[error("no remote offer to answer")]
    NoPendingOffer,

    #[error("unsupported description type: {0}")]
    UnsupportedDescription(&'static str),

    #[error("engine is closed")]
    Closed,
}

/// Failures while handling one signaling message. Each one ends the session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{step} failed: {source}")]
    Engine {
        step: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("failed to deliver answer: {0}")]
    Delivery(String),
}

impl RelayError {
    pub(crate) fn engine(step: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| Self::Engine { step, source }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    Duplicate(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write default config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures on the probing client side.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid signaling message: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("signaling connection closed (code {0:?})")]
    Closed(Option<u16>),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("invalid probe config: {0}")]
    Invalid(String),
}
