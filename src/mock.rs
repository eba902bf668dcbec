//! In-memory engine used by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::{
    CandidateHandler, ChannelMessage, DataChannel, DataChannelHandler, EngineAdapter,
    MessageHandler, NatConfig, PeerEngine,
};
use crate::error::EngineError;
use crate::protocol::{IceCandidateInit, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetRemote(SessionDescription),
    CreateAnswer,
    SetLocal(SessionDescription),
}

#[derive(Default)]
pub struct MockEngine {
    closes: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    fail_remote: AtomicBool,
    candidate_burst: AtomicUsize,
    candidate_handler: Arc<Mutex<Option<Arc<CandidateHandler>>>>,
    channel_handler: Mutex<Option<DataChannelHandler>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_remote() -> Arc<Self> {
        let engine = Self::default();
        engine.fail_remote.store(true, Ordering::SeqCst);
        Arc::new(engine)
    }

    /// Emit `n` candidates from separate threads while the local description
    /// is being applied.
    pub fn with_candidate_burst(n: usize) -> Arc<Self> {
        let engine = Self::default();
        engine.candidate_burst.store(n, Ordering::SeqCst);
        Arc::new(engine)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn emit_candidate(&self, n: usize) {
        emit(&self.candidate_handler, n);
    }

    pub fn has_candidate_handler(&self) -> bool {
        self.candidate_handler.lock().is_some()
    }

    pub fn open_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = Arc::new(MockChannel {
            label: label.to_string(),
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        });
        if let Some(handler) = self.channel_handler.lock().as_ref() {
            let opened: Arc<dyn DataChannel> = channel.clone();
            handler(opened);
        }
        channel
    }
}

fn emit(handler: &Mutex<Option<Arc<CandidateHandler>>>, n: usize) {
    let handler = handler.lock().clone();
    if let Some(handler) = handler {
        handler(candidate(n));
    }
}

pub fn candidate(n: usize) -> IceCandidateInit {
    IceCandidateInit {
        candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 40000 + n),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.calls.lock().push(Call::SetRemote(desc));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(EngineError::Sdp("rejected by mock".into()));
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let remote = self.calls.lock().iter().rev().find_map(|call| match call {
            Call::SetRemote(desc) => Some(desc.sdp.clone()),
            _ => None,
        });
        self.calls.lock().push(Call::CreateAnswer);
        let remote = remote.ok_or(EngineError::NoPendingOffer)?;
        Ok(SessionDescription::answer(format!("answer-to:{remote}")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.calls.lock().push(Call::SetLocal(desc));

        let burst = self.candidate_burst.load(Ordering::SeqCst);
        let threads: Vec<_> = (0..burst)
            .map(|n| {
                let handler = Arc::clone(&self.candidate_handler);
                std::thread::spawn(move || emit(&handler, n))
            })
            .collect();
        for thread in threads {
            let _ = thread.join();
        }
        Ok(())
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        *self.candidate_handler.lock() = Some(Arc::new(handler));
    }

    fn on_data_channel(&self, handler: DataChannelHandler) {
        *self.channel_handler.lock() = Some(handler);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockChannel {
    label: String,
    handler: Mutex<Option<MessageHandler>>,
    sent: Mutex<Vec<ChannelMessage>>,
}

impl MockChannel {
    pub fn deliver(&self, message: ChannelMessage) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(message);
        }
    }

    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.sent.lock().clone()
    }
}

impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn send(&self, message: ChannelMessage) -> Result<(), EngineError> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Hands out pre-built engines in order, or fails when none are left.
#[derive(Default)]
pub struct MockAdapter {
    engines: Mutex<Vec<Arc<MockEngine>>>,
    seen: Mutex<Vec<NatConfig>>,
}

impl MockAdapter {
    pub fn with(engines: Vec<Arc<MockEngine>>) -> Arc<Self> {
        let mut engines = engines;
        engines.reverse();
        Arc::new(Self {
            engines: Mutex::new(engines),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Self::with(Vec::new())
    }

    pub fn nat_configs(&self) -> Vec<NatConfig> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl EngineAdapter for MockAdapter {
    async fn create_instance(&self, nat: &NatConfig) -> Result<Arc<dyn PeerEngine>, EngineError> {
        self.seen.lock().push(nat.clone());
        let engine = self.engines.lock().pop().ok_or_else(|| {
            EngineError::Bind(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "mock adapter exhausted",
            ))
        })?;
        Ok(engine)
    }
}
