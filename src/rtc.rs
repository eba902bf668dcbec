//! [`EngineAdapter`] backed by str0m.
//!
//! str0m is sans-IO, so every peer gets its own task that owns the `Rtc`
//! and its UDP socket. The [`RtcPeer`] handle talks to that task over a
//! command channel; handlers registered on the handle run on the task.

use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::config::DtlsCert;
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, Input, Output, Rtc, RtcConfig, RtcError};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{
    CandidateHandler, ChannelMessage, DataChannel, DataChannelHandler, EngineAdapter,
    MessageHandler, NatConfig, PeerEngine,
};
use crate::error::EngineError;
use crate::protocol::{IceCandidateInit, SdpType, SessionDescription};
use crate::stun;

/// Initialise the str0m crypto provider (safe to call multiple times).
pub fn init_crypto() {
    str0m::crypto::from_feature_flags().install_process_default();
}

/// Return a lazily-generated DTLS certificate that is reused across all peers.
/// This avoids the key-generation cost on every new peer.
static SHARED_CERT: OnceLock<DtlsCert> = OnceLock::new();

pub fn shared_dtls_cert() -> &'static DtlsCert {
    SHARED_CERT.get_or_init(|| {
        let provider = str0m::crypto::from_feature_flags();
        provider
            .dtls_provider
            .generate_certificate()
            .expect("failed to generate DTLS certificate")
    })
}

#[derive(Debug, Clone)]
pub struct RtcEngineConfig {
    /// Local address every peer socket binds to.
    pub bind_ip: IpAddr,
    /// Queried in order for a server-reflexive candidate.
    pub stun_servers: Vec<String>,
    pub ice_lite: bool,
}

pub struct RtcAdapter {
    config: RtcEngineConfig,
}

impl RtcAdapter {
    pub fn new(config: RtcEngineConfig) -> Self {
        Self { config }
    }

    /// Bind a socket, gather candidates and start the peer's event loop.
    pub async fn create_peer(&self, nat: &NatConfig) -> Result<Arc<RtcPeer>, EngineError> {
        let socket = bind_socket(self.config.bind_ip, nat.udp_port_range).await?;
        let local_addr = socket.local_addr().map_err(EngineError::Bind)?;

        let mut candidates = vec![Candidate::host(local_addr, "udp").map_err(candidate_err)?];

        if let Some(public_ip) = nat.public_ip
            && public_ip != local_addr.ip()
        {
            let mapped = SocketAddr::new(public_ip, local_addr.port());
            candidates.push(
                Candidate::server_reflexive(mapped, local_addr, "udp").map_err(candidate_err)?,
            );
        }

        if !nat.direct_mapping()
            && !self.config.stun_servers.is_empty()
            && let Some(mapped) = stun::discover(&socket, &self.config.stun_servers).await
            && mapped != local_addr
            && Some(mapped.ip()) != nat.public_ip
        {
            candidates.push(
                Candidate::server_reflexive(mapped, local_addr, "udp").map_err(candidate_err)?,
            );
        }

        let mut config = RtcConfig::new().set_dtls_cert(shared_dtls_cert().clone());
        if self.config.ice_lite {
            config = config.set_ice_lite(true);
        }
        let mut rtc = config.build(Instant::now());

        let mut local_candidates = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let attribute = candidate_attribute(&candidate);
            info!(candidate = %attribute, "Adding local candidate");
            local_candidates.push(attribute);
            rtc.add_local_candidate(candidate);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handlers = Arc::new(Handlers::default());

        let task = PeerTask {
            rtc,
            socket,
            local_addr,
            commands: rx,
            sender: tx.clone(),
            cancel: cancel.clone(),
            handlers: Arc::clone(&handlers),
            local_candidates,
            candidates_released: false,
            remote_offer: None,
            pending_offer: None,
            local_sdp: None,
            channels: HashMap::new(),
            early: EarlyData::default(),
        };
        tokio::spawn(task.run());

        info!(%local_addr, ice_lite = self.config.ice_lite, "Created new peer");
        Ok(Arc::new(RtcPeer {
            commands: tx,
            cancel,
            handlers,
            local_addr,
        }))
    }
}

#[async_trait]
impl EngineAdapter for RtcAdapter {
    async fn create_instance(&self, nat: &NatConfig) -> Result<Arc<dyn PeerEngine>, EngineError> {
        let peer: Arc<dyn PeerEngine> = self.create_peer(nat).await?;
        Ok(peer)
    }
}

async fn bind_socket(ip: IpAddr, range: Option<(u16, u16)>) -> Result<UdpSocket, EngineError> {
    let Some((min, max)) = range else {
        return UdpSocket::bind(SocketAddr::new(ip, 0))
            .await
            .map_err(EngineError::Bind);
    };
    for port in min..=max {
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(EngineError::Bind(e)),
        }
    }
    Err(EngineError::PortRangeExhausted { min, max })
}

fn candidate_err(e: impl Display) -> EngineError {
    EngineError::Candidate(e.to_string())
}

fn sdp_err(e: impl Display) -> EngineError {
    EngineError::Sdp(e.to_string())
}

/// The `candidate:...` attribute value, without the `a=` prefix.
fn candidate_attribute(candidate: &Candidate) -> String {
    let line = candidate.to_sdp_string();
    let line = line.trim_start_matches("a=");
    if line.starts_with("candidate:") {
        line.to_string()
    } else {
        format!("candidate:{line}")
    }
}

/// Value of the first `a=<name>:` attribute in `sdp`.
fn sdp_attribute<'a>(sdp: &'a str, name: &str) -> Option<&'a str> {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix("a="))
        .find_map(|attr| attr.strip_prefix(name)?.strip_prefix(':'))
        .map(str::trim)
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    SetRemote(SessionDescription, Reply<()>),
    CreateAnswer(Reply<SessionDescription>),
    CreateOffer(String, Reply<SessionDescription>),
    SetLocal(SessionDescription, Reply<()>),
    AddRemoteCandidate(String),
    Write {
        id: ChannelId,
        message: ChannelMessage,
    },
}

#[derive(Default)]
struct Handlers {
    candidate: Mutex<Option<Arc<CandidateHandler>>>,
    data_channel: Mutex<Option<Arc<DataChannelHandler>>>,
}

/// Handle onto one str0m peer. Dropping it stops the peer.
pub struct RtcPeer {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    handlers: Arc<Handlers>,
    local_addr: SocketAddr,
}

impl RtcPeer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Create an offer that opens a data channel named `label`.
    pub async fn create_offer(&self, label: &str) -> Result<SessionDescription, EngineError> {
        let label = label.to_string();
        self.request(|reply| Command::CreateOffer(label, reply)).await
    }

    /// Add a candidate received from the remote side.
    pub fn add_remote_candidate(&self, candidate: &IceCandidateInit) {
        let _ = self
            .commands
            .send(Command::AddRemoteCandidate(candidate.candidate.clone()));
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command + Send,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }
}

#[async_trait]
impl PeerEngine for RtcPeer {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.request(|reply| Command::SetRemote(desc, reply)).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.request(Command::CreateAnswer).await
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.request(|reply| Command::SetLocal(desc, reply)).await
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        *self.handlers.candidate.lock() = Some(Arc::new(handler));
    }

    fn on_data_channel(&self, handler: DataChannelHandler) {
        *self.handlers.data_channel.lock() = Some(Arc::new(handler));
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(local_addr = %self.local_addr, "Closing peer");
        }
        self.cancel.cancel();
    }
}

impl Drop for RtcPeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A data channel opened on a str0m peer.
pub struct RtcChannel {
    id: ChannelId,
    label: String,
    commands: mpsc::UnboundedSender<Command>,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    handler: Option<Arc<MessageHandler>>,
    /// Messages that arrived before a handler was registered.
    early: Vec<ChannelMessage>,
}

impl RtcChannel {
    fn dispatch(&self, message: ChannelMessage) {
        let mut state = self.state.lock();
        let Some(handler) = state.handler.clone() else {
            if state.early.len() < MAX_EARLY_MESSAGES {
                state.early.push(message);
            } else {
                warn!(label = %self.label, "Dropping data for channel without a handler");
            }
            return;
        };
        drop(state);
        handler(message);
    }
}

impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn on_message(&self, handler: MessageHandler) {
        let handler = Arc::new(handler);
        let early = {
            let mut state = self.state.lock();
            state.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut state.early)
        };
        for message in early {
            handler(message);
        }
    }

    fn send(&self, message: ChannelMessage) -> Result<(), EngineError> {
        self.commands
            .send(Command::Write {
                id: self.id,
                message,
            })
            .map_err(|_| EngineError::Closed)
    }
}

struct PeerTask {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedReceiver<Command>,
    sender: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    handlers: Arc<Handlers>,
    local_candidates: Vec<String>,
    candidates_released: bool,
    remote_offer: Option<SdpOffer>,
    pending_offer: Option<SdpPendingOffer>,
    /// The last description this peer produced, waiting to be set as local.
    local_sdp: Option<String>,
    channels: HashMap<ChannelId, Arc<RtcChannel>>,
    early: EarlyData<ChannelId>,
}

/// Most messages held for channels str0m has not reported open yet.
const MAX_EARLY_MESSAGES: usize = 256;

/// Data for channels str0m has not reported open yet.
struct EarlyData<K> {
    held: Vec<(K, ChannelMessage)>,
}

impl<K> Default for EarlyData<K> {
    fn default() -> Self {
        Self { held: Vec::new() }
    }
}

impl<K: PartialEq> EarlyData<K> {
    /// Returns false when the buffer is full and `message` was dropped.
    fn push(&mut self, id: K, message: ChannelMessage) -> bool {
        if self.held.len() >= MAX_EARLY_MESSAGES {
            return false;
        }
        self.held.push((id, message));
        true
    }

    /// Remove and return everything held for `id`, in arrival order.
    fn take(&mut self, id: K) -> Vec<ChannelMessage> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|(early_id, _)| *early_id == id);
        self.held = waiting;
        ready.into_iter().map(|(_, message)| message).collect()
    }
}

impl PeerTask {
    async fn run(mut self) {
        let mut buf = vec![0u8; 65535];
        debug!(local_addr = %self.local_addr, "Event loop started");

        loop {
            let next_timeout = match self.drain_outputs().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(local_addr = %self.local_addr, "poll_output error: {e}");
                    break;
                }
            };
            if !self.rtc.is_alive() {
                info!(local_addr = %self.local_addr, "Peer connection is no longer alive");
                break;
            }

            let wait = next_timeout.saturating_duration_since(Instant::now());
            let sleep = tokio::time::sleep(wait);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                result = self.socket.recv_from(&mut buf) => {
                    let input = match result {
                        Ok((n, source)) => {
                            match Receive::new(Protocol::Udp, source, self.local_addr, &buf[..n]) {
                                Ok(receive) => self.rtc.handle_input(Input::Receive(Instant::now(), receive)),
                                Err(e) => {
                                    debug!(%source, "Dropping unparseable packet: {e}");
                                    Ok(())
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                            debug!("ConnectionReset on UDP recv (ignoring)");
                            self.rtc.handle_input(Input::Timeout(Instant::now()))
                        }
                        Err(e) => {
                            warn!(local_addr = %self.local_addr, "UDP recv: {e}");
                            break;
                        }
                    };
                    if let Err(e) = input {
                        warn!(local_addr = %self.local_addr, "handle_input receive: {e}");
                        break;
                    }
                }
                _ = sleep => {
                    if let Err(e) = self.rtc.handle_input(Input::Timeout(Instant::now())) {
                        warn!(local_addr = %self.local_addr, "handle_input timeout: {e}");
                        break;
                    }
                }
            }
        }

        self.rtc.disconnect();
        self.cancel.cancel();
        debug!(local_addr = %self.local_addr, "Event loop stopped");
    }

    async fn drain_outputs(&mut self) -> Result<Instant, RtcError> {
        loop {
            match self.rtc.poll_output()? {
                Output::Timeout(t) => return Ok(t),
                Output::Transmit(t) => {
                    if let Err(e) = self.socket.send_to(&t.contents, t.destination).await {
                        warn!(dest = %t.destination, "UDP send failed: {e}");
                    }
                }
                Output::Event(event) => self.handle_event(event),
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected => info!(local_addr = %self.local_addr, "Connected"),
            Event::IceConnectionStateChange(state) => {
                info!(local_addr = %self.local_addr, ?state, "ICE connection state changed");
            }
            Event::ChannelOpen(id, label) => {
                info!(?id, %label, "Data channel open");
                let channel = Arc::new(RtcChannel {
                    id,
                    label,
                    commands: self.sender.clone(),
                    state: Mutex::new(ChannelState::default()),
                });
                self.channels.insert(id, Arc::clone(&channel));

                let handler = self.handlers.data_channel.lock().clone();
                if let Some(handler) = handler {
                    let opened: Arc<dyn DataChannel> = channel.clone();
                    handler(opened);
                }

                for message in self.early.take(id) {
                    channel.dispatch(message);
                }
            }
            Event::ChannelData(data) => {
                let id = data.id;
                let message = ChannelMessage {
                    binary: data.binary,
                    data: data.data,
                };
                match self.channels.get(&id) {
                    Some(channel) => channel.dispatch(message),
                    None => {
                        if self.early.push(id, message) {
                            debug!(?id, "Buffering data for channel that is not open yet");
                        } else {
                            warn!(?id, "Dropping data for unopened channel, buffer full");
                        }
                    }
                }
            }
            Event::ChannelClose(id) => {
                info!(?id, "Data channel closed");
                self.channels.remove(&id);
                let dropped = self.early.take(id).len();
                if dropped > 0 {
                    debug!(?id, dropped, "Discarded data for closed channel");
                }
            }
            other => debug!("Event: {other:?}"),
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::SetRemote(desc, reply) => {
                let _ = reply.send(self.set_remote(desc));
            }
            Command::CreateAnswer(reply) => {
                let _ = reply.send(self.create_answer());
            }
            Command::CreateOffer(label, reply) => {
                let _ = reply.send(self.create_offer(label));
            }
            Command::SetLocal(desc, reply) => {
                let _ = reply.send(self.set_local(desc));
            }
            Command::AddRemoteCandidate(line) => {
                let line = line.trim_start_matches("a=");
                let parsed = if line.starts_with("candidate:") {
                    Candidate::from_sdp_string(line)
                } else {
                    Candidate::from_sdp_string(&format!("candidate:{line}"))
                };
                match parsed {
                    Ok(candidate) => {
                        debug!(%line, "Adding remote candidate");
                        self.rtc.add_remote_candidate(candidate);
                    }
                    Err(e) => warn!(%line, "Ignoring invalid remote candidate: {e}"),
                }
            }
            Command::Write { id, message } => match self.rtc.channel(id) {
                Some(mut channel) => {
                    if let Err(e) = channel.write(message.binary, &message.data) {
                        warn!(?id, "Data channel write failed: {e}");
                    }
                }
                None => warn!(?id, "Write to unknown data channel"),
            },
        }
    }

    fn set_remote(&mut self, desc: SessionDescription) -> Result<(), EngineError> {
        match desc.kind {
            SdpType::Offer => {
                let offer = SdpOffer::from_sdp_string(&desc.sdp).map_err(sdp_err)?;
                self.remote_offer = Some(offer);
                Ok(())
            }
            SdpType::Answer => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or(EngineError::UnsupportedDescription("answer without a local offer"))?;
                let answer = SdpAnswer::from_sdp_string(&desc.sdp).map_err(sdp_err)?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(sdp_err)?;
                info!("Accepted remote SDP answer");
                Ok(())
            }
        }
    }

    fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        let offer = self.remote_offer.take().ok_or(EngineError::NoPendingOffer)?;
        let answer = self.rtc.sdp_api().accept_offer(offer).map_err(sdp_err)?;
        let sdp = answer.to_sdp_string();
        info!(len = sdp.len(), "Created SDP answer");
        self.local_sdp = Some(sdp.clone());
        Ok(SessionDescription::answer(sdp))
    }

    fn create_offer(&mut self, label: String) -> Result<SessionDescription, EngineError> {
        let mut api = self.rtc.sdp_api();
        api.add_channel(label);
        let (offer, pending) = api
            .apply()
            .ok_or_else(|| EngineError::Sdp("no SDP changes to apply".into()))?;
        self.pending_offer = Some(pending);
        let sdp = offer.to_sdp_string();
        info!(len = sdp.len(), "Created SDP offer");
        self.local_sdp = Some(sdp.clone());
        Ok(SessionDescription::offer(sdp))
    }

    /// str0m applies its own descriptions as it creates them, so this only
    /// checks that `desc` is the one just produced and releases candidates.
    fn set_local(&mut self, desc: SessionDescription) -> Result<(), EngineError> {
        if self.local_sdp.as_deref() != Some(desc.sdp.as_str()) {
            return Err(EngineError::UnsupportedDescription(
                "local description was not created by this peer",
            ));
        }
        self.local_sdp = None;
        self.release_candidates(&desc.sdp);
        Ok(())
    }

    fn release_candidates(&mut self, sdp: &str) {
        if self.candidates_released {
            return;
        }
        self.candidates_released = true;

        let Some(handler) = self.handlers.candidate.lock().clone() else {
            debug!("No candidate handler registered");
            return;
        };
        let sdp_mid = sdp_attribute(sdp, "mid").map(str::to_string);
        let username_fragment = sdp_attribute(sdp, "ice-ufrag").map(str::to_string);
        for candidate in &self.local_candidates {
            handler(IceCandidateInit {
                candidate: candidate.clone(),
                sdp_mid: sdp_mid.clone(),
                sdp_m_line_index: Some(0),
                username_fragment: username_fragment.clone(),
            });
        }
    }
}
