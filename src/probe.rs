//! Client side of a loss and latency measurement.
//!
//! The probe offers a data channel to the signaling server, then sends
//! `"{index},{unix_millis}"` packets at a fixed rate and matches the echoes
//! by index.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::{self, ServerSignal};
use crate::engine::{ChannelMessage, DataChannel, NatConfig, PeerEngine};
use crate::error::ProbeError;
use crate::protocol::SdpType;
use crate::rtc::{RtcAdapter, RtcEngineConfig, RtcPeer};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Packets per second.
    pub frequency: u32,
    pub duration: Duration,
    /// Packets shorter than this are padded up to it.
    pub packet_size: usize,
    /// How long to wait for late echoes after the last packet was sent.
    pub grace: Duration,
    pub connect_timeout: Duration,
    pub bind_ip: IpAddr,
    pub label: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            frequency: 32,
            duration: Duration::from_secs(10),
            packet_size: 0,
            grace: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            label: "dataChannel".to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn total_packets(&self) -> u64 {
        (f64::from(self.frequency) * self.duration.as_secs_f64()).round() as u64
    }

    fn validate(&self) -> Result<(), ProbeError> {
        if self.frequency == 0 {
            return Err(ProbeError::Invalid("frequency must be positive".into()));
        }
        if self.total_packets() == 0 {
            return Err(ProbeError::Invalid("duration too short to send a packet".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub sent: u64,
    pub received: u64,
    /// Fraction of sent packets that were never echoed, 0.0 to 1.0.
    pub loss_rate: f64,
    pub min_latency: Option<Duration>,
    pub avg_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
}

impl ProbeReport {
    pub fn from_samples(sent: u64, latencies: &[Duration]) -> Self {
        let received = latencies.len() as u64;
        let loss_rate = if sent == 0 {
            0.0
        } else {
            sent.saturating_sub(received) as f64 / sent as f64
        };
        let avg_latency = (!latencies.is_empty())
            .then(|| latencies.iter().sum::<Duration>() / latencies.len() as u32);
        Self {
            sent,
            received,
            loss_rate,
            min_latency: latencies.iter().min().copied(),
            avg_latency,
            max_latency: latencies.iter().max().copied(),
        }
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} received {} loss {:.2}%",
            self.sent,
            self.received,
            self.loss_rate * 100.0
        )?;
        if let (Some(min), Some(avg), Some(max)) =
            (self.min_latency, self.avg_latency, self.max_latency)
        {
            write!(f, " latency min {min:?} avg {avg:?} max {max:?}")?;
        }
        Ok(())
    }
}

pub fn encode_packet(index: u64, unix_millis: u64, size: usize) -> String {
    let mut packet = format!("{index},{unix_millis}");
    if packet.len() < size {
        packet.push(',');
        let pad = size.saturating_sub(packet.len());
        packet.extend(std::iter::repeat_n('x', pad));
    }
    packet
}

/// Index and timestamp of an echoed packet.
pub fn parse_packet(data: &[u8]) -> Option<(u64, u64)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut fields = text.split(',');
    let index = fields.next()?.trim().parse().ok()?;
    let millis = fields.next()?.trim().parse().ok()?;
    Some((index, millis))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Apply the server's answer and candidates until the data channel opens.
async fn negotiate(
    ws: &mut WsStream,
    peer: &RtcPeer,
    open_rx: &mut mpsc::UnboundedReceiver<Arc<dyn DataChannel>>,
) -> Result<Arc<dyn DataChannel>, ProbeError> {
    let mut answered = false;
    loop {
        tokio::select! {
            Some(channel) = open_rx.recv() => return Ok(channel),
            signal = client::recv_signal(&mut *ws) => match signal? {
                ServerSignal::Description(desc) if desc.kind == SdpType::Answer && !answered => {
                    peer.set_remote_description(desc).await?;
                    answered = true;
                }
                ServerSignal::Description(desc) => {
                    debug!(kind = desc.kind.as_str(), "Ignoring unexpected description");
                }
                ServerSignal::Candidate(candidate) => peer.add_remote_candidate(&candidate),
            },
        }
    }
}

/// Connect to `ws_url`, negotiate a data channel and measure it.
pub async fn run_probe(ws_url: &str, config: &ProbeConfig) -> Result<ProbeReport, ProbeError> {
    config.validate()?;

    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await?;
    info!(%ws_url, "Signaling connected");

    let adapter = RtcAdapter::new(RtcEngineConfig {
        bind_ip: config.bind_ip,
        stun_servers: Vec::new(),
        ice_lite: false,
    });
    let peer = adapter.create_peer(&NatConfig::default()).await?;

    let (open_tx, mut open_rx) = mpsc::unbounded_channel::<Arc<dyn DataChannel>>();
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel::<(u64, Instant)>();
    peer.on_data_channel(Box::new(move |channel: Arc<dyn DataChannel>| {
        let echo_tx = echo_tx.clone();
        channel.on_message(Box::new(move |message: ChannelMessage| {
            if let Some((index, _)) = parse_packet(&message.data) {
                let _ = echo_tx.send((index, Instant::now()));
            }
        }));
        let _ = open_tx.send(channel);
    }));

    let offer = peer.create_offer(&config.label).await?;
    peer.set_local_description(offer.clone()).await?;
    client::send_description(&mut ws, &offer).await?;

    let channel = tokio::time::timeout(
        config.connect_timeout,
        negotiate(&mut ws, &peer, &mut open_rx),
    )
    .await
    .map_err(|_| ProbeError::Timeout("data channel to open"))??;
    info!(label = channel.label(), "Data channel open, probing");

    let total = config.total_packets();
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(
        1.0 / f64::from(config.frequency),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(config.duration + config.grace);
    tokio::pin!(deadline);

    let mut sent_at: Vec<Instant> = Vec::with_capacity(total as usize);
    let mut latencies: HashMap<u64, Duration> = HashMap::new();
    let mut signaling_open = true;

    loop {
        let sent = sent_at.len() as u64;
        if sent == total && latencies.len() as u64 == total {
            break;
        }

        tokio::select! {
            _ = &mut deadline => break,
            _ = ticker.tick(), if sent < total => {
                let packet = encode_packet(sent, unix_millis(), config.packet_size);
                if let Err(e) = channel.send(ChannelMessage::text(packet)) {
                    warn!("Data channel send failed: {e}");
                    break;
                }
                sent_at.push(Instant::now());
            }
            Some((index, at)) = echo_rx.recv() => {
                if let Some(sent_time) = sent_at.get(index as usize) {
                    latencies
                        .entry(index)
                        .or_insert_with(|| at.saturating_duration_since(*sent_time));
                }
            }
            signal = client::recv_signal(&mut ws), if signaling_open => match signal {
                Ok(ServerSignal::Candidate(candidate)) => peer.add_remote_candidate(&candidate),
                Ok(ServerSignal::Description(_)) => {}
                Err(e) => {
                    warn!("Signaling ended during probe: {e}");
                    signaling_open = false;
                }
            },
        }
    }

    if signaling_open {
        let _ = ws.close(None).await;
    }
    peer.close();

    let samples: Vec<Duration> = latencies.into_values().collect();
    let report = ProbeReport::from_samples(sent_at.len() as u64, &samples);
    info!(%report, "Probe finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_round_trip_through_text() {
        let packet = encode_packet(17, 1_700_000_000_123, 0);
        assert_eq!(packet, "17,1700000000123");
        assert_eq!(parse_packet(packet.as_bytes()), Some((17, 1_700_000_000_123)));

        let padded = encode_packet(3, 42, 64);
        assert_eq!(padded.len(), 64);
        assert!(padded.starts_with("3,42,x"));
        assert_eq!(parse_packet(padded.as_bytes()), Some((3, 42)));

        assert_eq!(parse_packet(b"ready"), None);
        assert_eq!(parse_packet(&[0xff, 0x2c, 0x31]), None);
    }

    #[test]
    fn report_counts_loss_and_latency() {
        let latencies = [
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(20),
        ];
        let report = ProbeReport::from_samples(4, &latencies);
        assert_eq!(report.received, 3);
        assert!((report.loss_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(report.min_latency, Some(Duration::from_millis(10)));
        assert_eq!(report.avg_latency, Some(Duration::from_millis(20)));
        assert_eq!(report.max_latency, Some(Duration::from_millis(30)));
        assert!(report.to_string().starts_with("sent 4 received 3 loss 25.00%"));
    }

    #[test]
    fn empty_report() {
        let report = ProbeReport::from_samples(0, &[]);
        assert_eq!(report.loss_rate, 0.0);
        assert_eq!(report.avg_latency, None);
        assert_eq!(report.to_string(), "sent 0 received 0 loss 0.00%");

        let all_lost = ProbeReport::from_samples(5, &[]);
        assert_eq!(all_lost.loss_rate, 1.0);
    }

    #[test]
    fn packet_count_follows_rate_and_duration() {
        let config = ProbeConfig {
            frequency: 50,
            duration: Duration::from_secs(3),
            ..ProbeConfig::default()
        };
        assert_eq!(config.total_packets(), 150);
        assert!(config.validate().is_ok());

        let config = ProbeConfig {
            frequency: 0,
            ..ProbeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProbeError::Invalid(_))));
    }
}
