use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use pltester::client::{self, ServerSignal};
use pltester::policy::{AllowList, OriginPolicy, Permissive};
use pltester::probe::{self, ProbeConfig};
use pltester::rtc::{RtcAdapter, RtcEngineConfig};
use pltester::{
    NatConfig, PeerEngine, ProbeError, RandomIds, Registry, SdpType, SessionContext,
    SessionLimits,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::info;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    pltester::init_crypto();
}

fn adapter() -> RtcAdapter {
    RtcAdapter::new(RtcEngineConfig {
        bind_ip: LOCALHOST,
        stun_servers: Vec::new(),
        ice_lite: false,
    })
}

struct TestServer {
    url: String,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

async fn start_server(policy: Arc<dyn OriginPolicy>) -> TestServer {
    init();

    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let registry = Arc::new(Registry::new());
    let shutdown = CancellationToken::new();

    let ctx = SessionContext {
        registry: Arc::clone(&registry),
        engines: Arc::new(adapter()),
        ids: Arc::new(RandomIds),
        nat: NatConfig::default(),
        limits: SessionLimits::default(),
        shutdown: shutdown.clone(),
    };
    let handle = tokio::spawn(pltester::server::run_server(
        listener,
        ctx,
        policy,
        "/ws".to_string(),
    ));

    TestServer {
        url: format!("ws://127.0.0.1:{port}/ws"),
        registry,
        shutdown,
        handle,
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn http_status(err: tungstenite::Error) -> StatusCode {
    match err {
        tungstenite::Error::Http(response) => response.status(),
        other => panic!("expected HTTP rejection, got: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn offer_gets_answer_then_candidates() {
    let server = start_server(Arc::new(Permissive)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();

    let client_peer = adapter().create_peer(&NatConfig::default()).await.unwrap();
    let offer = client_peer.create_offer("dataChannel").await.unwrap();
    client_peer.set_local_description(offer.clone()).await.unwrap();
    client::send_description(&mut ws, &offer).await.unwrap();

    let ServerSignal::Description(answer) = client::recv_signal(&mut ws).await.unwrap() else {
        panic!("first message must be the answer");
    };
    assert_eq!(answer.kind, SdpType::Answer);
    assert!(answer.sdp.contains("webrtc-datachannel"));

    let ServerSignal::Candidate(candidate) = client::recv_signal(&mut ws).await.unwrap() else {
        panic!("expected a candidate after the answer");
    };
    info!(?candidate, "Server candidate");
    assert!(candidate.candidate.starts_with("candidate:"));
    assert!(candidate.candidate.contains("127.0.0.1"));
    assert_eq!(candidate.sdp_m_line_index, Some(0));
    assert_eq!(server.registry.len(), 1);

    ws.close(None).await.unwrap();
    let registry = Arc::clone(&server.registry);
    wait_for("session teardown", || registry.is_empty()).await;
    client_peer.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_packets_are_echoed() {
    let server = start_server(Arc::new(Permissive)).await;

    let config = ProbeConfig {
        frequency: 50,
        duration: Duration::from_secs(1),
        grace: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(10),
        bind_ip: LOCALHOST,
        ..ProbeConfig::default()
    };
    let report = probe::run_probe(&server.url, &config).await.unwrap();
    info!(%report, "Loopback probe");

    assert_eq!(report.sent, 50);
    assert!(report.received > 0, "no echoes: {report}");
    assert!(report.received <= report.sent);
    assert!(report.min_latency.is_some());

    let registry = Arc::clone(&server.registry);
    wait_for("session teardown", || registry.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_path_is_not_found() {
    let server = start_server(Arc::new(Permissive)).await;
    let url = server.url.replace("/ws", "/other");

    let err = tokio_tungstenite::connect_async(url.as_str()).await.unwrap_err();
    assert_eq!(http_status(err), StatusCode::NOT_FOUND);
    assert!(server.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn disallowed_origin_is_forbidden() {
    let server = start_server(Arc::new(AllowList::new(["https://allowed.example"]))).await;

    let mut request = server.url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.example"));
    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    assert_eq!(http_status(err), StatusCode::FORBIDDEN);

    let mut request = server.url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://allowed.example"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let registry = Arc::clone(&server.registry);
    wait_for("session registration", || registry.len() == 1).await;
    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_sends_going_away_and_clears_registry() {
    let server = start_server(Arc::new(Permissive)).await;

    let (mut first, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();
    let registry = Arc::clone(&server.registry);
    wait_for("both sessions", || registry.len() == 2).await;

    server.shutdown.cancel();

    for ws in [&mut first, &mut second] {
        let err = client::recv_signal(ws).await.unwrap_err();
        assert!(
            matches!(err, ProbeError::Closed(Some(1001))),
            "unexpected: {err}"
        );
    }

    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(server.registry.is_empty());

    assert!(tokio_tungstenite::connect_async(server.url.as_str()).await.is_err());
}
