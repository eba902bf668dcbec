use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::policy::OriginPolicy;
use crate::session::{self, SessionContext};

/// How long shutdown waits for sessions to flush their close frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept signaling connections on `listener` until `ctx.shutdown` fires.
///
/// Only upgrades on `path` whose request passes `policy` are accepted; the
/// rest get a plain HTTP 404 or 403. On shutdown every open session is told
/// to go away and whatever is left in the registry is closed.
pub async fn run_server(
    listener: TcpListener,
    ctx: SessionContext,
    policy: Arc<dyn OriginPolicy>,
    path: String,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(%local_addr, %path, "WebSocket server listening");

    let tracker = TaskTracker::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    continue;
                }
            },
        };
        info!(%peer, "New TCP connection");

        let ctx = ctx.clone();
        let policy = Arc::clone(&policy);
        let path = path.clone();
        tracker.spawn(async move {
            let check = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if request.uri().path() != path {
                    info!(%peer, uri = %request.uri(), "Rejected request for unknown path");
                    return Err(reject(StatusCode::NOT_FOUND));
                }
                if !policy.allows(request) {
                    let origin = request.headers().get("origin").and_then(|v| v.to_str().ok());
                    warn!(%peer, ?origin, "Rejected request from disallowed origin");
                    return Err(reject(StatusCode::FORBIDDEN));
                }
                Ok(response)
            };

            let config = ctx.limits.websocket_config();
            let accepted =
                tokio_tungstenite::accept_hdr_async_with_config(stream, check, Some(config)).await;
            let ws_stream = match accepted {
                Ok(ws) => ws,
                Err(e) => {
                    info!(%peer, "WebSocket handshake failed: {e}");
                    return;
                }
            };
            info!(%peer, "WebSocket connection established");

            let outcome = session::start(&ctx, ws_stream).await;
            info!(%peer, ?outcome, "Connection finished");
        });
    }

    info!(sessions = tracker.len(), "Shutting down signaling server");
    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        warn!("Sessions did not finish within {DRAIN_TIMEOUT:?}");
    }
    let closed = ctx.registry.close_all();
    if closed > 0 {
        info!(closed, "Closed remaining sessions");
    }
    Ok(())
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(status.canonical_reason().map(str::to_string));
    *response.status_mut() = status;
    response
}
