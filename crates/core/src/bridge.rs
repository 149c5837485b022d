//! WebSocket-to-display-stream bridge
//!
//! One bridge per instance, serving upgrades on the instance's bridge port
//! and shuttling binary frames 1:1 to the display UNIX socket (or a TCP
//! endpoint). Connection lifecycle is reported as structured events on a
//! channel; the coordinator reacts to them instead of parsing process
//! output. At most one upstream connection is active per bridge; a second
//! concurrent attach is refused and closed.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmshare_common::{Error, Result};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

/// Lifecycle events a bridge publishes to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// First successful upstream open for the instance.
    Attached { instance_id: String },
    /// The WebSocket peer went away.
    Detached { instance_id: String },
    /// The bridge itself terminated for any reason other than an ordered
    /// shutdown.
    BridgeExited { instance_id: String },
}

/// Where the display bytes come from.
#[derive(Debug, Clone)]
pub enum BridgeTarget {
    Unix(PathBuf),
    Tcp(String, u16),
}

/// Handle to a running bridge.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    pub port: u16,
    pub cancel: CancellationToken,
}

struct BridgeShared {
    instance_id: String,
    target: BridgeTarget,
    events: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
    attached: AtomicBool,
}

/// Bind the bridge port and start serving WebSocket upgrades. Fails fast
/// when the port reservation lost its race; the caller retries with a
/// fresh port.
pub async fn spawn_bridge(
    instance_id: String,
    port: u16,
    target: BridgeTarget,
    events: mpsc::Sender<BridgeEvent>,
) -> Result<BridgeHandle> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let cancel = CancellationToken::new();

    let shared = Arc::new(BridgeShared {
        instance_id: instance_id.clone(),
        target,
        events: events.clone(),
        cancel: cancel.clone(),
        attached: AtomicBool::new(false),
    });

    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(shared);

    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        info!("Bridge for {} listening on port {}", instance_id, port);
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(serve_cancel.clone().cancelled_owned())
            .await;

        if let Err(e) = result {
            error!("Bridge for {} failed: {}", instance_id, e);
        }
        if !serve_cancel.is_cancelled() {
            let _ = events
                .send(BridgeEvent::BridgeExited {
                    instance_id: instance_id.clone(),
                })
                .await;
        }
        debug!("Bridge for {} stopped", instance_id);
    });

    Ok(BridgeHandle { port, cancel })
}

async fn ws_upgrade(
    State(shared): State<Arc<BridgeShared>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, shared))
}

async fn handle_socket(mut socket: WebSocket, shared: Arc<BridgeShared>) {
    if shared.attached.swap(true, Ordering::SeqCst) {
        warn!(
            "{}",
            Error::AlreadyAttached(shared.instance_id.clone())
        );
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let result = attach_and_pump(socket, &shared).await;
    shared.attached.store(false, Ordering::SeqCst);

    if let Err(e) = result {
        debug!("Bridge session for {} ended: {}", shared.instance_id, e);
    }
    let _ = shared
        .events
        .send(BridgeEvent::Detached {
            instance_id: shared.instance_id.clone(),
        })
        .await;
}

async fn attach_and_pump(socket: WebSocket, shared: &Arc<BridgeShared>) -> Result<()> {
    match &shared.target {
        BridgeTarget::Unix(path) => {
            let upstream = UnixStream::connect(path).await.map_err(|e| {
                error!("Failed to open display socket {}: {}", path.display(), e);
                Error::Io(e)
            })?;
            notify_attached(shared).await;
            let (read, write) = upstream.into_split();
            pump(socket, read, write, &shared.cancel).await
        }
        BridgeTarget::Tcp(host, port) => {
            let upstream = TcpStream::connect((host.as_str(), *port)).await.map_err(|e| {
                error!("Failed to open display endpoint {}:{}: {}", host, port, e);
                Error::Io(e)
            })?;
            notify_attached(shared).await;
            let (read, write) = upstream.into_split();
            pump(socket, read, write, &shared.cancel).await
        }
    }
}

async fn notify_attached(shared: &Arc<BridgeShared>) {
    debug!("Client attached to {}", shared.instance_id);
    let _ = shared
        .events
        .send(BridgeEvent::Attached {
            instance_id: shared.instance_id.clone(),
        })
        .await;
}

/// Shuttle bytes both ways until either side closes or the bridge is
/// cancelled. Each direction preserves byte order; the directions are
/// independent.
async fn pump<R, W>(
    socket: WebSocket,
    upstream_read: R,
    upstream_write: W,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (ws_write, ws_read) = socket.split();

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = forward_ws_to_stream(ws_read, upstream_write) => result,
        result = forward_stream_to_ws(upstream_read, ws_write) => result,
    }
}

async fn forward_ws_to_stream<W>(
    mut ws_read: SplitStream<WebSocket>,
    mut upstream: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = ws_read.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                upstream.write_all(&data).await?;
            }
            Ok(Message::Text(text)) => {
                // Some console clients send the protocol preamble as text.
                upstream.write_all(text.as_bytes()).await?;
            }
            Ok(Message::Close(_)) => {
                debug!("WebSocket closed by client");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

async fn forward_stream_to_ws<R>(
    mut upstream: R,
    mut ws_write: SplitSink<WebSocket, Message>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = upstream.read(&mut buffer).await?;
        if n == 0 {
            debug!("Display stream closed");
            break;
        }
        if let Err(e) = ws_write.send(Message::Binary(buffer[..n].to_vec())).await {
            debug!("WebSocket write error: {}", e);
            break;
        }
    }

    let _ = ws_write.close().await;
    Ok(())
}
