//! HTTP listener and WebSocket plumbing for the rendezvous service.
//!
//! `/` serves a small index page; `/v1` upgrades to WebSocket and becomes a
//! client session. Each socket gets two pumps: the read pump owns the
//! session state machine, the write pump owns the sink and the keepalive
//! ping. Session registration flows over two channels into one coordinator
//! task, which is the only place the live-session map is touched and where
//! the welcome is enqueued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use wormhole_proto::ServerMessage;

use crate::rendezvous::service::RendezvousService;
use crate::rendezvous::session::Session;

/// Idle cutoff on the read side; refreshed by every frame, pongs included.
const READ_WAIT: Duration = Duration::from_secs(60);
/// Per-frame write deadline.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Keepalive cadence, comfortably inside the read cutoff.
const PING_INTERVAL: Duration = Duration::from_secs(54);
/// Inbound frames larger than this kill the session.
const MAX_MESSAGE_SIZE: usize = 1024;
/// Outbound queue depth per session.
const SEND_QUEUE: usize = 64;

static INDEX_HTML: &str = include_str!("index.html");

pub struct Registration {
    pub session_id: u64,
    pub outbound: mpsc::Sender<ServerMessage>,
}

#[derive(Clone)]
struct WsState {
    service: Arc<RendezvousService>,
    register: mpsc::UnboundedSender<Registration>,
    unregister: mpsc::UnboundedSender<u64>,
    next_session_id: Arc<AtomicU64>,
}

/// The coordinator owns the live-session map exclusively; registration and
/// unregistration arrive over their channels and nowhere else.
pub fn spawn_coordinator(
    service: Arc<RendezvousService>,
    mut register_rx: mpsc::UnboundedReceiver<Registration>,
    mut unregister_rx: mpsc::UnboundedReceiver<u64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sessions: HashMap<u64, mpsc::Sender<ServerMessage>> = HashMap::new();
        loop {
            tokio::select! {
                registration = register_rx.recv() => {
                    let Some(registration) = registration else { break };
                    let welcome = ServerMessage::Welcome {
                        welcome: service.welcome(),
                    };
                    let _ = registration.outbound.try_send(welcome);
                    sessions.insert(registration.session_id, registration.outbound);
                    info!(
                        session = registration.session_id,
                        live = sessions.len(),
                        "client registered"
                    );
                }
                session_id = unregister_rx.recv() => {
                    let Some(session_id) = session_id else { break };
                    sessions.remove(&session_id);
                    info!(session = session_id, live = sessions.len(), "client unregistered");
                }
            }
        }
    })
}

pub fn router(
    service: Arc<RendezvousService>,
    register: mpsc::UnboundedSender<Registration>,
    unregister: mpsc::UnboundedSender<u64>,
) -> Router {
    let state = WsState {
        service,
        register,
        unregister,
        next_session_id: Arc::new(AtomicU64::new(1)),
    };

    Router::new()
        .route("/", get(index))
        .route("/v1", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let session_id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    let (sink, stream) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if state
        .register
        .send(Registration {
            session_id,
            outbound: outbound_tx.clone(),
        })
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(write_pump(sink, outbound_rx, shutdown_rx.clone()));

    let mut session = Session::new(state.service.clone(), outbound_tx, shutdown_tx.clone());
    read_pump(stream, &mut session, shutdown_rx).await;
    session.teardown();

    let _ = state.unregister.send(session_id);
    let _ = shutdown_tx.send(true);
    let _ = writer.await;
}

/// Drain inbound frames into the session until the socket dies, the idle
/// deadline trips, or a shutdown is signalled.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    session: &mut Session,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = tokio::time::timeout(READ_WAIT, stream.next()) => frame,
        };

        match frame {
            Err(_) => {
                debug!("read deadline expired, dropping client");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "socket read failed");
                return;
            }
            Ok(Some(Ok(Message::Text(text)))) => session.on_frame(text.as_bytes()),
            Ok(Some(Ok(Message::Binary(data)))) => session.on_frame(&data),
            Ok(Some(Ok(Message::Close(_)))) => return,
            // Pings are answered by the library; pongs just reset the
            // deadline by arriving.
            Ok(Some(Ok(_))) => {}
        }
    }
}

/// Serialize and write queued frames, pinging on an interval. Everything
/// that touches the sink lives here.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + PING_INTERVAL;
    let mut ping = tokio::time::interval_at(start, PING_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound frame");
                        continue;
                    }
                };
                match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "socket write failed");
                        return;
                    }
                    Err(_) => {
                        debug!("write deadline expired, dropping client");
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                let ping_frame = Message::Ping(Vec::new().into());
                match tokio::time::timeout(WRITE_WAIT, sink.send(ping_frame)).await {
                    Ok(Ok(())) => debug!("sent keepalive ping"),
                    _ => {
                        debug!("failed to write ping, dropping client");
                        return;
                    }
                }
            }
        }
    }
}

/// Serve the rendezvous endpoint until shutdown is signalled, then drain.
pub async fn serve(
    listener: TcpListener,
    service: Arc<RendezvousService>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (register_tx, register_rx) = mpsc::unbounded_channel();
    let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();

    spawn_coordinator(service.clone(), register_rx, unregister_rx);

    let app = router(service, register_tx, unregister_tx);

    info!(addr = %listener.local_addr()?, "rendezvous server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("rendezvous server closed");
    Ok(())
}
