use futures::{SinkExt, StreamExt};
use satellite_core::ControlChannel;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use warp::Filter;

// ============================================================================
// SERVER START
// ============================================================================

/// Serve the operator control socket at `/ws`
pub fn start(port: u16, control: ControlChannel) -> JoinHandle<()> {
    let control_filter = warp::any().map(move || control.clone());

    let health_route = warp::path::end()
        .and(warp::get())
        .map(|| format!("satellite {}", env!("CARGO_PKG_VERSION")))
        .boxed();

    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(control_filter)
        .map(|ws: warp::ws::Ws, control: ControlChannel| {
            ws.on_upgrade(move |socket| handle_connection(socket, control))
        })
        .boxed();

    let routes = health_route.or(ws_route).boxed();

    info!(port, "Starting control socket on 0.0.0.0:{}/ws", port);

    tokio::spawn(async move {
        warp::serve(routes).run(([0, 0, 0, 0], port)).await;
    })
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

async fn handle_connection(ws: warp::ws::WebSocket, control: ControlChannel) {
    let (mut socket_tx, mut socket_rx) = ws.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
    let id = control.connect(frames_tx);

    // Broadcast frames -> WebSocket
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if socket_tx.send(warp::ws::Message::text(frame)).await.is_err() {
                break;
            }
        }
    });

    // WebSocket -> control channel
    while let Some(result) = socket_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = id, "Control socket error: {}", e);
                break;
            }
        };
        if let Ok(text) = msg.to_str() {
            if let Err(e) = control.handle_message(id, text) {
                debug!(connection = id, "Control frame not handled: {}", e);
            }
        } else if msg.is_close() {
            break;
        }
    }

    control.disconnect(id);
    forward_task.abort();
}
