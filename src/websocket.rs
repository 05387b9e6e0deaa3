//! WebSocket proxying.
//!
//! Upgrades the client connection and relays messages bidirectionally to
//! the route's target until either side closes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use http::{header, Request, StatusCode};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as TgMessage};
use url::Url;

use crate::config::loader::CompiledRoute;
use crate::observability::MetricsRecorder;

/// Whether this request asks for a WebSocket upgrade.
pub fn is_upgrade_request(req: &Request<Body>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let upgrade_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && upgrade_websocket
}

/// Complete the client handshake and start the relay to the route target.
pub async fn handle_upgrade(
    req: Request<Body>,
    route: &CompiledRoute,
    metrics: Arc<dyn MetricsRecorder>,
) -> Response {
    let Some(backend_url) = websocket_url(&route.target) else {
        tracing::error!(target = %route.target, "Route target is not usable as a WebSocket URL");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid WebSocket target").into_response();
    };

    let (mut parts, _body) = req.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    tracing::info!(backend = %backend_url, "Handling WebSocket upgrade");
    metrics.update_active(1);

    ws.on_upgrade(move |socket| async move {
        proxy_ws(socket, backend_url).await;
        metrics.update_active(-1);
    })
}

/// Map the route's http(s) target onto the ws(s) scheme.
fn websocket_url(target: &Url) -> Option<Url> {
    let mut url = target.clone();
    let scheme = match target.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => other,
    };
    url.set_scheme(scheme).ok()?;
    Some(url)
}

async fn proxy_ws(client_ws: WebSocket, backend_url: Url) {
    let backend_ws = match connect_async(backend_url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::error!(backend = %backend_url, error = %e, "Failed to connect to backend WebSocket");
            return;
        }
    };

    let (mut backend_sink, mut backend_stream) = backend_ws.split();
    let (mut client_sink, mut client_stream) = client_ws.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_stream.next().await {
            let msg = match msg {
                Message::Text(t) => TgMessage::Text(t.to_string().into()),
                Message::Binary(b) => TgMessage::Binary(b.into()),
                Message::Ping(p) => TgMessage::Ping(p.into()),
                Message::Pong(p) => TgMessage::Pong(p.into()),
                Message::Close(frame) => TgMessage::Close(frame.map(to_backend_close)),
            };
            if let Err(e) = backend_sink.send(msg).await {
                tracing::warn!(error = %e, "Error forwarding message to backend");
                break;
            }
        }
    };

    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_stream.next().await {
            let msg = match msg {
                TgMessage::Text(t) => Message::Text(t.to_string().into()),
                TgMessage::Binary(b) => Message::Binary(b.into()),
                TgMessage::Ping(p) => Message::Ping(p.into()),
                TgMessage::Pong(p) => Message::Pong(p.into()),
                TgMessage::Close(frame) => Message::Close(frame.map(to_client_close)),
                _ => continue,
            };
            if let Err(e) = client_sink.send(msg).await {
                tracing::warn!(error = %e, "Error forwarding message to client");
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_backend => {},
        _ = backend_to_client => {},
    }
    tracing::debug!(backend = %backend_url, "WebSocket connection closed");
}

fn to_backend_close(frame: axum::extract::ws::CloseFrame) -> tungstenite::protocol::CloseFrame {
    tungstenite::protocol::CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.to_string().into(),
    }
}

fn to_client_close(frame: tungstenite::protocol::CloseFrame) -> axum::extract::ws::CloseFrame {
    axum::extract::ws::CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.to_string().into(),
    }
}
