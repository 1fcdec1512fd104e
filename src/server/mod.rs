//! HTTP side of the relay: WebSocket signaling for the two feeds, health,
//! and Prometheus metrics.

mod health;
mod session;
mod signaling;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::pipeline::PipelineState;

pub use health::HealthSnapshot;
pub use session::{encode_jpeg, FeedKind, PacingSettings, Publisher, SessionSet};
pub use signaling::{parse_signal, SessionManager, SignalMessage, SignalReply, FRAMES_CHANNEL};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub pipeline: Arc<PipelineState>,
    pub stream_name: Arc<str>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot::collect(
            &self.pipeline,
            &self.stream_name,
            self.sessions.client_count(FeedKind::Ai),
            self.sessions.client_count(FeedKind::Clean),
            Instant::now(),
        )
    }
}

/// `/{serial}/ai` carries the annotated feed, `/{serial}` the clean one.
pub fn router(serial: &str, app: AppState) -> Router {
    Router::new()
        .route(&format!("/{}/ai", serial), get(ai_feed))
        .route(&format!("/{}", serial), get(clean_feed))
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .with_state(app)
        .layer(CorsLayer::permissive())
}

pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener address")?;
    log::info!("signaling server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server")
}

async fn health(State(app): State<AppState>) -> Response {
    let snapshot = app.snapshot();
    let status =
        StatusCode::from_u16(snapshot.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(snapshot)).into_response()
}

async fn metrics(State(app): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.snapshot().render_metrics(),
    )
        .into_response()
}

async fn ai_feed(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| signaling_loop(socket, app, FeedKind::Ai))
}

async fn clean_feed(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| signaling_loop(socket, app, FeedKind::Clean))
}

async fn signaling_loop(socket: WebSocket, app: AppState, feed: FeedKind) {
    let (mut tx, mut rx) = socket.split();
    let mut shutdown = app.shutdown.clone();
    let mut owned = Vec::new();
    log::debug!("{} signaling connection opened", feed.as_str());

    while !*shutdown.borrow() {
        let text = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    log::debug!("{} signaling socket error: {}", feed.as_str(), err);
                    break;
                }
            },
        };

        let sdp = match parse_signal(&text) {
            Some(SignalMessage::Offer { sdp }) => sdp,
            Some(SignalMessage::Other) | None => {
                log::debug!("{} signaling: ignoring non-offer message", feed.as_str());
                continue;
            }
        };
        let answer = match app.sessions.negotiate(feed, sdp).await {
            Ok((id, answer)) => {
                owned.push(id);
                answer
            }
            Err(err) => {
                log::warn!("{} offer rejected: {:#}", feed.as_str(), err);
                continue;
            }
        };
        match (SignalReply::Answer { sdp: answer }).to_json() {
            Ok(json) => {
                if tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Err(err) => log::warn!("{:#}", err),
        }
    }

    app.sessions.close_sessions(feed, &owned).await;
    log::debug!(
        "{} signaling connection closed ({} sessions released)",
        feed.as_str(),
        owned.len()
    );
}

/// Periodic status line until shutdown.
pub async fn heartbeat(app: AppState, every: Duration) {
    let mut shutdown = app.shutdown.clone();
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let snap = app.snapshot();
        log::info!(
            "heartbeat: {} fps={:.1} healthy={} streaming={} clients ai={} clean={} reconnects={}",
            snap.stream_name,
            snap.fps,
            snap.is_ok(),
            snap.is_streaming,
            snap.connected_clients_ai,
            snap.connected_clients_clean,
            snap.reconnect_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PipelineSlots;

    fn app_state() -> (AppState, watch::Sender<bool>) {
        let slots = PipelineSlots::new();
        let pacing = PacingSettings {
            fps: 30,
            jpeg_quality: 80,
        };
        let (tx, rx) = watch::channel(false);
        let app = AppState {
            sessions: Arc::new(SessionManager::new(Vec::new(), &slots, 64, 48, pacing)),
            pipeline: Arc::new(PipelineState::new()),
            stream_name: Arc::from("Gate"),
            shutdown: rx,
        };
        (app, tx)
    }

    #[tokio::test]
    async fn health_reports_fresh_pipeline_as_ok() {
        let (app, _tx) = app_state();
        app.pipeline.capture().touch();
        app.pipeline.processing().touch();
        let response = health(State(app)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_is_unavailable_when_unhealthy() {
        let (app, _tx) = app_state();
        app.pipeline.set_healthy(false);
        let response = health(State(app)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_are_plain_text() {
        let (app, _tx) = app_state();
        let response = metrics(State(app)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn heartbeat_stops_on_shutdown() {
        let (app, tx) = app_state();
        let task = tokio::spawn(heartbeat(app, Duration::from_secs(30)));
        let _ = tx.send(true);
        let joined = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }
}
