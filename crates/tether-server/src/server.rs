//! `TetherServer`: Axum HTTP + WebSocket front end for a [`Hub`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Extension, Router};
use serde_json::Value;
use tether::Hub;
use tether::transport::AxumTransport;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::clock::run_clock;
use crate::demo::{DemoHandler, ID_ATTRIBUTE};
use crate::health::{self, HealthResponse};
use crate::settings::Settings;
use crate::shutdown::ShutdownCoordinator;
pub use crate::shutdown::SHUTDOWN_REASON;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The connection hub.
    pub hub: Hub,
    /// When the server started.
    pub start_time: Instant,
}

/// The demo server.
pub struct TetherServer {
    settings: Settings,
    hub: Hub,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl TetherServer {
    /// Create a server and its hub. Must be called inside a Tokio runtime.
    pub fn new(settings: Settings) -> Self {
        let hub = Hub::new(
            settings.hub.clone(),
            DemoHandler::new(settings.demo.clock_topic.clone()),
        );
        let shutdown = Arc::new(ShutdownCoordinator::new(
            hub.clone(),
            settings.server.shutdown_grace(),
        ));
        Self {
            settings,
            hub,
            shutdown,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws/{id}", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Get the hub.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind((self.settings.server.host.as_str(), self.settings.server.port)).await
    }

    /// Serve on `listener` until the shutdown coordinator fires.
    ///
    /// On shutdown every connection is closed with [`SHUTDOWN_REASON`] before
    /// the listener stops, then the clock task is stopped.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        let clock = tokio::spawn(run_clock(
            self.hub.clone(),
            self.settings.demo.clock_topic.clone(),
            self.settings.demo.clock_interval(),
            self.shutdown.token(),
        ));

        let coordinator = self.shutdown.clone();
        let signal = async move {
            let _ = coordinator.drain_hub().await;
        };

        info!(%addr, "listening");
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;

        self.shutdown.join_tasks(vec![clock]).await;
        info!("server stopped");
        Ok(())
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.is_shutting_down(),
        state.hub.connection_count(),
        state.hub.topics(),
    ))
}

/// GET /ws/{id}
async fn ws_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.hub.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let limit = state.hub.config().max_frame_size;
    let remote_addr = connect_info.map(|Extension(ConnectInfo(addr))| addr);

    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move {
            let mut transport = AxumTransport::new(socket);
            if let Some(addr) = remote_addr {
                transport = transport.with_remote_addr(addr);
            }
            let attributes = HashMap::from([(ID_ATTRIBUTE.to_owned(), Value::from(id))]);
            match state.hub.register(transport, attributes).await {
                Ok(conn_id) => debug!(conn_id = %conn_id, "websocket session ended"),
                Err(err) => warn!(error = %err, "websocket registration refused"),
            }
        })
}
