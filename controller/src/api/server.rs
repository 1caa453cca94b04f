//! API server initialization

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::routes::{deployments, health, publish, subscriptions, timeline};
use crate::app::ControllerApp;
use crate::core::constants::DEFAULT_BODY_LIMIT;
use crate::domain::deployments::Reconciler;
use crate::domain::pubsub::Publisher;
use crate::domain::routing::RouteTable;

/// Shared state for all route handlers
#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub publisher: Arc<Publisher>,
    pub reconciler: Arc<Reconciler>,
    pub routes: Arc<RouteTable>,
    pub shutdown_rx: watch::Receiver<bool>,
}

pub struct ApiServer {
    app: ControllerApp,
}

impl ApiServer {
    pub fn new(app: ControllerApp) -> Self {
        Self { app }
    }

    /// Serve until shutdown. Returns the app for final teardown.
    pub async fn start(self) -> Result<ControllerApp> {
        let Self { app } = self;

        let shutdown = app.shutdown.clone();
        let addr = SocketAddr::new(app.config.server.host.parse()?, app.config.server.port);

        let state = ApiState {
            pool: app.database.pool().clone(),
            publisher: app.publisher.clone(),
            reconciler: app.reconciler.clone(),
            routes: app.routes.clone(),
            shutdown_rx: shutdown.subscribe(),
        };

        let router = Self::router(state);

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Controller API listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        Ok(app)
    }

    fn router(state: ApiState) -> Router {
        Router::new()
            .route("/api/v1/health", get(health::health))
            .route(
                "/api/v1/modules/{module}/topics/{topic}/publish",
                post(publish::publish),
            )
            .route(
                "/api/v1/modules/{module}/subscriptions/{name}/reset",
                post(subscriptions::reset),
            )
            .route(
                "/api/v1/deployments",
                post(deployments::create).get(deployments::list),
            )
            .route("/api/v1/deployments/{key}", delete(deployments::delete))
            .route("/api/v1/deployments/{key}/logs", post(deployments::ingest_log))
            .route("/api/v1/timeline", post(timeline::query))
            .route("/api/v1/timeline/stream", get(timeline::stream))
            .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}
