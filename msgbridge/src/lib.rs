//! # msgbridge: Messages-API gateway for chat-completions providers
//!
//! `msgbridge` accepts requests in the messages API shape (`POST /v1/messages`), re-expresses
//! them as chat-completions requests, forwards them to a configured provider, and translates
//! the provider's answer back, either as one JSON body or as a live server-sent event stream.
//!
//! ## Request Flow
//!
//! Every request passes through the [`admission`] layer first: the API key is validated
//! (with results memoized for a few minutes) and metered against a fixed per-key window.
//! The body is then rewritten by [`transcode::to_target`] and sent through an
//! [`upstream::Upstream`]. Completed responses go back through [`transcode::to_source`];
//! streamed responses are rewritten chunk by chunk by a [`transcode::StreamTranscoder`],
//! so the first event reaches the client as soon as the provider produces it.
//!
//! Rate-limit state lives in this process only. Running several instances multiplies the
//! effective limit.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use msgbridge::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = msgbridge::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     msgbridge::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod api;
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod transcode;
pub mod upstream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use axum::{
    Router,
    routing::{get, post},
};
use bon::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

use crate::admission::{Admission, SystemClock};
use crate::upstream::{HttpUpstream, Upstream};
pub use config::Config;

/// Shared state handed to every handler.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .admission(admission)
///     .upstream(upstream)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub admission: Arc<Admission>,
    pub upstream: Arc<dyn Upstream>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/v1/messages", post(api::handlers::messages::create_message))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Background tasks that run alongside the HTTP server.
///
/// Currently this is the admission sweeper. When dropped, the `drop_guard` cancels the
/// shutdown token so tasks never outlive their owner.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    fn start(config: &Config, admission: &Arc<Admission>) -> Self {
        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();

        info!(
            interval = %humantime::format_duration(config.admission.sweep_interval),
            "Starting admission sweeper"
        );
        let sweeper = admission.spawn_sweeper(config.admission.sweep_interval, shutdown_token.clone());

        Self {
            background_tasks: vec![sweeper],
            shutdown_token,
            drop_guard: Some(drop_guard),
        }
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// The assembled gateway: shared state, router and background tasks.
///
/// 1. **Create**: [`Application::new`] builds the admission tables, the upstream client and
///    starts the sweeper
/// 2. **Serve**: [`Application::serve`] binds the listener and handles requests
/// 3. **Shutdown**: once the shutdown future resolves, in-flight requests drain and
///    background tasks stop
pub struct Application {
    router: Router,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application that forwards to the configured HTTP provider
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let upstream = HttpUpstream::new(&config.upstream)?;
        Self::new_with_upstream(config, Arc::new(upstream)).await
    }

    /// Create an application around any [`Upstream`] implementation
    pub async fn new_with_upstream(config: Config, upstream: Arc<dyn Upstream>) -> anyhow::Result<Self> {
        debug!("Starting msgbridge with configuration: {:#?}", config);
        config.validate()?;

        let admission = Arc::new(Admission::new(&config.admission, Arc::new(SystemClock)));
        let bg_services = BackgroundServices::start(&config, &admission);

        let app_state = AppState::builder()
            .config(config.clone())
            .admission(admission)
            .upstream(upstream)
            .build();

        Ok(Self {
            router: build_router(app_state),
            config,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "msgbridge listening on http://{}, forwarding to {}",
            bind_addr,
            self.config.upstream.completions_url()
        );

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        self.bg_services.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{FakeReply, FakeUpstream, create_test_config};
    use axum::http::StatusCode;
    use std::time::Duration;

    fn fake_upstream() -> Arc<dyn Upstream> {
        Arc::new(FakeUpstream::new(FakeReply::Status(StatusCode::BAD_GATEWAY, "unused".into())))
    }

    #[test_log::test(tokio::test)]
    async fn test_healthz() {
        let app = Application::new_with_upstream(create_test_config(), fake_upstream()).await.unwrap();
        let (server, bg_services) = app.into_test_server();

        let response = server.get("/healthz").await;
        response.assert_status(StatusCode::OK);
        response.assert_text("OK");

        bg_services.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = Application::new_with_upstream(create_test_config(), fake_upstream()).await.unwrap();
        let (server, _bg_services) = app.into_test_server();

        server.get("/v1/complete").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = create_test_config();
        config.admission.rate_limit = 0;

        assert!(Application::new_with_upstream(config, fake_upstream()).await.is_err());
    }

    #[tokio::test]
    async fn test_new_builds_http_upstream_from_config() {
        let app = Application::new(create_test_config()).await.unwrap();
        app.bg_services.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_signal() {
        let app = Application::new_with_upstream(create_test_config(), fake_upstream()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), app.serve(async {}))
            .await
            .expect("serve should return once the shutdown future resolves")
            .unwrap();
    }
}
