//! HTTP server setup.
//!
//! # Responsibilities
//! - Wrap a surface's routes in the common middleware (request id, access
//!   log, request timeout, request metrics)
//! - Serve them on any listener the proxy owns (host unix sockets or
//!   virtual listeners)
//! - Stop accepting and drain when shutdown is triggered, for a bounded time
//! - Fail when the listener stops accepting for good

use std::fmt;
use std::future::IntoFuture;
use std::io;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::TimeoutConfig;
use crate::http::request::{MakeRequestUuid, RequestIdExt};
use crate::lifecycle::Shutdown;
use crate::net::listener::FallibleListener;
use crate::observability::metrics;

/// One HTTP surface of the proxy.
pub struct HttpServer {
    name: &'static str,
    router: Router,
    drain: Duration,
}

impl HttpServer {
    /// Create a server for `routes`, labelled `name` in logs and metrics.
    pub fn new(name: &'static str, routes: Router, timeouts: &TimeoutConfig) -> Self {
        Self {
            name,
            router: Self::build_router(name, routes, timeouts),
            drain: Duration::from_secs(timeouts.drain_secs),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(name: &'static str, routes: Router, timeouts: &TimeoutConfig) -> Router {
        routes.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(Duration::from_secs(timeouts.request_secs)))
                .layer(middleware::from_fn_with_state(name, record_request)),
        )
    }

    /// Serve until `shutdown` is triggered, then drain open requests.
    ///
    /// Connections still open once the drain period is over are left behind.
    /// The listener is dropped when this returns, which removes its socket
    /// file if it owns one. Fails if the listener stops accepting.
    pub async fn run<L>(self, mut listener: L, shutdown: Shutdown) -> io::Result<()>
    where
        L: FallibleListener,
        L::Addr: fmt::Debug,
    {
        let addr = listener.local_addr()?;
        tracing::info!(server = self.name, address = ?addr, "HTTP server starting");

        let failure = listener.take_failure();
        let failed = async move {
            match failure {
                Some(rx) => match rx.await {
                    Ok(e) => e,
                    Err(_) => std::future::pending().await,
                },
                None => std::future::pending().await,
            }
        };
        let drain = self.drain;
        let drained = {
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                tokio::time::sleep(drain).await;
            }
        };
        let serve = axum::serve(listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .into_future();

        tokio::select! {
            result = serve => result?,
            () = drained => {
                tracing::warn!(
                    server = self.name,
                    address = ?addr,
                    drain_secs = drain.as_secs(),
                    "Drain period over; abandoning open connections"
                );
            }
            e = failed => {
                tracing::error!(server = self.name, address = ?addr, error = %e, "HTTP server failed");
                return Err(e);
            }
        }

        tracing::info!(server = self.name, address = ?addr, "HTTP server stopped");
        Ok(())
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer").field("name", &self.name).finish()
    }
}

async fn record_request(State(surface): State<&'static str>, request: Request, next: Next) -> Response {
    let request_id = request.request_id().unwrap_or("unknown").to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    tracing::debug!(
        request_id = %request_id,
        server = surface,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "Request handled"
    );
    metrics::record_request(surface, response.status().as_u16());
    response
}
