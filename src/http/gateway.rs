//! Gateway surface inside the virtual network.
//!
//! Nothing is served here yet; every request is logged and answered 404.

use axum::{
    extract::Request,
    http::StatusCode,
    Router,
};

pub fn router() -> Router {
    Router::new().fallback(not_found)
}

async fn not_found(request: Request) -> StatusCode {
    tracing::debug!(method = %request.method(), path = %request.uri().path(), "Gateway request");
    StatusCode::NOT_FOUND
}
