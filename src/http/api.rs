//! Root API served on the host endpoints.

use std::time::Duration;

use axum::Router;

use crate::http::pprof;

/// Mount point of the stack's routes; the prefix is stripped before they
/// see the request.
pub const NETWORK_PREFIX: &str = "/network";

/// The root API: the stack router under [`NETWORK_PREFIX`], plus the
/// profiling routes when `debug` is set.
pub fn router(stack: Router, debug: bool, request_timeout: Duration) -> Router {
    let router = Router::new().nest(NETWORK_PREFIX, stack);
    if debug {
        router.merge(pprof::router(request_timeout))
    } else {
        router
    }
}
