//! Profiling routes, mounted under `/debug/pprof` in debug mode.
//!
//! `profile` samples the tokio runtime and the process CPU clock for the
//! requested number of seconds and reports a plain-text summary. A profile
//! has to finish within the request timeout.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::runtime::Handle;

const DEFAULT_PROFILE_SECS: u64 = 30;
const MAX_PROFILE_SECS: u64 = 300;

pub fn router(request_timeout: Duration) -> Router {
    Router::new()
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/cmdline", get(cmdline))
        .route("/debug/pprof/profile", get(profile))
        .route("/debug/pprof/symbol", get(symbol).post(symbol))
        .with_state(profile_limit(request_timeout))
}

/// Longest profile that still answers before the request times out.
fn profile_limit(request_timeout: Duration) -> u64 {
    request_timeout
        .as_secs()
        .saturating_sub(1)
        .clamp(1, MAX_PROFILE_SECS)
}

async fn index() -> &'static str {
    "Profiles:\n\
     cmdline  command line of the running process\n\
     profile  runtime and CPU sample (?seconds=N, default 30)\n\
     symbol   symbol lookup (not supported)\n"
}

/// Arguments separated by NUL bytes.
async fn cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join("\0")
}

async fn symbol() -> &'static str {
    "num_symbols: 0\n"
}

#[derive(Debug, Deserialize)]
struct ProfileParams {
    seconds: Option<u64>,
}

async fn profile(State(limit): State<u64>, Query(params): Query<ProfileParams>) -> Response {
    let seconds = params.seconds.unwrap_or(DEFAULT_PROFILE_SECS.min(limit));
    if seconds == 0 || seconds > limit {
        return (
            StatusCode::BAD_REQUEST,
            format!("seconds must be between 1 and {limit}\n"),
        )
            .into_response();
    }

    let report = sample(Duration::from_secs(seconds)).await;
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], report).into_response()
}

#[derive(Debug, Default)]
struct Range {
    min: usize,
    max: usize,
    total: usize,
    samples: usize,
}

impl Range {
    fn add(&mut self, value: usize) {
        if self.samples == 0 || value < self.min {
            self.min = value;
        }
        self.max = self.max.max(value);
        self.total += value;
        self.samples += 1;
    }

    fn mean(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.total as f64 / self.samples as f64
    }
}

async fn sample(duration: Duration) -> String {
    let metrics = Handle::current().metrics();
    let cpu_start = cpu_time();
    let mut tasks = Range::default();
    let mut queue = Range::default();

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        tasks.add(metrics.num_alive_tasks());
        queue.add(metrics.global_queue_depth());
    }

    let cpu = cpu_time().saturating_sub(cpu_start);
    format!(
        "duration_seconds: {}\n\
         workers: {}\n\
         alive_tasks: min={} max={} mean={:.1}\n\
         global_queue_depth: min={} max={} mean={:.1}\n\
         cpu_seconds: {:.3}\n\
         cpu_utilization: {:.1}%\n",
        duration.as_secs(),
        metrics.num_workers(),
        tasks.min,
        tasks.max,
        tasks.mean(),
        queue.min,
        queue.max,
        queue.mean(),
        cpu.as_secs_f64(),
        100.0 * cpu.as_secs_f64() / duration.as_secs_f64(),
    )
}

/// User plus system CPU time consumed by the process.
#[allow(unsafe_code)]
fn cpu_time() -> Duration {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage fills the struct it is given.
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) } != 0 {
        return Duration::ZERO;
    }
    // SAFETY: initialised by the successful call above.
    let usage = unsafe { usage.assume_init() };
    let timeval = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
    };
    timeval(usage.ru_utime) + timeval(usage.ru_stime)
}
