//! End-to-end signal handling.
//!
//! Kept in its own test binary: the signal is delivered to the whole
//! process and would stop any other supervisor running alongside.

use std::time::Duration;

use vmnet_proxy::lifecycle::{ShutdownReason, Supervisor};

mod common;

#[tokio::test]
async fn sigterm_stops_cleanly_and_removes_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.sock");
    let second = dir.path().join("second.sock");
    let config = common::proxy_config(&[&first, &second]);
    let network = common::network(&config);

    let running = Supervisor::new(config, network).start().await.unwrap();
    let shutdown = running.shutdown_handle();
    assert!(first.exists() && second.exists());

    // Handlers are installed by `start`, so the signal cannot be lost.
    let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    assert_eq!(rc, 0);

    let result = tokio::time::timeout(Duration::from_secs(2), running.wait())
        .await
        .unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(shutdown.reason(), Some(ShutdownReason::Signal("SIGTERM")));
    assert!(!first.exists());
    assert!(!second.exists());
}
