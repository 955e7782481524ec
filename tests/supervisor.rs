//! Supervisor lifecycle tests: startup, serving, cancellation and failure.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixDatagram, UnixStream};

use vmnet_proxy::http::client::{ApiClient, ClientError};
use vmnet_proxy::lifecycle::{ShutdownReason, StartupError, Supervisor, SupervisorError};
use vmnet_proxy::net::Endpoint;
use vmnet_proxy::vnet::api::GUEST_UPGRADE;
use vmnet_proxy::vnet::{ExposeRequest, Protocol, VirtualNetwork};

mod common;

const PROMPT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn cancellation_stops_every_listener() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = (0..3).map(|i| dir.path().join(format!("api{i}.sock"))).collect();
    let refs: Vec<_> = paths.iter().map(|p| p.as_path()).collect();
    let config = common::proxy_config(&refs);
    let network = common::network(&config);

    let running = Supervisor::new(config, network).start().await.unwrap();
    for path in &paths {
        assert!(path.exists(), "{} not bound", path.display());
    }

    let shutdown = running.shutdown_handle();
    shutdown.trigger(ShutdownReason::Requested);
    let result = tokio::time::timeout(PROMPT, running.wait()).await.unwrap();

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    for path in &paths {
        assert!(!path.exists(), "{} left behind", path.display());
    }
}

#[tokio::test]
async fn root_api_serves_stack_routes() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let config = common::proxy_config(&[&api]);
    let network = common::network(&config);

    let running = Supervisor::new(config, network.clone()).start().await.unwrap();
    let client = ApiClient::new(&api);

    let res = client.get("/network/stats").await.unwrap();
    assert_eq!(res.status, StatusCode::OK);
    let stats: Value = serde_json::from_slice(&res.body).unwrap();
    assert_eq!(stats["bytes_sent"], 0);
    assert_eq!(stats["bytes_received"], 0);

    let expose = ExposeRequest {
        local: "127.0.0.1:0".to_string(),
        remote: "192.168.127.2:22".to_string(),
        protocol: Default::default(),
    };
    let res = client
        .post_json("/network/services/forwarder/expose", &expose)
        .await
        .unwrap();
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());

    let res = client.get("/network/services/forwarder/all").await.unwrap();
    let forwards: Vec<ExposeRequest> = serde_json::from_slice(&res.body).unwrap();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].remote, "192.168.127.2:22");

    let res = client.get("/network/services/dns/all").await.unwrap();
    let dns: Value = serde_json::from_slice(&res.body).unwrap();
    assert_eq!(dns["search_domains"][0], "test.example");

    // Profiling routes are debug-only.
    let res = client.get("/debug/pprof/cmdline").await.unwrap();
    assert_eq!(res.status, StatusCode::NOT_FOUND);

    // The prefix is required, and every response carries a request id.
    let res = client.get("/stats").await.unwrap();
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert!(res.headers.contains_key("x-request-id"));

    running.shutdown_handle().trigger(ShutdownReason::Requested);
    tokio::time::timeout(PROMPT, running.wait()).await.unwrap().unwrap();
    assert_eq!(network.forwarder().len(), 1);
}

#[tokio::test]
async fn debug_mode_adds_profiling_routes() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let mut config = common::proxy_config(&[&api]);
    config.observability.debug = true;
    config.observability.stats_interval_secs = 1;
    let network = common::network(&config);

    let running = Supervisor::new(config, network).start().await.unwrap();
    let client = ApiClient::new(&api);

    let res = client.get("/debug/pprof/").await.unwrap();
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.text().contains("profile"));

    let res = client.get("/debug/pprof/profile?seconds=1").await.unwrap();
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.text().contains("workers: "), "{}", res.text());

    let res = client.get("/debug/pprof/profile?seconds=0").await.unwrap();
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    running.shutdown_handle().trigger(ShutdownReason::Requested);
    tokio::time::timeout(PROMPT, running.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn virtual_listeners_serve_gateway_and_host_api() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::proxy_config(&[&dir.path().join("api.sock")]);
    let network = common::network(&config);

    let running = Supervisor::new(config, network.clone()).start().await.unwrap();

    let (status, body) =
        common::get_virtual(&network, "192.168.127.254:7777".parse().unwrap(), "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("bytes_sent"), "{body}");

    let (status, _) =
        common::get_virtual(&network, "192.168.127.1:80".parse().unwrap(), "/anything").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    running.shutdown_handle().trigger(ShutdownReason::Requested);
    tokio::time::timeout(PROMPT, running.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn guest_failure_cancels_everything() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let guest = dir.path().join("guest.sock");
    let mut config = common::proxy_config(&[&api]);
    config.listener.guest = Some(Endpoint::UnixStream(guest.clone()));
    config.network.protocol = Protocol::HyperKit;
    let network = common::network(&config);

    let running = Supervisor::new(config, network).start().await.unwrap();
    let shutdown = running.shutdown_handle();

    // A length prefix above the frame limit is a fatal channel error.
    let mut conn = UnixStream::connect(&guest).await.unwrap();
    conn.write_all(&[0xff, 0xff]).await.unwrap();

    let err = tokio::time::timeout(PROMPT, running.wait())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        SupervisorError::Task { task, source } => {
            assert_eq!(task, "guest");
            assert_eq!(source.kind(), std::io::ErrorKind::InvalidData);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(shutdown.reason(), Some(ShutdownReason::TaskFailed));
    assert!(!api.exists());
    assert!(!guest.exists());
}

#[tokio::test]
async fn guest_error_survives_a_later_signal() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let guest = dir.path().join("guest.sock");
    let mut config = common::proxy_config(&[&api]);
    config.listener.guest = Some(Endpoint::UnixStream(guest.clone()));
    config.network.protocol = Protocol::HyperKit;
    let network = common::network(&config);

    let running = Supervisor::new(config, network).start().await.unwrap();
    let shutdown = running.shutdown_handle();

    let mut conn = UnixStream::connect(&guest).await.unwrap();
    conn.write_all(&[0xff, 0xff]).await.unwrap();

    // The guest task has long failed by the time the signal lands.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!shutdown.trigger(ShutdownReason::Signal("SIGTERM")));

    let err = tokio::time::timeout(PROMPT, running.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(&err, SupervisorError::Task { task, source }
            if task == "guest" && source.kind() == std::io::ErrorKind::InvalidData),
        "{err}"
    );
    assert_eq!(shutdown.reason(), Some(ShutdownReason::TaskFailed));
}

#[tokio::test]
async fn partial_request_does_not_stall_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let mut config = common::proxy_config(&[&api]);
    config.timeouts.drain_secs = 1;
    let network = common::network(&config);

    let running = Supervisor::new(config, network).start().await.unwrap();

    let mut client = UnixStream::connect(&api).await.unwrap();
    client
        .write_all(b"GET /network/stats HTTP/1.1\r\nHost: x\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    running.shutdown_handle().trigger(ShutdownReason::Requested);
    let result = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .expect("shutdown held by an unfinished request");
    assert!(result.is_ok(), "{result:?}");
    assert!(!api.exists());
    drop(client);
}

#[tokio::test]
async fn guest_attaches_through_http_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let mut config = common::proxy_config(&[&api]);
    config.network.protocol = Protocol::HyperKit;
    let network = common::network(&config);

    let running = Supervisor::new(config, network.clone()).start().await.unwrap();
    let client = ApiClient::new(&api);

    let res = client.get("/network/connect").await.unwrap();
    assert_eq!(res.status, StatusCode::UPGRADE_REQUIRED);

    let mut frames = network.subscribe();
    let mut guest = client.upgrade("/network/connect", GUEST_UPGRADE).await.unwrap();
    assert!(common::eventually(PROMPT, || network.guest_attached()).await);

    let mut message = vec![20, 0];
    message.extend_from_slice(&[0x11; 20]);
    guest.write_all(&message).await.unwrap();
    let frame = tokio::time::timeout(PROMPT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(&frame[..], &[0x11; 20]);
    assert_eq!(network.counters().received(), 20);

    network.send_frame(Bytes::from_static(&[1, 2, 3])).await.unwrap();
    let mut reply = [0u8; 5];
    tokio::time::timeout(PROMPT, guest.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [3, 0, 1, 2, 3]);

    // One guest at a time.
    let err = client.upgrade("/network/connect", GUEST_UPGRADE).await.unwrap_err();
    assert!(
        matches!(&err, ClientError::Refused { status, .. } if *status == StatusCode::CONFLICT),
        "{err}"
    );

    drop(guest);
    assert!(common::eventually(PROMPT, || !network.guest_attached()).await);

    running.shutdown_handle().trigger(ShutdownReason::Requested);
    tokio::time::timeout(PROMPT, running.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn guest_leaving_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let guest = dir.path().join("guest.sock");
    let mut config = common::proxy_config(&[&api]);
    config.listener.guest = Some(Endpoint::UnixStream(guest.clone()));
    let network = common::network(&config);

    let running = Supervisor::new(config, network).start().await.unwrap();

    let conn = UnixStream::connect(&guest).await.unwrap();
    drop(conn);

    let err = tokio::time::timeout(PROMPT, running.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(&err, SupervisorError::TaskExited { task } if task == "guest"),
        "{err}"
    );
    assert!(!api.exists());
}

#[tokio::test]
async fn datagram_guest_traffic_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("api.sock");
    let guest = dir.path().join("vfkit.sock");
    let mut config = common::proxy_config(&[&api]);
    config.listener.guest = Some(Endpoint::UnixDatagram(guest.clone()));
    config.network.protocol = Protocol::Vfkit;
    let network = common::network(&config);

    let running = Supervisor::new(config, network.clone()).start().await.unwrap();

    let vm = UnixDatagram::bind(dir.path().join("vm.sock")).unwrap();
    vm.send_to(&[0u8; 60], &guest).await.unwrap();
    assert!(
        common::eventually(PROMPT, || network.counters().received() == 60).await,
        "frame not counted"
    );

    let client = ApiClient::new(&api);
    let stats: Value = serde_json::from_slice(&client.get("/network/stats").await.unwrap().body).unwrap();
    assert_eq!(stats["bytes_received"], 60);

    running.shutdown_handle().trigger(ShutdownReason::Requested);
    tokio::time::timeout(PROMPT, running.wait()).await.unwrap().unwrap();
    assert!(!guest.exists());
}

#[tokio::test]
async fn bind_failure_aborts_startup_and_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.sock");
    let bad = dir.path().join("missing").join("bad.sock");
    let config = common::proxy_config(&[&good, &bad]);
    let network = common::network(&config);

    let err = Supervisor::new(config, network).run().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::Startup(StartupError::Listen { .. })),
        "{err}"
    );
    assert!(!good.exists());
    assert!(!bad.exists());
}

#[tokio::test]
async fn read_only_directory_is_a_startup_error() {
    use std::os::unix::fs::PermissionsExt;

    // Root ignores directory permissions.
    if running_as_root() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let ro = dir.path().join("ro");
    std::fs::create_dir(&ro).unwrap();
    std::fs::set_permissions(&ro, std::fs::Permissions::from_mode(0o555)).unwrap();

    let api = ro.join("api.sock");
    let config = common::proxy_config(&[&api]);
    let network = common::network(&config);

    let result = Supervisor::new(config, network).run().await;
    assert!(matches!(result, Err(SupervisorError::Startup(_))), "{result:?}");
    assert_eq!(std::fs::read_dir(&ro).unwrap().count(), 0);

    std::fs::set_permissions(&ro, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
