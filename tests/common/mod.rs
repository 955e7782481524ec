//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;

use vmnet_proxy::config::{NetworkConfig, ProxyConfig};
use vmnet_proxy::net::Endpoint;
use vmnet_proxy::vnet::MemoryNetwork;

/// A config serving the API on `endpoints`, with no host forwards.
pub fn proxy_config(endpoints: &[&Path]) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.endpoints = endpoints
        .iter()
        .map(|p| Endpoint::UnixStream(p.to_path_buf()))
        .collect();
    config.network = NetworkConfig {
        forwards: BTreeMap::new(),
        search_domains: Some(vec!["test.example".to_string()]),
        ..Default::default()
    };
    config
}

pub fn network(config: &ProxyConfig) -> Arc<MemoryNetwork> {
    Arc::new(MemoryNetwork::new(config.network.clone()).unwrap())
}

/// Poll until `check` holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// GET `path` from a listener inside the virtual network.
pub async fn get_virtual(network: &MemoryNetwork, to: SocketAddr, path: &str) -> (StatusCode, String) {
    let from: SocketAddr = "192.168.127.2:40000".parse().unwrap();
    let stream = network.dial(from, to).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .uri(path)
        .header("host", to.to_string())
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}
