//! In-process virtual network.
//!
//! Frames from the guest are counted, optionally captured and fanned out to
//! subscribers; frames queued with [`MemoryNetwork::send_frame`] are written
//! back to the guest. Services inside the network are reached through
//! in-memory listeners rather than a TCP/IP stack.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc};

use crate::config::resolv::{self, RESOLV_CONF};
use crate::config::NetworkConfig;
use crate::net::Connection;
use crate::vnet::api::{self, StackState};
use crate::vnet::capture::Capture;
use crate::vnet::port::GuestPort;
use crate::vnet::protocol::ETHERNET_HEADER_LEN;
use crate::vnet::{
    ByteCounters, ExposeRequest, Forwarder, ListenerTable, NetworkError, VirtualListener,
    VirtualNetwork,
};

#[derive(Debug)]
pub struct MemoryNetwork {
    config: Arc<NetworkConfig>,
    search_domains: Arc<Vec<String>>,
    counters: Arc<ByteCounters>,
    listeners: Arc<ListenerTable>,
    forwarder: Arc<Forwarder>,
    port: Arc<GuestPort>,
    outbound: mpsc::Sender<Bytes>,
}

impl MemoryNetwork {
    /// Build the stack from its configuration.
    ///
    /// Search domains fall back to the host's resolv.conf when unset.
    pub fn new(config: NetworkConfig) -> Result<Self, NetworkError> {
        let search_domains = config
            .search_domains
            .clone()
            .unwrap_or_else(|| resolv::search_domains(Path::new(RESOLV_CONF)));

        let mut max_frame = config.mtu + ETHERNET_HEADER_LEN;
        if let Some(limit) = config.protocol.max_frame_len() {
            max_frame = max_frame.min(limit);
        }
        let capture = match config.capture_file.as_deref() {
            Some(path) => {
                let capture = Capture::create(path, max_frame as u32).map_err(|source| {
                    NetworkError::Capture {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                tracing::info!(path = %path.display(), "Capturing guest traffic");
                Some(capture)
            }
            None => None,
        };

        let counters = Arc::new(ByteCounters::default());
        let (port, outbound) =
            GuestPort::new(config.protocol, max_frame, counters.clone(), capture);
        let listeners = ListenerTable::new();
        let forwarder = Forwarder::new(listeners.clone(), config.gateway_ip, config.subnet);

        Ok(Self {
            config: Arc::new(config),
            search_domains: Arc::new(search_domains),
            counters,
            listeners,
            forwarder: Arc::new(forwarder),
            port: Arc::new(port),
            outbound,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn search_domains(&self) -> &[String] {
        &self.search_domains
    }

    /// Largest frame carried on the guest channel.
    pub fn max_frame(&self) -> usize {
        self.port.max_frame()
    }

    /// Receive a copy of every frame the guest sends.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.port.subscribe()
    }

    /// Whether a guest is attached right now.
    pub fn guest_attached(&self) -> bool {
        self.port.is_attached()
    }

    /// Queue a frame for delivery to the guest.
    pub async fn send_frame(&self, frame: Bytes) -> io::Result<()> {
        if frame.len() > self.max_frame() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit of {}", frame.len(), self.max_frame()),
            ));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "network stopped"))
    }

    /// Connect to a listener inside the network.
    pub async fn dial(&self, from: SocketAddr, to: SocketAddr) -> io::Result<DuplexStream> {
        self.listeners.dial(from, to).await
    }

    fn serves(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                v4 == self.config.gateway_ip || self.config.gateway_virtual_ips.contains(&v4)
            }
            IpAddr::V6(_) => false,
        }
    }
}

#[async_trait]
impl VirtualNetwork for MemoryNetwork {
    async fn start(&self) -> Result<(), NetworkError> {
        for (local, remote) in &self.config.forwards {
            self.forwarder
                .expose(&ExposeRequest {
                    local: local.clone(),
                    remote: remote.clone(),
                    protocol: Default::default(),
                })
                .await?;
        }
        Ok(())
    }

    async fn listen(&self, addr: SocketAddr) -> Result<VirtualListener, NetworkError> {
        if !self.serves(addr.ip()) {
            return Err(NetworkError::AddrNotAvailable(addr));
        }
        self.listeners.bind(addr)
    }

    async fn accept_packets(&self, conn: &dyn Connection) -> io::Result<()> {
        self.port.attach(conn).await
    }

    fn router(&self) -> axum::Router {
        api::routes(StackState {
            counters: self.counters.clone(),
            forwarder: self.forwarder.clone(),
            port: self.port.clone(),
            config: self.config.clone(),
            search_domains: self.search_domains.clone(),
        })
    }

    fn counters(&self) -> &ByteCounters {
        &self.counters
    }
}
