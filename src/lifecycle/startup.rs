//! Startup orchestration.
//!
//! # Responsibilities
//! - Turn endpoint descriptors into live host listeners
//! - Obtain the gateway and host-API listeners from the virtual network
//! - Open the guest packet channel
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Everything bound so far is released when a later step fails, because
//!   listeners remove their socket files on drop
//! - Listeners start last (traffic only when ready)

#![allow(unsafe_code)]

use std::io;
use std::net::SocketAddr;

use crate::config::ProxyConfig;
use crate::net::fd::check_descriptor;
use crate::net::{
    listen_datagram, Connection, DatagramSocket, Endpoint, FdConnection, HostListener,
    StreamConnection, TransportError,
};
use crate::vnet::{NetworkError, VirtualListener, VirtualNetwork};

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cannot listen on {endpoint}: {source}")]
    Listen {
        endpoint: Endpoint,
        #[source]
        source: TransportError,
    },
    #[error("cannot adopt descriptor {fd}: {source}")]
    Descriptor {
        fd: i32,
        #[source]
        source: io::Error,
    },
    #[error("{0} is a datagram endpoint and cannot serve HTTP")]
    DatagramApi(Endpoint),
    #[error("virtual network: {0}")]
    Network(#[from] NetworkError),
    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

/// Every listener the supervisor serves.
#[derive(Debug)]
pub struct ListenerSet {
    /// Host endpoints serving the root API.
    pub api: Vec<HostListener>,
    /// `gateway_ip:80` inside the virtual network.
    pub gateway: VirtualListener,
    /// `host_virtual_ip:host_api_port` inside the virtual network.
    pub host: VirtualListener,
}

/// Bind the host endpoints and the two virtual listeners.
pub async fn build_listener_set(
    config: &ProxyConfig,
    network: &dyn VirtualNetwork,
) -> Result<ListenerSet, StartupError> {
    let max_connections = config.listener.max_connections;
    let mut api = Vec::with_capacity(config.listener.endpoints.len());
    for endpoint in &config.listener.endpoints {
        api.push(bind_api_endpoint(endpoint, max_connections)?);
    }

    let net = &config.network;
    let gateway = network
        .listen(SocketAddr::from((net.gateway_ip, 80)))
        .await?;

    let host_ip = net.gateway_virtual_ips.first().copied().unwrap_or(net.gateway_ip);
    let host = network
        .listen(SocketAddr::from((host_ip, net.host_api_port)))
        .await?;

    tracing::info!(
        api_endpoints = api.len(),
        gateway = %gateway.local_addr(),
        host = %host.local_addr(),
        "Listener set ready"
    );

    Ok(ListenerSet { api, gateway, host })
}

fn bind_api_endpoint(endpoint: &Endpoint, max_connections: usize) -> Result<HostListener, StartupError> {
    match endpoint {
        Endpoint::UnixStream(path) => {
            HostListener::bind(path, max_connections).map_err(|source| StartupError::Listen {
                endpoint: endpoint.clone(),
                source,
            })
        }
        Endpoint::Fd(fd) => {
            let fd = *fd;
            check_descriptor(fd).map_err(|source| StartupError::Descriptor { fd, source })?;
            // SAFETY: inherited descriptors are handed to this process once by
            // its parent and validation rejects duplicate endpoints, so
            // nothing else in the process owns `fd`.
            unsafe { HostListener::from_raw_fd(fd, max_connections) }
                .map_err(|source| StartupError::Descriptor { fd, source })
        }
        Endpoint::UnixDatagram(_) => Err(StartupError::DatagramApi(endpoint.clone())),
    }
}

/// The raw channel carrying the guest's frames.
#[derive(Debug)]
pub enum GuestChannel {
    /// A unix stream listener; the first peer to connect is the guest.
    Stream(HostListener),
    /// A unix datagram socket; the guest is whoever sends to it.
    Datagram(DatagramSocket),
    /// An inherited, already-connected descriptor.
    Fd(Option<FdConnection>),
}

impl GuestChannel {
    /// Open the channel described by `endpoint`.
    pub fn open(endpoint: &Endpoint) -> Result<Self, StartupError> {
        let listen_err = |source| StartupError::Listen {
            endpoint: endpoint.clone(),
            source,
        };
        match endpoint {
            Endpoint::UnixStream(path) => Ok(Self::Stream(HostListener::bind(path, 1).map_err(listen_err)?)),
            Endpoint::UnixDatagram(path) => Ok(Self::Datagram(listen_datagram(path).map_err(listen_err)?)),
            Endpoint::Fd(fd) => {
                let fd = *fd;
                check_descriptor(fd).map_err(|source| StartupError::Descriptor { fd, source })?;
                // SAFETY: see `bind_api_endpoint`; the guest endpoint is
                // checked against the API endpoints for duplicates.
                let conn = unsafe { FdConnection::from_raw_fd(fd) }
                    .map_err(|source| StartupError::Descriptor { fd, source })?;
                Ok(Self::Fd(Some(conn)))
            }
        }
    }

    /// The connection carrying frames.
    ///
    /// Waits for the guest to connect on stream channels. The channel itself
    /// must outlive the returned connection.
    pub async fn connection(&mut self) -> io::Result<Box<dyn Connection>> {
        match self {
            GuestChannel::Stream(listener) => {
                let (stream, peer) = listener.accept_unbounded().await?;
                tracing::info!(peer = %peer, "Guest connected");
                Ok(Box::new(StreamConnection::new(stream)))
            }
            GuestChannel::Datagram(socket) => Ok(Box::new(socket.connection())),
            GuestChannel::Fd(conn) => conn
                .take()
                .map(|c| Box::new(c) as Box<dyn Connection>)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "guest descriptor already taken")),
        }
    }
}
