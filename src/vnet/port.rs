//! Attachment point of the guest's ethernet channel.
//!
//! One guest at a time: frames it sends are counted, captured and fanned out
//! to subscribers; frames queued by the stack are written back to it.

use std::io;
use std::sync::Arc;

use axum::body::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::net::{is_unset_peer, Connection};
use crate::vnet::capture::Capture;
use crate::vnet::{ByteCounters, Protocol};

/// Frames buffered towards the guest before senders wait.
const OUTBOUND_QUEUE: usize = 256;

/// Frames buffered per subscriber before it starts lagging.
const SUBSCRIBER_QUEUE: usize = 256;

#[derive(Debug)]
pub(crate) struct GuestPort {
    protocol: Protocol,
    max_frame: usize,
    counters: Arc<ByteCounters>,
    inbound: broadcast::Sender<Bytes>,
    outbound: Mutex<mpsc::Receiver<Bytes>>,
    capture: Option<Capture>,
}

impl GuestPort {
    /// Create the port and the sender feeding frames to the guest.
    pub fn new(
        protocol: Protocol,
        max_frame: usize,
        counters: Arc<ByteCounters>,
        capture: Option<Capture>,
    ) -> (Self, mpsc::Sender<Bytes>) {
        let (inbound, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let port = Self {
            protocol,
            max_frame,
            counters,
            inbound,
            outbound: Mutex::new(outbound_rx),
            capture,
        };
        (port, outbound_tx)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inbound.subscribe()
    }

    /// Whether a guest is attached right now.
    pub fn is_attached(&self) -> bool {
        self.outbound.try_lock().is_err()
    }

    /// Carry frames between `conn` and the stack until either side stops.
    ///
    /// Fails with `AddrInUse` while another guest is attached.
    pub async fn attach(&self, conn: &dyn Connection) -> io::Result<()> {
        let mut outbound = self.outbound.try_lock().map_err(|_| {
            io::Error::new(io::ErrorKind::AddrInUse, "a guest is already attached")
        })?;
        let protocol = self.protocol;
        let max_frame = self.max_frame;
        tracing::info!(remote = %conn.remote_addr(), %protocol, "Guest attached");

        let from_guest = async {
            let mut buf = Vec::with_capacity(max_frame + 1);
            while let Some(n) = protocol.read_frame(conn, &mut buf, max_frame).await? {
                self.counters.add_received(n);
                self.record(&buf);
                // No subscribers is the common case.
                let _ = self.inbound.send(Bytes::copy_from_slice(&buf));
            }
            Ok::<_, io::Error>(())
        };

        let to_guest = async {
            while let Some(frame) = outbound.recv().await {
                match protocol.write_frame(conn, &frame).await {
                    Ok(()) => {
                        self.counters.add_sent(frame.len());
                        self.record(&frame);
                    }
                    Err(e) if is_unset_peer(&e) => {
                        tracing::debug!(len = frame.len(), "Guest not heard from yet; frame dropped");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };

        let result = tokio::select! {
            r = from_guest => r,
            r = to_guest => r,
        };
        tracing::info!(remote = %conn.remote_addr(), "Guest detached");
        result
    }

    fn record(&self, frame: &[u8]) {
        if let Some(capture) = &self.capture {
            if let Err(e) = capture.record(frame) {
                tracing::warn!(path = %capture.path().display(), error = %e, "Capture write failed");
            }
        }
    }
}
