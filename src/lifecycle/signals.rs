//! OS signal handling.
//!
//! SIGTERM and SIGINT trigger graceful shutdown. Handlers are installed
//! during startup so a signal arriving before the tasks run is not lost.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::lifecycle::shutdown::{Shutdown, ShutdownReason};

/// Installed SIGTERM/SIGINT handlers.
#[derive(Debug)]
pub struct Signals {
    terminate: Signal,
    interrupt: Signal,
}

impl Signals {
    /// Install the handlers. Must be called inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }

    /// Trigger `shutdown` on the first signal; return when shutdown starts
    /// for any reason.
    pub async fn watch(mut self, shutdown: Shutdown) -> io::Result<()> {
        tokio::select! {
            name = self.recv() => {
                tracing::info!(signal = name, "Signal received");
                shutdown.trigger(ShutdownReason::Signal(name));
            }
            _ = shutdown.cancelled() => {}
        }
        Ok(())
    }
}
