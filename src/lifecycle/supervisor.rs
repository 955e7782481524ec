//! Proxy supervisor.
//!
//! Starts every listener's serve loop, the guest packet loop, the signal
//! watcher and (in debug mode) the telemetry loop as independent tasks,
//! then waits for all of them. The first failure cancels the rest; errors
//! raised once shutdown is underway are treated as shutdown noise.
//!
//! Whether a task failed or merely stopped is decided inside the task, the
//! moment it finishes: it claims the shutdown for itself, and only a claim
//! that wins marks a real failure.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinSet};

use crate::config::ProxyConfig;
use crate::http::{api, gateway, HttpServer};
use crate::lifecycle::shutdown::{Shutdown, ShutdownReason};
use crate::lifecycle::signals::Signals;
use crate::lifecycle::startup::{build_listener_set, GuestChannel, StartupError};
use crate::net::listener::FallibleListener;
use crate::observability::telemetry;
use crate::vnet::VirtualNetwork;

/// Error type for a supervised run.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("startup failed: {0}")]
    Startup(#[from] StartupError),
    #[error("{task} failed: {source}")]
    Task {
        task: String,
        #[source]
        source: io::Error,
    },
    #[error("{task} exited before shutdown")]
    TaskExited { task: String },
    #[error("{task} panicked")]
    Panicked { task: String },
}

/// Configured, not yet started proxy.
#[derive(Debug)]
pub struct Supervisor {
    config: ProxyConfig,
    network: Arc<dyn VirtualNetwork>,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(config: ProxyConfig, network: Arc<dyn VirtualNetwork>) -> Self {
        Self {
            config,
            network,
            shutdown: Shutdown::new(),
        }
    }

    /// Handle for requesting shutdown from outside.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Start the network, bind everything and spawn the tasks.
    ///
    /// Nothing runs if this fails; listeners bound so far are released.
    pub async fn start(self) -> Result<Running, StartupError> {
        let Supervisor {
            config,
            network,
            shutdown,
        } = self;

        network.start().await?;
        let listeners = build_listener_set(&config, network.as_ref()).await?;
        let guest = config
            .listener
            .guest
            .as_ref()
            .map(GuestChannel::open)
            .transpose()?;
        let signals = Signals::install().map_err(StartupError::Signals)?;

        let mut tasks = Tasks::new(shutdown.clone());
        let debug = config.observability.debug;

        let timeouts = &config.timeouts;

        let request_timeout = Duration::from_secs(timeouts.request_secs);
        let root = api::router(network.router(), debug, request_timeout);
        for listener in listeners.api {
            let name = format!("api {}", listener.local_addr());
            tasks.serve(name, HttpServer::new("api", root.clone(), timeouts), listener);
        }
        tasks.serve(
            "gateway",
            HttpServer::new("gateway", gateway::router(), timeouts),
            listeners.gateway,
        );
        tasks.serve(
            "host api",
            HttpServer::new("host", network.router(), timeouts),
            listeners.host,
        );

        if let Some(channel) = guest {
            let shutdown = shutdown.clone();
            tasks.spawn_task("guest", run_guest(network.clone(), channel, shutdown));
        }

        tasks.spawn_task("signals", signals.watch(shutdown.clone()));

        if debug {
            let interval = Duration::from_secs(config.observability.stats_interval_secs);
            tasks.spawn_task(
                "telemetry",
                telemetry::run(network.clone(), interval, shutdown.clone()),
            );
        }

        tracing::info!(tasks = tasks.len(), "Proxy running");
        Ok(Running { tasks, shutdown })
    }

    /// Start and run until shutdown.
    pub async fn run(self) -> Result<(), SupervisorError> {
        self.start().await?.wait().await
    }
}

/// A started proxy.
#[derive(Debug)]
pub struct Running {
    tasks: Tasks,
    shutdown: Shutdown,
}

impl Running {
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Wait for every task to finish.
    ///
    /// Returns the first error raised before shutdown began, or `Ok(())`.
    pub async fn wait(mut self) -> Result<(), SupervisorError> {
        let mut first_error = None;

        while let Some((task, outcome)) = self.tasks.join_next().await {
            let error = match outcome {
                Outcome::Stopped(Ok(())) => {
                    tracing::debug!(task = %task, "Task stopped");
                    continue;
                }
                Outcome::Stopped(Err(e)) => {
                    tracing::debug!(task = %task, error = %e, "Task error during shutdown");
                    continue;
                }
                Outcome::Failed(Ok(())) => SupervisorError::TaskExited { task },
                Outcome::Failed(Err(source)) => SupervisorError::Task { task, source },
                Outcome::Panicked => {
                    self.shutdown.trigger(ShutdownReason::TaskFailed);
                    SupervisorError::Panicked { task }
                }
            };

            tracing::error!(error = %error, "Supervised task failed");
            first_error.get_or_insert(error);
        }

        tracing::info!(reason = ?self.shutdown.reason(), "Proxy stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// How a task ended.
#[derive(Debug)]
enum Outcome {
    /// Finished after shutdown had already started.
    Stopped(io::Result<()>),
    /// Finished first, and so started the shutdown.
    Failed(io::Result<()>),
    Panicked,
}

/// Named tasks in one join set.
#[derive(Debug)]
struct Tasks {
    set: JoinSet<Outcome>,
    names: HashMap<Id, String>,
    shutdown: Shutdown,
}

impl Tasks {
    fn new(shutdown: Shutdown) -> Self {
        Self {
            set: JoinSet::new(),
            names: HashMap::new(),
            shutdown,
        }
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    /// Run `server` on `listener` until shutdown.
    fn serve<L>(&mut self, name: impl Into<String>, server: HttpServer, listener: L)
    where
        L: FallibleListener,
        L::Addr: std::fmt::Debug,
    {
        let shutdown = self.shutdown.clone();
        self.spawn_task(name, async move { server.run(listener, shutdown).await });
    }

    fn spawn_task<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let handle = self.set.spawn(async move {
            let result = task.await;
            if shutdown.trigger(ShutdownReason::TaskFailed) {
                Outcome::Failed(result)
            } else {
                Outcome::Stopped(result)
            }
        });
        self.names.insert(handle.id(), name.into());
    }

    async fn join_next(&mut self) -> Option<(String, Outcome)> {
        let joined = self.set.join_next_with_id().await?;
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) if e.is_panic() => (e.id(), Outcome::Panicked),
            Err(e) => (e.id(), Outcome::Failed(Err(io::Error::other(e)))),
        };
        let name = self.names.remove(&id).unwrap_or_else(|| format!("task {id}"));
        Some((name, outcome))
    }
}

/// Carry guest frames until the guest leaves or shutdown starts.
async fn run_guest(
    network: Arc<dyn VirtualNetwork>,
    mut channel: GuestChannel,
    shutdown: Shutdown,
) -> io::Result<()> {
    let conn = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        conn = channel.connection() => conn?,
    };

    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        r = network.accept_packets(conn.as_ref()) => r,
    };

    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Guest channel close failed");
    }
    drop(channel);
    result
}
