//! Debug traffic loop.
//!
//! Periodically logs the stack's byte counters and publishes them as
//! gauges. Runs only in debug mode and never fails.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::lifecycle::Shutdown;
use crate::observability::metrics::record_bytes;
use crate::vnet::VirtualNetwork;

/// Log counters every `interval` until shutdown.
pub async fn run(
    network: Arc<dyn VirtualNetwork>,
    interval: Duration,
    shutdown: Shutdown,
) -> io::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let snapshot = network.counters().snapshot();
        record_bytes(snapshot);
        tracing::info!(
            sent = %human_bytes(snapshot.bytes_sent),
            received = %human_bytes(snapshot.bytes_received),
            "Guest traffic"
        );
    }
}

/// Format a byte count with SI units ("1.5 kB", "83 MB").
pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    if n < 10 {
        return format!("{n} B");
    }

    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    // Round before choosing precision so 9.96 kB prints as "10 kB".
    let rounded = (value * 10.0).round() / 10.0;
    if rounded < 10.0 {
        format!("{rounded:.1} {}", UNITS[unit])
    } else {
        format!("{value:.0} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::lifecycle::ShutdownReason;
    use crate::vnet::MemoryNetwork;
    use std::collections::BTreeMap;

    #[test]
    fn formats_si_units() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(999), "999 B");
        assert_eq!(human_bytes(1500), "1.5 kB");
        assert_eq!(human_bytes(82_854_982), "83 MB");
        assert_eq!(human_bytes(2_000_000_000), "2.0 GB");
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let network = MemoryNetwork::new(NetworkConfig {
            forwards: BTreeMap::new(),
            search_domains: Some(Vec::new()),
            ..Default::default()
        })
        .unwrap();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(run(
            Arc::new(network),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger(ShutdownReason::Requested);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
