//! Prometheus metrics for command dispatch, connects and refreshes.
//!
//! Metrics live in an owned [`Registry`] rather than the process-global one so
//! several orchestrators (and tests) can coexist.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::codec::CommandSet;
use crate::error::{Error, Result};

/// Short label for a command or connect result.
pub fn outcome_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(Error::DeviceError { .. }) => "device_error",
        Err(Error::Timeout { .. }) => "timeout",
        Err(Error::TransportLost { .. }) => "transport_lost",
        Err(Error::Cancelled) => "cancelled",
        Err(_) => "error",
    }
}

/// nvmekit metrics
#[derive(Clone)]
pub struct NvmeMetrics {
    registry: Registry,
    commands: IntCounterVec,
    connect_attempts: IntCounterVec,
    refreshes: IntCounter,
    topology_changes: IntCounterVec,
    open_channels: IntGauge,
    controllers: IntGaugeVec,
}

impl std::fmt::Debug for NvmeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeMetrics")
            .field("open_channels", &self.open_channels.get())
            .field("refreshes", &self.refreshes.get())
            .finish()
    }
}

fn internal(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl NvmeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("nvmekit_commands_total", "NVMe commands submitted"),
            &["set", "outcome"],
        )
        .map_err(internal)?;
        let connect_attempts = IntCounterVec::new(
            Opts::new("nvmekit_connect_attempts_total", "Controller connect attempts"),
            &["outcome"],
        )
        .map_err(internal)?;
        let refreshes = IntCounter::new("nvmekit_refreshes_total", "Topology refresh passes")
            .map_err(internal)?;
        let topology_changes = IntCounterVec::new(
            Opts::new("nvmekit_topology_changes_total", "Entities changed by refresh"),
            &["change"],
        )
        .map_err(internal)?;
        let open_channels = IntGauge::new("nvmekit_open_channels", "Channels with a live worker")
            .map_err(internal)?;
        let controllers = IntGaugeVec::new(
            Opts::new("nvmekit_controllers", "Controllers by connection state"),
            &["state"],
        )
        .map_err(internal)?;

        registry.register(Box::new(commands.clone())).map_err(internal)?;
        registry
            .register(Box::new(connect_attempts.clone()))
            .map_err(internal)?;
        registry.register(Box::new(refreshes.clone())).map_err(internal)?;
        registry
            .register(Box::new(topology_changes.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(open_channels.clone()))
            .map_err(internal)?;
        registry.register(Box::new(controllers.clone())).map_err(internal)?;

        Ok(Self {
            registry,
            commands,
            connect_attempts,
            refreshes,
            topology_changes,
            open_channels,
            controllers,
        })
    }

    pub fn record_command<T>(&self, set: CommandSet, result: &Result<T>) {
        let set = match set {
            CommandSet::Admin => "admin",
            CommandSet::Io => "io",
        };
        self.commands
            .with_label_values(&[set, outcome_label(result)])
            .inc();
    }

    pub fn record_connect_attempt<T>(&self, result: &Result<T>) {
        self.connect_attempts
            .with_label_values(&[outcome_label(result)])
            .inc();
    }

    pub fn record_refresh(&self, added: usize, updated: usize, removed: usize) {
        self.refreshes.inc();
        self.topology_changes
            .with_label_values(&["added"])
            .inc_by(added as u64);
        self.topology_changes
            .with_label_values(&["updated"])
            .inc_by(updated as u64);
        self.topology_changes
            .with_label_values(&["removed"])
            .inc_by(removed as u64);
    }

    pub fn set_controllers(&self, state: &str, count: usize) {
        self.controllers
            .with_label_values(&[state])
            .set(count as i64);
    }

    pub fn channel_opened(&self) {
        self.open_channels.inc();
    }

    pub fn channel_closed(&self) {
        self.open_channels.dec();
    }

    pub fn open_channels(&self) -> i64 {
        self.open_channels.get()
    }

    pub fn commands_total(&self, set: &str, outcome: &str) -> u64 {
        self.commands.with_label_values(&[set, outcome]).get()
    }

    pub fn connect_attempts_total(&self, outcome: &str) -> u64 {
        self.connect_attempts.with_label_values(&[outcome]).get()
    }

    pub fn refreshes_total(&self) -> u64 {
        self.refreshes.get()
    }

    /// Prometheus text exposition of every metric.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = NvmeMetrics::new().unwrap();
        metrics.record_command::<()>(CommandSet::Admin, &Ok(()));
        metrics.record_command::<()>(
            CommandSet::Io,
            &Err(Error::Timeout {
                opcode: 2,
                timeout_ms: 5,
            }),
        );
        metrics.record_connect_attempt::<()>(&Err(Error::Cancelled));
        metrics.record_refresh(2, 0, 1);
        metrics.channel_opened();

        assert_eq!(metrics.commands_total("admin", "success"), 1);
        assert_eq!(metrics.commands_total("io", "timeout"), 1);
        assert_eq!(metrics.connect_attempts_total("cancelled"), 1);
        assert_eq!(metrics.refreshes_total(), 1);
        assert_eq!(metrics.open_channels(), 1);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("nvmekit_commands_total"));
        assert!(text.contains("nvmekit_open_channels 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = NvmeMetrics::new().unwrap();
        let b = NvmeMetrics::new().unwrap();
        a.record_refresh(0, 0, 0);
        assert_eq!(b.refreshes_total(), 0);
    }
}
