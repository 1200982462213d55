//! Connect/Disconnect Orchestrator
//!
//! Drives a controller through its lifecycle and keeps the topology in step:
//!
//! ```text
//! connect()
//!   ├── open channel ─────────────── spawn_blocking (Connector::open)
//!   ├── establish ────────────────── fabrics connect / no-op for local devices
//!   ├── start ChannelWorker
//!   ├── discover ─────────────────── Identify Controller + Namespaces
//!   └── register ─────────────────── subsystem + controller + namespaces, atomically
//!
//!   any step fails  →  channel closed, attempt recorded, backoff, retry
//!   cancelled       →  channel closed, Error::Cancelled
//! ```
//!
//! A controller whose channel faults (timeout, transport loss, path-related
//! status) moves to `Disconnected` on the next [`Orchestrator::check_state`]
//! and keeps its entity so [`Orchestrator::reconnect`] can revive it.

pub mod backoff;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::codec::discovery_log::{AddressFamily, DiscoveryLogEntry, SubsystemType, TransportType};
use crate::codec::{Command, CommandSet, DataBuffer, DiscoveryLog};
use crate::discovery::{DiscoveredController, DiscoveryConfig, IdentifyEngine};
use crate::error::{Error, Result};
use crate::metrics::NvmeMetrics;
use crate::persist::ConfigStore;
use crate::topology::{
    validate_nqn, ControllerId, ControllerKey, ControllerState, Host, NamespaceId, SubsystemId,
    Topology, TopologyConfig, TopologyDiff,
};
use crate::transport::fabrics::DISCOVERY_NQN;
use crate::transport::{
    Channel, ChannelWorker, CommandIssuer, CommandOutcome, ConnectTarget, Connector,
    ControllerAddress, FabricsConfig, Transport, TransportConfig, TransportKind,
};

pub use backoff::BackoffPolicy;

/// Persisted-store key holding reconnect targets.
pub const TARGETS_KEY: &str = "targets";
/// Persisted-store key holding the host identity.
pub const HOST_KEY: &str = "host";

// =============================================================================
// Configuration
// =============================================================================

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
    pub topology: TopologyConfig,
    pub backoff: BackoffPolicy,
    /// Controllers identified in parallel during a refresh
    pub refresh_concurrency: usize,
    /// Send Keep Alive to connected controllers when polling health
    pub keep_alive_on_poll: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            discovery: DiscoveryConfig::default(),
            topology: TopologyConfig::default(),
            backoff: BackoffPolicy::default(),
            refresh_concurrency: 8,
            keep_alive_on_poll: true,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String, retryable: bool },
}

/// One connect attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }
}

/// Result of a successful connect or reconnect.
#[derive(Debug, Clone)]
pub struct ConnectReport {
    pub controller: ControllerId,
    pub subsystem: SubsystemId,
    pub namespaces: Vec<NamespaceId>,
    pub attempts: Vec<AttemptRecord>,
    /// Namespace changes found by a reconnect
    pub diff: Option<TopologyDiff>,
}

/// A connect target saved for the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTarget {
    pub subsystem_nqn: String,
    pub target: ConnectTarget,
}

// =============================================================================
// Internals
// =============================================================================

#[derive(Debug, Clone)]
struct Binding {
    subsystem_nqn: String,
    target: ConnectTarget,
    worker: Option<Arc<ChannelWorker>>,
}

struct Established {
    worker: ChannelWorker,
    discovered: DiscoveredController,
}

/// Marks an address as being connected until dropped.
struct InFlight<'a> {
    map: &'a DashMap<ControllerAddress, ()>,
    address: ControllerAddress,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.address);
    }
}

async fn shutdown(worker: &ChannelWorker) {
    if let Err(e) = worker.close().await {
        warn!("Closing channel to {} failed: {}", worker.target(), e);
    }
}

async fn close_blocking(mut channel: Channel) {
    let target = channel.target();
    let closed = tokio::task::spawn_blocking(move || channel.close()).await;
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Closing channel to {} failed: {}", target, e),
        Err(e) => warn!("Close task for {} failed: {}", target, e),
    }
}

/// What [`Orchestrator::connect_discovery_entry`] did with an entry.
#[derive(Debug)]
pub enum DiscoveryEntryOutcome {
    /// The entry named an NVM subsystem, now connected
    Connected(ConnectReport),
    /// The entry names another discovery controller; nothing was connected.
    /// Its log is read with [`Orchestrator::fetch_discovery_log`].
    Referral(ConnectTarget),
}

/// Build a fabrics target for a discovery log entry.
///
/// Options not derived from the entry are taken from `defaults`.
pub fn target_from_discovery_entry(
    entry: &DiscoveryLogEntry,
    defaults: &FabricsConfig,
) -> Result<FabricsConfig> {
    let transport = entry.trtype.kernel_name().ok_or_else(|| {
        Error::InvalidArgument(format!("unsupported transport type {:?}", entry.trtype))
    })?;

    match entry.subtype {
        SubsystemType::Nvme | SubsystemType::Discovery | SubsystemType::CurrentDiscovery => {}
        other => {
            return Err(Error::InvalidArgument(format!(
                "unsupported subsystem type {:?}",
                other
            )))
        }
    }

    let mut cfg = FabricsConfig::new(transport);
    match entry.trtype {
        TransportType::Rdma | TransportType::Tcp => match entry.adrfam {
            AddressFamily::Ipv4 | AddressFamily::Ipv6 => {
                cfg.traddr = Some(entry.traddr.clone());
                cfg.trsvcid = Some(entry.trsvcid.clone()).filter(|s| !s.is_empty());
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{} entry with address family {:?}",
                    transport, other
                )))
            }
        },
        TransportType::Fc => match entry.adrfam {
            AddressFamily::Fc => cfg.traddr = Some(entry.traddr.clone()),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "fc entry with address family {:?}",
                    other
                )))
            }
        },
        _ => {}
    }

    if entry.supports_disable_sqflow() {
        cfg.disable_sqflow = true;
    }
    cfg.merge_defaults(defaults);
    Ok(cfg)
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owns the topology and every controller's channel.
pub struct Orchestrator {
    config: OrchestratorConfig,
    topology: Arc<Topology>,
    connector: Arc<dyn Connector>,
    engine: IdentifyEngine,
    metrics: Option<Arc<NvmeMetrics>>,
    bindings: DashMap<ControllerId, Binding>,
    connecting: DashMap<ControllerAddress, ()>,
}

impl Orchestrator {
    pub fn new(host: Host, connector: Arc<dyn Connector>, config: OrchestratorConfig) -> Self {
        let topology = Arc::new(Topology::new(host, config.topology.clone()));
        Self {
            engine: IdentifyEngine::new(config.discovery.clone()),
            config,
            topology,
            connector,
            metrics: None,
            bindings: DashMap::new(),
            connecting: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<NvmeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<NvmeMetrics>> {
        self.metrics.as_ref()
    }

    /// Device handles currently open through this orchestrator's connector.
    pub fn open_handles(&self) -> usize {
        self.connector.handles().open_handles()
    }

    /// The target a controller was connected with.
    pub fn target_of(&self, id: ControllerId) -> Option<ConnectTarget> {
        self.bindings.get(&id).map(|b| b.target.clone())
    }

    fn worker(&self, id: ControllerId) -> Option<Arc<ChannelWorker>> {
        self.bindings.get(&id).and_then(|b| b.worker.clone())
    }

    fn begin_connect(&self, address: ControllerAddress) -> Result<InFlight<'_>> {
        match self.connecting.entry(address.clone()) {
            Entry::Occupied(_) => Err(Error::InvalidState {
                entity: address.to_string(),
                reason: "a connect is already in progress".into(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlight {
                    map: &self.connecting,
                    address,
                })
            }
        }
    }

    fn update_gauges(&self) {
        if let Some(m) = &self.metrics {
            let counts = self.topology.controller_states();
            for state in [
                ControllerState::Disconnected,
                ControllerState::Connecting,
                ControllerState::Connected,
                ControllerState::Disconnecting,
            ] {
                m.set_controllers(state.as_str(), counts.get(&state).copied().unwrap_or(0));
            }
        }
    }

    // =========================================================================
    // Connect
    // =========================================================================

    async fn open_channel(&self, subsystem_nqn: &str, target: &ConnectTarget) -> Result<Channel> {
        let connector = self.connector.clone();
        let nqn = subsystem_nqn.to_string();
        let target = target.clone();

        tokio::task::spawn_blocking(move || {
            let mut channel = connector.open(&nqn, &target)?;
            if let Err(e) = channel.establish() {
                if let Err(close_err) = channel.close() {
                    warn!("Closing {} after failed connect: {}", channel.target(), close_err);
                }
                return Err(e);
            }
            Ok(channel)
        })
        .await
        .map_err(|e| Error::Internal(format!("connect task failed: {}", e)))?
    }

    /// One pass of open, establish, identify. Leaves nothing open on failure.
    async fn attempt(
        &self,
        subsystem_nqn: &str,
        target: &ConnectTarget,
        cancel: &CancellationToken,
    ) -> Result<Established> {
        let channel = self.open_channel(subsystem_nqn, target).await?;
        if cancel.is_cancelled() {
            close_blocking(channel).await;
            return Err(Error::Cancelled);
        }

        let worker = ChannelWorker::spawn(
            channel,
            self.config.transport.clone(),
            self.metrics.clone(),
        )?;

        let discovered = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = self.engine.discover(&worker) => r,
        };
        let discovered = match discovered {
            Ok(d) => d,
            Err(e) => {
                shutdown(&worker).await;
                return Err(e);
            }
        };

        if discovered.info.subnqn != subsystem_nqn {
            shutdown(&worker).await;
            return Err(Error::InvalidState {
                entity: target.address().to_string(),
                reason: format!(
                    "controller reports subsystem {} instead of {}",
                    discovered.info.subnqn, subsystem_nqn
                ),
            });
        }

        Ok(Established { worker, discovered })
    }

    /// Run attempts under the backoff policy, recording each one.
    async fn run_attempts(
        &self,
        subsystem_nqn: &str,
        target: &ConnectTarget,
        cancel: &CancellationToken,
    ) -> Result<(Established, Vec<AttemptRecord>)> {
        let policy = &self.config.backoff;
        let mut attempts = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let started_at = Utc::now();
            let clock = Instant::now();
            let result = self.attempt(subsystem_nqn, target, cancel).await;
            if let Some(m) = &self.metrics {
                m.record_connect_attempt(&result);
            }
            let elapsed = clock.elapsed();

            match result {
                Ok(established) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        elapsed,
                        outcome: AttemptOutcome::Succeeded,
                    });
                    return Ok((established, attempts));
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    let retryable = e.is_retryable();
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        elapsed,
                        outcome: AttemptOutcome::Failed {
                            error: e.to_string(),
                            retryable,
                        },
                    });

                    if !retryable || !policy.has_next(attempt) {
                        warn!(
                            "Giving up on {} after {} attempt(s): {}",
                            target.address(),
                            attempt,
                            e
                        );
                        return Err(Error::ConnectFailed {
                            cause: Box::new(e),
                            attempts,
                        });
                    }

                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Connect attempt {} to {} failed: {}; retrying in {:?}",
                        attempt,
                        target.address(),
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect to `subsystem_nqn` through `target` and register what it exposes.
    #[instrument(skip(self, target, cancel), fields(address = %target.address()))]
    pub async fn connect(
        &self,
        subsystem_nqn: &str,
        target: ConnectTarget,
        cancel: &CancellationToken,
    ) -> Result<ConnectReport> {
        validate_nqn(subsystem_nqn)?;
        let address = target.address();

        let allow_duplicate = matches!(&target, ConnectTarget::Fabrics(cfg) if cfg.duplicate_connect);
        if !allow_duplicate {
            if let Some(existing) = self
                .topology
                .find_controller_by(|c| c.key.address == address && !c.status.is_removed())
            {
                return Err(Error::DuplicateIdentity {
                    key: existing.key.to_string(),
                });
            }
        }

        let _in_flight = self.begin_connect(address.clone())?;
        info!("Connecting to {} at {}", subsystem_nqn, address);

        let (established, attempts) = self.run_attempts(subsystem_nqn, &target, cancel).await?;
        let Established { worker, discovered } = established;

        let key = ControllerKey::new(address, worker.instance());
        let registration =
            match self
                .topology
                .register_controller(key, ControllerState::Connecting, &discovered)
            {
                Ok(r) => r,
                Err(e) => {
                    shutdown(&worker).await;
                    return Err(e);
                }
            };

        if let Err(e) = self
            .topology
            .set_controller_state(registration.controller, ControllerState::Connected)
        {
            shutdown(&worker).await;
            if let Err(rm) = self.topology.remove_controller(registration.controller) {
                warn!("Rolling back {}: {}", registration.controller, rm);
            }
            return Err(e);
        }

        self.bindings.insert(
            registration.controller,
            Binding {
                subsystem_nqn: subsystem_nqn.to_string(),
                target,
                worker: Some(Arc::new(worker)),
            },
        );
        self.update_gauges();

        info!(
            "Connected {} with {} namespace(s) after {} attempt(s)",
            registration.controller,
            registration.namespaces.len(),
            attempts.len()
        );
        Ok(ConnectReport {
            controller: registration.controller,
            subsystem: registration.subsystem,
            namespaces: registration.namespaces,
            attempts,
            diff: None,
        })
    }

    /// Connect to the subsystem a discovery log entry describes.
    ///
    /// Entries naming a discovery controller are returned as referrals
    /// instead of being connected.
    #[instrument(skip(self, entry, defaults, cancel), fields(subnqn = %entry.subnqn))]
    pub async fn connect_discovery_entry(
        &self,
        entry: &DiscoveryLogEntry,
        defaults: &FabricsConfig,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryEntryOutcome> {
        let target = ConnectTarget::Fabrics(target_from_discovery_entry(entry, defaults)?);
        if entry.subtype.is_discovery() {
            debug!("{} refers to discovery controller {}", entry.subnqn, target.address());
            return Ok(DiscoveryEntryOutcome::Referral(target));
        }
        self.connect(&entry.subnqn, target, cancel)
            .await
            .map(DiscoveryEntryOutcome::Connected)
    }

    /// Read the discovery log through a transient discovery controller.
    ///
    /// Nothing is registered in the topology.
    #[instrument(skip(self, target, cancel), fields(address = %target.address()))]
    pub async fn fetch_discovery_log(
        &self,
        target: ConnectTarget,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryLog> {
        let channel = self.open_channel(DISCOVERY_NQN, &target).await?;
        if cancel.is_cancelled() {
            close_blocking(channel).await;
            return Err(Error::Cancelled);
        }
        let worker = ChannelWorker::spawn(
            channel,
            self.config.transport.clone(),
            self.metrics.clone(),
        )?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = self.engine.get_discovery_log(&worker, self.config.discovery.discovery_log_retries) => r,
        };
        shutdown(&worker).await;

        if let Ok(log) = &result {
            info!(
                "Discovery log generation {} lists {} subsystem(s)",
                log.genctr,
                log.entries.len()
            );
        }
        result
    }

    // =========================================================================
    // Disconnect / reconnect
    // =========================================================================

    /// Tear a controller down and drop it and its namespaces from the topology.
    ///
    /// Unknown and already-disconnected controllers are not an error.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, id: ControllerId) -> Result<()> {
        let ctrl = match self.topology.controller(id) {
            Some(c) => c,
            None => {
                if let Some((_, binding)) = self.bindings.remove(&id) {
                    if let Some(worker) = binding.worker {
                        shutdown(&worker).await;
                    }
                }
                return Ok(());
            }
        };

        match ctrl.state {
            ControllerState::Connecting | ControllerState::Disconnecting => {
                return Err(Error::InvalidState {
                    entity: id.to_string(),
                    reason: format!("controller is {}", ctrl.state),
                });
            }
            ControllerState::Connected => {
                self.topology
                    .set_controller_state(id, ControllerState::Disconnecting)?;
            }
            ControllerState::Disconnected => {}
        }

        if let Some((_, binding)) = self.bindings.remove(&id) {
            if let Some(worker) = binding.worker {
                shutdown(&worker).await;
            }
        }
        if ctrl.state == ControllerState::Connected {
            self.topology
                .set_controller_state(id, ControllerState::Disconnected)?;
        }

        match self.topology.remove_controller(id) {
            Ok(()) | Err(Error::EntityNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        if let Some(subsystem) = self.topology.subsystem(ctrl.subsystem) {
            if subsystem.controllers.is_empty() {
                if let Err(e) = self.topology.remove_subsystem(subsystem.id) {
                    debug!("Subsystem {} already gone: {}", subsystem.nqn, e);
                }
            }
        }
        self.update_gauges();

        info!("Disconnected {} ({})", id, ctrl.key);
        Ok(())
    }

    /// Re-run the connect sequence for a lost controller, keeping its handle.
    #[instrument(skip(self, cancel))]
    pub async fn reconnect(
        &self,
        id: ControllerId,
        cancel: &CancellationToken,
    ) -> Result<ConnectReport> {
        let ctrl = self
            .topology
            .controller(id)
            .ok_or_else(|| Error::EntityNotFound { key: id.to_string() })?;
        if ctrl.state != ControllerState::Disconnected {
            return Err(Error::InvalidState {
                entity: id.to_string(),
                reason: format!("controller is {}", ctrl.state),
            });
        }
        let (nqn, target) = self
            .bindings
            .get(&id)
            .map(|b| (b.subsystem_nqn.clone(), b.target.clone()))
            .ok_or_else(|| Error::InvalidState {
                entity: id.to_string(),
                reason: "no connect target recorded".into(),
            })?;

        let _in_flight = self.begin_connect(target.address())?;
        self.topology
            .set_controller_state(id, ControllerState::Connecting)?;
        info!("Reconnecting {} to {}", id, nqn);

        let (established, attempts) = match self.run_attempts(&nqn, &target, cancel).await {
            Ok(v) => v,
            Err(e) => {
                self.topology
                    .set_controller_state(id, ControllerState::Disconnected)?;
                return Err(e);
            }
        };
        let Established { worker, discovered } = established;

        let key = ControllerKey::new(target.address(), worker.instance());
        if let Err(e) = self.topology.rekey_controller(id, key) {
            shutdown(&worker).await;
            self.topology
                .set_controller_state(id, ControllerState::Disconnected)?;
            return Err(e);
        }

        let diff = self.topology.apply_refresh(vec![(id, Ok(discovered))]);
        self.topology
            .set_controller_state(id, ControllerState::Connected)?;
        if let Some(mut binding) = self.bindings.get_mut(&id) {
            binding.worker = Some(Arc::new(worker));
        }
        self.update_gauges();

        Ok(ConnectReport {
            controller: id,
            subsystem: ctrl.subsystem,
            namespaces: self
                .topology
                .namespaces_of(id)
                .into_iter()
                .map(|n| n.id)
                .collect(),
            attempts,
            diff: Some(diff),
        })
    }

    /// Disconnect every controller.
    pub async fn shutdown(&self) {
        for ctrl in self.topology.controllers() {
            if let Err(e) = self.disconnect(ctrl.id).await {
                warn!("Disconnecting {} during shutdown: {}", ctrl.id, e);
            }
        }
    }

    // =========================================================================
    // Health and refresh
    // =========================================================================

    /// The channel of a lost controller is usually stuck in the command that
    /// faulted it, so the close is bounded by the watchdog grace.
    async fn mark_lost(&self, id: ControllerId, worker: Option<Arc<ChannelWorker>>) -> Result<()> {
        if let Some(mut binding) = self.bindings.get_mut(&id) {
            binding.worker = None;
        }
        let marked = self
            .topology
            .set_controller_state(id, ControllerState::Disconnected);
        warn!("{} lost its channel", id);

        if let Some(worker) = worker {
            let grace = self.config.transport.watchdog_grace;
            if let Err(e) = worker.close_within(grace).await {
                warn!("Closing channel to {} failed: {}", worker.target(), e);
            }
        }
        self.update_gauges();
        marked.map(|_| ())
    }

    /// Move a connected controller whose channel faulted to `Disconnected`.
    pub async fn check_state(&self, id: ControllerId) -> Result<ControllerState> {
        let ctrl = self
            .topology
            .controller(id)
            .ok_or_else(|| Error::EntityNotFound { key: id.to_string() })?;
        if ctrl.state != ControllerState::Connected {
            return Ok(ctrl.state);
        }

        let worker = self.worker(id);
        let healthy = worker
            .as_ref()
            .map_or(false, |w| w.is_open() && !w.is_faulted());
        if healthy {
            return Ok(ControllerState::Connected);
        }

        self.mark_lost(id, worker).await?;
        Ok(ControllerState::Disconnected)
    }

    /// Check every connected controller; returns the ones found lost.
    #[instrument(skip(self))]
    pub async fn poll_health(&self) -> Vec<ControllerId> {
        let mut lost = Vec::new();

        for ctrl in self.topology.controllers() {
            if !ctrl.is_connected() {
                continue;
            }
            if self.config.keep_alive_on_poll {
                if let Some(worker) = self.worker(ctrl.id) {
                    if worker.is_open() && !worker.is_faulted() {
                        if let Err(e) = worker.issue(&Command::KeepAlive, None).await {
                            debug!("Keep Alive to {} failed: {}", ctrl.id, e);
                        }
                    }
                }
            }
            match self.check_state(ctrl.id).await {
                Ok(ControllerState::Disconnected) => lost.push(ctrl.id),
                Ok(_) => {}
                Err(e) => warn!("Health check of {} failed: {}", ctrl.id, e),
            }
        }

        lost
    }

    /// Re-identify every connected controller and reconcile in one write.
    ///
    /// Disconnected controllers count as failed refreshes.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<TopologyDiff> {
        self.poll_health().await;

        let mut results: Vec<(ControllerId, Result<DiscoveredController>)> = Vec::new();
        let mut live = Vec::new();
        for ctrl in self.topology.controllers() {
            if ctrl.status.is_removed() {
                continue;
            }
            match (ctrl.state, self.worker(ctrl.id)) {
                (ControllerState::Connected, Some(worker)) => live.push((ctrl.id, worker)),
                (ControllerState::Connected, None) | (ControllerState::Disconnected, _) => {
                    results.push((
                        ctrl.id,
                        Err(Error::TransportLost {
                            reason: format!("{} has no channel", ctrl.key),
                        }),
                    ))
                }
                _ => debug!("Skipping {} while {}", ctrl.id, ctrl.state),
            }
        }

        let live_ids: Vec<ControllerId> = live.iter().map(|(id, _)| *id).collect();
        let engine = &self.engine;
        let discovered: Vec<(ControllerId, Result<DiscoveredController>)> = stream::iter(live)
            .map(|(id, worker)| async move { (id, engine.discover(&*worker).await) })
            .buffer_unordered(self.config.refresh_concurrency.max(1))
            .collect()
            .await;
        results.extend(discovered);

        let diff = self.topology.apply_refresh(results);
        if let Some(m) = &self.metrics {
            m.record_refresh(diff.added.len(), diff.updated.len(), diff.removed.len());
        }

        for id in live_ids {
            if let Err(e) = self.check_state(id).await {
                debug!("{} vanished during refresh: {}", id, e);
            }
        }
        Ok(diff)
    }

    /// Excise what `diff` removed and close channels of excised controllers.
    pub async fn acknowledge(&self, diff: &TopologyDiff) -> usize {
        let excised = self.topology.acknowledge(diff);

        let stale: Vec<ControllerId> = self
            .bindings
            .iter()
            .map(|b| *b.key())
            .filter(|id| self.topology.controller(*id).is_none())
            .collect();
        for id in stale {
            if let Some((_, binding)) = self.bindings.remove(&id) {
                if let Some(worker) = binding.worker {
                    shutdown(&worker).await;
                }
            }
        }
        self.update_gauges();
        excised
    }

    // =========================================================================
    // Command passthrough
    // =========================================================================

    async fn submit(
        &self,
        id: ControllerId,
        set: CommandSet,
        command: &Command,
        data: Option<DataBuffer>,
    ) -> Result<CommandOutcome> {
        if command.command_set() != set {
            return Err(Error::InvalidArgument(format!(
                "opcode {:#04x} is not an {} command",
                command.opcode(),
                set
            )));
        }
        let ctrl = self
            .topology
            .controller(id)
            .ok_or_else(|| Error::EntityNotFound { key: id.to_string() })?;
        let worker = match (ctrl.state, self.worker(id)) {
            (ControllerState::Connected, Some(w)) => w,
            _ => {
                return Err(Error::InvalidState {
                    entity: id.to_string(),
                    reason: format!("controller is {}", ctrl.state),
                })
            }
        };

        let result = worker.issue(command, data).await;
        if let Err(e) = &result {
            if e.faults_controller() || worker.is_faulted() {
                if let Err(check) = self.check_state(id).await {
                    debug!("State check of {} failed: {}", id, check);
                }
            } else {
                debug!("{} completed with {}", id, e);
            }
        }
        result
    }

    /// Issue an Admin command on a connected controller.
    pub async fn submit_admin(
        &self,
        id: ControllerId,
        command: &Command,
        data: Option<DataBuffer>,
    ) -> Result<CommandOutcome> {
        self.submit(id, CommandSet::Admin, command, data).await
    }

    /// Issue an NVM I/O command on a connected controller.
    pub async fn submit_io(
        &self,
        id: ControllerId,
        command: &Command,
        data: Option<DataBuffer>,
    ) -> Result<CommandOutcome> {
        self.submit(id, CommandSet::Io, command, data).await
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Save the host identity and every non-local target; returns the target count.
    ///
    /// Local character devices are found again by the sysfs scan and are not saved.
    pub fn save_config(&self, store: &dyn ConfigStore) -> Result<usize> {
        let mut targets: Vec<PersistedTarget> = self
            .bindings
            .iter()
            .filter(|b| b.target.kind() != TransportKind::Pcie)
            .filter(|b| {
                self.topology
                    .controller(*b.key())
                    .map_or(false, |c| !c.status.is_removed())
            })
            .map(|b| PersistedTarget {
                subsystem_nqn: b.subsystem_nqn.clone(),
                target: b.target.clone(),
            })
            .collect();
        targets.sort_by(|a, b| {
            (a.subsystem_nqn.as_str(), a.target.address())
                .cmp(&(b.subsystem_nqn.as_str(), b.target.address()))
        });

        store.set(HOST_KEY, serde_json::to_value(self.topology.host())?)?;
        store.set(TARGETS_KEY, serde_json::to_value(&targets)?)?;
        debug!("Saved {} target(s)", targets.len());
        Ok(targets.len())
    }

    /// Targets saved by [`Orchestrator::save_config`].
    pub fn load_targets(store: &dyn ConfigStore) -> Result<Vec<PersistedTarget>> {
        match store.get(TARGETS_KEY)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::discovery_log::TREQ_DISABLE_SQFLOW;
    use crate::codec::{AdminOpcode, Cns, Status, StatusType};
    use crate::persist::MemoryConfigStore;
    use crate::transport::mock::{Fault, FaultRule};
    use crate::transport::{MockConnector, MockDevice, OpenFault};
    use assert_matches::assert_matches;
    use uuid::Uuid;

    const NQN: &str = "nqn.2024-01.io.nvmekit:orch";

    fn orchestrator(connector: Arc<MockConnector>) -> Orchestrator {
        let host = Host::new("nqn.2024-01.io.nvmekit:host", Uuid::new_v4(), "t").unwrap();
        let config = OrchestratorConfig {
            backoff: BackoffPolicy {
                initial: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            },
            ..Default::default()
        };
        Orchestrator::new(host, connector, config)
    }

    fn mock(name: &str) -> ConnectTarget {
        ConnectTarget::Mock { name: name.into() }
    }

    fn entry(trtype: TransportType, adrfam: AddressFamily) -> DiscoveryLogEntry {
        DiscoveryLogEntry {
            trtype,
            adrfam,
            subtype: SubsystemType::Nvme,
            treq: 0,
            portid: 1,
            cntlid: 0xFFFF,
            asqsz: 32,
            eflags: 0,
            trsvcid: "4420".into(),
            subnqn: NQN.into(),
            traddr: "192.168.1.5".into(),
        }
    }

    #[test]
    fn test_target_from_tcp_entry() {
        let mut e = entry(TransportType::Tcp, AddressFamily::Ipv4);
        e.treq = TREQ_DISABLE_SQFLOW;
        let mut defaults = FabricsConfig::default();
        defaults.host_nqn = Some("nqn.2024-01.io.nvmekit:host".into());
        defaults.keep_alive_tmo = 30;

        let cfg = target_from_discovery_entry(&e, &defaults).unwrap();
        assert_eq!(cfg.transport, "tcp");
        assert_eq!(cfg.traddr.as_deref(), Some("192.168.1.5"));
        assert_eq!(cfg.trsvcid.as_deref(), Some("4420"));
        assert!(cfg.disable_sqflow);
        assert_eq!(cfg.keep_alive_tmo, 30);
        assert_eq!(cfg.host_nqn.as_deref(), Some("nqn.2024-01.io.nvmekit:host"));
    }

    #[test]
    fn test_target_from_entry_checks_address_family() {
        let defaults = FabricsConfig::default();
        assert_matches!(
            target_from_discovery_entry(&entry(TransportType::Tcp, AddressFamily::Fc), &defaults),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            target_from_discovery_entry(&entry(TransportType::Fc, AddressFamily::Ipv4), &defaults),
            Err(Error::InvalidArgument(_))
        );
        let fc = target_from_discovery_entry(&entry(TransportType::Fc, AddressFamily::Fc), &defaults)
            .unwrap();
        assert_eq!(fc.trsvcid, None);
        let lp = target_from_discovery_entry(&entry(TransportType::Loop, AddressFamily::Loop), &defaults)
            .unwrap();
        assert_eq!(lp.traddr, None);
        assert_matches!(
            target_from_discovery_entry(&entry(TransportType::Other(9), AddressFamily::Ipv4), &defaults),
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_discovery_referral_is_not_connected() {
        let connector = Arc::new(MockConnector::new());
        let orch = orchestrator(connector.clone());
        let mut referral = entry(TransportType::Tcp, AddressFamily::Ipv4);
        referral.subtype = SubsystemType::Discovery;
        referral.subnqn = DISCOVERY_NQN.into();
        referral.trsvcid = "8009".into();

        let outcome = orch
            .connect_discovery_entry(&referral, &FabricsConfig::default(), &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            DiscoveryEntryOutcome::Referral(ConnectTarget::Fabrics(cfg)) => {
                assert_eq!(cfg.traddr.as_deref(), Some("192.168.1.5"));
                assert_eq!(cfg.trsvcid.as_deref(), Some("8009"));
            }
            other => panic!("expected a referral, got {:?}", other),
        }
        assert_eq!(connector.open_handles(), 0);
        assert!(orch.topology().controllers().is_empty());
    }

    #[tokio::test]
    async fn test_connect_registers_and_disconnect_releases() {
        let connector = Arc::new(MockConnector::new());
        connector.add_device("a", MockDevice::new(NQN, "S1").with_namespace(1, 64));
        let orch = orchestrator(connector.clone());

        let report = orch
            .connect(NQN, mock("a"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.attempts.len(), 1);
        assert!(report.attempts[0].succeeded());
        assert_eq!(connector.open_handles(), 1);
        assert_eq!(
            orch.topology().controller(report.controller).unwrap().state,
            ControllerState::Connected
        );

        orch.disconnect(report.controller).await.unwrap();
        orch.disconnect(report.controller).await.unwrap();
        assert_eq!(connector.open_handles(), 0);
        assert!(orch.topology().find_subsystem(NQN).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected() {
        let connector = Arc::new(MockConnector::new());
        connector.add_device("a", MockDevice::new(NQN, "S1"));
        let orch = orchestrator(connector.clone());
        let cancel = CancellationToken::new();

        orch.connect(NQN, mock("a"), &cancel).await.unwrap();
        assert_matches!(
            orch.connect(NQN, mock("a"), &cancel).await,
            Err(Error::DuplicateIdentity { .. })
        );
        assert_eq!(connector.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let connector = Arc::new(MockConnector::new());
        let device = MockDevice::new(NQN, "S1");
        device.fail_open(OpenFault::AlreadyInUse);
        connector.add_device("a", device);
        let orch = orchestrator(connector.clone());

        let report = orch
            .connect(NQN, mock("a"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.attempts.len(), 2);
        assert_matches!(
            report.attempts[0].outcome,
            AttemptOutcome::Failed { retryable: true, .. }
        );
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let connector = Arc::new(MockConnector::new());
        let device = MockDevice::new(NQN, "S1");
        device.fail_open(OpenFault::PermissionDenied);
        connector.add_device("a", device);
        let orch = orchestrator(connector.clone());

        match orch.connect(NQN, mock("a"), &CancellationToken::new()).await {
            Err(Error::ConnectFailed { cause, attempts }) => {
                assert_matches!(*cause, Error::PermissionDenied { .. });
                assert_eq!(attempts.len(), 1);
            }
            other => panic!("unexpected {:?}", other.map(|r| r.controller)),
        }
    }

    #[tokio::test]
    async fn test_wrong_subsystem_rolls_back() {
        let connector = Arc::new(MockConnector::new());
        connector.add_device("a", MockDevice::new(NQN, "S1"));
        let orch = orchestrator(connector.clone());

        let err = orch
            .connect("nqn.2024-01.io.nvmekit:else", mock("a"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::ConnectFailed { .. });
        assert_eq!(connector.open_handles(), 0);
        assert!(orch.topology().subsystems().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let connector = Arc::new(MockConnector::new());
        connector.add_device("a", MockDevice::new(NQN, "S1"));
        let orch = orchestrator(connector.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_matches!(
            orch.connect(NQN, mock("a"), &cancel).await,
            Err(Error::Cancelled)
        );
        assert_eq!(connector.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_submit_device_error_keeps_connected() {
        let connector = Arc::new(MockConnector::new());
        let device = MockDevice::new(NQN, "S1");
        connector.add_device("a", device.clone());
        let orch = orchestrator(connector.clone());
        let report = orch
            .connect(NQN, mock("a"), &CancellationToken::new())
            .await
            .unwrap();

        device.inject(
            FaultRule::new(
                AdminOpcode::Identify as u8,
                Fault::Status(Status::new(StatusType::Generic, 0x06)),
            )
            .cns(Cns::Controller),
        );
        let buf = DataBuffer::new(4096).unwrap();
        assert_matches!(
            orch.submit_admin(report.controller, &Command::identify_controller(), Some(buf))
                .await,
            Err(Error::DeviceError { .. })
        );
        assert_eq!(
            orch.check_state(report.controller).await.unwrap(),
            ControllerState::Connected
        );

        assert_matches!(
            orch.submit_io(report.controller, &Command::KeepAlive, None).await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_save_and_load_targets() {
        let connector = Arc::new(MockConnector::new());
        connector.add_device("a", MockDevice::new(NQN, "S1"));
        let orch = orchestrator(connector.clone());
        orch.connect(NQN, mock("a"), &CancellationToken::new())
            .await
            .unwrap();

        let store = MemoryConfigStore::new();
        assert_eq!(orch.save_config(&store).unwrap(), 1);
        let targets = Orchestrator::load_targets(&store).unwrap();
        assert_eq!(
            targets,
            vec![PersistedTarget {
                subsystem_nqn: NQN.into(),
                target: mock("a"),
            }]
        );
        assert!(store.get(HOST_KEY).unwrap().is_some());
        assert!(Orchestrator::load_targets(&MemoryConfigStore::new())
            .unwrap()
            .is_empty());
    }
}
