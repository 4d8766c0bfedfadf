//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Polling loop that owns the active/standby role of this node."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fgw_common::time::random_jitter;
use fgw_common::RedundancyConfig;
use fgw_metrics::RedundancyMetrics;
use fgw_model::{ConnectionStats, Protocol};
use fgw_store::{PointStore, StoreError};
use fgw_transport::Transport;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::state::{Decision, RedundancyState, Role, TransitionReason};
use crate::ActiveFlag;

/// Polls the driver instance record and drives transports, heartbeats and the
/// shared [`ActiveFlag`] from the resulting role.
pub struct RedundancyCoordinator {
    protocol: Protocol,
    instance: u32,
    node_name: String,
    config: RedundancyConfig,
    store: Arc<dyn PointStore>,
    transports: Vec<Arc<dyn Transport>>,
    active: ActiveFlag,
    state: RedundancyState,
    metrics: Option<RedundancyMetrics>,
}

impl RedundancyCoordinator {
    pub fn new(
        protocol: Protocol,
        instance: u32,
        node_name: impl Into<String>,
        config: RedundancyConfig,
        store: Arc<dyn PointStore>,
        active: ActiveFlag,
    ) -> Self {
        Self {
            protocol,
            instance,
            node_name: node_name.into(),
            config,
            store,
            transports: Vec::new(),
            active,
            state: RedundancyState::new(),
            metrics: None,
        }
    }

    /// Transports enabled while active and disabled on standby.
    pub fn with_transports(mut self, transports: Vec<Arc<dyn Transport>>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_metrics(mut self, metrics: RedundancyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn state(&self) -> &RedundancyState {
        &self.state
    }

    /// Run one poll: read the instance record, advance the role and apply its side effects.
    ///
    /// A store failure while reading leaves the role untouched.
    pub async fn poll_once(&mut self) -> Result<Decision, StoreError> {
        let record = self
            .store
            .find_driver_instance(self.protocol, self.instance)
            .await?;
        let keep_running = record
            .as_ref()
            .map(|record| record.keep_protocol_running_while_inactive)
            .unwrap_or(false);
        let decision =
            self.state
                .observe(record.as_ref(), &self.node_name, self.config.unchanged_threshold);

        self.active.set(decision.is_active());
        if let Some(metrics) = &self.metrics {
            metrics.set_active(decision.is_active());
            if decision.is_transition() {
                metrics.record_transition(decision.reason.label());
            }
        }
        self.log_decision(&decision);

        if decision.is_active() {
            self.enable_transports().await;
            self.heartbeat().await?;
        } else {
            if !keep_running {
                self.disable_transports().await;
            }
            if decision.deactivated() {
                self.invalidate_points().await;
            }
        }
        Ok(decision)
    }

    fn log_decision(&self, decision: &Decision) {
        match decision.reason {
            TransitionReason::InstanceMissing
            | TransitionReason::InstanceDisabled
            | TransitionReason::NodeNotAllowed => {
                error!(
                    node = %self.node_name,
                    protocol = %self.protocol,
                    instance = self.instance,
                    reason = %decision.reason,
                    "driver instance unusable by this node; staying inactive"
                );
            }
            _ if decision.is_transition() => {
                info!(
                    node = %self.node_name,
                    from = ?decision.previous,
                    to = ?decision.role,
                    reason = %decision.reason,
                    "redundancy role changed"
                );
            }
            _ => {
                debug!(node = %self.node_name, role = ?decision.role, unchanged = self.state.unchanged_polls(), "redundancy poll");
            }
        }
    }

    async fn enable_transports(&self) {
        for transport in &self.transports {
            if let Err(err) = transport.enable().await {
                warn!(connection = transport.connection_number(), error = %err, "failed to enable transport");
            }
        }
    }

    async fn disable_transports(&self) {
        for transport in &self.transports {
            if let Err(err) = transport.disable().await {
                warn!(connection = transport.connection_number(), error = %err, "failed to disable transport");
            }
        }
    }

    async fn heartbeat(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store
            .write_heartbeat(self.protocol, self.instance, &self.node_name, now)
            .await?;
        let stats = ConnectionStats {
            node_name: self.node_name.clone(),
            time_tag: now,
        };
        for transport in &self.transports {
            self.store
                .update_connection_stats(transport.connection_number(), &stats)
                .await?;
        }
        Ok(())
    }

    async fn invalidate_points(&self) {
        let now = Utc::now();
        for transport in &self.transports {
            let connection = transport.connection_number();
            match self.store.invalidate_connection(connection, now).await {
                Ok(count) => info!(connection, count, "points invalidated after losing active role"),
                Err(err) => warn!(connection, error = %err, "failed to invalidate points"),
            }
        }
    }

    /// Poll until shutdown. Sleeps a random jitter after stepping down and the
    /// retry backoff after a store error.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node = %self.node_name, protocol = %self.protocol, instance = self.instance, "redundancy coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(node = %self.node_name, "redundancy coordinator shutdown");
                    break;
                }
                _ = interval.tick() => {
                    let pause = match self.poll_once().await {
                        Ok(decision) if decision.deactivated() => {
                            Some(random_jitter(self.config.jitter_min, self.config.jitter_max))
                        }
                        Ok(_) => None,
                        Err(err) => {
                            warn!(node = %self.node_name, error = %err, role = ?self.state.role(), "redundancy poll failed; retaining role");
                            if let Some(metrics) = &self.metrics {
                                metrics.record_store_error();
                            }
                            Some(self.config.retry_backoff)
                        }
                    };
                    if let Some(pause) = pause {
                        if !sleep_or_shutdown(pause, &mut shutdown).await {
                            break;
                        }
                        interval.reset();
                    }
                }
            }
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Returns `false` when shutdown was signalled during the pause.
async fn sleep_or_shutdown(pause: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown.recv() => false,
        _ = tokio::time::sleep(pause) => true,
    }
}
