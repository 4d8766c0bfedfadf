//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Command feed consumer validating and delivering control requests."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fgw_common::time::age;
use fgw_common::DispatchConfig;
use fgw_metrics::DispatchMetrics;
use fgw_model::{CancelReason, CommandOutcome, CommandRequest, ConnectionConfig, DriverError};
use fgw_redundancy::ActiveFlag;
use fgw_store::PointStore;
use fgw_transport::{CommandPrimitive, LinkState, Transport};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::translate::translate;

/// Watches the command queue and hands each insert to a short-lived task.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
    metrics: Option<DispatchMetrics>,
}

struct Inner {
    store: Arc<dyn PointStore>,
    connections: HashMap<u32, ConnectionConfig>,
    transports: HashMap<u32, Arc<dyn Transport>>,
    active: ActiveFlag,
    config: DispatchConfig,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<dyn PointStore>,
        connections: impl IntoIterator<Item = ConnectionConfig>,
        transports: impl IntoIterator<Item = Arc<dyn Transport>>,
        active: ActiveFlag,
        config: DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                connections: connections
                    .into_iter()
                    .map(|conn| (conn.protocol_connection_number, conn))
                    .collect(),
                transports: transports
                    .into_iter()
                    .map(|transport| (transport.connection_number(), transport))
                    .collect(),
                active,
                config,
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DispatchMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Follow the command feed until shutdown, re-opening it after a backoff
    /// whenever it fails or ends. In-flight commands finish before returning.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let backoff = self.inner.config.feed_backoff;
        let mut in_flight: JoinSet<()> = JoinSet::new();
        info!(
            connections = self.inner.connections.len(),
            expiry_s = self.inner.config.command_expiry.as_secs(),
            "command dispatcher started"
        );

        'feed: loop {
            let mut feed = match self.inner.store.watch_commands().await {
                Ok(feed) => feed,
                Err(err) => {
                    warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "command feed unavailable");
                    tokio::select! {
                        _ = shutdown.recv() => break 'feed,
                        _ = tokio::time::sleep(backoff) => continue 'feed,
                    }
                }
            };
            debug!("command feed opened");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break 'feed,
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    item = feed.next() => match item {
                        Some(Ok(request)) => {
                            if !self.inner.active.is_active() {
                                debug!(command = %request.id, "standby; command left to the active node");
                                if let Some(metrics) = &self.metrics {
                                    metrics.record_ignored("standby");
                                }
                                continue;
                            }
                            let dispatcher = self.clone();
                            in_flight.spawn(async move {
                                dispatcher.dispatch(request).await;
                            });
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "command feed failed; reopening");
                            break;
                        }
                        None => {
                            warn!("command feed ended; reopening");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break 'feed,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        debug!("command dispatcher shutdown");
    }

    /// Validate and deliver one command, recording its terminal outcome.
    ///
    /// Returns `None` when the request names a connection this instance does
    /// not own; such requests are left untouched for their owner.
    pub async fn dispatch(&self, request: CommandRequest) -> Option<CommandOutcome> {
        let number = request.protocol_source_connection_number;
        let Some(connection) = self.inner.connections.get(&number) else {
            warn!(
                command = %request.id,
                connection = number,
                "command for unknown connection ignored"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_ignored("unknown_connection");
            }
            return None;
        };

        let outcome = match self.validate(connection, &request) {
            Ok((transport, primitive)) => self.deliver(transport.as_ref(), &request, primitive).await,
            Err(reason) => {
                info!(
                    command = %request.id,
                    connection = number,
                    address = %request.protocol_source_object_address,
                    value = request.value,
                    error = %DriverError::CommandValidation(reason),
                    "command cancelled"
                );
                CommandOutcome::Cancelled { reason }
            }
        };

        if let Err(err) = self
            .inner
            .store
            .update_command_outcome(request.id, &outcome, Utc::now())
            .await
        {
            error!(command = %request.id, error = %err, "failed to record command outcome");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(outcome.label());
        }
        Some(outcome)
    }

    fn validate(
        &self,
        connection: &ConnectionConfig,
        request: &CommandRequest,
    ) -> Result<(Arc<dyn Transport>, CommandPrimitive), CancelReason> {
        if !connection.commands_enabled {
            return Err(CancelReason::CommandsDisabled);
        }
        let transport = self
            .inner
            .transports
            .get(&connection.protocol_connection_number)
            .filter(|transport| transport.link_state() == LinkState::Up)
            .ok_or(CancelReason::NotConnected)?;
        if age(request.time_tag, Utc::now()) >= self.inner.config.command_expiry {
            return Err(CancelReason::Expired);
        }
        let primitive = translate(connection.protocol_driver, request)?;
        Ok((Arc::clone(transport), primitive))
    }

    async fn deliver(
        &self,
        transport: &dyn Transport,
        request: &CommandRequest,
        primitive: CommandPrimitive,
    ) -> CommandOutcome {
        let limit = self.inner.config.transport_timeout;
        let rejected = |result_description: String| CommandOutcome::Delivered {
            ack: false,
            result_description,
        };

        if request.protocol_source_command_use_sbo {
            match timeout(limit, transport.select(&primitive)).await {
                Ok(Ok(true)) => debug!(command = %request.id, target = %primitive.target(), "select confirmed"),
                Ok(Ok(false)) => {
                    warn!(command = %request.id, target = %primitive.target(), "select not confirmed; execute skipped");
                    return rejected("select not confirmed".to_owned());
                }
                Ok(Err(err)) => {
                    warn!(command = %request.id, error = %err, "select failed");
                    return rejected(format!("select failed: {err}"));
                }
                Err(_) => {
                    warn!(command = %request.id, timeout_ms = limit.as_millis() as u64, "select timed out");
                    return rejected(format!("select timed out after {} ms", limit.as_millis()));
                }
            }
        }

        match timeout(limit, transport.execute(&primitive)).await {
            Ok(Ok(response)) => {
                info!(
                    command = %request.id,
                    target = %primitive.target(),
                    value = request.value,
                    ack = response.ack,
                    result = %response.description,
                    "command delivered"
                );
                CommandOutcome::Delivered {
                    ack: response.ack,
                    result_description: response.description,
                }
            }
            Ok(Err(err)) => {
                warn!(command = %request.id, error = %err, "command execution failed");
                rejected(format!("execute failed: {err}"))
            }
            Err(_) => {
                warn!(command = %request.id, timeout_ms = limit.as_millis() as u64, "command execution timed out");
                rejected(format!("execute timed out after {} ms", limit.as_millis()))
            }
        }
    }
}
