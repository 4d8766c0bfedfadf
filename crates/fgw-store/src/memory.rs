//! ---
//! fgw_section: "03-persistence-logging"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "In-memory point store backend for single-node runs and tests."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fgw_model::{
    CommandOutcome, CommandRequest, ConnectionConfig, ConnectionStats, DriverInstanceRecord,
    Origin, PointKey, PointRecord, Protocol,
};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    BulkWriteSummary, CommandFeed, KnownPoint, PointStore, PointWrite, Result, StoreError,
};

const COMMAND_FEED_CAPACITY: usize = 1_024;

type PointIndexKey = (u32, String, Origin);

#[derive(Debug, Default)]
struct State {
    connections: BTreeMap<u32, ConnectionConfig>,
    instances: HashMap<(Protocol, u32), DriverInstanceRecord>,
    points: BTreeMap<PointKey, PointRecord>,
    by_address: HashMap<PointIndexKey, PointKey>,
    commands: HashMap<Uuid, CommandRequest>,
    outcome_writes: HashMap<Uuid, usize>,
    bulk_write_sizes: Vec<usize>,
}

impl State {
    fn insert_point(&mut self, record: PointRecord) -> bool {
        let index_key = (
            record.protocol_source_connection_number,
            record.protocol_source_object_address.clone(),
            record.origin,
        );
        let tag_taken = self.points.values().any(|existing| existing.tag == record.tag);
        if self.points.contains_key(&record.key) || tag_taken {
            return false;
        }
        self.by_address.insert(index_key, record.key);
        self.points.insert(record.key, record);
        true
    }
}

/// Process-local point store used by simulation mode and tests.
///
/// Availability can be toggled to exercise the store-outage paths of the
/// driver loops.
#[derive(Debug)]
pub struct MemoryPointStore {
    state: RwLock<State>,
    available: AtomicBool,
    commands_tx: Mutex<broadcast::Sender<CommandRequest>>,
}

impl Default for MemoryPointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPointStore {
    /// Empty, reachable store.
    pub fn new() -> Self {
        let (commands_tx, _) = broadcast::channel(COMMAND_FEED_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
            commands_tx: Mutex::new(commands_tx),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unreachable".into()))
        }
    }

    /// Simulate an outage (`false`) or a recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Add or replace a connection document.
    pub fn insert_connection(&self, connection: ConnectionConfig) {
        self.state
            .write()
            .connections
            .insert(connection.protocol_connection_number, connection);
    }

    /// Current connection document.
    pub fn connection(&self, number: u32) -> Option<ConnectionConfig> {
        self.state.read().connections.get(&number).cloned()
    }

    /// Add or replace a driver instance document.
    pub fn upsert_driver_instance(&self, record: DriverInstanceRecord) {
        self.state.write().instances.insert(
            (record.protocol_driver, record.protocol_driver_instance_number),
            record,
        );
    }

    /// Current driver instance document.
    pub fn driver_instance(&self, protocol: Protocol, instance: u32) -> Option<DriverInstanceRecord> {
        self.state.read().instances.get(&(protocol, instance)).cloned()
    }

    /// Seed a point record directly; returns `false` on key or tag collision.
    pub fn insert_point(&self, record: PointRecord) -> bool {
        self.state.write().insert_point(record)
    }

    /// Point record by key.
    pub fn point(&self, key: PointKey) -> Option<PointRecord> {
        self.state.read().points.get(&key).cloned()
    }

    /// Point record by connection, address and origin.
    pub fn point_at(&self, connection_number: u32, address: &str, origin: Origin) -> Option<PointRecord> {
        let state = self.state.read();
        state
            .by_address
            .get(&(connection_number, address.to_owned(), origin))
            .and_then(|key| state.points.get(key))
            .cloned()
    }

    /// All records owned by a connection, ordered by key.
    pub fn points_for_connection(&self, connection_number: u32) -> Vec<PointRecord> {
        self.state
            .read()
            .points
            .values()
            .filter(|record| record.protocol_source_connection_number == connection_number)
            .cloned()
            .collect()
    }

    /// Total number of point records.
    pub fn point_count(&self) -> usize {
        self.state.read().points.len()
    }

    /// Insert a command and notify every open feed.
    pub fn insert_command(&self, request: CommandRequest) {
        self.state
            .write()
            .commands
            .insert(request.id, request.clone());
        if self.commands_tx.lock().send(request).is_err() {
            debug!("command inserted without active feed subscribers");
        }
    }

    /// Current state of a command.
    pub fn command(&self, id: Uuid) -> Option<CommandRequest> {
        self.state.read().commands.get(&id).cloned()
    }

    /// Number of outcome writes recorded for a command.
    pub fn outcome_writes(&self, id: Uuid) -> usize {
        self.state
            .read()
            .outcome_writes
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    /// Sizes of every bulk write accepted so far.
    pub fn bulk_write_sizes(&self) -> Vec<usize> {
        self.state.read().bulk_write_sizes.clone()
    }

    /// Close every open command feed; later subscriptions get a fresh feed.
    pub fn restart_command_feed(&self) {
        let (commands_tx, _) = broadcast::channel(COMMAND_FEED_CAPACITY);
        *self.commands_tx.lock() = commands_tx;
    }
}

#[async_trait]
impl PointStore for MemoryPointStore {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn find_connections(
        &self,
        protocol: Protocol,
        instance: u32,
    ) -> Result<Vec<ConnectionConfig>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .connections
            .values()
            .filter(|conn| {
                conn.enabled
                    && conn.protocol_driver == protocol
                    && conn.protocol_driver_instance_number == instance
            })
            .cloned()
            .collect())
    }

    async fn find_driver_instance(
        &self,
        protocol: Protocol,
        instance: u32,
    ) -> Result<Option<DriverInstanceRecord>> {
        self.check_available()?;
        Ok(self.driver_instance(protocol, instance))
    }

    async fn write_heartbeat(
        &self,
        protocol: Protocol,
        instance: u32,
        node_name: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write();
        let record = state
            .instances
            .entry((protocol, instance))
            .or_insert_with(|| DriverInstanceRecord::new(protocol, instance));
        record.active_node_name = node_name.to_owned();
        record.active_node_keep_alive_time_tag = Some(at);
        Ok(())
    }

    async fn update_connection_stats(
        &self,
        connection_number: u32,
        stats: &ConnectionStats,
    ) -> Result<()> {
        self.check_available()?;
        if let Some(conn) = self.state.write().connections.get_mut(&connection_number) {
            conn.stats = Some(stats.clone());
        }
        Ok(())
    }

    async fn max_point_key_in_range(&self, range: Range<PointKey>) -> Result<Option<PointKey>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .points
            .range(range)
            .next_back()
            .map(|(key, _)| *key))
    }

    async fn known_points(&self, connection_number: u32) -> Result<Vec<KnownPoint>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .by_address
            .iter()
            .filter(|((conn, _, _), _)| *conn == connection_number)
            .map(|((_, address, origin), key)| KnownPoint {
                key: *key,
                address: address.clone(),
                origin: *origin,
            })
            .collect())
    }

    async fn bulk_write(&self, writes: Vec<PointWrite>) -> Result<BulkWriteSummary> {
        self.check_available()?;
        let mut state = self.state.write();
        state.bulk_write_sizes.push(writes.len());
        let mut summary = BulkWriteSummary::default();
        for write in writes {
            match write {
                PointWrite::Insert(record) => {
                    if state.insert_point(*record) {
                        summary.inserted += 1;
                    } else {
                        summary.duplicates += 1;
                    }
                }
                PointWrite::UpdateSource {
                    connection_number,
                    address,
                    update,
                } => {
                    let key = state
                        .by_address
                        .get(&(connection_number, address, Origin::Supervised))
                        .copied();
                    match key.and_then(|key| state.points.get_mut(&key)) {
                        Some(record) => {
                            record.source_data_update = Some(update);
                            summary.updated += 1;
                        }
                        None => summary.unmatched += 1,
                    }
                }
                PointWrite::LinkCommand {
                    supervised,
                    command,
                } => {
                    let mut linked = false;
                    if let Some(record) = state.points.get_mut(&supervised) {
                        record.command_of_supervised = command;
                        linked = true;
                    }
                    if let Some(record) = state.points.get_mut(&command) {
                        record.supervised_of_command = supervised;
                        linked = true;
                    }
                    if linked {
                        summary.updated += 1;
                    } else {
                        summary.unmatched += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn invalidate_connection(
        &self,
        connection_number: u32,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_available()?;
        let mut touched = 0;
        for record in self.state.write().points.values_mut() {
            if record.protocol_source_connection_number == connection_number
                && record.origin == Origin::Supervised
            {
                record.invalid = true;
                record.time_tag = Some(at);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn watch_commands(&self) -> Result<CommandFeed> {
        self.check_available()?;
        let receiver = self.commands_tx.lock().subscribe();
        let feed = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(request) => return Some((Ok::<_, StoreError>(request), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "command feed lagged; inserts skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(feed.boxed())
    }

    async fn update_command_outcome(
        &self,
        id: Uuid,
        outcome: &CommandOutcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write();
        let request = state
            .commands
            .get_mut(&id)
            .ok_or(StoreError::CommandNotFound(id))?;
        request.apply_outcome(outcome, at);
        *state.outcome_writes.entry(id).or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgw_model::{AcquiredValue, SampleValue, SourceDataUpdate};

    fn record(key: PointKey, conn: u32, address: &str, origin: Origin) -> PointRecord {
        let mut record = PointRecord::new(key, format!("c{conn};{address};{origin:?}"), origin);
        record.protocol_source_connection_number = conn;
        record.protocol_source_object_address = address.to_owned();
        record
    }

    #[tokio::test]
    async fn unavailable_store_rejects_every_call() {
        let store = MemoryPointStore::new();
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.bulk_write(Vec::new()).await.is_err());
        assert!(store.watch_commands().await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn bulk_write_inserts_updates_and_reports_duplicates() {
        let store = MemoryPointStore::new();
        let sample = AcquiredValue::new(2, "RTU2", "17", SampleValue::Analog(1.5));
        let summary = store
            .bulk_write(vec![
                PointWrite::Insert(Box::new(record(2_000_000, 2, "17", Origin::Supervised))),
                PointWrite::Insert(Box::new(record(2_000_000, 2, "18", Origin::Supervised))),
                PointWrite::UpdateSource {
                    connection_number: 2,
                    address: "17".into(),
                    update: SourceDataUpdate::from(&sample),
                },
                PointWrite::UpdateSource {
                    connection_number: 2,
                    address: "99".into(),
                    update: SourceDataUpdate::from(&sample),
                },
            ])
            .await
            .unwrap();
        assert_eq!(
            summary,
            BulkWriteSummary {
                inserted: 1,
                updated: 1,
                unmatched: 1,
                duplicates: 1
            }
        );
        let stored = store.point(2_000_000).unwrap();
        assert_eq!(stored.source_data_update.unwrap().value_at_source, 1.5);
        assert_eq!(store.bulk_write_sizes(), vec![4]);
    }

    #[tokio::test]
    async fn max_key_is_scoped_to_range() {
        let store = MemoryPointStore::new();
        store.insert_point(record(1_000_005, 1, "a", Origin::Supervised));
        store.insert_point(record(2_000_001, 2, "a", Origin::Supervised));
        assert_eq!(
            store.max_point_key_in_range(1_000_000..2_000_000).await.unwrap(),
            Some(1_000_005)
        );
        assert_eq!(
            store.max_point_key_in_range(3_000_000..4_000_000).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn invalidation_only_touches_supervised_points_of_connection() {
        let store = MemoryPointStore::new();
        let mut valid = record(1, 1, "a", Origin::Supervised);
        valid.invalid = false;
        store.insert_point(valid);
        let mut command = record(2, 1, "a", Origin::Command);
        command.invalid = false;
        store.insert_point(command);
        let mut other = record(3, 2, "a", Origin::Supervised);
        other.invalid = false;
        store.insert_point(other);

        let touched = store.invalidate_connection(1, Utc::now()).await.unwrap();
        assert_eq!(touched, 1);
        assert!(store.point(1).unwrap().invalid);
        assert!(!store.point(2).unwrap().invalid);
        assert!(!store.point(3).unwrap().invalid);
    }

    #[tokio::test]
    async fn feed_delivers_inserts_and_ends_on_restart() {
        let store = MemoryPointStore::new();
        let mut feed = store.watch_commands().await.unwrap();
        let request = CommandRequest::new(3, "40001", 1.0);
        store.insert_command(request.clone());
        let received = feed.next().await.unwrap().unwrap();
        assert_eq!(received.id, request.id);

        store.restart_command_feed();
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn outcome_writes_are_counted() {
        let store = MemoryPointStore::new();
        let request = CommandRequest::new(3, "40001", 1.0);
        store.insert_command(request.clone());
        let outcome = CommandOutcome::Delivered {
            ack: true,
            result_description: "ok".into(),
        };
        store
            .update_command_outcome(request.id, &outcome, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.outcome_writes(request.id), 1);
        assert_eq!(store.command(request.id).unwrap().ack, Some(true));
        let missing = Uuid::new_v4();
        assert_eq!(
            store
                .update_command_outcome(missing, &outcome, Utc::now())
                .await
                .unwrap_err(),
            StoreError::CommandNotFound(missing)
        );
    }
}
