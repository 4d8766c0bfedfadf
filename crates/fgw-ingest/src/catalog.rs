//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Known point addresses and surrogate key allocation per connection."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use fgw_model::{key_range, Origin, PointKey};
use fgw_store::{PointStore, Result};
use parking_lot::RwLock;
use tracing::{debug, error};

#[derive(Debug)]
struct ConnectionCatalog {
    next_key: PointKey,
    end: PointKey,
    known: HashMap<(String, Origin), PointKey>,
}

/// Addresses already present in the store, shared by the ingestion consumer and
/// discovery. Each connection is loaded lazily from the store on first use.
#[derive(Debug, Default)]
pub struct PointCatalog {
    connections: RwLock<HashMap<u32, ConnectionCatalog>>,
}

impl PointCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, connection_number: u32) -> bool {
        self.connections.read().contains_key(&connection_number)
    }

    /// Load the known addresses and the key high-water mark of a connection.
    pub async fn ensure_loaded(&self, store: &dyn PointStore, connection_number: u32) -> Result<()> {
        if self.is_loaded(connection_number) {
            return Ok(());
        }
        let range = key_range(connection_number);
        let max = store.max_point_key_in_range(range.clone()).await?;
        let points = store.known_points(connection_number).await?;

        let mut connections = self.connections.write();
        if connections.contains_key(&connection_number) {
            return Ok(());
        }
        let known: HashMap<(String, Origin), PointKey> = points
            .into_iter()
            .map(|point| ((point.address, point.origin), point.key))
            .collect();
        let next_key = max.map(|key| key + 1).unwrap_or(range.start);
        debug!(
            connection = connection_number,
            known = known.len(),
            next_key,
            "point catalog loaded"
        );
        connections.insert(
            connection_number,
            ConnectionCatalog {
                next_key,
                end: range.end,
                known,
            },
        );
        Ok(())
    }

    /// Drop what is cached for a connection so the next use reloads it from the store.
    pub fn reset(&self, connection_number: u32) {
        self.connections.write().remove(&connection_number);
    }

    /// Forget every connection. Used when this node regains the active role,
    /// since the peer may have created points in the meantime.
    pub fn reset_all(&self) {
        self.connections.write().clear();
    }

    pub fn lookup(&self, connection_number: u32, address: &str, origin: Origin) -> Option<PointKey> {
        self.connections
            .read()
            .get(&connection_number)?
            .known
            .get(&(address.to_owned(), origin))
            .copied()
    }

    /// Supervised addresses known for a connection.
    pub fn known_addresses(&self, connection_number: u32) -> HashSet<String> {
        self.connections
            .read()
            .get(&connection_number)
            .map(|catalog| {
                catalog
                    .known
                    .keys()
                    .filter(|(_, origin)| *origin == Origin::Supervised)
                    .map(|(address, _)| address.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reserve a key for `address` unless one is already known. Returns `None`
    /// when the address is known, the connection is not loaded or its key range
    /// is exhausted.
    pub fn allocate(
        &self,
        connection_number: u32,
        address: &str,
        origin: Origin,
    ) -> Option<PointKey> {
        let mut connections = self.connections.write();
        let catalog = connections.get_mut(&connection_number)?;
        let entry = (address.to_owned(), origin);
        if catalog.known.contains_key(&entry) {
            return None;
        }
        if catalog.next_key >= catalog.end {
            error!(
                connection = connection_number,
                address, "point key range exhausted; point not created"
            );
            return None;
        }
        let key = catalog.next_key;
        catalog.next_key += 1;
        catalog.known.insert(entry, key);
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgw_model::PointRecord;
    use fgw_store::MemoryPointStore;

    #[tokio::test]
    async fn allocation_continues_after_highest_stored_key() {
        let store = MemoryPointStore::new();
        let mut record = PointRecord::new(2_000_041, "RTU2;7", Origin::Supervised);
        record.protocol_source_connection_number = 2;
        record.protocol_source_object_address = "7".into();
        store.insert_point(record);

        let catalog = PointCatalog::new();
        catalog.ensure_loaded(&store, 2).await.unwrap();
        assert_eq!(catalog.lookup(2, "7", Origin::Supervised), Some(2_000_041));
        assert_eq!(catalog.allocate(2, "7", Origin::Supervised), None);
        assert_eq!(catalog.allocate(2, "8", Origin::Supervised), Some(2_000_042));
        assert_eq!(catalog.allocate(2, "8", Origin::Command), Some(2_000_043));
        assert_eq!(catalog.known_addresses(2).len(), 2);
    }

    #[tokio::test]
    async fn empty_range_starts_at_connection_base_and_reset_reloads() {
        let store = MemoryPointStore::new();
        let catalog = PointCatalog::new();
        catalog.ensure_loaded(&store, 5).await.unwrap();
        assert_eq!(catalog.allocate(5, "a", Origin::Supervised), Some(5_000_000));
        catalog.reset(5);
        assert!(!catalog.is_loaded(5));
        assert_eq!(catalog.allocate(5, "a", Origin::Supervised), None);
        catalog.ensure_loaded(&store, 5).await.unwrap();
        assert_eq!(catalog.allocate(5, "a", Origin::Supervised), Some(5_000_000));
    }

    #[tokio::test]
    async fn reset_all_picks_up_points_created_elsewhere() {
        let store = MemoryPointStore::new();
        let catalog = PointCatalog::new();
        catalog.ensure_loaded(&store, 1).await.unwrap();
        catalog.ensure_loaded(&store, 2).await.unwrap();
        assert_eq!(catalog.allocate(1, "a", Origin::Supervised), Some(1_000_000));

        let mut peer = PointRecord::new(1_000_000, "PLC1;b", Origin::Supervised);
        peer.protocol_source_connection_number = 1;
        peer.protocol_source_object_address = "b".into();
        store.insert_point(peer);

        catalog.reset_all();
        assert!(!catalog.is_loaded(1));
        assert!(!catalog.is_loaded(2));
        catalog.ensure_loaded(&store, 1).await.unwrap();
        assert_eq!(catalog.lookup(1, "b", Origin::Supervised), Some(1_000_000));
        assert_eq!(catalog.allocate(1, "a", Origin::Supervised), Some(1_000_001));
    }
}
