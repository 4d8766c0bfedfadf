//! ---
//! fgw_section: "05-networking-external-interfaces"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Breadth-first namespace walk over a transport."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use fgw_common::DiscoveryConfig;
use fgw_model::{
    AcquiredValue, ConnectionConfig, DriverError, PointMetadata, Quality, SampleValue,
    COT_INTERROGATED,
};
use fgw_transport::{BrowseNode, NodeClass, NodeReading, SampleSink, Transport, TransportError};
use futures::stream::{self, Stream};
use tracing::{debug, info, warn};

/// Limits applied to one discovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Nodes read per request.
    pub read_batch_size: usize,
    /// Nodes requested per browse call, `0` leaves it to the server.
    pub max_nodes_per_browse: u32,
}

impl DiscoveryOptions {
    /// Connection settings, falling back to the process defaults.
    pub fn for_connection(connection: &ConnectionConfig, defaults: &DiscoveryConfig) -> Self {
        let read_batch_size = if connection.read_batch_size > 0 {
            connection.read_batch_size
        } else {
            defaults.read_batch_size
        };
        Self {
            read_batch_size: read_batch_size.max(1),
            max_nodes_per_browse: connection.max_nodes_per_browse,
        }
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            read_batch_size: 100,
            max_nodes_per_browse: 0,
        }
    }
}

/// Outcome of [`Discovery::feed`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    /// Samples accepted by the sink.
    pub published: usize,
    /// Samples the sink dropped.
    pub dropped: usize,
    /// Set when the link went away mid-pass and the walk stopped early.
    pub interrupted: Option<DriverError>,
}

impl DiscoveryReport {
    /// `true` when every node was walked and handed to the sink.
    pub fn is_complete(&self) -> bool {
        self.dropped == 0 && self.interrupted.is_none()
    }
}

#[derive(Debug, Clone)]
struct Leaf {
    node: BrowseNode,
    path: String,
    parent_path: String,
}

/// A single lazy pass over the namespace of one connection.
///
/// Yields one sample per accepted leaf that is not already known, plus a
/// command-flavored sample for writable variables and methods when the
/// connection accepts commands. Once exhausted the pass stays exhausted.
pub struct Discovery {
    connection: ConnectionConfig,
    transport: Arc<dyn Transport>,
    known: HashSet<String>,
    options: DiscoveryOptions,
    root_pending: bool,
    folders: VecDeque<(String, String)>,
    visited: HashSet<String>,
    leaves: VecDeque<Leaf>,
    ready: VecDeque<AcquiredValue>,
    finished: bool,
    interrupted: Option<DriverError>,
}

impl Discovery {
    pub fn new(
        connection: ConnectionConfig,
        transport: Arc<dyn Transport>,
        known: HashSet<String>,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            connection,
            transport,
            known,
            options,
            root_pending: true,
            folders: VecDeque::new(),
            visited: HashSet::new(),
            leaves: VecDeque::new(),
            ready: VecDeque::new(),
            finished: false,
            interrupted: None,
        }
    }

    /// Next discovered sample, `None` once the namespace is exhausted.
    pub async fn next(&mut self) -> Option<AcquiredValue> {
        loop {
            if let Some(sample) = self.ready.pop_front() {
                return Some(sample);
            }
            if self.finished {
                return None;
            }
            let browsing_done = !self.root_pending && self.folders.is_empty();
            if self.leaves.len() >= self.options.read_batch_size
                || (browsing_done && !self.leaves.is_empty())
            {
                self.read_leaves().await;
                continue;
            }
            if self.root_pending {
                self.root_pending = false;
                self.browse_folder(None, "").await;
                continue;
            }
            if let Some((node_id, path)) = self.folders.pop_front() {
                self.browse_folder(Some(&node_id), &path).await;
                continue;
            }
            self.finished = true;
            info!(
                connection = self.connection.protocol_connection_number,
                known = self.known.len(),
                "discovery pass complete"
            );
        }
    }

    /// Adapt the pass into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = AcquiredValue> + Send {
        stream::unfold(self, |mut discovery| async move {
            discovery.next().await.map(|sample| (sample, discovery))
        })
    }

    /// Drain the pass into `sink`.
    pub async fn feed(mut self, sink: &dyn SampleSink) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        while let Some(sample) = self.next().await {
            if sink.publish(sample) {
                report.published += 1;
            } else {
                report.dropped += 1;
            }
        }
        report.interrupted = self.interrupted.take();
        report
    }

    fn abort(&mut self, err: TransportError) {
        let err = err.into_driver_error(self.connection.protocol_connection_number);
        warn!(error = %err, retryable = err.is_retryable(), "discovery aborted");
        self.interrupted = Some(err);
        self.finished = true;
        self.folders.clear();
        self.leaves.clear();
    }

    async fn browse_folder(&mut self, parent: Option<&str>, path: &str) {
        let mut continuation: Option<String> = None;
        loop {
            let page = match self
                .transport
                .browse(parent, continuation.as_deref(), self.options.max_nodes_per_browse)
                .await
            {
                Ok(page) => page,
                Err(err @ TransportError::NotConnected(_)) => {
                    self.abort(err);
                    return;
                }
                Err(err) => {
                    warn!(
                        connection = self.connection.protocol_connection_number,
                        folder = path,
                        error = %err,
                        "browse failed; folder skipped"
                    );
                    return;
                }
            };
            for node in page.nodes {
                self.classify(node, path);
            }
            match page.continuation {
                Some(token) if continuation.as_deref() != Some(token.as_str()) => {
                    continuation = Some(token)
                }
                Some(_) => {
                    warn!(folder = path, "browse continuation did not advance; folder truncated");
                    return;
                }
                None => return,
            }
        }
    }

    fn classify(&mut self, node: BrowseNode, parent_path: &str) {
        if !self.visited.insert(node.node_id.clone()) {
            return;
        }
        let path = if parent_path.is_empty() {
            node.browse_name.clone()
        } else {
            format!("{parent_path}/{}", node.browse_name)
        };
        if node.class == NodeClass::Object && node.has_children {
            self.folders.push_back((node.node_id, path));
            return;
        }
        if !self.connection.accepts_path(&path) {
            debug!(path = %path, "node outside topic filter");
            return;
        }
        if self.known.contains(&node.node_id) {
            return;
        }
        self.leaves.push_back(Leaf {
            node,
            path,
            parent_path: parent_path.to_owned(),
        });
    }

    async fn read_leaves(&mut self) {
        let take = self.leaves.len().min(self.options.read_batch_size);
        let batch: Vec<Leaf> = self.leaves.drain(..take).collect();
        let readable: Vec<String> = batch
            .iter()
            .filter(|leaf| leaf.node.class != NodeClass::Method)
            .map(|leaf| leaf.node.node_id.clone())
            .collect();

        let mut readings = if readable.is_empty() {
            Vec::new()
        } else {
            match self.transport.read(&readable).await {
                Ok(readings) => readings,
                Err(err @ TransportError::NotConnected(_)) => {
                    self.abort(err);
                    return;
                }
                Err(err) => {
                    warn!(
                        connection = self.connection.protocol_connection_number,
                        nodes = readable.len(),
                        error = %err,
                        "read failed; values reported invalid"
                    );
                    Vec::new()
                }
            }
        }
        .into_iter();

        for leaf in batch {
            self.known.insert(leaf.node.node_id.clone());
            if leaf.node.class == NodeClass::Method {
                if self.connection.commands_enabled {
                    let sample = self.sample(&leaf, SampleValue::Command, Quality::good());
                    self.ready.push_back(sample);
                }
                continue;
            }
            let sample = match readings.next() {
                Some(Ok(reading)) => self.sample_from_reading(&leaf, reading),
                Some(Err(err)) => {
                    debug!(node = %leaf.node.node_id, error = %err, "node read failed");
                    self.placeholder(&leaf)
                }
                None => self.placeholder(&leaf),
            };
            let command = (leaf.node.writable && self.connection.commands_enabled)
                .then(|| sample.as_command());
            self.ready.push_back(sample);
            if let Some(command) = command {
                self.ready.push_back(command);
            }
        }
    }

    fn sample_from_reading(&self, leaf: &Leaf, reading: NodeReading) -> AcquiredValue {
        let mut sample = self.sample(leaf, reading.value, reading.quality);
        sample.source_timestamp = reading.source_timestamp;
        sample
    }

    fn placeholder(&self, leaf: &Leaf) -> AcquiredValue {
        let value = match leaf.node.data_type.to_ascii_lowercase().as_str() {
            "boolean" => SampleValue::Digital(false),
            "string" | "localizedtext" | "datetime" => SampleValue::Text(String::new()),
            _ => SampleValue::Analog(0.0),
        };
        self.sample(leaf, value, Quality::invalid())
    }

    fn sample(
        &self,
        leaf: &Leaf,
        value: SampleValue,
        quality: Quality,
    ) -> AcquiredValue {
        let mut sample = AcquiredValue::new(
            self.connection.protocol_connection_number,
            self.connection.name.clone(),
            leaf.node.node_id.clone(),
            value,
        )
        .with_common_address(leaf.parent_path.clone())
        .with_quality(quality);
        if !leaf.node.data_type.is_empty() {
            sample = sample.with_asdu(leaf.node.data_type.clone());
        }
        sample.is_array = leaf.node.is_array;
        sample.is_event = false;
        sample.cause_of_transmission = COT_INTERROGATED;
        let access_level = if leaf.node.writable {
            "CurrentRead,CurrentWrite"
        } else {
            "CurrentRead"
        };
        sample.self_published(PointMetadata {
            display_name: leaf.node.display_name.clone(),
            path: leaf.path.clone(),
            writable: leaf.node.writable,
            access_level: Some(access_level.to_owned()),
            publishing_interval: Some(self.connection.auto_create_tags_publishing_interval),
            sampling_interval: Some(self.connection.auto_create_tags_sampling_interval),
            queue_size: Some(self.connection.auto_create_tags_queue_size),
        })
    }
}
