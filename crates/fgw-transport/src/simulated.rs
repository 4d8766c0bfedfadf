//! ---
//! fgw_section: "05-networking-external-interfaces"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Simulated field device used by simulation mode and tests."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fgw_model::{AcquiredValue, PointMetadata, Quality, SampleValue};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::primitive::{CommandPrimitive, CommandResponse, OpcUaValue};
use crate::{
    BrowseNode, BrowsePage, LinkState, NodeClass, NodeReading, Result, SampleSink, Transport,
    TransportError,
};

/// Command calls observed by a [`SimulatedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Select(CommandPrimitive),
    Execute(CommandPrimitive),
}

#[derive(Debug, Clone)]
struct SimNode {
    node: BrowseNode,
    parent: String,
    value: SampleValue,
}

#[derive(Debug, Default)]
struct Namespace {
    nodes: BTreeMap<String, SimNode>,
    children: BTreeMap<String, Vec<String>>,
}

impl Namespace {
    fn add(&mut self, parent: &str, node: SimNode) {
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.node.has_children = true;
        }
        let siblings = self.children.entry(parent.to_owned()).or_default();
        if !siblings.contains(&node.node.node_id) {
            siblings.push(node.node.node_id.clone());
        }
        self.nodes.insert(node.node.node_id.clone(), node);
    }

    fn ensure_objects(&mut self, segments: &[&str]) -> String {
        let mut parent = String::new();
        for (depth, segment) in segments.iter().enumerate() {
            let node_id = segments[..=depth].join("/");
            if !self.nodes.contains_key(&node_id) {
                let node = SimNode {
                    node: BrowseNode {
                        node_id: node_id.clone(),
                        browse_name: (*segment).to_owned(),
                        display_name: (*segment).to_owned(),
                        class: NodeClass::Object,
                        has_children: false,
                        writable: false,
                        data_type: String::new(),
                        is_array: false,
                    },
                    parent: parent.clone(),
                    value: SampleValue::Command,
                };
                self.add(&parent, node);
            }
            parent = node_id;
        }
        parent
    }
}

fn data_type_of(value: &SampleValue) -> &'static str {
    match value {
        SampleValue::Digital(_) => "boolean",
        SampleValue::Analog(_) => "double",
        SampleValue::Text(_) => "string",
        SampleValue::Structured(_) => "extensionobject",
        SampleValue::Command => "",
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

/// In-memory field device exposing a browsable namespace, readable values and
/// a scriptable command response. Used by simulation mode and tests.
pub struct SimulatedTransport {
    connection_number: u32,
    connection_name: String,
    enabled: AtomicBool,
    link_up: AtomicBool,
    select_confirms: AtomicBool,
    execute_acks: AtomicBool,
    execute_delay: Mutex<Duration>,
    failing_reads: Mutex<HashSet<String>>,
    namespace: RwLock<Namespace>,
    journal: Mutex<Vec<JournalEntry>>,
    sink: RwLock<Option<Arc<dyn SampleSink>>>,
    browse_calls: AtomicUsize,
}

impl fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("connection_number", &self.connection_number)
            .field("connection_name", &self.connection_name)
            .field("enabled", &self.enabled.load(Ordering::SeqCst))
            .field("link_up", &self.link_up.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SimulatedTransport {
    /// Disabled device with an empty namespace that confirms selects and acknowledges executes.
    pub fn new(connection_number: u32, connection_name: impl Into<String>) -> Self {
        Self {
            connection_number,
            connection_name: connection_name.into(),
            enabled: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            select_confirms: AtomicBool::new(true),
            execute_acks: AtomicBool::new(true),
            execute_delay: Mutex::new(Duration::ZERO),
            failing_reads: Mutex::new(HashSet::new()),
            namespace: RwLock::new(Namespace::default()),
            journal: Mutex::new(Vec::new()),
            sink: RwLock::new(None),
            browse_calls: AtomicUsize::new(0),
        }
    }

    /// Add a variable at a slash delimited path, creating parent objects. Returns its node id.
    pub fn add_variable(&self, path: &str, value: SampleValue, writable: bool) -> String {
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return String::new();
        };
        let mut namespace = self.namespace.write();
        let parent = namespace.ensure_objects(parents);
        let node_id = segments.join("/");
        let node = SimNode {
            node: BrowseNode {
                node_id: node_id.clone(),
                browse_name: (*name).to_owned(),
                display_name: (*name).to_owned(),
                class: NodeClass::Variable,
                has_children: false,
                writable,
                data_type: data_type_of(&value).to_owned(),
                is_array: false,
            },
            parent: parent.clone(),
            value,
        };
        namespace.add(&parent, node);
        node_id
    }

    /// Add a callable method at a slash delimited path. Returns its node id.
    pub fn add_method(&self, path: &str) -> String {
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return String::new();
        };
        let mut namespace = self.namespace.write();
        let parent = namespace.ensure_objects(parents);
        let node_id = segments.join("/");
        let node = SimNode {
            node: BrowseNode {
                node_id: node_id.clone(),
                browse_name: (*name).to_owned(),
                display_name: (*name).to_owned(),
                class: NodeClass::Method,
                has_children: false,
                writable: true,
                data_type: String::new(),
                is_array: false,
            },
            parent: parent.clone(),
            value: SampleValue::Command,
        };
        namespace.add(&parent, node);
        node_id
    }

    /// Route pushed samples and link events to `sink`.
    pub fn attach_sink(&self, sink: Arc<dyn SampleSink>) {
        *self.sink.write() = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn SampleSink>> {
        self.sink.read().clone()
    }

    /// Force the link state; a transition to down is reported to the sink.
    pub fn set_link(&self, state: LinkState) {
        let up = state == LinkState::Up;
        let was_up = self.link_up.swap(up, Ordering::SeqCst);
        if was_up && !up {
            info!(connection = self.connection_number, "simulated link down");
            if let Some(sink) = self.sink() {
                sink.link_down(self.connection_number);
            }
        }
    }

    /// Answer subsequent selects positively (`true`) or negatively.
    pub fn set_select_confirms(&self, confirms: bool) {
        self.select_confirms.store(confirms, Ordering::SeqCst);
    }

    /// Acknowledge subsequent executes positively (`true`) or negatively.
    pub fn set_execute_acks(&self, acks: bool) {
        self.execute_acks.store(acks, Ordering::SeqCst);
    }

    /// Delay every execute by `delay`.
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock() = delay;
    }

    /// Make reads of `node_id` fail individually.
    pub fn fail_reads_for(&self, node_id: impl Into<String>) {
        self.failing_reads.lock().insert(node_id.into());
    }

    /// Command calls observed so far.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    /// Number of execute calls observed so far.
    pub fn executed_count(&self) -> usize {
        self.journal
            .lock()
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Execute(_)))
            .count()
    }

    /// Number of browse calls served so far.
    pub fn browse_calls(&self) -> usize {
        self.browse_calls.load(Ordering::SeqCst)
    }

    /// Current value of a variable.
    pub fn value(&self, node_id: &str) -> Option<SampleValue> {
        self.namespace
            .read()
            .nodes
            .get(node_id)
            .map(|node| node.value.clone())
    }

    /// Change a variable and push the new value when the link is up.
    pub fn set_value(&self, node_id: &str, value: SampleValue) -> bool {
        let sample = {
            let mut namespace = self.namespace.write();
            let Some(node) = namespace.nodes.get_mut(node_id) else {
                return false;
            };
            node.value = value;
            self.sample_for(node)
        };
        self.push(sample);
        true
    }

    /// Push the current value of every variable; returns how many were accepted.
    pub fn publish_all(&self) -> usize {
        let samples: Vec<AcquiredValue> = self
            .namespace
            .read()
            .nodes
            .values()
            .filter(|node| node.node.class == NodeClass::Variable)
            .map(|node| self.sample_for(node))
            .collect();
        samples
            .into_iter()
            .filter(|sample| self.push(sample.clone()))
            .count()
    }

    fn push(&self, sample: AcquiredValue) -> bool {
        if !self.is_enabled() || self.link_state() == LinkState::Down {
            return false;
        }
        match self.sink() {
            Some(sink) => sink.publish(sample),
            None => false,
        }
    }

    fn sample_for(&self, node: &SimNode) -> AcquiredValue {
        let access_level = if node.node.writable {
            "CurrentRead,CurrentWrite"
        } else {
            "CurrentRead"
        };
        AcquiredValue::new(
            self.connection_number,
            self.connection_name.clone(),
            node.node.node_id.clone(),
            node.value.clone(),
        )
        .with_asdu(node.node.data_type.clone())
        .with_common_address(node.parent.clone())
        .with_source_timestamp(Utc::now())
        .self_published(PointMetadata {
            display_name: node.node.display_name.clone(),
            path: node.node.node_id.clone(),
            writable: node.node.writable,
            access_level: Some(access_level.to_owned()),
            ..PointMetadata::default()
        })
    }

    fn perturb(&self) {
        let mut rng = rand::thread_rng();
        let mut namespace = self.namespace.write();
        for node in namespace.nodes.values_mut() {
            match &mut node.value {
                SampleValue::Analog(value) => *value += rng.gen_range(-0.5..0.5),
                SampleValue::Digital(state) if rng.gen_bool(0.05) => *state = !*state,
                _ => {}
            }
        }
    }

    /// Periodically perturb and push every variable while enabled and linked.
    pub fn spawn_publisher(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(connection = self.connection_number, "simulated publisher shutdown");
                        break;
                    }
                    _ = ticker.tick() => {
                        if self.is_enabled() && self.link_state() == LinkState::Up {
                            self.perturb();
                            let published = self.publish_all();
                            debug!(connection = self.connection_number, published, "simulated values pushed");
                        }
                    }
                }
            }
        })
    }

    fn ensure_linked(&self) -> Result<()> {
        if self.link_state() == LinkState::Up {
            Ok(())
        } else {
            Err(TransportError::NotConnected(self.connection_number))
        }
    }

    fn apply_write(&self, node_id: &str, value: &OpcUaValue) -> std::result::Result<(), String> {
        let converted = match value {
            OpcUaValue::Boolean(state) => SampleValue::Digital(*state),
            OpcUaValue::String(text) => SampleValue::Text(text.clone()),
            OpcUaValue::DateTime(stamp) => SampleValue::Text(stamp.to_rfc3339()),
            OpcUaValue::SByte(v) => SampleValue::Analog(f64::from(*v)),
            OpcUaValue::Byte(v) => SampleValue::Analog(f64::from(*v)),
            OpcUaValue::Int16(v) => SampleValue::Analog(f64::from(*v)),
            OpcUaValue::UInt16(v) => SampleValue::Analog(f64::from(*v)),
            OpcUaValue::Int32(v) => SampleValue::Analog(f64::from(*v)),
            OpcUaValue::UInt32(v) => SampleValue::Analog(f64::from(*v)),
            OpcUaValue::Int64(v) => SampleValue::Analog(*v as f64),
            OpcUaValue::UInt64(v) => SampleValue::Analog(*v as f64),
            OpcUaValue::Float(v) => SampleValue::Analog(f64::from(*v)),
            OpcUaValue::Double(v) => SampleValue::Analog(*v),
        };
        let writable = self
            .namespace
            .read()
            .nodes
            .get(node_id)
            .map(|node| node.node.writable);
        match writable {
            Some(true) => {
                self.set_value(node_id, converted);
                Ok(())
            }
            Some(false) => Err("BadNotWritable".to_owned()),
            None => Err("BadNodeIdUnknown".to_owned()),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn connection_number(&self) -> u32 {
        self.connection_number
    }

    fn link_state(&self) -> LinkState {
        if self.link_up.load(Ordering::SeqCst) {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> Result<()> {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!(connection = self.connection_number, "simulated transport enabled");
        }
        self.link_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!(connection = self.connection_number, "simulated transport disabled");
        }
        self.link_up.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn browse(
        &self,
        parent: Option<&str>,
        continuation: Option<&str>,
        max_nodes: u32,
    ) -> Result<BrowsePage> {
        self.browse_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_linked()?;
        let offset = match continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| TransportError::Rejected(format!("bad continuation point {token}")))?,
            None => 0,
        };
        let namespace = self.namespace.read();
        let parent = parent.unwrap_or_default();
        if !parent.is_empty() && !namespace.nodes.contains_key(parent) {
            return Err(TransportError::UnknownNode(parent.to_owned()));
        }
        let children = namespace.children.get(parent).cloned().unwrap_or_default();
        let limit = if max_nodes == 0 {
            children.len()
        } else {
            max_nodes as usize
        };
        let nodes: Vec<BrowseNode> = children
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| namespace.nodes.get(id).map(|node| node.node.clone()))
            .collect();
        let next = offset + nodes.len();
        let continuation = (next < children.len()).then(|| next.to_string());
        Ok(BrowsePage {
            nodes,
            continuation,
        })
    }

    async fn read(&self, node_ids: &[String]) -> Result<Vec<Result<NodeReading>>> {
        self.ensure_linked()?;
        let failing = self.failing_reads.lock().clone();
        let namespace = self.namespace.read();
        Ok(node_ids
            .iter()
            .map(|id| {
                if failing.contains(id) {
                    return Err(TransportError::Rejected(format!("BadNotReadable {id}")));
                }
                namespace
                    .nodes
                    .get(id)
                    .map(|node| NodeReading {
                        value: node.value.clone(),
                        quality: Quality::good(),
                        source_timestamp: Some(Utc::now()),
                    })
                    .ok_or_else(|| TransportError::UnknownNode(id.clone()))
            })
            .collect())
    }

    async fn select(&self, command: &CommandPrimitive) -> Result<bool> {
        self.ensure_linked()?;
        self.journal.lock().push(JournalEntry::Select(command.clone()));
        Ok(self.select_confirms.load(Ordering::SeqCst))
    }

    async fn execute(&self, command: &CommandPrimitive) -> Result<CommandResponse> {
        self.ensure_linked()?;
        self.journal
            .lock()
            .push(JournalEntry::Execute(command.clone()));
        let delay = *self.execute_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.execute_acks.load(Ordering::SeqCst) {
            return Ok(CommandResponse::nack("Bad"));
        }
        if let CommandPrimitive::OpcUaWrite { node_id, value } = command {
            if let Err(status) = self.apply_write(node_id, value) {
                return Ok(CommandResponse::nack(status));
            }
        }
        Ok(CommandResponse::ack("Good"))
    }
}
