//! ---
//! fgw_section: "05-networking-external-interfaces"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Construction of transports for the configured connections."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fgw_common::{SimulatedPointKind, SimulationConfig};
use fgw_model::{ConnectionConfig, DriverError, SampleValue};
use fgw_transport::{SampleSink, SimulatedTransport, Transport};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Builds the transport of each connection. Wire protocol stacks plug in here.
pub trait TransportFactory: Send + Sync {
    /// Create the transport for `connection`, pushing its samples into `sink`.
    fn create(
        &self,
        connection: &ConnectionConfig,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Arc<dyn Transport>, DriverError>;

    /// Background tasks owned by the created transports.
    fn spawn_workers(&self, _shutdown: &broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Simulated devices seeded from the `[simulation]` configuration section.
#[derive(Debug)]
pub struct SimulatedTransportFactory {
    config: SimulationConfig,
    devices: Mutex<Vec<Arc<SimulatedTransport>>>,
}

impl SimulatedTransportFactory {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn publish_interval(&self) -> Duration {
        self.config.publish_interval
    }

    /// Devices created so far.
    pub fn devices(&self) -> Vec<Arc<SimulatedTransport>> {
        self.devices.lock().clone()
    }

    pub fn device(&self, connection_number: u32) -> Option<Arc<SimulatedTransport>> {
        self.devices
            .lock()
            .iter()
            .find(|device| device.connection_number() == connection_number)
            .cloned()
    }
}

impl TransportFactory for SimulatedTransportFactory {
    fn create(
        &self,
        connection: &ConnectionConfig,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Arc<dyn Transport>, DriverError> {
        let number = connection.protocol_connection_number;
        let device = Arc::new(SimulatedTransport::new(number, connection.name.clone()));
        let mut seeded = 0;
        for point in self.config.points.iter().filter(|p| p.connection == number) {
            let value = match point.kind {
                SimulatedPointKind::Digital => SampleValue::Digital(point.initial != 0.0),
                SimulatedPointKind::Analog => SampleValue::Analog(point.initial),
                SimulatedPointKind::String => SampleValue::Text(point.initial.to_string()),
            };
            if device.add_variable(&point.path, value, point.writable).is_empty() {
                return Err(DriverError::Config(format!(
                    "simulated point '{}' on connection {} has an empty path",
                    point.path, number
                )));
            }
            seeded += 1;
        }
        device.attach_sink(sink);
        debug!(connection = number, points = seeded, "simulated device created");
        self.devices.lock().push(device.clone());
        Ok(device)
    }

    fn spawn_workers(&self, shutdown: &broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let devices = self.devices();
        info!(
            devices = devices.len(),
            interval_ms = self.config.publish_interval.as_millis() as u64,
            "simulated publishers starting"
        );
        devices
            .into_iter()
            .map(|device| device.spawn_publisher(self.config.publish_interval, shutdown.resubscribe()))
            .collect()
    }
}
