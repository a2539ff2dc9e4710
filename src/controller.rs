//! Consumer facade over a connection, plus the registry that shares
//! connections between controllers keyed by an application-chosen id.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::anatomy::Frame;
use crate::connection::Connection;
use crate::device::Device;
use crate::error::Result;
use crate::events::{SdkEvent, SubscriptionId};
use crate::image::{DistortionData, Image, ImageKind};
use crate::service::{ConfigParam, TrackingBackend};

/// The main entry point: owns (a share of) a connection and exposes the
/// polling and request surface consumers work with.
pub struct Controller {
    connection: Arc<Connection>,
}

impl Controller {
    /// Creates a controller over its own freshly started connection.
    pub fn new(backend: Box<dyn TrackingBackend>) -> Result<Self> {
        let connection = Arc::new(Connection::new(backend));
        connection.start()?;
        Ok(Self { connection })
    }

    /// Wraps an existing (typically registry-shared) connection.
    pub fn from_connection(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// The snapshot `history` frames back; 0 is the most recent.
    pub fn frame(&self, history: usize) -> Arc<Frame> {
        self.connection.frame(history)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.connection.devices()
    }

    pub fn request_images(&self, frame_id: i64, kind: ImageKind) -> Result<Image> {
        self.connection.request_images(frame_id, kind)
    }

    pub fn distortion(&self) -> Option<Arc<DistortionData>> {
        self.connection.distortion()
    }

    pub fn set_policy(&self, mask: u64) {
        self.connection.set_policy(mask)
    }

    pub fn clear_policy(&self, mask: u64) {
        self.connection.clear_policy(mask)
    }

    pub fn is_policy_set(&self, mask: u64) -> bool {
        self.connection.is_policy_set(mask)
    }

    pub fn now_us(&self) -> i64 {
        self.connection.now_us()
    }

    /// Typed access to the service's key/value configuration store.
    pub fn config(&self) -> Config<'_> {
        Config {
            connection: &self.connection,
        }
    }

    pub fn subscribe(&self, callback: impl FnMut(&SdkEvent) + Send + 'static) -> SubscriptionId {
        self.connection.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.connection.unsubscribe(id)
    }

    pub fn event_channel(&self) -> Receiver<SdkEvent> {
        self.connection.event_channel()
    }
}

/// Borrowed view for config reads and writes.
pub struct Config<'a> {
    connection: &'a Connection,
}

impl Config<'_> {
    /// Asynchronously reads `key`; the continuation gets `None` on a type
    /// mismatch.
    pub fn get<T: ConfigParam>(
        &self,
        key: &str,
        on_value: impl FnOnce(Option<T>) + Send + 'static,
    ) -> Result<()> {
        self.connection.config_get(key, on_value)
    }

    /// Asynchronously writes `key`; the continuation reports acceptance.
    pub fn set<T: ConfigParam>(
        &self,
        key: &str,
        value: T,
        on_done: impl FnOnce(bool) + Send + 'static,
    ) -> Result<()> {
        self.connection.config_set(key, value, on_done)
    }
}

/// Shares started connections between controllers. Each key maps to at most
/// one live connection; `connect` hands back the existing one when present.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection registered under `key`, creating and starting
    /// one from `make_backend` when absent.
    pub fn connect(
        &self,
        key: u32,
        make_backend: impl FnOnce() -> Box<dyn TrackingBackend>,
    ) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().unwrap();
        if let Some(existing) = connections.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let connection = Arc::new(Connection::new(make_backend()));
        connection.start()?;
        connections.insert(key, Arc::clone(&connection));
        info!(key, "connection registered");
        Ok(connection)
    }

    pub fn get(&self, key: u32) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(&key).cloned()
    }

    /// Stops and drops the connection under `key`. Controllers still holding
    /// a share keep a stopped connection.
    pub fn destroy(&self, key: u32) -> bool {
        let removed = self.connections.lock().unwrap().remove(&key);
        match removed {
            Some(connection) => {
                connection.stop();
                info!(key, "connection destroyed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use crate::sim::SimulatedBackend;

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(Instant::now() < deadline, "condition never became true");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn controller_over_simulation_produces_frames() {
        let controller = Controller::new(Box::new(SimulatedBackend::new())).unwrap();
        wait_until(|| controller.frame(0).is_valid());

        assert!(controller.is_connected());
        let frame = controller.frame(0);
        assert_eq!(frame.hands.len(), 2);
        assert_eq!(controller.devices().len(), 1);
        assert_eq!(controller.devices()[0].serial, "SIM-0001");
        controller.connection().stop();
    }

    #[test]
    fn config_round_trips_through_the_facade() {
        let controller = Controller::new(Box::new(SimulatedBackend::new())).unwrap();
        wait_until(|| controller.is_connected());

        let written = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&written);
        controller
            .config()
            .set("tracking_mode", 2i32, move |ok| {
                sink.store(ok, Ordering::SeqCst);
            })
            .unwrap();
        wait_until(|| written.load(Ordering::SeqCst));

        let read_back = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&read_back);
        controller
            .config()
            .get::<i32>("tracking_mode", move |value| {
                *sink.lock().unwrap() = Some(value);
            })
            .unwrap();
        wait_until(|| read_back.lock().unwrap().is_some());
        assert_eq!(*read_back.lock().unwrap(), Some(Some(2)));
        controller.connection().stop();
    }

    #[test]
    fn registry_shares_one_connection_per_key() {
        let registry = ConnectionRegistry::new();
        let a = registry
            .connect(7, || Box::new(SimulatedBackend::new()))
            .unwrap();
        let b = registry
            .connect(7, || Box::new(SimulatedBackend::new()))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        assert!(registry.destroy(7));
        assert!(!a.is_running());
        assert!(!registry.destroy(7));
        assert!(registry.get(7).is_none());
    }
}
