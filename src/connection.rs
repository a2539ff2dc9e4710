//! The live connection: owns the backend, the dedicated poll thread, and the
//! shared state every consumer-facing accessor reads from.
//!
//! One thread pumps the backend's blocking poll and translates service events
//! into published [`SdkEvent`]s; consumer threads call the request methods
//! concurrently. A panic anywhere in the pump stops it for good rather than
//! limping on with half-applied state.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::anatomy::{Frame, INVALID_FRAME};
use crate::config::ConfigRequests;
use crate::device::{Device, DeviceList};
use crate::error::{Error, Result};
use crate::events::{
    EventHub, ImageFailureReason, ImageRequestFailure, SdkEvent, SubscriptionId,
};
use crate::factory::build_frame;
use crate::image::{DistortionData, Image, ImageKind, ImagePool};
use crate::pending::PendingRequests;
use crate::pool::ObjectPool;
use crate::ring::CircularBuffer;
use crate::service::{
    ConfigParam, LogSeverity, RawImageComplete, RawImageError, ServiceError, ServiceEvent,
    ServiceResult, TrackingBackend,
};

/// How long one blocking poll waits before surfacing a quiet timeout.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Tracking snapshots retained for history lookups.
const FRAME_HISTORY: usize = 60;

/// Image buffers kept warm in the pool.
const IMAGE_POOL_CAPACITY: usize = 4;

/// Initial reservation for image response buffers (one 640x480 sensor pair).
/// Grows when the service reports a larger requirement.
const DEFAULT_IMAGE_BUFFER_LEN: usize = 307_200;

struct Shared {
    backend: Box<dyn TrackingBackend>,
    running: AtomicBool,
    connected: AtomicBool,
    frames: CircularBuffer<Arc<Frame>>,
    image_pool: ImagePool,
    pending: PendingRequests<Image>,
    hub: EventHub,
    devices: Mutex<DeviceList>,
    distortion: Mutex<Option<Arc<DistortionData>>>,
    requested_policies: AtomicU64,
    active_policies: AtomicU64,
    configs: ConfigRequests,
    default_image_len: AtomicUsize,
}

pub struct Connection {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(backend: Box<dyn TrackingBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                frames: CircularBuffer::new(FRAME_HISTORY, INVALID_FRAME.clone()),
                image_pool: Arc::new(Mutex::new(ObjectPool::new(IMAGE_POOL_CAPACITY, true))),
                pending: PendingRequests::new(),
                hub: EventHub::new(),
                devices: Mutex::new(DeviceList::new()),
                distortion: Mutex::new(None),
                requested_policies: AtomicU64::new(0),
                active_policies: AtomicU64::new(0),
                configs: ConfigRequests::new(),
                default_image_len: AtomicUsize::new(DEFAULT_IMAGE_BUFFER_LEN),
            }),
            pump: Mutex::new(None),
        }
    }

    /// Opens the backend and starts the poll thread. Idempotent; a second
    /// start while running is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.shared.backend.open() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(Error::Service(err));
        }
        self.shared.hub.publish(SdkEvent::Init);

        let shared = Arc::clone(&self.shared);
        let handle = match thread::Builder::new()
            .name("handlink-pump".into())
            .spawn(move || run_loop(&shared))
        {
            Ok(handle) => handle,
            Err(err) => {
                // No pump thread exists; the connection must stay startable.
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(Error::Service(ServiceError::Transport(err.to_string())));
            }
        };
        *self.pump.lock().unwrap() = Some(handle);
        info!("connection started");
        Ok(())
    }

    /// Stops the poll thread and closes the backend. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.backend.close();
        if let Some(handle) = self.pump.lock().unwrap().take() {
            let _ = handle.join();
        }
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            self.shared.hub.publish(SdkEvent::Disconnected);
        }
        info!("connection stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The snapshot `history` frames back from the most recent one; the
    /// invalid frame beyond retention.
    pub fn frame(&self, history: usize) -> Arc<Frame> {
        self.shared.frames.get(history)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.shared.devices.lock().unwrap().devices().to_vec()
    }

    pub fn active_device(&self) -> Device {
        self.shared.devices.lock().unwrap().active_device()
    }

    pub fn distortion(&self) -> Option<Arc<DistortionData>> {
        self.shared.distortion.lock().unwrap().clone()
    }

    /// Current service clock in microseconds.
    pub fn now_us(&self) -> i64 {
        self.shared.backend.now_us()
    }

    /// Requests the sensor images for `frame_id`, reserving a pooled buffer
    /// sized by the current default. The returned handle fills in
    /// asynchronously; completion surfaces as [`SdkEvent::ImageReady`].
    pub fn request_images(&self, frame_id: i64, kind: ImageKind) -> Result<Image> {
        let buffer_len = self.shared.default_image_len.load(Ordering::SeqCst);
        self.request_images_sized(frame_id, kind, buffer_len, None)
    }

    /// Like [`request_images`](Self::request_images) but adopts the caller's
    /// buffer as the response storage, preserving its length as the reserved
    /// size.
    pub fn request_images_into(
        &self,
        frame_id: i64,
        kind: ImageKind,
        buffer: Vec<u8>,
    ) -> Result<Image> {
        let buffer_len = buffer.len();
        self.request_images_sized(frame_id, kind, buffer_len, Some(buffer))
    }

    fn request_images_sized(
        &self,
        frame_id: i64,
        kind: ImageKind,
        buffer_len: usize,
        buffer: Option<Vec<u8>>,
    ) -> Result<Image> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let shared = &self.shared;
        let checkout = shared.image_pool.lock().unwrap().check_out();
        let image = Image::new(&shared.image_pool, checkout);
        {
            let mut data = image.data().lock().unwrap();
            data.frame_id = frame_id;
            data.kind = kind;
            match buffer {
                Some(buffer) => data.pixels = buffer,
                None => data.pixels.resize(buffer_len, 0),
            }
        }
        let token = match shared.backend.request_image(frame_id, kind, buffer_len) {
            Ok(token) => token,
            Err(err) => {
                image.surrender();
                return Err(Error::Service(err));
            }
        };
        shared.pending.add(token, image.clone(), shared.backend.now_us());
        trace!(frame_id, token, buffer_len, "image requested");
        Ok(image)
    }

    /// Requests the given policy flags. The change is asynchronous; the
    /// service answers with a [`SdkEvent::PolicyChange`] carrying the mask it
    /// actually granted.
    pub fn set_policy(&self, mask: u64) {
        self.shared.requested_policies.fetch_or(mask, Ordering::SeqCst);
        self.shared.backend.set_policy(mask, 0);
    }

    pub fn clear_policy(&self, mask: u64) {
        self.shared.requested_policies.fetch_and(!mask, Ordering::SeqCst);
        self.shared.backend.set_policy(0, mask);
    }

    /// True when every bit of `mask` is active on the service side.
    pub fn is_policy_set(&self, mask: u64) -> bool {
        self.shared.active_policies.load(Ordering::SeqCst) & mask == mask
    }

    /// Asynchronously reads a config value. The continuation receives `None`
    /// when the stored value has a different type than `T`. A newer request
    /// for the same key supersedes this one.
    pub fn config_get<T: ConfigParam>(
        &self,
        key: &str,
        on_value: impl FnOnce(Option<T>) + Send + 'static,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let request_id = self
            .shared
            .backend
            .request_config(key)
            .map_err(Error::Service)?;
        self.shared
            .configs
            .stash_get(request_id, key, move |value| on_value(T::from_value(value)));
        Ok(())
    }

    /// Asynchronously writes a config value; the continuation reports whether
    /// the service accepted it.
    pub fn config_set<T: ConfigParam>(
        &self,
        key: &str,
        value: T,
        on_done: impl FnOnce(bool) + Send + 'static,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let request_id = self
            .shared
            .backend
            .write_config(key, value.into_value())
            .map_err(Error::Service)?;
        self.shared.configs.stash_set(request_id, key, on_done);
        Ok(())
    }

    pub fn subscribe(
        &self,
        callback: impl FnMut(&SdkEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.shared.hub.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.hub.unsubscribe(id)
    }

    pub fn event_channel(&self) -> Receiver<SdkEvent> {
        self.shared.hub.channel()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True for the first of a run of identical poll errors. Repeats are
/// suppressed until a different error (or a successful poll, which clears
/// `last`) starts a new run.
fn should_log_poll_error(err: &ServiceError, last: &mut Option<ServiceError>) -> bool {
    if last.as_ref() == Some(err) {
        return false;
    }
    *last = Some(err.clone());
    true
}

fn run_loop(shared: &Shared) {
    let mut last_quiet: Option<ServiceError> = None;
    while shared.running.load(Ordering::SeqCst) {
        let polled =
            panic::catch_unwind(AssertUnwindSafe(|| shared.backend.poll(POLL_TIMEOUT)));
        let result = match polled {
            Ok(result) => result,
            Err(_) => {
                error!("backend poll panicked; stopping the event pump");
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
        };
        match result {
            Ok(event) => {
                last_quiet = None;
                let handled =
                    panic::catch_unwind(AssertUnwindSafe(|| shared.handle_event(event)));
                if handled.is_err() {
                    error!("event handling panicked; stopping the event pump");
                    shared.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
            Err(err) => {
                if should_log_poll_error(&err, &mut last_quiet) {
                    if err == ServiceError::Code(ServiceResult::Timeout) {
                        trace!("poll timed out with no event");
                    } else {
                        error!(%err, "poll failed");
                    }
                }
            }
        }
        let now = shared.backend.now_us();
        let purged = shared.pending.purge_old(now, |token, image| {
            shared.backend.cancel_image(token);
            image.surrender();
        });
        if purged > 0 {
            debug!(purged, "cancelled timed-out image requests");
        }
    }
}

impl Shared {
    fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::Connection => {
                self.connected.store(true, Ordering::SeqCst);
                self.hub.publish(SdkEvent::Connected);
            }
            ServiceEvent::ConnectionLost => {
                self.connected.store(false, Ordering::SeqCst);
                self.hub.publish(SdkEvent::Disconnected);
            }
            ServiceEvent::Device { handle, attributes } => {
                let serial = self.fetch_serial(handle);
                let device = Device::new(handle, serial, attributes);
                self.devices.lock().unwrap().add_or_update(device.clone());
                info!(serial = %device.serial, handle, "device attached");
                self.hub.publish(SdkEvent::DeviceAttached(device));
            }
            ServiceEvent::DeviceLost { handle } => {
                let removed = self.devices.lock().unwrap().remove_by_handle(handle);
                match removed {
                    Some(device) => {
                        info!(serial = %device.serial, handle, "device lost");
                        self.hub.publish(SdkEvent::DeviceLost(device));
                    }
                    None => debug!(handle, "lost event for an unknown device"),
                }
            }
            ServiceEvent::DeviceFailure { handle, code } => {
                warn!(handle, ?code, "device failure");
                self.hub.publish(SdkEvent::DeviceFailure { handle, code });
            }
            ServiceEvent::Tracking(raw) => {
                let frame = Arc::new(build_frame(&raw));
                self.frames.put(Arc::clone(&frame));
                self.hub.publish(SdkEvent::FrameReady(frame));
            }
            ServiceEvent::ImageComplete(record) => self.handle_image_complete(record),
            ServiceEvent::ImageRequestError(record) => self.handle_image_error(record),
            ServiceEvent::Log { severity, message } => {
                match severity {
                    LogSeverity::Critical => error!(target: "handlink::service", "{message}"),
                    LogSeverity::Warning => warn!(target: "handlink::service", "{message}"),
                    LogSeverity::Information => info!(target: "handlink::service", "{message}"),
                    LogSeverity::Unknown => debug!(target: "handlink::service", "{message}"),
                }
                self.hub.publish(SdkEvent::LogMessage { severity, message });
            }
            ServiceEvent::PolicyChange { active } => {
                self.active_policies.store(active, Ordering::SeqCst);
                let requested = self.requested_policies.load(Ordering::SeqCst);
                if active != requested {
                    debug!(active, requested, "service granted a different policy set");
                }
                self.hub.publish(SdkEvent::PolicyChange { active, requested });
            }
            ServiceEvent::ConfigChange { request_id, success } => {
                self.configs.complete_change(request_id, success);
                self.hub.publish(SdkEvent::ConfigChange { request_id, success });
            }
            ServiceEvent::ConfigResponse { request_id, value } => {
                self.configs.complete_response(request_id, value);
            }
            ServiceEvent::TrackedQuad => {
                trace!("discarding legacy tracked-quad event");
            }
        }
    }

    /// Two-call sizing: probe with a stack buffer, retry once with the size
    /// the service asked for. A second failure leaves the serial empty.
    fn fetch_serial(&self, handle: u32) -> String {
        let mut buf = vec![0u8; 64];
        let written = match self.backend.device_serial(handle, &mut buf) {
            Ok(written) => written,
            Err(ServiceError::InsufficientBuffer { required, .. }) => {
                buf.resize(required, 0);
                match self.backend.device_serial(handle, &mut buf) {
                    Ok(written) => written,
                    Err(err) => {
                        warn!(handle, %err, "device serial fetch failed");
                        return String::new();
                    }
                }
            }
            Err(err) => {
                warn!(handle, %err, "device serial fetch failed");
                return String::new();
            }
        };
        buf.truncate(written);
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn handle_image_complete(&self, record: RawImageComplete) {
        let Some(image) = self.pending.find_and_remove(record.token) else {
            // Completion for a purged or cancelled request.
            trace!(token = record.token, "image completion with no pending request");
            return;
        };

        // A changed calibration version replaces the cached grid; images taken
        // under the same version share one allocation.
        let (grid, replaced) = {
            let mut current = self.distortion.lock().unwrap();
            match current.as_ref() {
                Some(d) if d.version == record.matrix_version => (Arc::clone(d), false),
                _ => {
                    let grid = Arc::new(DistortionData {
                        version: record.matrix_version,
                        grid: record.distortion_grid.as_ref().clone(),
                    });
                    *current = Some(Arc::clone(&grid));
                    (grid, true)
                }
            }
        };

        {
            let mut data = image.data().lock().unwrap();
            data.kind = record.kind;
            data.format = record.format;
            data.bytes_per_pixel = record.bytes_per_pixel;
            data.width = record.width;
            data.height = record.height;
            data.timestamp_us = record.timestamp_us;
            data.frame_id = record.frame_id;
            data.ray_offset_x = record.ray_offset[0];
            data.ray_offset_y = record.ray_offset[1];
            data.ray_scale_x = record.ray_scale[0];
            data.ray_scale_y = record.ray_scale[1];
            data.pixels = record.pixels;
            data.distortion = Some(Arc::clone(&grid));
            data.complete = true;
        }

        if replaced {
            info!(version = grid.version, "distortion calibration changed");
            self.hub.publish(SdkEvent::DistortionChange(grid));
        }
        self.hub.publish(SdkEvent::ImageReady(image));
    }

    fn handle_image_error(&self, record: RawImageError) {
        let Some(image) = self.pending.find_and_remove(record.token) else {
            trace!(token = record.token, "image error with no pending request");
            return;
        };
        let frame_id = image.with_data(|d| d.frame_id).unwrap_or(-1);
        image.surrender();

        let (reason, required) = match record.code {
            ServiceResult::InsufficientBuffer => {
                // Grow the default so the next request succeeds.
                self.default_image_len
                    .fetch_max(record.required_buffer_len, Ordering::SeqCst);
                (
                    ImageFailureReason::InsufficientBuffer,
                    Some(record.required_buffer_len),
                )
            }
            ServiceResult::UnknownImageFrameRequest | ServiceResult::UnknownTrackingFrameId => {
                (ImageFailureReason::Unavailable, None)
            }
            ServiceResult::NotStreaming | ServiceResult::NotAvailable => {
                (ImageFailureReason::ImagesDisabled, None)
            }
            _ => (ImageFailureReason::Unknown, None),
        };
        debug!(frame_id, code = ?record.code, "image request failed");
        self.hub
            .publish(SdkEvent::ImageRequestFailed(ImageRequestFailure {
                frame_id,
                reason,
                message: format!("image request failed: {:?}", record.code),
                required_buffer_len: required,
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicI64, AtomicU32};
    use std::time::Instant;

    use crate::service::{policy, ConfigValue, RawTrackingFrame, RequestToken};

    #[derive(Default)]
    struct ScriptedState {
        queue: Mutex<VecDeque<ServiceEvent>>,
        cancelled: Mutex<Vec<RequestToken>>,
        requested_lens: Mutex<Vec<usize>>,
        next_token: AtomicU32,
        next_request_id: AtomicU32,
        clock_us: AtomicI64,
        /// Calibration version stamped onto each successive completion.
        matrix_versions: Mutex<VecDeque<u64>>,
        /// Scripted failures consumed ahead of completions.
        image_errors: Mutex<VecDeque<(ServiceResult, usize)>>,
        /// When false, image requests are accepted but never answered.
        answer_images: bool,
        /// Scripted `open` failures, consumed one per call.
        fail_opens: Mutex<VecDeque<ServiceError>>,
        policies: AtomicU64,
    }

    struct ScriptedBackend(Arc<ScriptedState>);

    impl ScriptedState {
        fn push(&self, event: ServiceEvent) {
            self.queue.lock().unwrap().push_back(event);
        }
    }

    impl TrackingBackend for ScriptedBackend {
        fn open(&self) -> std::result::Result<(), ServiceError> {
            if let Some(err) = self.0.fail_opens.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(())
        }

        fn close(&self) {}

        fn poll(
            &self,
            _timeout: Duration,
        ) -> std::result::Result<ServiceEvent, ServiceError> {
            if let Some(event) = self.0.queue.lock().unwrap().pop_front() {
                return Ok(event);
            }
            thread::sleep(Duration::from_millis(2));
            Err(ServiceError::Code(ServiceResult::Timeout))
        }

        fn request_image(
            &self,
            frame_id: i64,
            kind: ImageKind,
            buffer_len: usize,
        ) -> std::result::Result<RequestToken, ServiceError> {
            self.0.requested_lens.lock().unwrap().push(buffer_len);
            let token = self.0.next_token.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((code, required)) = self.0.image_errors.lock().unwrap().pop_front() {
                self.0.push(ServiceEvent::ImageRequestError(RawImageError {
                    token,
                    timestamp_us: self.now_us(),
                    code,
                    required_buffer_len: required,
                }));
            } else if self.0.answer_images {
                let version = self
                    .0
                    .matrix_versions
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(1);
                self.0.push(ServiceEvent::ImageComplete(RawImageComplete {
                    token,
                    frame_id,
                    timestamp_us: self.now_us(),
                    kind,
                    format: crate::image::ImageFormat::Infrared,
                    bytes_per_pixel: 1,
                    width: 4,
                    height: 2,
                    ray_offset: [0.5, 0.5],
                    ray_scale: [0.125, 0.125],
                    matrix_version: version,
                    distortion_grid: Arc::new(vec![0.0; 8]),
                    pixels: vec![0xAB; 8],
                }));
            }
            Ok(token)
        }

        fn cancel_image(&self, token: RequestToken) {
            self.0.cancelled.lock().unwrap().push(token);
        }

        fn set_policy(&self, set_mask: u64, clear_mask: u64) {
            let active = (self.0.policies.load(Ordering::SeqCst) | set_mask) & !clear_mask;
            self.0.policies.store(active, Ordering::SeqCst);
            self.0.push(ServiceEvent::PolicyChange { active });
        }

        fn request_config(&self, _key: &str) -> std::result::Result<u32, ServiceError> {
            let id = self.0.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.push(ServiceEvent::ConfigResponse {
                request_id: id,
                value: ConfigValue::Int32(42),
            });
            Ok(id)
        }

        fn write_config(
            &self,
            _key: &str,
            _value: ConfigValue,
        ) -> std::result::Result<u32, ServiceError> {
            let id = self.0.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.push(ServiceEvent::ConfigChange {
                request_id: id,
                success: true,
            });
            Ok(id)
        }

        fn device_serial(
            &self,
            _handle: u32,
            buf: &mut [u8],
        ) -> std::result::Result<usize, ServiceError> {
            let serial = b"TEST-0001";
            if buf.len() < serial.len() {
                return Err(ServiceError::InsufficientBuffer {
                    required: serial.len(),
                    provided: buf.len(),
                });
            }
            buf[..serial.len()].copy_from_slice(serial);
            Ok(serial.len())
        }

        fn now_us(&self) -> i64 {
            self.0.clock_us.load(Ordering::SeqCst)
        }
    }

    fn scripted(events: Vec<ServiceEvent>) -> (Connection, Arc<ScriptedState>) {
        let state = Arc::new(ScriptedState {
            queue: Mutex::new(events.into()),
            answer_images: true,
            ..Default::default()
        });
        let connection = Connection::new(Box::new(ScriptedBackend(Arc::clone(&state))));
        (connection, state)
    }

    fn tracking(frame_id: i64) -> ServiceEvent {
        ServiceEvent::Tracking(Arc::new(RawTrackingFrame {
            frame_id,
            timestamp_us: frame_id * 10_000,
            framerate: 100.0,
            ..Default::default()
        }))
    }

    fn wait_for(
        rx: &Receiver<SdkEvent>,
        mut pred: impl FnMut(&SdkEvent) -> bool,
    ) -> SdkEvent {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(err) => panic!("timed out waiting for event: {err}"),
            }
        }
    }

    #[test]
    fn start_publishes_lifecycle_and_is_idempotent() {
        let (connection, _state) = scripted(vec![ServiceEvent::Connection]);
        let rx = connection.event_channel();

        connection.start().unwrap();
        connection.start().unwrap();

        wait_for(&rx, |e| matches!(e, SdkEvent::Init));
        wait_for(&rx, |e| matches!(e, SdkEvent::Connected));
        assert!(connection.is_connected());

        connection.stop();
        connection.stop();
        assert!(!connection.is_running());
        wait_for(&rx, |e| matches!(e, SdkEvent::Disconnected));
    }

    #[test]
    fn tracking_events_land_in_history() {
        let (connection, _state) =
            scripted(vec![ServiceEvent::Connection, tracking(7), tracking(8)]);
        let rx = connection.event_channel();
        connection.start().unwrap();

        let mut seen = 0;
        while seen < 2 {
            if matches!(
                wait_for(&rx, |e| matches!(e, SdkEvent::FrameReady(_))),
                SdkEvent::FrameReady(_)
            ) {
                seen += 1;
            }
        }
        assert_eq!(connection.frame(0).id, 8);
        assert_eq!(connection.frame(1).id, 7);
        assert!(!connection.frame(5).is_valid(), "beyond history is invalid");
        connection.stop();
    }

    #[test]
    fn device_attach_fetches_serial() {
        let (connection, _state) = scripted(vec![ServiceEvent::Device {
            handle: 3,
            attributes: Default::default(),
        }]);
        let rx = connection.event_channel();
        connection.start().unwrap();

        let event = wait_for(&rx, |e| matches!(e, SdkEvent::DeviceAttached(_)));
        let SdkEvent::DeviceAttached(device) = event else {
            unreachable!()
        };
        assert_eq!(device.serial, "TEST-0001");
        assert_eq!(connection.devices().len(), 1);
        connection.stop();
    }

    #[test]
    fn repeated_calibration_version_publishes_once() {
        let (connection, state) = scripted(vec![ServiceEvent::Connection]);
        *state.matrix_versions.lock().unwrap() = VecDeque::from(vec![1, 1, 2]);
        let rx = connection.event_channel();
        connection.start().unwrap();
        wait_for(&rx, |e| matches!(e, SdkEvent::Connected));

        for _ in 0..3 {
            connection.request_images(10, ImageKind::Default).unwrap();
        }

        let mut ready = 0;
        let mut distortion_changes = 0;
        while ready < 3 {
            match wait_for(&rx, |e| {
                matches!(e, SdkEvent::ImageReady(_) | SdkEvent::DistortionChange(_))
            }) {
                SdkEvent::ImageReady(image) => {
                    assert!(image.is_complete());
                    ready += 1;
                }
                SdkEvent::DistortionChange(_) => distortion_changes += 1,
                _ => unreachable!(),
            }
        }
        assert_eq!(distortion_changes, 2, "one per distinct calibration version");
        assert_eq!(connection.distortion().unwrap().version, 2);
        connection.stop();
    }

    #[test]
    fn insufficient_buffer_grows_the_next_reservation() {
        let (connection, state) = scripted(vec![ServiceEvent::Connection]);
        state
            .image_errors
            .lock()
            .unwrap()
            .push_back((ServiceResult::InsufficientBuffer, 1_000_000));
        let rx = connection.event_channel();
        connection.start().unwrap();
        wait_for(&rx, |e| matches!(e, SdkEvent::Connected));

        let image = connection.request_images(5, ImageKind::Default).unwrap();
        let event = wait_for(&rx, |e| matches!(e, SdkEvent::ImageRequestFailed(_)));
        let SdkEvent::ImageRequestFailed(failure) = event else {
            unreachable!()
        };
        assert_eq!(failure.reason, ImageFailureReason::InsufficientBuffer);
        assert_eq!(failure.required_buffer_len, Some(1_000_000));
        assert_eq!(failure.frame_id, 5);
        assert!(!image.is_valid(), "failed request releases the buffer");

        connection.request_images(6, ImageKind::Default).unwrap();
        wait_for(&rx, |e| matches!(e, SdkEvent::ImageReady(_)));
        let lens = state.requested_lens.lock().unwrap().clone();
        assert_eq!(lens[0], DEFAULT_IMAGE_BUFFER_LEN);
        assert_eq!(lens[1], 1_000_000);
        connection.stop();
    }

    #[test]
    fn abandoned_request_is_cancelled_and_released() {
        let state = Arc::new(ScriptedState {
            queue: Mutex::new(VecDeque::from(vec![ServiceEvent::Connection])),
            answer_images: false,
            ..Default::default()
        });
        let connection = Connection::new(Box::new(ScriptedBackend(Arc::clone(&state))));
        let rx = connection.event_channel();
        connection.start().unwrap();
        wait_for(&rx, |e| matches!(e, SdkEvent::Connected));

        let image = connection.request_images(9, ImageKind::Default).unwrap();
        state
            .clock_us
            .store(crate::pending::REQUEST_TIMEOUT_US + 1, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(2);
        while state.cancelled.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "purge never ran");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!image.is_valid(), "purged request releases the buffer");
        connection.stop();
    }

    #[test]
    fn policy_change_reports_active_and_requested() {
        let (connection, _state) = scripted(vec![ServiceEvent::Connection]);
        let rx = connection.event_channel();
        connection.start().unwrap();
        wait_for(&rx, |e| matches!(e, SdkEvent::Connected));

        connection.set_policy(policy::IMAGES);
        let event = wait_for(&rx, |e| matches!(e, SdkEvent::PolicyChange { .. }));
        let SdkEvent::PolicyChange { active, requested } = event else {
            unreachable!()
        };
        assert_eq!(active, policy::IMAGES);
        assert_eq!(requested, policy::IMAGES);
        assert!(connection.is_policy_set(policy::IMAGES));

        connection.clear_policy(policy::IMAGES);
        wait_for(
            &rx,
            |e| matches!(e, SdkEvent::PolicyChange { active: 0, .. }),
        );
        assert!(!connection.is_policy_set(policy::IMAGES));
        connection.stop();
    }

    #[test]
    fn config_round_trip_runs_continuations() {
        let (connection, _state) = scripted(vec![ServiceEvent::Connection]);
        let rx = connection.event_channel();
        connection.start().unwrap();
        wait_for(&rx, |e| matches!(e, SdkEvent::Connected));

        let got = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        connection
            .config_get::<i32>("tracking_mode", move |value| {
                *sink.lock().unwrap() = Some(value);
            })
            .unwrap();

        let confirmed = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&confirmed);
        connection
            .config_set("robust_mode", true, move |ok| {
                sink.store(ok, Ordering::SeqCst);
            })
            .unwrap();

        wait_for(&rx, |e| matches!(e, SdkEvent::ConfigChange { .. }));
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.lock().unwrap().is_none() {
            assert!(Instant::now() < deadline, "config response never arrived");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*got.lock().unwrap(), Some(Some(42)));
        assert!(confirmed.load(Ordering::SeqCst));
        connection.stop();
    }

    #[test]
    fn failed_start_leaves_connection_startable() {
        let (connection, state) = scripted(vec![ServiceEvent::Connection]);
        state
            .fail_opens
            .lock()
            .unwrap()
            .push_back(ServiceError::Transport("service socket missing".into()));
        let rx = connection.event_channel();

        assert!(connection.start().is_err());
        assert!(!connection.is_running(), "failed start must reset the flag");

        connection.start().unwrap();
        assert!(connection.is_running());
        wait_for(&rx, |e| matches!(e, SdkEvent::Connected));
        connection.stop();
    }

    #[test]
    fn poll_error_logging_suppresses_repeats_of_the_same_error() {
        let mut last = None;
        let dropped = ServiceError::Code(ServiceResult::NotConnected);
        let refused = ServiceError::Transport("connection refused".into());

        assert!(should_log_poll_error(&dropped, &mut last));
        assert!(!should_log_poll_error(&dropped, &mut last));
        assert!(should_log_poll_error(&refused, &mut last));
        assert!(!should_log_poll_error(&refused, &mut last));

        // A successful poll clears the run; the same error logs again.
        last = None;
        assert!(should_log_poll_error(&refused, &mut last));
    }

    #[test]
    fn requests_while_stopped_are_rejected() {
        let (connection, _state) = scripted(vec![]);
        assert!(matches!(
            connection.request_images(1, ImageKind::Default),
            Err(Error::NotRunning)
        ));
        assert!(matches!(
            connection.config_get::<bool>("k", |_| {}),
            Err(Error::NotRunning)
        ));
    }
}
