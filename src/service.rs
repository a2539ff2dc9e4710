//! The opaque boundary to the native tracking service.
//!
//! The service is an external producer of tracking events and image bytes;
//! this module defines the fixed-layout records it emits, the tagged event
//! envelope returned by the blocking poll call, and the `TrackingBackend`
//! trait the connection drives. Implementations must be internally
//! thread-safe: the poll loop and consumer threads call into the backend
//! concurrently.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::image::{ImageFormat, ImageKind};

/// Opaque id issued on an asynchronous request, used to match a later
/// completion or error event to the original request.
pub type RequestToken = u32;

/// Closed result enum of the native service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceResult {
    Success,
    UnknownError,
    InvalidArgument,
    InsufficientResources,
    InsufficientBuffer,
    Timeout,
    NotConnected,
    HandshakeIncomplete,
    BufferSizeOverflow,
    ProtocolError,
    InvalidClientId,
    UnexpectedClosed,
    UnknownImageFrameRequest,
    UnknownTrackingFrameId,
    RoutineIsNotSeer,
    TimestampTooEarly,
    ConcurrentPoll,
    NotAvailable,
    NotStreaming,
    CannotOpenDevice,
}

impl ServiceResult {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service call failed: {0:?}")]
    Code(ServiceResult),

    #[error("buffer too small: need {required} bytes, have {provided}")]
    InsufficientBuffer { required: usize, provided: usize },

    #[error("backend transport failure: {0}")]
    Transport(String),
}

/// Log severities forwarded from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Unknown,
    Critical,
    Warning,
    Information,
}

/// Tagged config value variant carried by config requests and responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConfigValue {
    Bool(bool),
    Int32(i32),
    Float(f32),
    Str(String),
}

/// Typed view over [`ConfigValue`] for the generic config accessors.
pub trait ConfigParam: Sized {
    fn into_value(self) -> ConfigValue;
    fn from_value(value: ConfigValue) -> Option<Self>;
}

impl ConfigParam for bool {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Bool(self)
    }

    fn from_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl ConfigParam for i32 {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Int32(self)
    }

    fn from_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int32(v) => Some(v),
            _ => None,
        }
    }
}

impl ConfigParam for f32 {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Float(self)
    }

    fn from_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl ConfigParam for String {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Str(self)
    }

    fn from_value(value: ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Policy flag bitmask values understood by the service.
pub mod policy {
    pub const BACKGROUND_FRAMES: u64 = 1 << 0;
    pub const IMAGES: u64 = 1 << 1;
    pub const OPTIMIZE_HMD: u64 = 1 << 2;
    pub const ALLOW_PAUSE_RESUME: u64 = 1 << 3;
}

/// Fixed-layout bone record: joints, width and a 3x3 basis (column-major).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBone {
    pub prev_joint: [f32; 3],
    pub next_joint: [f32; 3],
    pub width: f32,
    pub basis: [[f32; 3]; 3],
}

/// One digit: four bones base to tip, metacarpal first. The thumb's
/// metacarpal arrives with coincident joints.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDigit {
    pub bones: [RawBone; 4],
    pub tip_velocity: [f32; 3],
    pub stabilized_tip: [f32; 3],
    pub is_extended: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawPalm {
    pub position: [f32; 3],
    pub stabilized_position: [f32; 3],
    pub velocity: [f32; 3],
    pub normal: [f32; 3],
    pub direction: [f32; 3],
    pub width: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawHand {
    pub id: i32,
    pub is_left: bool,
    pub confidence: f32,
    pub visible_time_us: i64,
    pub pinch_strength: f32,
    pub pinch_distance: f32,
    pub grab_strength: f32,
    pub grab_angle: f32,
    pub palm: RawPalm,
    /// Thumb, index, middle, ring, pinky.
    pub digits: [RawDigit; 5],
    pub arm: RawBone,
}

#[derive(Debug, Clone, Default)]
pub struct RawTrackingFrame {
    pub frame_id: i64,
    pub timestamp_us: i64,
    pub framerate: f32,
    pub box_center: [f32; 3],
    pub box_size: [f32; 3],
    pub hands: Vec<RawHand>,
}

/// Device attributes delivered with an attach event. The serial string is
/// fetched separately through the two-call sizing protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDeviceAttributes {
    pub horizontal_fov: f32,
    pub vertical_fov: f32,
    pub range: f32,
    pub baseline: f32,
    pub is_embedded: bool,
    pub is_streaming: bool,
}

/// Completion record for an image request.
#[derive(Debug, Clone)]
pub struct RawImageComplete {
    pub token: RequestToken,
    pub frame_id: i64,
    pub timestamp_us: i64,
    pub kind: ImageKind,
    pub format: ImageFormat,
    pub bytes_per_pixel: u32,
    pub width: u32,
    pub height: u32,
    pub ray_offset: [f32; 2],
    pub ray_scale: [f32; 2],
    /// Calibration generation of the accompanying distortion grid.
    pub matrix_version: u64,
    pub distortion_grid: Arc<Vec<f32>>,
    pub pixels: Vec<u8>,
}

/// Error record for an image request, with the required-length hint the
/// service supplies on insufficient-buffer failures.
#[derive(Debug, Clone, Copy)]
pub struct RawImageError {
    pub token: RequestToken,
    pub timestamp_us: i64,
    pub code: ServiceResult,
    pub required_buffer_len: usize,
}

/// Tagged union event envelope returned by the blocking poll call.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Connection,
    ConnectionLost,
    Device {
        handle: u32,
        attributes: RawDeviceAttributes,
    },
    DeviceLost {
        handle: u32,
    },
    DeviceFailure {
        handle: u32,
        code: ServiceResult,
    },
    Tracking(Arc<RawTrackingFrame>),
    ImageComplete(RawImageComplete),
    ImageRequestError(RawImageError),
    Log {
        severity: LogSeverity,
        message: String,
    },
    PolicyChange {
        active: u64,
    },
    ConfigChange {
        request_id: u32,
        success: bool,
    },
    ConfigResponse {
        request_id: u32,
        value: ConfigValue,
    },
    /// Legacy envelope tag; decoded and discarded.
    TrackedQuad,
}

/// Poll-based connection to the tracking service.
///
/// All methods take `&self`; implementations carry their own interior
/// synchronization so a blocking poll does not starve request calls from
/// consumer threads.
pub trait TrackingBackend: Send + Sync {
    fn open(&self) -> Result<(), ServiceError>;

    fn close(&self);

    /// Blocks up to `timeout` for the next event. A quiet interval surfaces
    /// as `Err(ServiceError::Code(ServiceResult::Timeout))`.
    fn poll(&self, timeout: Duration) -> Result<ServiceEvent, ServiceError>;

    /// Issues an asynchronous image request and returns its correlation
    /// token. The response buffer of `buffer_len` bytes is reserved on the
    /// client side.
    fn request_image(
        &self,
        frame_id: i64,
        kind: ImageKind,
        buffer_len: usize,
    ) -> Result<RequestToken, ServiceError>;

    /// Cancels an outstanding image request. Best effort.
    fn cancel_image(&self, token: RequestToken);

    fn set_policy(&self, set_mask: u64, clear_mask: u64);

    /// Requests a config value; the response arrives as a
    /// [`ServiceEvent::ConfigResponse`] carrying the returned request id.
    fn request_config(&self, key: &str) -> Result<u32, ServiceError>;

    /// Writes a config value; confirmation arrives as a
    /// [`ServiceEvent::ConfigChange`].
    fn write_config(&self, key: &str, value: ConfigValue) -> Result<u32, ServiceError>;

    /// Copies the device serial into `buf`, returning the number of bytes
    /// written, or `ServiceError::InsufficientBuffer` with the required size.
    fn device_serial(&self, handle: u32, buf: &mut [u8]) -> Result<usize, ServiceError>;

    /// Current service clock in microseconds.
    fn now_us(&self) -> i64;
}
