//! Simulated backend: a self-contained `TrackingBackend` that synthesizes
//! plausible two-hand tracking data. Used by the probe binary and anywhere a
//! connection is exercised without the native service.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::image::{ImageFormat, ImageKind, DISTORTION_GRID_FLOATS};
use crate::service::{
    ConfigValue, RawBone, RawDeviceAttributes, RawDigit, RawHand, RawImageComplete, RawPalm,
    RawTrackingFrame, RequestToken, ServiceError, ServiceEvent, ServiceResult, TrackingBackend,
};
use std::sync::Arc;

const SIM_DEVICE_HANDLE: u32 = 1;
const SIM_SERIAL: &[u8] = b"SIM-0001";
const SIM_FRAMERATE: f32 = 110.0;

/// Frame pacing of the synthesized stream.
const FRAME_INTERVAL: Duration = Duration::from_millis(5);

struct SimState {
    open: bool,
    frame_id: i64,
    next_token: u32,
    next_request_id: u32,
    queued: VecDeque<ServiceEvent>,
    policies: u64,
    configs: HashMap<String, ConfigValue>,
    sent_connect: bool,
    sent_device: bool,
}

pub struct SimulatedBackend {
    state: Mutex<SimState>,
    started_at: Instant,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                open: false,
                frame_id: 0,
                next_token: 0,
                next_request_id: 0,
                queued: VecDeque::new(),
                policies: 0,
                configs: HashMap::new(),
                sent_connect: false,
                sent_device: false,
            }),
            started_at: Instant::now(),
        }
    }

    fn elapsed_secs(&self) -> f32 {
        self.started_at.elapsed().as_secs_f32()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingBackend for SimulatedBackend {
    fn open(&self) -> Result<(), ServiceError> {
        self.state.lock().unwrap().open = true;
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap().open = false;
    }

    fn poll(&self, timeout: Duration) -> Result<ServiceEvent, ServiceError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.open {
                return Err(ServiceError::Code(ServiceResult::NotConnected));
            }
            if !state.sent_connect {
                state.sent_connect = true;
                return Ok(ServiceEvent::Connection);
            }
            if !state.sent_device {
                state.sent_device = true;
                return Ok(ServiceEvent::Device {
                    handle: SIM_DEVICE_HANDLE,
                    attributes: RawDeviceAttributes {
                        horizontal_fov: 2.303835,
                        vertical_fov: 2.007129,
                        range: 470.0,
                        baseline: 40.0,
                        is_embedded: false,
                        is_streaming: true,
                    },
                });
            }
            if let Some(event) = state.queued.pop_front() {
                return Ok(event);
            }
        }

        // Pace the synthetic stream; the lock is not held while sleeping.
        std::thread::sleep(FRAME_INTERVAL.min(timeout));
        let t = self.elapsed_secs();
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(ServiceError::Code(ServiceResult::NotConnected));
        }
        state.frame_id += 1;
        Ok(ServiceEvent::Tracking(Arc::new(RawTrackingFrame {
            frame_id: state.frame_id,
            timestamp_us: self.now_us(),
            framerate: SIM_FRAMERATE,
            box_center: [0.0, 200.0, 0.0],
            box_size: [400.0, 400.0, 300.0],
            hands: vec![synth_hand(t, 1, true), synth_hand(t, 2, false)],
        })))
    }

    fn request_image(
        &self,
        frame_id: i64,
        kind: ImageKind,
        _buffer_len: usize,
    ) -> Result<RequestToken, ServiceError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(ServiceError::Code(ServiceResult::NotConnected));
        }
        state.next_token += 1;
        let token = state.next_token;
        let width = 64u32;
        let height = 32u32;
        let pixels = (0..width * height).map(|i| (i % 256) as u8).collect();
        state.queued.push_back(ServiceEvent::ImageComplete(RawImageComplete {
            token,
            frame_id,
            timestamp_us: self.now_us(),
            kind,
            format: ImageFormat::Infrared,
            bytes_per_pixel: 1,
            width,
            height,
            ray_offset: [0.5, 0.5],
            ray_scale: [0.125, 0.125],
            matrix_version: 1,
            distortion_grid: Arc::new(vec![0.0; DISTORTION_GRID_FLOATS]),
            pixels,
        }));
        Ok(token)
    }

    fn cancel_image(&self, _token: RequestToken) {}

    fn set_policy(&self, set_mask: u64, clear_mask: u64) {
        let mut state = self.state.lock().unwrap();
        state.policies = (state.policies | set_mask) & !clear_mask;
        let active = state.policies;
        state.queued.push_back(ServiceEvent::PolicyChange { active });
    }

    fn request_config(&self, key: &str) -> Result<u32, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.next_request_id += 1;
        let request_id = state.next_request_id;
        let value = state
            .configs
            .get(key)
            .cloned()
            .unwrap_or(ConfigValue::Int32(0));
        state
            .queued
            .push_back(ServiceEvent::ConfigResponse { request_id, value });
        Ok(request_id)
    }

    fn write_config(&self, key: &str, value: ConfigValue) -> Result<u32, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.next_request_id += 1;
        let request_id = state.next_request_id;
        state.configs.insert(key.to_string(), value);
        state.queued.push_back(ServiceEvent::ConfigChange {
            request_id,
            success: true,
        });
        Ok(request_id)
    }

    fn device_serial(&self, _handle: u32, buf: &mut [u8]) -> Result<usize, ServiceError> {
        if buf.len() < SIM_SERIAL.len() {
            return Err(ServiceError::InsufficientBuffer {
                required: SIM_SERIAL.len(),
                provided: buf.len(),
            });
        }
        buf[..SIM_SERIAL.len()].copy_from_slice(SIM_SERIAL);
        Ok(SIM_SERIAL.len())
    }

    fn now_us(&self) -> i64 {
        self.started_at.elapsed().as_micros() as i64
    }
}

/// One synthesized hand: the palm orbits slowly and the fingers extend out of
/// it along gently waving directions.
fn synth_hand(t: f32, id: i32, is_left: bool) -> RawHand {
    let side = if is_left { -1.0 } else { 1.0 };
    let palm = [
        side * (80.0 + 20.0 * (t * 0.9).sin()),
        200.0 + 40.0 * (t * 1.3).sin(),
        -30.0 + 15.0 * (t * 0.7).cos(),
    ];

    let mut digits = [RawDigit::default(); 5];
    for (index, digit) in digits.iter_mut().enumerate() {
        let spread = (index as f32 - 2.0) * 0.25 + 0.1 * (t * 1.7 + index as f32).sin();
        *digit = synth_digit(palm, spread, index == 0);
    }

    RawHand {
        id,
        is_left,
        confidence: 0.99,
        visible_time_us: (t * 1e6) as i64,
        pinch_strength: 0.5 + 0.5 * (t * 2.1).sin(),
        pinch_distance: 40.0 + 20.0 * (t * 2.1).cos(),
        grab_strength: 0.5 + 0.5 * (t * 1.1).cos(),
        grab_angle: 1.5 + (t * 1.1).sin(),
        palm: RawPalm {
            position: palm,
            stabilized_position: palm,
            velocity: [20.0 * (t * 0.9).cos(), 50.0 * (t * 1.3).cos(), 0.0],
            normal: [0.0, -1.0, 0.0],
            direction: [0.0, 0.0, -1.0],
            width: 85.0,
        },
        digits,
        arm: bone_between(
            [palm[0], palm[1] - 50.0, palm[2] + 220.0],
            [palm[0], palm[1] - 10.0, palm[2] + 60.0],
            55.0,
        ),
    }
}

fn synth_digit(palm: [f32; 3], spread: f32, is_thumb: bool) -> RawDigit {
    let dir = [spread.sin(), 0.0, -spread.cos()];
    let lengths: [f32; 4] = if is_thumb {
        // The thumb metacarpal is a zero-length placeholder.
        [0.0, 32.0, 22.0, 16.0]
    } else {
        [22.0, 35.0, 24.0, 17.0]
    };

    let mut bones = [RawBone::default(); 4];
    let mut joint = palm;
    for (bone, length) in bones.iter_mut().zip(lengths) {
        let next = [
            joint[0] + dir[0] * length,
            joint[1] + dir[1] * length,
            joint[2] + dir[2] * length,
        ];
        *bone = bone_between(joint, next, 10.0);
        joint = next;
    }

    RawDigit {
        bones,
        tip_velocity: [0.0, 0.0, 0.0],
        stabilized_tip: joint,
        is_extended: true,
    }
}

fn bone_between(prev: [f32; 3], next: [f32; 3], width: f32) -> RawBone {
    RawBone {
        prev_joint: prev,
        next_joint: next,
        width,
        basis: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(backend: &SimulatedBackend) -> ServiceEvent {
        backend.poll(Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn startup_sequence_is_connect_then_device_then_tracking() {
        let backend = SimulatedBackend::new();
        backend.open().unwrap();

        assert!(matches!(poll(&backend), ServiceEvent::Connection));
        let ServiceEvent::Device { handle, attributes } = poll(&backend) else {
            panic!("expected a device event");
        };
        assert_eq!(handle, SIM_DEVICE_HANDLE);
        assert!(attributes.is_streaming);

        let ServiceEvent::Tracking(frame) = poll(&backend) else {
            panic!("expected a tracking event");
        };
        assert_eq!(frame.hands.len(), 2);
        assert!(frame.hands[0].is_left);
        assert!(!frame.hands[1].is_left);
    }

    #[test]
    fn frame_ids_increase_monotonically() {
        let backend = SimulatedBackend::new();
        backend.open().unwrap();
        poll(&backend);
        poll(&backend);

        let mut last = 0;
        for _ in 0..3 {
            let ServiceEvent::Tracking(frame) = poll(&backend) else {
                panic!("expected a tracking event");
            };
            assert!(frame.frame_id > last);
            last = frame.frame_id;
        }
    }

    #[test]
    fn image_requests_complete_with_a_valid_grid() {
        let backend = SimulatedBackend::new();
        backend.open().unwrap();
        poll(&backend);
        poll(&backend);

        let token = backend
            .request_image(1, ImageKind::Default, 4096)
            .unwrap();
        let ServiceEvent::ImageComplete(record) = poll(&backend) else {
            panic!("expected an image completion");
        };
        assert_eq!(record.token, token);
        assert_eq!(record.distortion_grid.len(), DISTORTION_GRID_FLOATS);
        assert_eq!(record.pixels.len(), 64 * 32);
    }

    #[test]
    fn config_writes_read_back() {
        let backend = SimulatedBackend::new();
        backend.open().unwrap();
        poll(&backend);
        poll(&backend);

        backend
            .write_config("tracking_mode", ConfigValue::Int32(2))
            .unwrap();
        assert!(matches!(
            poll(&backend),
            ServiceEvent::ConfigChange { success: true, .. }
        ));

        backend.request_config("tracking_mode").unwrap();
        let ServiceEvent::ConfigResponse { value, .. } = poll(&backend) else {
            panic!("expected a config response");
        };
        assert_eq!(value, ConfigValue::Int32(2));
    }

    #[test]
    fn closed_backend_refuses_to_poll() {
        let backend = SimulatedBackend::new();
        assert!(matches!(
            backend.poll(Duration::from_millis(1)),
            Err(ServiceError::Code(ServiceResult::NotConnected))
        ));
    }

    #[test]
    fn thumb_metacarpal_is_zero_length() {
        let hand = synth_hand(0.5, 1, true);
        let thumb = &hand.digits[0];
        assert_eq!(thumb.bones[0].prev_joint, thumb.bones[0].next_joint);
        let index = &hand.digits[1];
        assert_ne!(index.bones[0].prev_joint, index.bones[0].next_joint);
    }
}
