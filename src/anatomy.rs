//! The immutable snapshot object model: Frame → Hand → Finger → Bone.
//!
//! A frame graph is built once per tracking tick by the frame factory and
//! never mutated afterwards. Lookups that miss return shared invalid
//! sentinels instead of errors; two invalid instances of the same type
//! compare equal.

use once_cell::sync::{Lazy, OnceCell};
use std::sync::Arc;

use crate::geometry::{basis_from_columns, normalized_or_zero, Basis, Vec3};

/// Shared invalid sentinels, handed out by reference from failed lookups.
pub static INVALID_BONE: Lazy<Bone> = Lazy::new(Bone::invalid);
pub static INVALID_FINGER: Lazy<Finger> = Lazy::new(Finger::invalid);
pub static INVALID_HAND: Lazy<Hand> = Lazy::new(Hand::invalid);
pub static INVALID_FRAME: Lazy<Arc<Frame>> = Lazy::new(|| Arc::new(Frame::invalid()));

/// Anatomical bone classification, ordered base to tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoneType {
    Metacarpal = 0,
    Proximal = 1,
    Intermediate = 2,
    Distal = 3,
    Invalid = 4,
}

impl BoneType {
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Metacarpal,
            1 => Self::Proximal,
            2 => Self::Intermediate,
            3 => Self::Distal,
            _ => Self::Invalid,
        }
    }
}

/// Finger classification, thumb through pinky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerType {
    Thumb = 0,
    Index = 1,
    Middle = 2,
    Ring = 3,
    Pinky = 4,
}

impl FingerType {
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Thumb,
            1 => Self::Index,
            2 => Self::Middle,
            3 => Self::Ring,
            _ => Self::Pinky,
        }
    }
}

/// One bone segment. The thumb's metacarpal is a valid zero-length
/// placeholder so every finger always carries exactly four bones.
#[derive(Debug, Clone, Copy)]
pub struct Bone {
    pub prev_joint: Vec3,
    pub next_joint: Vec3,
    pub center: Vec3,
    /// Unit vector from prev to next joint; zero when the joints coincide.
    pub direction: Vec3,
    pub length: f32,
    pub width: f32,
    pub kind: BoneType,
    pub basis: Basis,
}

impl Bone {
    pub fn from_joints(prev_joint: Vec3, next_joint: Vec3, width: f32, kind: BoneType, basis: Basis) -> Self {
        let span = next_joint - prev_joint;
        Self {
            prev_joint,
            next_joint,
            center: (prev_joint + next_joint) * 0.5,
            direction: normalized_or_zero(span),
            length: span.norm(),
            width,
            kind,
            basis,
        }
    }

    pub fn invalid() -> Self {
        Self {
            prev_joint: Vec3::zeros(),
            next_joint: Vec3::zeros(),
            center: Vec3::zeros(),
            direction: Vec3::zeros(),
            length: 0.0,
            width: 0.0,
            kind: BoneType::Invalid,
            basis: Basis::identity(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind != BoneType::Invalid
    }
}

impl PartialEq for Bone {
    fn eq(&self, other: &Self) -> bool {
        if !self.is_valid() && !other.is_valid() {
            return true;
        }
        self.kind == other.kind
            && self.prev_joint == other.prev_joint
            && self.next_joint == other.next_joint
            && self.width == other.width
    }
}

/// Forearm segment; a bone whose prev joint is the elbow and next joint the
/// wrist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arm {
    bone: Bone,
}

impl Arm {
    pub fn new(bone: Bone) -> Self {
        Self { bone }
    }

    pub fn invalid() -> Self {
        Self {
            bone: Bone::invalid(),
        }
    }

    pub fn elbow_position(&self) -> Vec3 {
        self.bone.prev_joint
    }

    pub fn wrist_position(&self) -> Vec3 {
        self.bone.next_joint
    }
}

impl std::ops::Deref for Arm {
    type Target = Bone;

    fn deref(&self) -> &Bone {
        &self.bone
    }
}

#[derive(Debug, Clone)]
pub struct Finger {
    /// Stable id, derived as `hand_id * 10 + position index`.
    pub id: i32,
    pub hand_id: i32,
    pub frame_id: i64,
    pub kind: FingerType,
    /// Ordered base to tip: metacarpal, proximal, intermediate, distal.
    pub bones: [Bone; 4],
    pub tip_position: Vec3,
    pub tip_velocity: Vec3,
    pub stabilized_tip_position: Vec3,
    pub direction: Vec3,
    pub width: f32,
    /// Derived approximation; the visible fingertip is not the full distal
    /// bone, hence the 0.77 factor applied to it.
    pub length: f32,
    pub is_extended: bool,
    pub time_visible: f32,
}

impl Finger {
    pub fn invalid() -> Self {
        Self {
            id: -1,
            hand_id: -1,
            frame_id: -1,
            kind: FingerType::Thumb,
            bones: [Bone::invalid(); 4],
            tip_position: Vec3::zeros(),
            tip_velocity: Vec3::zeros(),
            stabilized_tip_position: Vec3::zeros(),
            direction: Vec3::zeros(),
            width: 0.0,
            length: 0.0,
            is_extended: false,
            time_visible: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id >= 0
    }

    pub fn bone(&self, kind: BoneType) -> &Bone {
        match kind {
            BoneType::Invalid => &INVALID_BONE,
            _ => &self.bones[kind as usize],
        }
    }
}

impl PartialEq for Finger {
    fn eq(&self, other: &Self) -> bool {
        if !self.is_valid() && !other.is_valid() {
            return true;
        }
        self.id == other.id && self.frame_id == other.frame_id
    }
}

#[derive(Debug, Clone)]
pub struct Hand {
    pub id: i32,
    pub frame_id: i64,
    pub confidence: f32,
    pub grab_strength: f32,
    pub grab_angle: f32,
    pub pinch_strength: f32,
    pub pinch_distance: f32,
    pub palm_width: f32,
    pub is_left: bool,
    pub time_visible: f32,
    pub arm: Arm,
    /// Exactly five, ordered thumb through pinky.
    pub fingers: Vec<Finger>,
    pub palm_position: Vec3,
    pub stabilized_palm_position: Vec3,
    pub palm_velocity: Vec3,
    pub palm_normal: Vec3,
    pub direction: Vec3,
    pub wrist_position: Vec3,
    basis: OnceCell<Basis>,
}

impl Hand {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i32,
        frame_id: i64,
        confidence: f32,
        grab_strength: f32,
        grab_angle: f32,
        pinch_strength: f32,
        pinch_distance: f32,
        palm_width: f32,
        is_left: bool,
        time_visible: f32,
        arm: Arm,
        fingers: Vec<Finger>,
        palm_position: Vec3,
        stabilized_palm_position: Vec3,
        palm_velocity: Vec3,
        palm_normal: Vec3,
        direction: Vec3,
        wrist_position: Vec3,
    ) -> Self {
        Self {
            id,
            frame_id,
            confidence,
            grab_strength,
            grab_angle,
            pinch_strength,
            pinch_distance,
            palm_width,
            is_left,
            time_visible,
            arm,
            fingers,
            palm_position,
            stabilized_palm_position,
            palm_velocity,
            palm_normal,
            direction,
            wrist_position,
            basis: OnceCell::new(),
        }
    }

    pub fn invalid() -> Self {
        Self {
            id: -1,
            frame_id: -1,
            confidence: 0.0,
            grab_strength: 0.0,
            grab_angle: 0.0,
            pinch_strength: 0.0,
            pinch_distance: 0.0,
            palm_width: 0.0,
            is_left: false,
            time_visible: 0.0,
            arm: Arm::invalid(),
            fingers: vec![Finger::invalid(); 5],
            palm_position: Vec3::zeros(),
            stabilized_palm_position: Vec3::zeros(),
            palm_velocity: Vec3::zeros(),
            palm_normal: Vec3::zeros(),
            direction: Vec3::zeros(),
            wrist_position: Vec3::zeros(),
            basis: OnceCell::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id >= 0
    }

    pub fn is_right(&self) -> bool {
        !self.is_left
    }

    /// Orientation basis derived from the palm direction and normal. Computed
    /// on first access and cached for the life of the snapshot.
    pub fn basis(&self) -> Basis {
        *self.basis.get_or_init(|| {
            let z_basis = normalized_or_zero(-self.direction);
            let y_basis = normalized_or_zero(-self.palm_normal);
            let mut x_basis = y_basis.cross(&z_basis);
            if self.is_left {
                x_basis = -x_basis;
            }
            basis_from_columns(normalized_or_zero(x_basis), y_basis, z_basis)
        })
    }

    pub fn finger(&self, kind: FingerType) -> &Finger {
        self.fingers.get(kind as usize).unwrap_or(&INVALID_FINGER)
    }

    pub fn finger_by_id(&self, id: i32) -> &Finger {
        self.fingers
            .iter()
            .find(|f| f.id == id)
            .unwrap_or(&INVALID_FINGER)
    }
}

impl PartialEq for Hand {
    fn eq(&self, other: &Self) -> bool {
        if !self.is_valid() && !other.is_valid() {
            return true;
        }
        self.id == other.id && self.frame_id == other.frame_id
    }
}

/// Axis-aligned normalization volume in device millimeters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionBox {
    pub center: Vec3,
    pub size: Vec3,
}

impl InteractionBox {
    pub fn new(center: Vec3, size: Vec3) -> Self {
        Self { center, size }
    }

    pub fn invalid() -> Self {
        Self {
            center: Vec3::zeros(),
            size: Vec3::zeros(),
        }
    }

    /// Invalid when any size axis is zero, negative or NaN.
    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| self.size[i].is_finite() && self.size[i] > 0.0)
    }

    /// Maps a point in device millimeters into the [0, 1]^3 volume.
    pub fn normalize_point(&self, point: Vec3, clamp: bool) -> Vec3 {
        if !self.is_valid() {
            return Vec3::zeros();
        }
        let min = self.center - self.size * 0.5;
        let mut n = (point - min).component_div(&self.size);
        if clamp {
            for i in 0..3 {
                n[i] = n[i].clamp(0.0, 1.0);
            }
        }
        n
    }

    /// Maps a normalized [0, 1]^3 point back into device millimeters.
    pub fn denormalize_point(&self, normalized: Vec3) -> Vec3 {
        if !self.is_valid() {
            return Vec3::zeros();
        }
        let min = self.center - self.size * 0.5;
        min + normalized.component_mul(&self.size)
    }
}

/// One timestamped snapshot of all tracked hands.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing tracking frame id.
    pub id: i64,
    /// Capture timestamp in microseconds.
    pub timestamp: i64,
    /// Instantaneous framerate reported by the service.
    pub current_fps: f32,
    /// Arbitrary order; lookup by id is a linear scan.
    pub hands: Vec<Hand>,
    pub interaction_box: InteractionBox,
}

impl Frame {
    pub fn invalid() -> Self {
        Self {
            id: -1,
            timestamp: -1,
            current_fps: 0.0,
            hands: Vec::new(),
            interaction_box: InteractionBox::invalid(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id >= 0
    }

    pub fn hand(&self, id: i32) -> &Hand {
        self.hands.iter().find(|h| h.id == id).unwrap_or(&INVALID_HAND)
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        if !self.is_valid() && !other.is_valid() {
            return true;
        }
        self.id == other.id && self.timestamp == other.timestamp
    }
}
