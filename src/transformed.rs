//! Lazy transform overlay over a tracking snapshot.
//!
//! Wrappers hold a reference to the immutable source frame plus the active
//! transform and recompute every accessor on demand. `set` re-targets a
//! wrapper tree in place: child wrappers are reused index by index and only
//! allocated when the new frame has more children than are already wrapped,
//! so per-frame updates settle into zero allocation.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::anatomy::{
    Arm, Bone, BoneType, Finger, FingerType, Frame, Hand, InteractionBox,
};
use crate::geometry::{basis_from_columns, normalized_or_zero, Basis, Transform, Vec3};

/// Read surface shared by concrete bones and their transformed views.
pub trait BoneView {
    fn prev_joint(&self) -> Vec3;
    fn next_joint(&self) -> Vec3;
    fn center(&self) -> Vec3;
    fn direction(&self) -> Vec3;
    fn length(&self) -> f32;
    fn width(&self) -> f32;
    fn kind(&self) -> BoneType;
    fn basis(&self) -> Basis;
}

/// Read surface shared by concrete fingers and their transformed views.
pub trait FingerView {
    fn id(&self) -> i32;
    fn kind(&self) -> FingerType;
    fn tip_position(&self) -> Vec3;
    fn direction(&self) -> Vec3;
    fn width(&self) -> f32;
    fn length(&self) -> f32;
    fn is_extended(&self) -> bool;
}

/// Read surface shared by concrete hands and their transformed views.
pub trait HandView {
    fn id(&self) -> i32;
    fn palm_position(&self) -> Vec3;
    fn palm_normal(&self) -> Vec3;
    fn direction(&self) -> Vec3;
    fn wrist_position(&self) -> Vec3;
    fn palm_width(&self) -> f32;
    fn is_left(&self) -> bool;
    fn basis(&self) -> Basis;
}

impl BoneView for Bone {
    fn prev_joint(&self) -> Vec3 {
        self.prev_joint
    }

    fn next_joint(&self) -> Vec3 {
        self.next_joint
    }

    fn center(&self) -> Vec3 {
        self.center
    }

    fn direction(&self) -> Vec3 {
        self.direction
    }

    fn length(&self) -> f32 {
        self.length
    }

    fn width(&self) -> f32 {
        self.width
    }

    fn kind(&self) -> BoneType {
        self.kind
    }

    fn basis(&self) -> Basis {
        self.basis
    }
}

impl FingerView for Finger {
    fn id(&self) -> i32 {
        self.id
    }

    fn kind(&self) -> FingerType {
        self.kind
    }

    fn tip_position(&self) -> Vec3 {
        self.tip_position
    }

    fn direction(&self) -> Vec3 {
        self.direction
    }

    fn width(&self) -> f32 {
        self.width
    }

    fn length(&self) -> f32 {
        self.length
    }

    fn is_extended(&self) -> bool {
        self.is_extended
    }
}

impl HandView for Hand {
    fn id(&self) -> i32 {
        self.id
    }

    fn palm_position(&self) -> Vec3 {
        self.palm_position
    }

    fn palm_normal(&self) -> Vec3 {
        self.palm_normal
    }

    fn direction(&self) -> Vec3 {
        self.direction
    }

    fn wrist_position(&self) -> Vec3 {
        self.wrist_position
    }

    fn palm_width(&self) -> f32 {
        self.palm_width
    }

    fn is_left(&self) -> bool {
        self.is_left
    }

    fn basis(&self) -> Basis {
        Hand::basis(self)
    }
}

static INVALID_TRANSFORMED_BONE: Lazy<TransformedBone> =
    Lazy::new(|| TransformedBone::new(Bone::invalid(), Transform::identity()));

/// Transformed view of one bone. Holds the source bone by value (bones are
/// plain `Copy` data), so re-targeting is a pair of assignments.
#[derive(Debug, Clone, Copy)]
pub struct TransformedBone {
    bone: Bone,
    transform: Transform,
}

impl TransformedBone {
    fn new(bone: Bone, transform: Transform) -> Self {
        Self { bone, transform }
    }

    fn retarget(&mut self, bone: Bone, transform: Transform) {
        self.bone = bone;
        self.transform = transform;
    }
}

impl BoneView for TransformedBone {
    fn prev_joint(&self) -> Vec3 {
        self.transform.transform_point(self.bone.prev_joint)
    }

    fn next_joint(&self) -> Vec3 {
        self.transform.transform_point(self.bone.next_joint)
    }

    fn center(&self) -> Vec3 {
        self.transform.transform_point(self.bone.center)
    }

    fn direction(&self) -> Vec3 {
        normalized_or_zero(self.transform.transform_direction(self.bone.direction))
    }

    /// Length rescales by the longitudinal (z) axis magnitude.
    fn length(&self) -> f32 {
        self.bone.length * self.transform.axis_scale(2)
    }

    /// Width rescales by the lateral (x) axis magnitude.
    fn width(&self) -> f32 {
        self.bone.width * self.transform.axis_scale(0)
    }

    fn kind(&self) -> BoneType {
        self.bone.kind
    }

    fn basis(&self) -> Basis {
        transformed_basis(&self.transform, self.bone.basis)
    }
}

/// Transformed view of the forearm segment.
#[derive(Debug, Clone, Copy)]
pub struct TransformedArm {
    bone: TransformedBone,
}

impl TransformedArm {
    pub fn elbow_position(&self) -> Vec3 {
        self.bone.prev_joint()
    }

    pub fn wrist_position(&self) -> Vec3 {
        self.bone.next_joint()
    }

    pub fn bone(&self) -> &TransformedBone {
        &self.bone
    }
}

/// Transformed view of one finger.
#[derive(Clone)]
pub struct TransformedFinger {
    frame: Arc<Frame>,
    hand: usize,
    finger: usize,
    transform: Transform,
    bones: [TransformedBone; 4],
}

impl TransformedFinger {
    fn new(frame: &Arc<Frame>, hand: usize, finger: usize, transform: Transform) -> Self {
        let source = &frame.hands[hand].fingers[finger];
        Self {
            frame: Arc::clone(frame),
            hand,
            finger,
            transform,
            bones: source.bones.map(|b| TransformedBone::new(b, transform)),
        }
    }

    fn retarget(&mut self, frame: &Arc<Frame>, hand: usize, finger: usize, transform: Transform) {
        let source = &frame.hands[hand].fingers[finger];
        for (wrapped, bone) in self.bones.iter_mut().zip(source.bones) {
            wrapped.retarget(bone, transform);
        }
        self.frame = Arc::clone(frame);
        self.hand = hand;
        self.finger = finger;
        self.transform = transform;
    }

    fn source(&self) -> &Finger {
        &self.frame.hands[self.hand].fingers[self.finger]
    }

    pub fn bone(&self, kind: BoneType) -> &TransformedBone {
        match kind {
            BoneType::Invalid => &INVALID_TRANSFORMED_BONE,
            _ => &self.bones[kind as usize],
        }
    }

    pub fn bones(&self) -> &[TransformedBone; 4] {
        &self.bones
    }

    pub fn tip_velocity(&self) -> Vec3 {
        self.transform.transform_direction(self.source().tip_velocity)
    }

    pub fn stabilized_tip_position(&self) -> Vec3 {
        self.transform
            .transform_point(self.source().stabilized_tip_position)
    }
}

impl FingerView for TransformedFinger {
    fn id(&self) -> i32 {
        self.source().id
    }

    fn kind(&self) -> FingerType {
        self.source().kind
    }

    fn tip_position(&self) -> Vec3 {
        self.transform.transform_point(self.source().tip_position)
    }

    fn direction(&self) -> Vec3 {
        normalized_or_zero(self.transform.transform_direction(self.source().direction))
    }

    fn width(&self) -> f32 {
        self.source().width * self.transform.axis_scale(0)
    }

    fn length(&self) -> f32 {
        self.source().length * self.transform.axis_scale(2)
    }

    fn is_extended(&self) -> bool {
        self.source().is_extended
    }
}

/// Transformed view of one hand.
#[derive(Clone)]
pub struct TransformedHand {
    frame: Arc<Frame>,
    hand: usize,
    transform: Transform,
    fingers: Vec<TransformedFinger>,
    arm: TransformedArm,
}

impl TransformedHand {
    fn new(frame: &Arc<Frame>, hand: usize, transform: Transform) -> Self {
        let source = &frame.hands[hand];
        let fingers = (0..source.fingers.len())
            .map(|i| TransformedFinger::new(frame, hand, i, transform))
            .collect();
        Self {
            frame: Arc::clone(frame),
            hand,
            transform,
            fingers,
            arm: TransformedArm {
                bone: TransformedBone::new(*source.arm, transform),
            },
        }
    }

    fn retarget(&mut self, frame: &Arc<Frame>, hand: usize, transform: Transform) {
        let source = &frame.hands[hand];
        for (index, finger) in self.fingers.iter_mut().enumerate() {
            finger.retarget(frame, hand, index, transform);
        }
        for index in self.fingers.len()..source.fingers.len() {
            self.fingers
                .push(TransformedFinger::new(frame, hand, index, transform));
        }
        self.arm.bone.retarget(*source.arm, transform);
        self.frame = Arc::clone(frame);
        self.hand = hand;
        self.transform = transform;
    }

    fn source(&self) -> &Hand {
        &self.frame.hands[self.hand]
    }

    pub fn fingers(&self) -> &[TransformedFinger] {
        &self.fingers[..self.source().fingers.len().min(self.fingers.len())]
    }

    pub fn finger(&self, kind: FingerType) -> &TransformedFinger {
        &self.fingers[kind as usize]
    }

    pub fn arm(&self) -> &TransformedArm {
        &self.arm
    }

    pub fn grab_strength(&self) -> f32 {
        self.source().grab_strength
    }

    pub fn pinch_strength(&self) -> f32 {
        self.source().pinch_strength
    }

    pub fn pinch_distance(&self) -> f32 {
        self.source().pinch_distance * self.transform.axis_scale(0)
    }

    pub fn confidence(&self) -> f32 {
        self.source().confidence
    }

    pub fn palm_velocity(&self) -> Vec3 {
        self.transform.transform_direction(self.source().palm_velocity)
    }

    pub fn stabilized_palm_position(&self) -> Vec3 {
        self.transform
            .transform_point(self.source().stabilized_palm_position)
    }
}

impl HandView for TransformedHand {
    fn id(&self) -> i32 {
        self.source().id
    }

    fn palm_position(&self) -> Vec3 {
        self.transform.transform_point(self.source().palm_position)
    }

    fn palm_normal(&self) -> Vec3 {
        normalized_or_zero(self.transform.transform_direction(self.source().palm_normal))
    }

    fn direction(&self) -> Vec3 {
        normalized_or_zero(self.transform.transform_direction(self.source().direction))
    }

    fn wrist_position(&self) -> Vec3 {
        self.transform.transform_point(self.source().wrist_position)
    }

    fn palm_width(&self) -> f32 {
        self.source().palm_width * self.transform.axis_scale(0)
    }

    fn is_left(&self) -> bool {
        self.source().is_left
    }

    fn basis(&self) -> Basis {
        transformed_basis(&self.transform, self.source().basis())
    }
}

/// Transformed view of a whole snapshot. Long-lived: call
/// [`set`](Self::set) with each new frame to re-target every wrapper in
/// place.
pub struct TransformedFrame {
    source: Arc<Frame>,
    transform: Transform,
    hands: Vec<TransformedHand>,
    active_hands: usize,
}

impl TransformedFrame {
    pub fn new(transform: Transform, source: Arc<Frame>) -> Self {
        let mut view = Self {
            source: Arc::clone(&source),
            transform,
            hands: Vec::new(),
            active_hands: 0,
        };
        view.set(transform, source);
        view
    }

    /// Re-targets the wrapper tree at a new frame and transform. Hand
    /// wrappers beyond the new frame's count go inactive but stay allocated
    /// for the next retarget.
    pub fn set(&mut self, transform: Transform, source: Arc<Frame>) {
        let count = source.hands.len();
        for index in 0..count.min(self.hands.len()) {
            self.hands[index].retarget(&source, index, transform);
        }
        for index in self.hands.len()..count {
            self.hands.push(TransformedHand::new(&source, index, transform));
        }
        self.active_hands = count;
        self.transform = transform;
        self.source = source;
    }

    pub fn id(&self) -> i64 {
        self.source.id
    }

    pub fn timestamp(&self) -> i64 {
        self.source.timestamp
    }

    pub fn current_fps(&self) -> f32 {
        self.source.current_fps
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Active hand views only; surplus wrappers from a previous larger frame
    /// are not visible here.
    pub fn hands(&self) -> &[TransformedHand] {
        &self.hands[..self.active_hands]
    }

    pub fn hand(&self, id: i32) -> Option<&TransformedHand> {
        self.hands().iter().find(|h| h.id() == id)
    }

    pub fn interaction_box(&self) -> InteractionBox {
        let source = self.source.interaction_box;
        let size = Vec3::new(
            source.size.x * self.transform.axis_scale(0),
            source.size.y * self.transform.axis_scale(1),
            source.size.z * self.transform.axis_scale(2),
        );
        InteractionBox::new(self.transform.transform_point(source.center), size)
    }

    /// Eagerly applies the transform, producing a concrete frame graph with
    /// no further dependence on this view or its source.
    pub fn materialized(&self) -> Frame {
        Frame {
            id: self.source.id,
            timestamp: self.source.timestamp,
            current_fps: self.source.current_fps,
            hands: self.hands().iter().map(materialize_hand).collect(),
            interaction_box: self.interaction_box(),
        }
    }
}

fn transformed_basis(transform: &Transform, basis: Basis) -> Basis {
    basis_from_columns(
        normalized_or_zero(transform.transform_direction(basis.column(0).into_owned())),
        normalized_or_zero(transform.transform_direction(basis.column(1).into_owned())),
        normalized_or_zero(transform.transform_direction(basis.column(2).into_owned())),
    )
}

fn materialize_bone(bone: &TransformedBone) -> Bone {
    Bone {
        prev_joint: bone.prev_joint(),
        next_joint: bone.next_joint(),
        center: bone.center(),
        direction: bone.direction(),
        length: bone.length(),
        width: bone.width(),
        kind: bone.kind(),
        basis: bone.basis(),
    }
}

fn materialize_finger(finger: &TransformedFinger) -> Finger {
    let source = finger.source();
    Finger {
        id: source.id,
        hand_id: source.hand_id,
        frame_id: source.frame_id,
        kind: source.kind,
        bones: [
            materialize_bone(&finger.bones[0]),
            materialize_bone(&finger.bones[1]),
            materialize_bone(&finger.bones[2]),
            materialize_bone(&finger.bones[3]),
        ],
        tip_position: finger.tip_position(),
        tip_velocity: finger.tip_velocity(),
        stabilized_tip_position: finger.stabilized_tip_position(),
        direction: finger.direction(),
        width: finger.width(),
        length: finger.length(),
        is_extended: source.is_extended,
        time_visible: source.time_visible,
    }
}

fn materialize_hand(hand: &TransformedHand) -> Hand {
    let source = hand.source();
    Hand::new(
        source.id,
        source.frame_id,
        source.confidence,
        source.grab_strength,
        source.grab_angle,
        hand.pinch_strength(),
        hand.pinch_distance(),
        hand.palm_width(),
        source.is_left,
        source.time_visible,
        Arm::new(materialize_bone(hand.arm.bone())),
        hand.fingers().iter().map(materialize_finger).collect(),
        hand.palm_position(),
        hand.stabilized_palm_position(),
        hand.palm_velocity(),
        hand.palm_normal(),
        hand.direction(),
        hand.wrist_position(),
    )
}
