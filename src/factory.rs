//! Frame factory: decodes one flat native tracking record into the immutable
//! Frame → Hand → Finger → Bone snapshot graph.

use crate::anatomy::{Arm, Bone, BoneType, Finger, FingerType, Frame, Hand, InteractionBox};
use crate::geometry::{basis_from_columns, Basis, Vec3};
use crate::service::{RawBone, RawDigit, RawHand, RawTrackingFrame};

/// The visible fingertip ends short of the distal bone, so the derived finger
/// length discounts it.
const DISTAL_LENGTH_FACTOR: f32 = 0.77;

fn vec3(v: [f32; 3]) -> Vec3 {
    Vec3::new(v[0], v[1], v[2])
}

fn basis(columns: [[f32; 3]; 3]) -> Basis {
    basis_from_columns(vec3(columns[0]), vec3(columns[1]), vec3(columns[2]))
}

fn build_bone(raw: &RawBone, kind: BoneType) -> Bone {
    Bone::from_joints(
        vec3(raw.prev_joint),
        vec3(raw.next_joint),
        raw.width,
        kind,
        basis(raw.basis),
    )
}

fn build_finger(raw: &RawDigit, position: usize, hand_id: i32, frame_id: i64, time_visible: f32) -> Finger {
    let bones = [
        build_bone(&raw.bones[0], BoneType::Metacarpal),
        build_bone(&raw.bones[1], BoneType::Proximal),
        build_bone(&raw.bones[2], BoneType::Intermediate),
        build_bone(&raw.bones[3], BoneType::Distal),
    ];
    let distal = &bones[3];
    let length =
        bones[1].length + bones[2].length + DISTAL_LENGTH_FACTOR * distal.length;

    Finger {
        id: hand_id * 10 + position as i32,
        hand_id,
        frame_id,
        kind: FingerType::from_index(position),
        tip_position: distal.next_joint,
        tip_velocity: vec3(raw.tip_velocity),
        stabilized_tip_position: vec3(raw.stabilized_tip),
        direction: bones[2].direction,
        width: bones[1].width,
        length,
        is_extended: raw.is_extended,
        time_visible,
        bones,
    }
}

fn build_hand(raw: &RawHand, frame_id: i64) -> Hand {
    let time_visible = raw.visible_time_us as f32 * 1e-6;
    let arm_bone = build_bone(&raw.arm, BoneType::Metacarpal);
    let wrist_position = arm_bone.next_joint;

    let fingers = raw
        .digits
        .iter()
        .enumerate()
        .map(|(i, digit)| build_finger(digit, i, raw.id, frame_id, time_visible))
        .collect();

    Hand::new(
        raw.id,
        frame_id,
        raw.confidence,
        raw.grab_strength,
        raw.grab_angle,
        raw.pinch_strength,
        raw.pinch_distance,
        raw.palm.width,
        raw.is_left,
        time_visible,
        Arm::new(arm_bone),
        fingers,
        vec3(raw.palm.position),
        vec3(raw.palm.stabilized_position),
        vec3(raw.palm.velocity),
        vec3(raw.palm.normal),
        vec3(raw.palm.direction),
        wrist_position,
    )
}

/// Decodes a native tracking record into a frame graph. Pure function; never
/// fails, degenerate inputs produce zeroed fields instead of NaN.
pub fn build_frame(raw: &RawTrackingFrame) -> Frame {
    Frame {
        id: raw.frame_id,
        timestamp: raw.timestamp_us,
        current_fps: raw.framerate,
        hands: raw.hands.iter().map(|h| build_hand(h, raw.frame_id)).collect(),
        interaction_box: InteractionBox::new(vec3(raw.box_center), vec3(raw.box_size)),
    }
}
