//! Geometry kernel built on nalgebra.
//!
//! Tracking data is expressed in millimeters in the device coordinate space.
//! `Transform` re-projects positions and directions into a consumer space and
//! carries an independent non-uniform scale; the scaled basis columns are
//! cached so `transform_point`/`transform_direction` stay O(1).

use nalgebra::{Matrix3, Quaternion, Rotation3, Unit, UnitQuaternion, Vector3};

/// 3-component vector, millimeters unless stated otherwise.
pub type Vec3 = Vector3<f32>;

/// Orthonormal orientation frame; columns are the x/y/z basis vectors.
pub type Basis = Matrix3<f32>;

/// Normalize a vector, returning the zero vector instead of NaN when the
/// squared magnitude is at or below machine epsilon.
pub fn normalized_or_zero(v: Vec3) -> Vec3 {
    let mag_sq = v.norm_squared();
    if mag_sq <= f32::EPSILON {
        Vec3::zeros()
    } else {
        v / mag_sq.sqrt()
    }
}

/// Build a rotation basis from an axis and an angle (radians).
pub fn basis_from_axis_angle(axis: Vec3, angle: f32) -> Basis {
    Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle).into_inner()
}

/// Build a basis matrix from three column vectors.
pub fn basis_from_columns(x: Vec3, y: Vec3, z: Vec3) -> Basis {
    Basis::from_columns(&[x, y, z])
}

/// An affine transform: rotation basis + translation + independent per-axis
/// scale.
///
/// Note the asymmetry: setting the quaternion recomputes the basis, but
/// setting the basis directly does NOT update the stored quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    basis: Basis,
    origin: Vec3,
    scale: Vec3,
    rotation: UnitQuaternion<f32>,
    // Cached basis columns pre-multiplied by the per-axis scale.
    scaled_basis: Basis,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            basis: Basis::identity(),
            origin: Vec3::zeros(),
            scale: Vec3::new(1.0, 1.0, 1.0),
            rotation: UnitQuaternion::identity(),
            scaled_basis: Basis::identity(),
        }
    }

    /// Rigid transform from a translation and a rotation quaternion.
    pub fn new(origin: Vec3, rotation: UnitQuaternion<f32>) -> Self {
        let mut t = Self::identity();
        t.origin = origin;
        t.set_rotation(rotation);
        t
    }

    /// Transform with an additional independent per-axis scale.
    pub fn with_scale(origin: Vec3, rotation: UnitQuaternion<f32>, scale: Vec3) -> Self {
        let mut t = Self::new(origin, rotation);
        t.set_scale(scale);
        t
    }

    /// Transform from explicit basis columns and a translation. The stored
    /// quaternion stays at identity.
    pub fn from_basis(x: Vec3, y: Vec3, z: Vec3, origin: Vec3) -> Self {
        let mut t = Self::identity();
        t.origin = origin;
        t.set_basis(basis_from_columns(x, y, z));
        t
    }

    pub fn from_axis_angle(axis: Vec3, angle: f32, origin: Vec3) -> Self {
        let mut t = Self::identity();
        t.origin = origin;
        t.set_rotation(UnitQuaternion::from_axis_angle(
            &Unit::new_normalize(axis),
            angle,
        ));
        t
    }

    pub fn basis(&self) -> Basis {
        self.basis
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn rotation(&self) -> UnitQuaternion<f32> {
        self.rotation
    }

    pub fn set_origin(&mut self, origin: Vec3) {
        self.origin = origin;
    }

    /// Replaces the rotation and recomputes the basis from the quaternion.
    pub fn set_rotation(&mut self, rotation: UnitQuaternion<f32>) {
        self.rotation = rotation;
        self.basis = rotation.to_rotation_matrix().into_inner();
        self.rescale();
    }

    /// Replaces the basis columns directly. The stored quaternion is left
    /// untouched.
    pub fn set_basis(&mut self, basis: Basis) {
        self.basis = basis;
        self.rescale();
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.scale = scale;
        self.rescale();
    }

    fn rescale(&mut self) {
        for i in 0..3 {
            let column: Vec3 = self.basis.column(i).into_owned() * self.scale[i];
            self.scaled_basis.set_column(i, &column);
        }
    }

    /// Applies scale, rotation and translation.
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.scaled_basis * point + self.origin
    }

    /// Applies scale and rotation only.
    pub fn transform_direction(&self, direction: Vec3) -> Vec3 {
        self.scaled_basis * direction
    }

    /// Magnitude of the scaled basis column for the given axis. Used to
    /// rescale scalar quantities such as widths and lengths.
    pub fn axis_scale(&self, axis: usize) -> f32 {
        self.scaled_basis.column(axis).norm()
    }

    /// Inverse of a rigid transform. Only valid when this transform is pure
    /// rotation + translation (unit scale).
    pub fn rigid_inverse(&self) -> Self {
        let basis = self.basis.transpose();
        let origin = -(basis * self.origin);
        Self {
            basis,
            origin,
            scale: Vec3::new(1.0, 1.0, 1.0),
            rotation: self.rotation.inverse(),
            scaled_basis: basis,
        }
    }

    /// Quaternion from explicit components (x, y, z, w), normalized.
    pub fn quaternion(x: f32, y: f32, z: f32, w: f32) -> UnitQuaternion<f32> {
        UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
    }
}

impl std::ops::Mul for Transform {
    type Output = Transform;

    /// Composition: `(a * b).transform_point(p)` applies `b` first, then `a`.
    /// The result carries unit scale; any scale from the operands is folded
    /// into the combined basis.
    fn mul(self, rhs: Transform) -> Transform {
        let basis = self.scaled_basis * rhs.scaled_basis;
        Transform {
            basis,
            origin: self.transform_point(rhs.origin),
            scale: Vec3::new(1.0, 1.0, 1.0),
            rotation: self.rotation * rhs.rotation,
            scaled_basis: basis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_vec_eq(a: Vec3, b: Vec3) {
        assert!((a - b).norm() < 1e-4, "expected {b:?}, got {a:?}");
    }

    #[test]
    fn normalize_of_tiny_vector_is_zero() {
        let v = Vec3::new(1e-23, 0.0, 0.0);
        assert_eq!(normalized_or_zero(v), Vec3::zeros());
    }

    #[test]
    fn normalize_of_regular_vector_is_unit() {
        let n = normalized_or_zero(Vec3::new(3.0, 0.0, 4.0));
        assert!((n.norm() - 1.0).abs() < 1e-6);
        assert_vec_eq(n, Vec3::new(0.6, 0.0, 0.8));
    }

    #[test]
    fn rigid_inverse_round_trips_points() {
        let t = Transform::from_axis_angle(
            Vec3::new(0.3, 1.0, -0.2),
            1.1,
            Vec3::new(12.0, -4.0, 88.0),
        );
        let p = Vec3::new(5.0, -17.5, 42.0);
        let round_trip = t.rigid_inverse().transform_point(t.transform_point(p));
        assert_vec_eq(round_trip, p);
    }

    #[test]
    fn composition_matches_sequential_application() {
        let a = Transform::from_axis_angle(Vec3::y(), 0.7, Vec3::new(1.0, 2.0, 3.0));
        let b = Transform::from_axis_angle(Vec3::x(), -0.4, Vec3::new(-5.0, 0.0, 9.0));
        let p = Vec3::new(2.5, -1.0, 4.0);
        assert_vec_eq(
            (a * b).transform_point(p),
            a.transform_point(b.transform_point(p)),
        );
    }

    #[test]
    fn transform_direction_ignores_translation() {
        let t = Transform::new(Vec3::new(100.0, 200.0, 300.0), UnitQuaternion::identity());
        assert_vec_eq(t.transform_direction(Vec3::z()), Vec3::z());
    }

    #[test]
    fn scale_applies_to_points_and_directions() {
        let t = Transform::with_scale(
            Vec3::zeros(),
            UnitQuaternion::identity(),
            Vec3::new(2.0, 3.0, 4.0),
        );
        assert_vec_eq(
            t.transform_point(Vec3::new(1.0, 1.0, 1.0)),
            Vec3::new(2.0, 3.0, 4.0),
        );
        assert_vec_eq(t.transform_direction(Vec3::x()), Vec3::new(2.0, 0.0, 0.0));
        assert!((t.axis_scale(1) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn set_basis_does_not_touch_rotation() {
        let mut t = Transform::identity();
        let q = Transform::quaternion(0.0, 0.7071, 0.0, 0.7071);
        t.set_rotation(q);
        t.set_basis(Basis::identity());
        // Basis changed, quaternion deliberately did not.
        assert_eq!(t.basis(), Basis::identity());
        assert!((t.rotation().angle() - q.angle()).abs() < 1e-4);
    }

    #[test]
    fn axis_angle_basis_rotates_as_expected() {
        let b = basis_from_axis_angle(Vec3::y(), std::f32::consts::FRAC_PI_2);
        // Rotating +x around +y by 90 degrees lands on -z.
        assert_vec_eq(b * Vec3::x(), Vec3::new(0.0, 0.0, -1.0));
    }
}
