//! Value types shared by the measurement cycle and data reduction.

use crate::motion::RotationPosition;
use serde::{Deserialize, Serialize};
use std::fmt;
use nalgebra::{ArrayStorage, Vector3};
use std::ops::{Add, Deref, DerefMut, Index, IndexMut, Mul, Sub};

/// Magnetometer (or sample) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Transverse axis X
    X,
    /// Transverse axis Y
    Y,
    /// Axial axis Z (along the handler tube, the rotation axis)
    Z,
}

impl Axis {
    /// All three axes in X, Y, Z order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Single-letter code used on the wire.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }

    /// Index into X/Y/Z arrays.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A set of axes, e.g. the magnetometer axes physically present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisSet {
    /// X present
    pub x: bool,
    /// Y present
    pub y: bool,
    /// Z present
    pub z: bool,
}

impl AxisSet {
    /// All three axes.
    pub const fn all() -> Self {
        Self {
            x: true,
            y: true,
            z: true,
        }
    }

    /// No axes.
    pub const fn none() -> Self {
        Self {
            x: false,
            y: false,
            z: false,
        }
    }

    /// Build from a list of axes.
    pub fn of(axes: &[Axis]) -> Self {
        let mut set = Self::none();
        for axis in axes {
            set.insert(*axis);
        }
        set
    }

    /// Whether `axis` is in the set.
    pub fn contains(&self, axis: Axis) -> bool {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Add `axis` to the set.
    pub fn insert(&mut self, axis: Axis) {
        match axis {
            Axis::X => self.x = true,
            Axis::Y => self.y = true,
            Axis::Z => self.z = true,
        }
    }

    /// Iterate the axes in the set, X first.
    pub fn iter(&self) -> impl Iterator<Item = Axis> + '_ {
        Axis::ALL.into_iter().filter(|a| self.contains(*a))
    }

    /// Number of axes in the set.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True when no axis is set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Three-component vector (emu, or any per-axis quantity).
///
/// Wraps a nalgebra `Vector3<f64>`; components read as `v.x`, `v.y`, `v.z`
/// and the linear algebra (`norm`, `dot`, `cross`) comes from nalgebra.
/// Serialized as an `{ x, y, z }` table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Components", into = "Components")]
pub struct Vec3(Vector3<f64>);

#[derive(Serialize, Deserialize)]
struct Components {
    x: f64,
    y: f64,
    z: f64,
}

impl From<Components> for Vec3 {
    fn from(c: Components) -> Self {
        Vec3::new(c.x, c.y, c.z)
    }
}

impl From<Vec3> for Components {
    fn from(v: Vec3) -> Self {
        Components {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

impl Vec3 {
    /// Zero vector.
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    /// Construct from components.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self(Vector3::from_array_storage(ArrayStorage([[x, y, z]])))
    }

    /// Component for `axis`.
    pub fn get(&self, axis: Axis) -> f64 {
        self[axis]
    }

    /// The underlying nalgebra vector.
    pub fn into_inner(self) -> Vector3<f64> {
        self.0
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Vec3::ZERO
    }
}

impl From<Vector3<f64>> for Vec3 {
    fn from(v: Vector3<f64>) -> Self {
        Self(v)
    }
}

impl Deref for Vec3 {
    type Target = Vector3<f64>;

    fn deref(&self) -> &Vector3<f64> {
        &self.0
    }
}

impl DerefMut for Vec3 {
    fn deref_mut(&mut self) -> &mut Vector3<f64> {
        &mut self.0
    }
}

impl Index<Axis> for Vec3 {
    type Output = f64;

    fn index(&self, axis: Axis) -> &f64 {
        &self.0[axis.index()]
    }
}

impl IndexMut<Axis> for Vec3 {
    fn index_mut(&mut self, axis: Axis) -> &mut f64 {
        &mut self.0[axis.index()]
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3(self.0 + rhs.0)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3(self.0 - rhs.0)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        Vec3(self.0 * rhs)
    }
}

/// Which end of the sample faced +Z when it was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZOrientation {
    /// Sample loaded upright; sample +Z along magnetometer +Z
    #[default]
    PlusZ,
    /// Sample loaded inverted (turned over about its Y axis)
    MinusZ,
}

/// One raw reading set taken at a rotation position (emu, magnetometer frame).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Rotation position the sample was at
    pub rotation: RotationPosition,
    /// Per-axis emu values; absent axes are zero
    pub moment: Vec3,
}

/// Background readings bracketing a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Background {
    /// Empty-tube reading before the sample is measured
    pub before: Vec3,
    /// Empty-tube reading after the sample is measured
    pub after: Vec3,
}

impl Background {
    /// Drift over the cycle: after − before per axis.
    pub fn drift(&self) -> Vec3 {
        self.after - self.before
    }
}

/// Raw output of one completed measurement cycle.
///
/// Consumed immediately by data reduction; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    /// Magnetometer axes that produced data
    pub axes: AxisSet,
    /// How the sample was loaded
    pub orientation: ZOrientation,
    /// Readings in the order taken
    pub readings: Vec<Reading>,
    /// Bracketing background readings
    pub background: Background,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_set_iterates_in_order() {
        let set = AxisSet::of(&[Axis::Z, Axis::X]);
        let axes: Vec<Axis> = set.iter().collect();
        assert_eq!(axes, vec![Axis::X, Axis::Z]);
        assert_eq!(set.len(), 2);
        assert!(!set.contains(Axis::Y));
    }

    #[test]
    fn vec3_arithmetic() {
        let a = Vec3::new(1.0, 2.0, 2.0);
        assert_eq!(a.norm(), 3.0);
        assert_eq!(a - a, Vec3::ZERO);
        assert_eq!((a + a)[Axis::Y], 4.0);
        assert_eq!((a * 0.5).z, 1.0);
    }

    #[test]
    fn vec3_serializes_as_a_component_table() {
        let json = serde_json::to_value(Vec3::new(1.0, -2.0, 0.5)).unwrap();
        assert_eq!(json, serde_json::json!({ "x": 1.0, "y": -2.0, "z": 0.5 }));
        let back: Vec3 = serde_json::from_value(json).unwrap();
        assert_eq!(back.cross(&Vector3::z()).x, -2.0);
    }

    #[test]
    fn drift_is_after_minus_before() {
        let bg = Background {
            before: Vec3::new(1.0, 1.0, 1.0),
            after: Vec3::new(2.0, 0.5, 1.0),
        };
        assert_eq!(bg.drift(), Vec3::new(1.0, -0.5, 0.0));
    }
}
