//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! It avoids SIMD/unsafe and focuses on stable semantics.

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn abs(self) -> Self {
        Self::new(self.x.abs(), self.y.abs(), self.z.abs())
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }
}

/// Unit quaternion (conceptually). Kept minimal for now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotation of `degrees` around the up (Z) axis.
    pub fn from_yaw_degrees(degrees: f32) -> Self {
        let half = degrees.to_radians() * 0.5;
        Self {
            x: 0.0,
            y: 0.0,
            z: half.sin(),
            w: half.cos(),
        }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Position plus orientation of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    /// Canonical pose used when a scene registers no spawn points.
    pub const ORIGIN: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub const fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }
}

/// A spawn volume: positions are drawn from the box `origin ± extent`,
/// rotation is always `rotation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SpawnPoint {
    pub origin: Vec3,
    /// Half-size of the box on each axis. Negative components are treated as positive.
    #[serde(default)]
    pub extent: Vec3,
    #[serde(default)]
    pub rotation: Quat,
}

impl SpawnPoint {
    pub fn new(origin: Vec3, extent: Vec3, rotation: Quat) -> Self {
        Self {
            origin,
            extent: extent.abs(),
            rotation,
        }
    }

    /// Returns true if `p` lies inside the spawn volume.
    pub fn contains(&self, p: Vec3) -> bool {
        let d = p.sub(self.origin).abs();
        let e = self.extent.abs();
        d.x <= e.x && d.y <= e.y && d.z <= e.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_point_contains_its_box() {
        let sp = SpawnPoint::new(
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(-2.0, 2.0, 0.0),
            Quat::IDENTITY,
        );
        assert!(sp.contains(Vec3::new(11.5, -1.0, 0.0)));
        assert!(!sp.contains(Vec3::new(13.0, 0.0, 0.0)));
        assert!(!sp.contains(Vec3::new(10.0, 0.0, 0.5)));
    }

    #[test]
    fn yaw_zero_is_identity() {
        assert_eq!(Quat::from_yaw_degrees(0.0), Quat::IDENTITY);
    }
}
