use nalgebra::{Vector2, Vector3};
use std::f32::consts::PI;

/// Area light is a disk light source that always faces the point being lit. Example:
/// a lamp with a soft shade.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AreaLight {
    /// Position of light center in world coordinates.
    pub position: Vector3<f32>,
    /// Diameter of light footprint. Zero makes a point light with hard shadows.
    pub size: f32,
    /// Color of light.
    pub color: Vector3<f32>,
    /// Intensity is how bright light is. Default is 1.0.
    pub intensity: f32,
}

impl Default for AreaLight {
    fn default() -> Self {
        Self {
            position: Vector3::new(0.0, 1.0, 1.0).normalize(),
            size: 1.0,
            color: Vector3::new(1.0, 1.0, 1.0),
            intensity: 1.0,
        }
    }
}

impl AreaLight {
    /// Radiance that reaches a point that fully sees the light.
    pub fn radiance(&self) -> Vector3<f32> {
        self.color.scale(self.intensity)
    }

    /// Maps a point of unit square to a point on the light disk oriented towards
    /// `target`.
    pub fn sample_point(&self, target: Vector3<f32>, u: Vector2<f32>) -> Vector3<f32> {
        let radius = self.size * 0.5;
        if radius <= 0.0 {
            return self.position;
        }
        let axis = (target - self.position)
            .try_normalize(f32::EPSILON)
            .unwrap_or_else(Vector3::y);
        let (tangent, bitangent) = orthonormal_basis(axis);
        let r = radius * u.x.sqrt();
        let phi = 2.0 * PI * u.y;
        self.position + tangent.scale(r * phi.cos()) + bitangent.scale(r * phi.sin())
    }
}

/// Builds two unit vectors perpendicular to `n` and to each other.
pub fn orthonormal_basis(n: Vector3<f32>) -> (Vector3<f32>, Vector3<f32>) {
    let helper = if n.x.abs() > 0.9 {
        Vector3::y()
    } else {
        Vector3::x()
    };
    let tangent = helper.cross(&n).normalize();
    let bitangent = n.cross(&tangent);
    (tangent, bitangent)
}

/// Cosine-weighted direction on a hemisphere around `normal`.
pub fn cosine_hemisphere(normal: Vector3<f32>, u: Vector2<f32>) -> Vector3<f32> {
    let (tangent, bitangent) = orthonormal_basis(normal);
    let r = u.x.sqrt();
    let phi = 2.0 * PI * u.y;
    let z = (1.0 - u.x).max(0.0).sqrt();
    (tangent.scale(r * phi.cos()) + bitangent.scale(r * phi.sin()) + normal.scale(z))
        .try_normalize(f32::EPSILON)
        .unwrap_or(normal)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_disk_samples_face_target() {
        let light = AreaLight {
            position: Vector3::new(0.0, 5.0, 0.0),
            size: 2.0,
            ..Default::default()
        };
        for i in 0..16 {
            let u = Vector2::new(i as f32 / 16.0, (i * 7 % 16) as f32 / 16.0);
            let p = light.sample_point(Vector3::default(), u);
            assert!((p.y - 5.0).abs() < 1.0e-5);
            assert!((p - light.position).norm() <= 1.0 + 1.0e-5);
        }
    }

    #[test]
    fn test_point_light() {
        let light = AreaLight {
            size: 0.0,
            ..Default::default()
        };
        let p = light.sample_point(Vector3::new(3.0, 0.0, 0.0), Vector2::new(0.7, 0.2));
        assert_eq!(p, light.position);
    }

    #[test]
    fn test_cosine_hemisphere() {
        let normal = Vector3::new(1.0, 1.0, 0.0).normalize();
        for i in 0..32 {
            let u = Vector2::new((i as f32 + 0.5) / 32.0, (i * 13 % 32) as f32 / 32.0);
            let d = cosine_hemisphere(normal, u);
            assert!((d.norm() - 1.0).abs() < 1.0e-5);
            assert!(d.dot(&normal) >= 0.0);
        }
    }
}
