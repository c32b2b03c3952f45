//! View frustum culling in f64 world space using planes extracted from a
//! view-projection matrix.

use glam::{DMat4, DVec3, DVec4};

use crate::bounds::{BoundingVolume, PlaneSide};

/// Plane indices into the frustum planes array.
const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const NEAR: usize = 4;
const FAR: usize = 5;

/// A plane `normal.dot(p) + distance = 0`. Points with a positive signed
/// distance are on the inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: DVec3,
    pub distance: f64,
}

impl Plane {
    pub fn new(normal: DVec3, distance: f64) -> Self {
        Self { normal, distance }
    }

    fn from_coefficients(v: DVec4) -> Self {
        let normal = v.truncate();
        let len = normal.length();
        if len > 0.0 {
            Self::new(normal / len, v.w / len)
        } else {
            Self::new(normal, v.w)
        }
    }

    pub fn signed_distance(&self, point: DVec3) -> f64 {
        self.normal.dot(point) + self.distance
    }
}

/// Result of testing a volume against the whole frustum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intersection {
    Inside,
    Outside,
    Intersecting,
}

/// A view frustum defined by six inward-pointing planes.
#[derive(Clone, Debug)]
pub struct Frustum {
    /// Left, right, bottom, top, near, far.
    planes: [Plane; 6],
}

impl Frustum {
    /// Extracts the planes of a view-projection matrix with a `[0, 1]` depth
    /// range (as produced by `DMat4::perspective_rh`), Griggs-Hartmann style.
    pub fn from_view_projection(vp: &DMat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];

        let mut planes = [Plane::new(DVec3::ZERO, 0.0); 6];
        planes[LEFT] = Plane::from_coefficients(rows[3] + rows[0]);
        planes[RIGHT] = Plane::from_coefficients(rows[3] - rows[0]);
        planes[BOTTOM] = Plane::from_coefficients(rows[3] + rows[1]);
        planes[TOP] = Plane::from_coefficients(rows[3] - rows[1]);
        planes[NEAR] = Plane::from_coefficients(rows[2]);
        planes[FAR] = Plane::from_coefficients(rows[3] - rows[2]);

        Self { planes }
    }

    pub fn planes(&self) -> &[Plane; 6] {
        &self.planes
    }

    /// Classifies a bounding volume. Conservative: volumes near frustum corners
    /// may be reported as intersecting while lying outside.
    pub fn intersect(&self, volume: &BoundingVolume) -> Intersection {
        let mut intersecting = false;
        for plane in &self.planes {
            match volume.intersect_plane(plane) {
                PlaneSide::Outside => return Intersection::Outside,
                PlaneSide::Intersecting => intersecting = true,
                PlaneSide::Inside => {}
            }
        }
        if intersecting {
            Intersection::Intersecting
        } else {
            Intersection::Inside
        }
    }

    /// Returns `true` if the volume is at least partially inside the frustum.
    pub fn is_visible(&self, volume: &BoundingVolume) -> bool {
        self.intersect(volume) != Intersection::Outside
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{BoundingSphere, OrientedBox};
    use glam::DMat3;

    fn default_frustum() -> Frustum {
        let view = DMat4::look_to_rh(DVec3::ZERO, DVec3::NEG_Z, DVec3::Y);
        let proj = DMat4::perspective_rh(std::f64::consts::FRAC_PI_4, 16.0 / 9.0, 0.1, 1000.0);
        Frustum::from_view_projection(&(proj * view))
    }

    fn sphere(x: f64, y: f64, z: f64, r: f64) -> BoundingVolume {
        BoundingVolume::Sphere(BoundingSphere::new(DVec3::new(x, y, z), r))
    }

    #[test]
    fn test_object_in_front_visible() {
        let f = default_frustum();
        assert_eq!(f.intersect(&sphere(0.0, 0.0, -10.0, 1.0)), Intersection::Inside);
    }

    #[test]
    fn test_object_behind_camera_not_visible() {
        let f = default_frustum();
        assert!(!f.is_visible(&sphere(0.0, 0.0, 10.0, 1.0)));
    }

    #[test]
    fn test_object_far_to_the_side_not_visible() {
        let f = default_frustum();
        assert!(!f.is_visible(&sphere(1000.0, 0.0, -5.0, 1.0)));
    }

    #[test]
    fn test_object_beyond_far_plane_not_visible() {
        let f = default_frustum();
        assert!(!f.is_visible(&sphere(0.0, 0.0, -2000.0, 1.0)));
    }

    #[test]
    fn test_object_straddling_plane_intersects() {
        let f = default_frustum();
        let b = BoundingVolume::Box(OrientedBox::new(
            DVec3::new(0.0, 0.0, -10.0),
            DMat3::from_diagonal(DVec3::new(100.0, 1.0, 1.0)),
        ));
        assert_eq!(f.intersect(&b), Intersection::Intersecting);
    }

    /// All six planes point inward, so the camera axis point is inside every one.
    #[test]
    fn test_planes_are_normalized_and_inward() {
        let f = default_frustum();
        let probe = DVec3::new(0.0, 0.0, -50.0);
        for plane in f.planes() {
            assert!((plane.normal.length() - 1.0).abs() < 1e-9);
            assert!(plane.signed_distance(probe) > 0.0);
        }
    }
}
