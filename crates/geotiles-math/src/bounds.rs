//! Bounding volumes for tile hierarchies: oriented boxes, spheres, and
//! geographic regions (converted to a conservative sphere on construction).

use glam::{DMat3, DMat4, DVec3};

use crate::frustum::Plane;

/// WGS84 semi-major axis in meters.
const WGS84_RADIUS_EQUATOR: f64 = 6_378_137.0;
/// WGS84 semi-minor axis in meters.
const WGS84_RADIUS_POLAR: f64 = 6_356_752.314_245_179;

/// Result of testing a volume against a single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    /// Entirely on the positive (inside) half-space.
    Inside,
    /// Entirely on the negative (outside) half-space.
    Outside,
    /// Straddles the plane.
    Intersecting,
}

/// A sphere in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: DVec3,
    pub radius: f64,
}

impl BoundingSphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self {
            center,
            radius: radius.max(0.0),
        }
    }

    /// Smallest sphere centered on the centroid of `points` that encloses all of them.
    pub fn from_points(points: &[DVec3]) -> Self {
        if points.is_empty() {
            return Self::new(DVec3::ZERO, 0.0);
        }
        let center = points.iter().copied().sum::<DVec3>() / points.len() as f64;
        let radius = points
            .iter()
            .map(|p| p.distance(center))
            .fold(0.0_f64, f64::max);
        Self::new(center, radius)
    }

    /// Distance from `point` to the sphere surface, 0 when inside.
    pub fn distance_to(&self, point: DVec3) -> f64 {
        (point.distance(self.center) - self.radius).max(0.0)
    }

    /// Smallest sphere enclosing both spheres.
    pub fn union(&self, other: &Self) -> Self {
        let offset = other.center - self.center;
        let distance = offset.length();
        if distance + other.radius <= self.radius {
            return *self;
        }
        if distance + self.radius <= other.radius {
            return *other;
        }
        let radius = (distance + self.radius + other.radius) * 0.5;
        let center = self.center + offset * ((radius - self.radius) / distance);
        Self::new(center, radius)
    }

    pub fn intersect_plane(&self, plane: &Plane) -> PlaneSide {
        let d = plane.signed_distance(self.center);
        if d < -self.radius {
            PlaneSide::Outside
        } else if d < self.radius {
            PlaneSide::Intersecting
        } else {
            PlaneSide::Inside
        }
    }

    /// Applies an affine transform. The radius scales by the largest axis scale.
    pub fn transform(&self, m: &DMat4) -> Self {
        let scale = m
            .x_axis
            .truncate()
            .length()
            .max(m.y_axis.truncate().length())
            .max(m.z_axis.truncate().length());
        Self::new(m.transform_point3(self.center), self.radius * scale)
    }
}

/// An oriented bounding box: a center plus three half-axis vectors (the columns of `half_axes`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedBox {
    pub center: DVec3,
    pub half_axes: DMat3,
}

impl OrientedBox {
    pub fn new(center: DVec3, half_axes: DMat3) -> Self {
        Self { center, half_axes }
    }

    /// Builds a box from the 3D Tiles 12-number layout: center, then x, y, z half-axes.
    pub fn from_array(values: &[f64; 12]) -> Self {
        Self {
            center: DVec3::new(values[0], values[1], values[2]),
            half_axes: DMat3::from_cols(
                DVec3::new(values[3], values[4], values[5]),
                DVec3::new(values[6], values[7], values[8]),
                DVec3::new(values[9], values[10], values[11]),
            ),
        }
    }

    /// Distance from `point` to the box, 0 when inside.
    pub fn distance_to(&self, point: DVec3) -> f64 {
        let offset = point - self.center;
        let mut distance_sq = 0.0;
        for axis in [
            self.half_axes.x_axis,
            self.half_axes.y_axis,
            self.half_axes.z_axis,
        ] {
            let half_len = axis.length();
            if half_len <= f64::EPSILON {
                continue;
            }
            let projected = offset.dot(axis / half_len);
            let excess = projected.abs() - half_len;
            if excess > 0.0 {
                distance_sq += excess * excess;
            }
        }
        distance_sq.sqrt()
    }

    pub fn intersect_plane(&self, plane: &Plane) -> PlaneSide {
        let n = plane.normal;
        let radius = self.half_axes.x_axis.dot(n).abs()
            + self.half_axes.y_axis.dot(n).abs()
            + self.half_axes.z_axis.dot(n).abs();
        let d = plane.signed_distance(self.center);
        if d < -radius {
            PlaneSide::Outside
        } else if d < radius {
            PlaneSide::Intersecting
        } else {
            PlaneSide::Inside
        }
    }

    pub fn bounding_sphere(&self) -> BoundingSphere {
        let diagonal = self.half_axes.x_axis + self.half_axes.y_axis + self.half_axes.z_axis;
        let radius = [
            diagonal,
            self.half_axes.x_axis + self.half_axes.y_axis - self.half_axes.z_axis,
            self.half_axes.x_axis - self.half_axes.y_axis + self.half_axes.z_axis,
            -self.half_axes.x_axis + self.half_axes.y_axis + self.half_axes.z_axis,
        ]
        .iter()
        .map(|v| v.length())
        .fold(0.0_f64, f64::max);
        BoundingSphere::new(self.center, radius)
    }

    pub fn transform(&self, m: &DMat4) -> Self {
        let linear = DMat3::from_mat4(*m);
        Self {
            center: m.transform_point3(self.center),
            half_axes: linear * self.half_axes,
        }
    }
}

/// A tile's bounding volume in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingVolume {
    Box(OrientedBox),
    Sphere(BoundingSphere),
}

impl BoundingVolume {
    /// Converts a geographic region (`[west, south, east, north, min_height, max_height]`,
    /// radians and meters on the WGS84 ellipsoid) into a sphere enclosing its corners
    /// and edge midpoints.
    pub fn from_region(region: &[f64; 6]) -> Self {
        let [west, south, east, north, min_h, max_h] = *region;
        let mid_lon = (west + east) * 0.5;
        let mid_lat = (south + north) * 0.5;
        let mut points = Vec::with_capacity(18);
        for height in [min_h, max_h] {
            for lon in [west, mid_lon, east] {
                for lat in [south, mid_lat, north] {
                    points.push(geodetic_to_ecef(lon, lat, height));
                }
            }
        }
        BoundingVolume::Sphere(BoundingSphere::from_points(&points))
    }

    pub fn distance_to(&self, point: DVec3) -> f64 {
        match self {
            BoundingVolume::Box(b) => b.distance_to(point),
            BoundingVolume::Sphere(s) => s.distance_to(point),
        }
    }

    pub fn intersect_plane(&self, plane: &Plane) -> PlaneSide {
        match self {
            BoundingVolume::Box(b) => b.intersect_plane(plane),
            BoundingVolume::Sphere(s) => s.intersect_plane(plane),
        }
    }

    pub fn center(&self) -> DVec3 {
        match self {
            BoundingVolume::Box(b) => b.center,
            BoundingVolume::Sphere(s) => s.center,
        }
    }

    pub fn bounding_sphere(&self) -> BoundingSphere {
        match self {
            BoundingVolume::Box(b) => b.bounding_sphere(),
            BoundingVolume::Sphere(s) => *s,
        }
    }

    pub fn transform(&self, m: &DMat4) -> Self {
        match self {
            BoundingVolume::Box(b) => BoundingVolume::Box(b.transform(m)),
            BoundingVolume::Sphere(s) => BoundingVolume::Sphere(s.transform(m)),
        }
    }
}

/// Geodetic longitude/latitude (radians) and ellipsoidal height (meters) to
/// Earth-centered, Earth-fixed coordinates on WGS84.
pub fn geodetic_to_ecef(lon: f64, lat: f64, height: f64) -> DVec3 {
    let a2 = WGS84_RADIUS_EQUATOR * WGS84_RADIUS_EQUATOR;
    let b2 = WGS84_RADIUS_POLAR * WGS84_RADIUS_POLAR;
    let e2 = 1.0 - b2 / a2;
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    let n = WGS84_RADIUS_EQUATOR / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    DVec3::new(
        (n + height) * cos_lat * cos_lon,
        (n + height) * cos_lat * sin_lon,
        (n * (1.0 - e2) + height) * sin_lat,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> OrientedBox {
        OrientedBox::from_array(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// Points inside a volume are at distance zero.
    #[test]
    fn test_distance_inside_is_zero() {
        assert_eq!(unit_box().distance_to(DVec3::new(0.5, -0.5, 0.2)), 0.0);
        let sphere = BoundingSphere::new(DVec3::ZERO, 2.0);
        assert_eq!(sphere.distance_to(DVec3::new(1.0, 1.0, 0.0)), 0.0);
    }

    #[test]
    fn test_sphere_union_encloses_both() {
        let a = BoundingSphere::new(DVec3::new(-5.0, 0.0, 0.0), 5.0);
        let b = BoundingSphere::new(DVec3::new(5.0, 0.0, 0.0), 5.0);
        let u = a.union(&b);
        assert!(u.center.length() < 1e-12);
        assert!((u.radius - 10.0).abs() < 1e-12);

        let inner = BoundingSphere::new(DVec3::new(1.0, 0.0, 0.0), 1.0);
        assert_eq!(u.union(&inner), u);
        assert_eq!(inner.union(&u), u);
    }

    /// Distance to a box is measured to its nearest face or edge.
    #[test]
    fn test_box_distance_outside() {
        let b = unit_box();
        assert!((b.distance_to(DVec3::new(3.0, 0.0, 0.0)) - 2.0).abs() < 1e-12);
        let corner = b.distance_to(DVec3::new(2.0, 2.0, 0.0));
        assert!((corner - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    /// A box rotated by its half-axes still measures distance along its own axes.
    #[test]
    fn test_rotated_box_distance() {
        let b = OrientedBox::new(
            DVec3::ZERO,
            DMat3::from_cols(DVec3::new(0.0, 1.0, 0.0), DVec3::new(-3.0, 0.0, 0.0), DVec3::Z),
        );
        assert!((b.distance_to(DVec3::new(5.0, 0.0, 0.0)) - 2.0).abs() < 1e-12);
        assert!((b.distance_to(DVec3::new(0.0, 5.0, 0.0)) - 4.0).abs() < 1e-12);
    }

    /// Plane classification respects the sphere radius.
    #[test]
    fn test_sphere_plane_sides() {
        let plane = Plane::new(DVec3::X, 0.0);
        let s = BoundingSphere::new(DVec3::new(5.0, 0.0, 0.0), 1.0);
        assert_eq!(s.intersect_plane(&plane), PlaneSide::Inside);
        let s = BoundingSphere::new(DVec3::new(0.5, 0.0, 0.0), 1.0);
        assert_eq!(s.intersect_plane(&plane), PlaneSide::Intersecting);
        let s = BoundingSphere::new(DVec3::new(-5.0, 0.0, 0.0), 1.0);
        assert_eq!(s.intersect_plane(&plane), PlaneSide::Outside);
    }

    /// The bounding sphere of a box encloses its corners.
    #[test]
    fn test_box_bounding_sphere_encloses_corners() {
        let s = unit_box().bounding_sphere();
        assert!((s.radius - 3.0_f64.sqrt()).abs() < 1e-12);
    }

    /// Transforms translate centers and scale extents.
    #[test]
    fn test_transform_translates_and_scales() {
        let m = DMat4::from_scale_rotation_translation(
            DVec3::splat(2.0),
            glam::DQuat::IDENTITY,
            DVec3::new(10.0, 0.0, 0.0),
        );
        let s = BoundingSphere::new(DVec3::ZERO, 1.0).transform(&m);
        assert_eq!(s.center, DVec3::new(10.0, 0.0, 0.0));
        assert!((s.radius - 2.0).abs() < 1e-12);
        let b = unit_box().transform(&m);
        assert!((b.distance_to(DVec3::new(15.0, 0.0, 0.0)) - 3.0).abs() < 1e-12);
    }

    /// A small region near the equator becomes a sphere close to the Earth's surface.
    #[test]
    fn test_region_converts_to_surface_sphere() {
        let region = [0.0, 0.0, 0.001, 0.001, 0.0, 100.0];
        let BoundingVolume::Sphere(s) = BoundingVolume::from_region(&region) else {
            panic!("region should convert to a sphere");
        };
        let surface_distance = s.center.length();
        assert!((surface_distance - WGS84_RADIUS_EQUATOR).abs() < 200.0);
        assert!(s.radius > 1000.0 && s.radius < 10_000.0);
    }
}
