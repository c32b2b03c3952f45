//! Horizon culling against a spherical occluder (typically the globe).
//!
//! Eliminates tiles that are geometrically below the horizon as seen from the
//! camera. Only useful for globe-scale datasets; local datasets pass no occluder.

use glam::DVec3;

/// A sphere that hides everything behind its horizon.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HorizonOccluder {
    pub center: DVec3,
    pub radius: f64,
}

impl HorizonOccluder {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    /// Occluder approximating the WGS84 ellipsoid by its minor radius.
    pub fn wgs84() -> Self {
        Self::new(DVec3::ZERO, 6_356_752.314_245_179)
    }

    /// Precomputes the per-frame horizon cone for a camera position.
    pub fn culler(&self, camera_pos: DVec3) -> HorizonCuller {
        HorizonCuller::new(camera_pos, self.center, self.radius)
    }
}

/// Horizon culling state computed from camera position and occluder geometry.
#[derive(Clone, Debug)]
pub struct HorizonCuller {
    camera_pos: DVec3,
    center: DVec3,
    radius: f64,
    /// Distance from camera to the occluder center.
    camera_distance: f64,
    /// Cosine of the horizon angle, `r / d`.
    cos_horizon: f64,
}

impl HorizonCuller {
    pub fn new(camera_pos: DVec3, center: DVec3, radius: f64) -> Self {
        let camera_distance = (center - camera_pos).length();
        // Camera inside the occluder sees everything.
        let cos_horizon = if camera_distance > radius {
            radius / camera_distance
        } else {
            0.0
        };
        Self {
            camera_pos,
            center,
            radius,
            camera_distance,
            cos_horizon,
        }
    }

    /// Returns `true` if a sphere might be visible above the horizon, `false`
    /// if it is definitely hidden.
    ///
    /// A point at angle `a` from the sub-camera direction (seen from the
    /// center) is above the horizon iff `a < acos(r / d)`; for a bounding
    /// sphere the cone is widened by its angular radius.
    pub fn is_above_horizon(&self, sphere_center: DVec3, sphere_radius: f64) -> bool {
        if self.camera_distance <= self.radius {
            return true;
        }

        let center_to_sphere = sphere_center - self.center;
        let sphere_dist = center_to_sphere.length();
        if sphere_dist < 1e-10 || sphere_radius >= sphere_dist {
            return true;
        }

        let center_to_camera = self.camera_pos - self.center;
        let cos_angle =
            center_to_sphere.dot(center_to_camera) / (sphere_dist * self.camera_distance);

        let sin_margin = sphere_radius / sphere_dist;
        let cos_margin = (1.0 - sin_margin * sin_margin).max(0.0).sqrt();
        let sin_horizon = (1.0 - self.cos_horizon * self.cos_horizon).max(0.0).sqrt();
        // cos(horizon + margin)
        let cos_threshold = self.cos_horizon * cos_margin - sin_horizon * sin_margin;

        cos_angle >= cos_threshold
    }

    pub fn center(&self) -> DVec3 {
        self.center
    }

    /// Straight-line distance from the camera to the horizon tangent point.
    pub fn horizon_distance(&self) -> f64 {
        if self.camera_distance <= self.radius {
            return 0.0;
        }
        (self.camera_distance * self.camera_distance - self.radius * self.radius).sqrt()
    }

    /// Camera altitude above the occluder surface.
    pub fn camera_altitude(&self) -> f64 {
        (self.camera_distance - self.radius).max(0.0)
    }
}
