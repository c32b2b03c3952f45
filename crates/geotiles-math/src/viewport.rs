//! Perspective camera description used for per-frame culling and
//! screen-space error projection.

use glam::{DMat4, DVec3};

use crate::frustum::Frustum;

/// Minimum distance used in screen-space projections, so a camera inside a
/// bounding volume yields a large but finite error.
pub const MIN_PROJECTION_DISTANCE: f64 = 1e-6;

/// A perspective camera in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub position: DVec3,
    /// Normalized view direction.
    pub direction: DVec3,
    /// Normalized up vector.
    pub up: DVec3,
    /// Vertical field of view in radians.
    pub fov_y: f64,
    /// Screen width in pixels.
    pub width: u32,
    /// Screen height in pixels.
    pub height: u32,
    pub near: f64,
    pub far: f64,
}

impl Viewport {
    /// Creates a viewport at `position` looking towards `target`.
    pub fn look_at(
        position: DVec3,
        target: DVec3,
        up: DVec3,
        fov_y: f64,
        width: u32,
        height: u32,
    ) -> Self {
        let direction = (target - position).try_normalize().unwrap_or(DVec3::NEG_Z);
        Self {
            position,
            direction,
            up: up.try_normalize().unwrap_or(DVec3::Y),
            fov_y,
            width,
            height,
            near: 0.1,
            far: 1.0e8,
        }
    }

    pub fn with_clip_planes(mut self, near: f64, far: f64) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    pub fn aspect_ratio(&self) -> f64 {
        f64::from(self.width.max(1)) / f64::from(self.height.max(1))
    }

    pub fn view_projection(&self) -> DMat4 {
        let view = DMat4::look_to_rh(self.position, self.direction, self.up);
        let proj = DMat4::perspective_rh(self.fov_y, self.aspect_ratio(), self.near, self.far);
        proj * view
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    /// `2 * tan(fov_y / 2)`: world units per unit distance spanned by the screen height.
    pub fn sse_denominator(&self) -> f64 {
        2.0 * (self.fov_y * 0.5).tan()
    }

    /// Projects a world-space error at `distance` onto the screen, in pixels.
    ///
    /// Zero error always projects to zero; otherwise the result decreases
    /// monotonically with distance.
    pub fn screen_space_error(&self, geometric_error: f64, distance: f64) -> f64 {
        if geometric_error <= 0.0 {
            return 0.0;
        }
        let distance = distance.max(MIN_PROJECTION_DISTANCE);
        geometric_error * f64::from(self.height) / (distance * self.sse_denominator())
    }

    /// Projected diameter in pixels of a sphere of `radius` at `distance`.
    pub fn projected_diameter(&self, radius: f64, distance: f64) -> f64 {
        self.screen_space_error(2.0 * radius, distance)
    }
}
