//! f64 world-space geometry for tile streaming: bounding volumes, view frustum,
//! perspective viewport, and horizon occlusion.

mod bounds;
mod frustum;
mod horizon;
mod viewport;

pub use bounds::{
    BoundingSphere, BoundingVolume, OrientedBox, PlaneSide, geodetic_to_ecef,
};
pub use frustum::{Frustum, Intersection, Plane};
pub use horizon::{HorizonCuller, HorizonOccluder};
pub use viewport::{MIN_PROJECTION_DISTANCE, Viewport};

pub use glam::{DMat3, DMat4, DQuat, DVec3};
