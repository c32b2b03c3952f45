//! JSON tileset descriptions (3D Tiles `tileset.json` and I3S-style node
//! metadata) and URL resolution for the content they reference.

use geotiles_math::{BoundingSphere, BoundingVolume, DMat4, DVec3, OrientedBox};
use serde::{Deserialize, Serialize};

use crate::error::TilesetError;
use crate::tile::{LodMetric, Refinement};

/// Asset versions this engine understands.
pub const SUPPORTED_VERSIONS: [&str; 2] = ["0.0", "1.0"];

/// I3S metric type compared against the projected bounding-sphere diameter.
pub const MAX_SCREEN_THRESHOLD: &str = "maxScreenThreshold";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(default)]
    pub version: Option<String>,
    /// Appended to every content URL as `?v=<tilesetVersion>`.
    #[serde(default)]
    pub tileset_version: Option<String>,
    #[serde(default)]
    pub gltf_up_axis: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetDescription {
    #[serde(default)]
    pub asset: Option<Asset>,
    #[serde(default)]
    pub geometric_error: f64,
    #[serde(default)]
    pub root: Option<TileDescription>,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
    #[serde(default)]
    pub extensions_used: Vec<String>,
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDescription {
    #[serde(default)]
    pub bounding_volume: BoundingVolumeDescription,
    #[serde(default)]
    pub geometric_error: f64,
    #[serde(default)]
    pub refine: Option<Refinement>,
    #[serde(default)]
    pub content: Option<ContentDescription>,
    #[serde(default)]
    pub children: Vec<TileDescription>,
    /// Column-major 4x4 matrix applied to this tile and its descendants.
    #[serde(default)]
    pub transform: Option<[f64; 16]>,
    #[serde(default)]
    pub lod_selection: Vec<LodSelection>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingVolumeDescription {
    #[serde(default, rename = "box")]
    pub oriented_box: Option<Vec<f64>>,
    #[serde(default)]
    pub sphere: Option<Vec<f64>>,
    /// `[west, south, east, north, min_height, max_height]`, radians and meters.
    #[serde(default)]
    pub region: Option<Vec<f64>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentDescription {
    #[serde(default)]
    pub uri: Option<String>,
    /// Pre-1.0 spelling of `uri`.
    #[serde(default)]
    pub url: Option<String>,
}

impl ContentDescription {
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref().or(self.url.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LodSelection {
    pub metric_type: String,
    pub max_error: f64,
}

impl TilesetDescription {
    /// Parses and validates a description.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TilesetError> {
        let description: Self = serde_json::from_slice(bytes)?;
        description.validate()?;
        Ok(description)
    }

    /// Checks the asset block, version and root presence.
    pub fn validate(&self) -> Result<(), TilesetError> {
        let asset = self.asset.as_ref().ok_or(TilesetError::MissingAsset)?;
        match asset.version.as_deref() {
            Some(v) if SUPPORTED_VERSIONS.contains(&v) => {}
            Some(v) => return Err(TilesetError::UnsupportedVersion(v.to_owned())),
            None => return Err(TilesetError::UnsupportedVersion("<missing>".to_owned())),
        }
        if self.root.is_none() {
            return Err(TilesetError::MissingRoot);
        }
        Ok(())
    }

    pub fn tileset_version(&self) -> Option<&str> {
        self.asset.as_ref()?.tileset_version.as_deref()
    }

    /// Number of tiles described, including the root.
    pub fn tile_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&TileDescription> = self.root.iter().collect();
        while let Some(tile) = stack.pop() {
            count += 1;
            stack.extend(tile.children.iter());
        }
        count
    }
}

impl TileDescription {
    /// The LOD metric, preferring an I3S `maxScreenThreshold` selection when present.
    pub fn lod_metric(&self) -> LodMetric {
        self.lod_selection
            .iter()
            .find(|s| s.metric_type == MAX_SCREEN_THRESHOLD)
            .map_or(LodMetric::GeometricError, |s| {
                LodMetric::MaxScreenThreshold(s.max_error)
            })
    }

    pub fn local_transform(&self) -> DMat4 {
        self.transform
            .map_or(DMat4::IDENTITY, |cols| DMat4::from_cols_array(&cols))
    }
}

impl BoundingVolumeDescription {
    /// Builds a world-space volume. Boxes and spheres are expressed in the
    /// tile's frame and are moved by `world`; regions are already geographic.
    pub fn to_volume(&self, world: &DMat4) -> Result<BoundingVolume, TilesetError> {
        if let Some(values) = &self.oriented_box {
            let values: &[f64; 12] = values.as_slice().try_into().map_err(|_| {
                TilesetError::InvalidBoundingVolume(format!(
                    "box needs 12 numbers, got {}",
                    values.len()
                ))
            })?;
            check_finite(values)?;
            return Ok(BoundingVolume::Box(OrientedBox::from_array(values)).transform(world));
        }
        if let Some(values) = &self.sphere {
            let [x, y, z, r]: [f64; 4] = values.as_slice().try_into().map_err(|_| {
                TilesetError::InvalidBoundingVolume(format!(
                    "sphere needs 4 numbers, got {}",
                    values.len()
                ))
            })?;
            check_finite(values)?;
            if r < 0.0 {
                return Err(TilesetError::InvalidBoundingVolume(format!(
                    "negative sphere radius {r}"
                )));
            }
            let sphere = BoundingSphere::new(DVec3::new(x, y, z), r);
            return Ok(BoundingVolume::Sphere(sphere).transform(world));
        }
        if let Some(values) = &self.region {
            let values: &[f64; 6] = values.as_slice().try_into().map_err(|_| {
                TilesetError::InvalidBoundingVolume(format!(
                    "region needs 6 numbers, got {}",
                    values.len()
                ))
            })?;
            check_finite(values)?;
            return Ok(BoundingVolume::from_region(values));
        }
        Err(TilesetError::InvalidBoundingVolume(
            "no box, sphere, or region".to_owned(),
        ))
    }
}

fn check_finite(values: &[f64]) -> Result<(), TilesetError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(TilesetError::InvalidBoundingVolume(
            "non-finite component".to_owned(),
        ))
    }
}

/// Directory part of `url`, including the trailing slash.
pub fn base_path(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rfind('/') {
        Some(i) => &path[..=i],
        None => "",
    }
}

/// Resolves `uri` against `base` and appends the tileset version query.
pub fn resolve_url(base: &str, uri: &str, tileset_version: Option<&str>) -> String {
    let uri = uri.strip_prefix("./").unwrap_or(uri);
    let mut resolved = if uri.contains("://") || uri.starts_with('/') || base.is_empty() {
        uri.to_owned()
    } else {
        format!("{base}{uri}")
    };
    if let Some(version) = tileset_version {
        let separator = if resolved.contains('?') { '&' } else { '?' };
        resolved.push(separator);
        resolved.push_str("v=");
        resolved.push_str(version);
    }
    resolved
}
