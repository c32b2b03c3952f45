//! A generated quadtree tileset served from memory.
//!
//! Level `l` splits a square of side `extent` into `2^l x 2^l` boxes. Every
//! tile carries a point cloud; the geometric error halves per level and is
//! zero at the leaves.

use std::time::Duration;

use geotiles_tiles::{
    ContentDecoder, DecodeError, DecodedContent, FetchError, FetchedContent, Fetcher,
    PointCloudContent, TileContent, TileMetadata,
};
use serde_json::{Value, json};

pub const ROOT_URL: &str = "tileset.json";

/// Box half-height of every tile, in meters.
const TILE_HALF_HEIGHT: f64 = 10.0;

/// Points generated per tile edge.
const GRID: usize = 16;

pub struct SyntheticTileset {
    depth: u32,
    description: Vec<u8>,
    latency: Duration,
}

impl SyntheticTileset {
    pub fn new(depth: u32, extent: f64, latency: Duration) -> Result<Self, serde_json::Error> {
        let root = tile_json(depth, extent, 0, 0, 0);
        let description = json!({
            "asset": { "version": "1.0", "tilesetVersion": "synthetic" },
            "geometricError": geometric_error(extent, 0) * 2.0,
            "root": root,
        });
        Ok(Self {
            depth,
            description: serde_json::to_vec(&description)?,
            latency,
        })
    }

    /// Number of tiles in the generated tree.
    pub fn tile_count(&self) -> u64 {
        (0..=self.depth).map(|l| 4u64.pow(l)).sum()
    }

    /// Parses `tiles/<level>/<x>/<y>.pnts`, ignoring the version query.
    fn parse_tile_url(&self, url: &str) -> Option<(u32, u32, u32)> {
        let path = url.split('?').next()?;
        let rest = path.strip_prefix("tiles/")?.strip_suffix(".pnts")?;
        let mut parts = rest.split('/').map(str::parse::<u32>);
        let (level, x, y) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
        let span = 1u32.checked_shl(level)?;
        (parts.next().is_none() && level <= self.depth && x < span && y < span)
            .then_some((level, x, y))
    }
}

impl Fetcher for SyntheticTileset {
    fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if url == ROOT_URL {
            return Ok(FetchedContent::new(self.description.clone()));
        }
        let (level, x, y) = self
            .parse_tile_url(url)
            .ok_or_else(|| FetchError::NotFound(url.to_owned()))?;
        Ok(FetchedContent::new(format!("{level}/{x}/{y}").into_bytes()))
    }
}

fn geometric_error(extent: f64, level: u32) -> f64 {
    extent / f64::from(1u32 << level) / 16.0
}

fn tile_json(depth: u32, extent: f64, level: u32, x: u32, y: u32) -> Value {
    let span = f64::from(1u32 << level);
    let size = extent / span;
    let cx = -extent * 0.5 + (f64::from(x) + 0.5) * size;
    let cy = -extent * 0.5 + (f64::from(y) + 0.5) * size;
    let half = size * 0.5;

    let children: Vec<Value> = if level < depth {
        (0..2)
            .flat_map(|dy| (0..2).map(move |dx| (dx, dy)))
            .map(|(dx, dy)| tile_json(depth, extent, level + 1, x * 2 + dx, y * 2 + dy))
            .collect()
    } else {
        Vec::new()
    };
    let error = if level < depth {
        geometric_error(extent, level)
    } else {
        0.0
    };

    json!({
        "boundingVolume": {
            "box": [cx, cy, 0.0, half, 0.0, 0.0, 0.0, half, 0.0, 0.0, 0.0, TILE_HALF_HEIGHT]
        },
        "geometricError": error,
        "refine": "REPLACE",
        "content": { "uri": format!("tiles/{level}/{x}/{y}.pnts") },
        "children": children,
    })
}

/// Scatters a point grid across the tile's bounding sphere.
pub struct GridDecoder;

impl ContentDecoder for GridDecoder {
    fn decode(&self, bytes: &[u8], metadata: &TileMetadata) -> Result<DecodedContent, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Corrupt(format!("{} is empty", metadata.url)));
        }
        let sphere = metadata.bounding_volume.bounding_sphere();
        let half = sphere.radius * std::f64::consts::FRAC_1_SQRT_2;
        let step = 2.0 * half / (GRID - 1) as f64;
        let mut positions = Vec::with_capacity(GRID * GRID);
        for j in 0..GRID {
            for i in 0..GRID {
                let p = sphere.center
                    + geotiles_math::DVec3::new(
                        -half + i as f64 * step,
                        -half + j as f64 * step,
                        0.0,
                    );
                positions.push([p.x as f32, p.y as f32, p.z as f32]);
            }
        }
        let shade = (metadata.depth.min(7) * 32) as u8;
        let colors = vec![[shade, 255 - shade, 128, 255]; positions.len()];
        Ok(DecodedContent::new(TileContent::PointCloud(PointCloudContent {
            positions,
            colors: Some(colors),
            normals: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use geotiles_tiles::{TileId, TilesetDescription};

    use super::*;

    fn synthetic(depth: u32) -> SyntheticTileset {
        SyntheticTileset::new(depth, 1000.0, Duration::ZERO).unwrap()
    }

    /// The generated description parses and has one tile per quadtree node.
    #[test]
    fn test_description_is_valid() {
        let tileset = synthetic(2);
        let bytes = tileset.fetch(ROOT_URL).unwrap().bytes;
        let description = TilesetDescription::from_slice(&bytes).unwrap();
        assert_eq!(description.tile_count() as u64, tileset.tile_count());
        assert_eq!(tileset.tile_count(), 21);
    }

    /// Tile URLs outside the tree are rejected.
    #[test]
    fn test_tile_urls() {
        let tileset = synthetic(2);
        assert!(tileset.fetch("tiles/2/3/3.pnts?v=synthetic").is_ok());
        assert!(matches!(
            tileset.fetch("tiles/2/4/0.pnts"),
            Err(FetchError::NotFound(_))
        ));
        assert!(tileset.fetch("tiles/3/0/0.pnts").is_err());
        assert!(tileset.fetch("other.json").is_err());
    }

    /// Decoded tiles hold a full grid.
    #[test]
    fn test_decoder_builds_grid() {
        let metadata = TileMetadata {
            id: TileId(0),
            url: "tiles/0/0/0.pnts".into(),
            depth: 0,
            geometric_error: 1.0,
            refine: Default::default(),
            bounding_volume: geotiles_math::BoundingVolume::Sphere(
                geotiles_math::BoundingSphere::new(geotiles_math::DVec3::ZERO, 10.0),
            ),
        };
        let decoded = GridDecoder.decode(b"0/0/0", &metadata).unwrap();
        match decoded.content {
            TileContent::PointCloud(points) => assert_eq!(points.point_count(), GRID * GRID),
            other => panic!("unexpected content {other:?}"),
        }
        assert!(decoded.byte_size > 0);
        assert!(GridDecoder.decode(&[], &metadata).is_err());
    }
}
