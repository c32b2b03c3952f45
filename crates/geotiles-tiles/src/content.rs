//! Decoded tile payloads and the decoder seam.
//!
//! The engine never interprets payload bytes itself. A host supplies a
//! [`ContentDecoder`] that turns fetched bytes into one of the
//! [`TileContent`] variants, and reports how many bytes the result occupies
//! so the cache can enforce its budget.

use geotiles_math::BoundingVolume;

use crate::error::DecodeError;
use crate::tile::{Refinement, TileId};

/// Discriminant of [`TileContent`], used for presentation dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentKind {
    PointCloud,
    Scenegraph,
    SimpleMesh,
    Tileset,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloudContent {
    pub positions: Vec<[f32; 3]>,
    pub colors: Option<Vec<[u8; 4]>>,
    pub normals: Option<Vec<[f32; 3]>>,
}

impl PointCloudContent {
    pub fn point_count(&self) -> usize {
        self.positions.len()
    }
}

/// A glTF scene kept as the raw binary blob for the host renderer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScenegraphContent {
    pub gltf: Vec<u8>,
    /// Number of instances for instanced models, 1 otherwise.
    pub instance_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimpleMeshContent {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    pub tex_coords: Option<Vec<[f32; 2]>>,
}

impl SimpleMeshContent {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Payload of a loaded tile.
#[derive(Clone, Debug, PartialEq)]
pub enum TileContent {
    PointCloud(PointCloudContent),
    Scenegraph(ScenegraphContent),
    SimpleMesh(SimpleMeshContent),
    /// Marker for a tile whose content was an external tileset; the
    /// referenced tiles now hang below it in the tree.
    Tileset { tile_count: usize },
}

impl TileContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            TileContent::PointCloud(_) => ContentKind::PointCloud,
            TileContent::Scenegraph(_) => ContentKind::Scenegraph,
            TileContent::SimpleMesh(_) => ContentKind::SimpleMesh,
            TileContent::Tileset { .. } => ContentKind::Tileset,
        }
    }

    /// Approximate in-memory size of the payload.
    pub fn estimated_bytes(&self) -> u64 {
        let bytes = match self {
            TileContent::PointCloud(p) => {
                p.positions.len() * 12
                    + p.colors.as_ref().map_or(0, |c| c.len() * 4)
                    + p.normals.as_ref().map_or(0, |n| n.len() * 12)
            }
            TileContent::Scenegraph(s) => s.gltf.len(),
            TileContent::SimpleMesh(m) => {
                m.positions.len() * 12
                    + m.indices.len() * 4
                    + m.tex_coords.as_ref().map_or(0, |t| t.len() * 8)
            }
            TileContent::Tileset { .. } => 0,
        };
        bytes as u64
    }
}

/// What a decoder knows about the tile whose bytes it is decoding.
#[derive(Clone, Debug)]
pub struct TileMetadata {
    pub id: TileId,
    pub url: String,
    pub depth: u32,
    pub geometric_error: f64,
    pub refine: Refinement,
    pub bounding_volume: BoundingVolume,
}

/// Output of a successful decode.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedContent {
    pub content: TileContent,
    /// Bytes charged against the memory budget.
    pub byte_size: u64,
}

impl DecodedContent {
    /// Wraps content, charging its estimated size.
    pub fn new(content: TileContent) -> Self {
        let byte_size = content.estimated_bytes();
        Self { content, byte_size }
    }

    pub fn with_byte_size(content: TileContent, byte_size: u64) -> Self {
        Self { content, byte_size }
    }
}

/// Turns fetched bytes into renderable content. Runs on fetch workers.
pub trait ContentDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], metadata: &TileMetadata) -> Result<DecodedContent, DecodeError>;
}

impl<F> ContentDecoder for F
where
    F: Fn(&[u8], &TileMetadata) -> Result<DecodedContent, DecodeError> + Send + Sync,
{
    fn decode(&self, bytes: &[u8], metadata: &TileMetadata) -> Result<DecodedContent, DecodeError> {
        self(bytes, metadata)
    }
}
