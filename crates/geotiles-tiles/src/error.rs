//! Error types for tileset construction and per-tile content loading.

use geotiles_config::ConfigError;

use crate::tile::TileId;

/// Fatal errors raised while constructing a tileset or attaching an external
/// subtree. A construction error means no tileset is exposed.
#[derive(Debug, thiserror::Error)]
pub enum TilesetError {
    /// The description has no `asset` block.
    #[error("tileset must have an asset property")]
    MissingAsset,

    /// `asset.version` is missing or not a supported version.
    #[error("unsupported tileset version `{0}` (expected 0.0 or 1.0)")]
    UnsupportedVersion(String),

    /// The description has no `root` tile.
    #[error("tileset must have a root tile")]
    MissingRoot,

    /// A tile's bounding volume is absent or malformed.
    #[error("invalid bounding volume: {0}")]
    InvalidBoundingVolume(String),

    /// A tile's geometric error is negative or not finite.
    #[error("invalid geometric error {0}")]
    InvalidGeometricError(f64),

    /// The description is not valid JSON for the expected schema.
    #[error("malformed tileset JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An external subtree was attached below a tile that no longer exists.
    #[error("{0} is not part of the tileset")]
    UnknownTile(TileId),

    /// The top-level description could not be fetched.
    #[error("failed to fetch tileset: {0}")]
    Fetch(#[from] FetchError),

    /// The supplied configuration is out of range.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl TilesetError {
    /// Whether this error describes a malformed or unsupported description.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            TilesetError::MissingAsset
                | TilesetError::UnsupportedVersion(_)
                | TilesetError::MissingRoot
                | TilesetError::InvalidBoundingVolume(_)
                | TilesetError::InvalidGeometricError(_)
                | TilesetError::Json(_)
        )
    }
}

/// Errors reported by a [`Fetcher`](crate::Fetcher).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("i/o error reading {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// The server reports the content as stale; the subtree must be rebuilt.
    #[error("content is stale")]
    Stale,

    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Errors reported by a [`ContentDecoder`](crate::ContentDecoder).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported content format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt content: {0}")]
    Corrupt(String),
}

/// Per-tile, non-fatal failure of a content request.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An external tileset referenced by a tile is malformed.
    #[error("external tileset: {0}")]
    Tileset(#[from] TilesetError),
}

impl ContentError {
    pub fn is_stale(&self) -> bool {
        matches!(self, ContentError::Fetch(FetchError::Stale))
    }
}
