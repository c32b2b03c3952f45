//! Configuration structs with sensible defaults, validation, and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const IDENTITY: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Level-of-detail and cache settings of a tileset.
    pub tileset: TilesetConfig,
    /// Fetch worker and request settings.
    pub streaming: StreamingConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Per-tileset level-of-detail, culling, and memory settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilesetConfig {
    /// Maximum screen-space error in pixels before a tile is refined.
    pub maximum_screen_space_error: f64,
    /// Memory budget for resident tile content, in bytes.
    pub maximum_memory_usage_bytes: u64,
    /// Skip intermediate levels of detail while descending.
    pub skip_level_of_detail: bool,
    /// SSE that must be reached before levels are skipped.
    pub base_screen_space_error: f64,
    /// Minimum ratio between an ancestor's SSE and a tile's SSE for the tile to
    /// be loaded while skipping.
    pub skip_screen_space_error_factor: f64,
    /// Minimum number of levels skipped between loaded tiles.
    pub skip_levels: u32,
    /// Only load tiles that meet the target SSE.
    pub immediately_load_desired_level_of_detail: bool,
    /// Request siblings of refined tiles even when culled.
    pub load_siblings: bool,
    /// Keep a tile visible when any descendant's bounds are visible.
    pub cull_with_children_bounds: bool,
    /// Relax the SSE target for distant tiles seen towards the horizon.
    pub dynamic_screen_space_error: bool,
    /// Fog density used by the dynamic SSE relaxation.
    pub dynamic_screen_space_error_density: f64,
    /// Strength of the dynamic SSE relaxation.
    pub dynamic_screen_space_error_factor: f64,
    /// How quickly the relaxation fades as the camera rises above the dataset (0..=1).
    pub dynamic_screen_space_error_height_falloff: f64,
    /// Column-major 4x4 transform applied to the whole tileset.
    pub root_transform: [f64; 16],
    /// Re-request tiles whose content failed to load on later frames.
    pub retry_failed_tiles: bool,
}

/// Fetch worker pool and request scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of fetch worker threads. `0` runs fetches inline on the caller.
    pub worker_threads: usize,
    /// Maximum number of requests in flight at once.
    pub max_concurrent_requests: usize,
    /// Cancel in-flight requests for tiles not visited for this many frames.
    pub cancel_after_frames: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "geotiles_tiles=trace").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for TilesetConfig {
    fn default() -> Self {
        Self {
            maximum_screen_space_error: 16.0,
            maximum_memory_usage_bytes: 512 * 1024 * 1024,
            skip_level_of_detail: false,
            base_screen_space_error: 1024.0,
            skip_screen_space_error_factor: 16.0,
            skip_levels: 1,
            immediately_load_desired_level_of_detail: false,
            load_siblings: false,
            cull_with_children_bounds: true,
            dynamic_screen_space_error: false,
            dynamic_screen_space_error_density: 0.00278,
            dynamic_screen_space_error_factor: 4.0,
            dynamic_screen_space_error_height_falloff: 0.25,
            root_transform: IDENTITY,
            retry_failed_tiles: false,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_concurrent_requests: 32,
            cancel_after_frames: 4,
        }
    }
}

/// One worker per core, leaving two for the main and render threads.
fn default_worker_threads() -> usize {
    (num_cpus::get().max(2) - 2).max(1)
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Validation ---

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(
            field,
            format!("expected a finite value >= 0, got {value}"),
        ));
    }
    Ok(())
}

impl TilesetConfig {
    /// Checks every numeric setting against its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("maximum_screen_space_error", self.maximum_screen_space_error)?;
        check_memory_budget(self.maximum_memory_usage_bytes)?;
        check_non_negative("base_screen_space_error", self.base_screen_space_error)?;
        if !self.skip_screen_space_error_factor.is_finite()
            || self.skip_screen_space_error_factor < 1.0
        {
            return Err(ConfigError::invalid(
                "skip_screen_space_error_factor",
                format!(
                    "expected a finite value >= 1, got {}",
                    self.skip_screen_space_error_factor
                ),
            ));
        }
        check_non_negative(
            "dynamic_screen_space_error_density",
            self.dynamic_screen_space_error_density,
        )?;
        check_non_negative(
            "dynamic_screen_space_error_factor",
            self.dynamic_screen_space_error_factor,
        )?;
        let falloff = self.dynamic_screen_space_error_height_falloff;
        if !(0.0..=1.0).contains(&falloff) {
            return Err(ConfigError::invalid(
                "dynamic_screen_space_error_height_falloff",
                format!("expected a value in 0..=1, got {falloff}"),
            ));
        }
        if self.root_transform.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::invalid(
                "root_transform",
                "matrix contains non-finite values",
            ));
        }
        Ok(())
    }

    /// Sets the SSE target after validating it is finite and `>= 0`.
    pub fn set_maximum_screen_space_error(&mut self, value: f64) -> Result<(), ConfigError> {
        check_non_negative("maximum_screen_space_error", value)?;
        self.maximum_screen_space_error = value;
        Ok(())
    }

    /// Sets the memory budget after validating it is `> 0`.
    pub fn set_maximum_memory_usage_bytes(&mut self, value: u64) -> Result<(), ConfigError> {
        check_memory_budget(value)?;
        self.maximum_memory_usage_bytes = value;
        Ok(())
    }
}

fn check_memory_budget(value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(
            "maximum_memory_usage_bytes",
            "budget must be greater than zero",
        ));
    }
    Ok(())
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_requests",
                "at least one request must be allowed in flight",
            ));
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tileset.validate()?;
        self.streaming.validate()
    }
}
