//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tileset streaming command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "geotiles", about = "Hierarchical 3D tile streaming")]
pub struct CliArgs {
    /// Path to a tileset JSON description.
    #[arg(long)]
    pub tileset: Option<PathBuf>,

    /// Generate a synthetic quadtree tileset of this depth instead of loading one.
    #[arg(long)]
    pub synthetic_depth: Option<u32>,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = 120)]
    pub frames: u64,

    /// Orbit radius of the simulated camera, in meters.
    #[arg(long)]
    pub orbit_radius: Option<f64>,

    /// Maximum screen-space error.
    #[arg(long)]
    pub max_sse: Option<f64>,

    /// Memory budget in megabytes.
    #[arg(long)]
    pub memory_mb: Option<u64>,

    /// Number of fetch worker threads (0 = inline).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enable level-of-detail skipping.
    #[arg(long)]
    pub skip_lod: Option<bool>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(sse) = args.max_sse {
            self.tileset.maximum_screen_space_error = sse;
        }
        if let Some(mb) = args.memory_mb {
            self.tileset.maximum_memory_usage_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(workers) = args.workers {
            self.streaming.worker_threads = workers;
        }
        if let Some(skip) = args.skip_lod {
            self.tileset.skip_level_of_detail = skip;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            tileset: None,
            synthetic_depth: None,
            frames: 120,
            orbit_radius: None,
            max_sse: None,
            memory_mb: None,
            workers: None,
            skip_lod: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            max_sse: Some(2.0),
            memory_mb: Some(64),
            workers: Some(0),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.tileset.maximum_screen_space_error, 2.0);
        assert_eq!(config.tileset.maximum_memory_usage_bytes, 64 * 1024 * 1024);
        assert_eq!(config.streaming.worker_threads, 0);
        // Non-overridden fields retain defaults
        assert!(!config.tileset.skip_level_of_detail);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::try_parse_from([
            "geotiles",
            "--synthetic-depth",
            "4",
            "--frames",
            "10",
            "--skip-lod",
            "true",
        ])
        .unwrap();
        assert_eq!(args.synthetic_depth, Some(4));
        assert_eq!(args.frames, 10);
        assert_eq!(args.skip_lod, Some(true));
    }
}
