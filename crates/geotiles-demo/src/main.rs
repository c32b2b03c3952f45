//! Headless demo that streams a tileset under an orbiting camera.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p geotiles-demo` for a generated quadtree tileset.
//! Run with `cargo run -p geotiles-demo -- --tileset path/to/tileset.json` to
//! stream a tileset from disk.

mod presenter;
mod synthetic;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use geotiles_config::{CliArgs, Config};
use geotiles_math::{DVec3, Viewport};
use geotiles_tiles::{
    ContentDecoder, FileFetcher, FrameState, PresentationSync, Tileset3D, TilesetError,
    TilesetOptions,
};
use tracing::{error, info};

use crate::presenter::{LoggingPresenter, ProgressObserver};
use crate::synthetic::{GridDecoder, ROOT_URL, SyntheticTileset};

/// Side length of the generated tileset, in meters.
const SYNTHETIC_EXTENT: f64 = 2000.0;

/// Simulated per-request latency of the generated tileset.
const SYNTHETIC_LATENCY: Duration = Duration::from_millis(2);

const FRAME_TIME: Duration = Duration::from_millis(16);

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("geotiles")
    });

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    geotiles_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let mut tileset = match open_tileset(&args, &config) {
        Ok(tileset) => tileset,
        Err(e) => {
            error!(error = %e, "Failed to open tileset");
            std::process::exit(1);
        }
    };

    let Some(sphere) = tileset.bounding_sphere() else {
        error!("Tileset has no root");
        std::process::exit(1);
    };
    let orbit_radius = args.orbit_radius.unwrap_or(sphere.radius * 1.5);
    info!(
        url = tileset.url(),
        radius = sphere.radius,
        orbit_radius,
        frames = args.frames,
        "Starting orbit"
    );

    let mut sync = PresentationSync::new();
    let mut presenter = LoggingPresenter::default();
    for frame_number in 1..=args.frames {
        let angle = std::f64::consts::TAU * frame_number as f64 / args.frames.max(1) as f64;
        let eye = sphere.center
            + DVec3::new(
                orbit_radius * angle.cos(),
                orbit_radius * angle.sin(),
                orbit_radius * 0.35,
            );
        let viewport = Viewport::look_at(
            eye,
            sphere.center,
            DVec3::Z,
            std::f64::consts::FRAC_PI_3,
            1920,
            1080,
        );

        let result = tileset.update(&FrameState::new(frame_number, viewport));
        sync.sync(&tileset, &result, &mut presenter);

        if frame_number % 30 == 0 {
            let stats = tileset.statistics();
            info!(
                frame = frame_number,
                selected = stats.selected,
                visited = stats.visited,
                culled = stats.culled,
                in_flight = stats.in_flight_requests,
                resident = stats.resident_tiles,
                resident_kib = stats.resident_bytes / 1024,
                "Frame"
            );
        }
        if config.streaming.worker_threads > 0 {
            std::thread::sleep(FRAME_TIME);
        }
    }

    let stats = *tileset.statistics();
    info!(
        frames = args.frames,
        elapsed_ms = tileset.time_since_load().as_millis() as u64,
        tiles_loaded = tileset.tiles_loaded(),
        total_tiles = stats.total_tiles,
        resident_tiles = stats.resident_tiles,
        resident_bytes = stats.resident_bytes,
        failed_tiles = stats.failed_tiles,
        renderables = sync.len(),
        created = presenter.created(),
        released = presenter.released(),
        "Done"
    );

    sync.clear(&mut presenter);
    tileset.destroy();
}

fn open_tileset(args: &CliArgs, config: &Config) -> Result<Tileset3D, TilesetError> {
    let options = TilesetOptions::from_config(config).with_observer(ProgressObserver::default());
    let decoder: Arc<dyn ContentDecoder> = Arc::new(GridDecoder);

    if let Some(path) = &args.tileset {
        let root = path.parent().map(PathBuf::from).unwrap_or_default();
        let url = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(path = %path.display(), "Loading tileset from disk");
        return Tileset3D::load(&url, Arc::new(FileFetcher::new(root)), decoder, options);
    }

    let depth = args.synthetic_depth.unwrap_or(4);
    let synthetic = SyntheticTileset::new(depth, SYNTHETIC_EXTENT, SYNTHETIC_LATENCY)
        .map_err(TilesetError::Json)?;
    info!(depth, tiles = synthetic.tile_count(), "Generated synthetic tileset");
    Tileset3D::load(ROOT_URL, Arc::new(synthetic), decoder, options)
}
