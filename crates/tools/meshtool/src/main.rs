use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use terramesh_map::tiles::{select_zoom, tile_count, tiles_for_bbox, MAX_SUPPORTED_ZOOM};
use terramesh_map::{
    exporter_for, BoundingBox, BoundingPolygon, GenerationContext, GenerationRequest,
    GenerationScheduler, Pipeline, PipelineConfig, Tile,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Upper bound on how many tiles `tiles` will print
const MAX_LISTED_TILES: usize = 10_000;

#[derive(Parser)]
#[command(name = "meshtool")]
#[command(about = "Turn a geographic area into a terrain and building mesh", long_about = None)]
struct Cli {
    /// TOML configuration file; TERRAMESH_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AreaArgs {
    /// Bounding box as minLng,minLat,maxLng,maxLat
    #[arg(long, conflicts_with = "geojson", required_unless_present = "geojson")]
    bbox: Option<String>,

    /// GeoJSON file with a Polygon or MultiPolygon
    #[arg(long)]
    geojson: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one mesh and write it to a file
    Generate {
        #[command(flatten)]
        area: AreaArgs,

        /// Vertical exaggeration of the terrain
        #[arg(long)]
        exaggeration: Option<f64>,

        /// Multiplier applied to building heights
        #[arg(long)]
        building_scale: Option<f64>,

        /// Output format: obj or json
        #[arg(short, long, default_value = "obj")]
        format: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the elevation zoom and tiles a box needs
    Tiles {
        #[command(flatten)]
        area: AreaArgs,

        /// Use this zoom instead of the automatic choice
        #[arg(long)]
        zoom: Option<u8>,
    },
    /// Read `key=value` changes from stdin and regenerate after each settles
    Interactive {
        #[command(flatten)]
        area: AreaArgs,

        /// Output format: obj or json
        #[arg(short, long, default_value = "obj")]
        format: String,

        /// Output file, rewritten on every published result
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate {
            area,
            exaggeration,
            building_scale,
            format,
            output,
        } => {
            let polygon = area.polygon()?;
            let mut request = GenerationRequest::new(polygon, &config);
            if let Some(value) = exaggeration {
                request.exaggeration = value;
            }
            if let Some(value) = building_scale {
                request.building_scale = value;
            }
            generate(config, request, &format, &output).await?;
        }
        Commands::Tiles { area, zoom } => {
            let bbox = area.polygon()?.bbox();
            let zoom = zoom.unwrap_or_else(|| {
                select_zoom(
                    &bbox,
                    config.tiles.max_elevation_zoom,
                    config.tiles.max_elevation_tiles,
                )
            });
            let tiles = list_tiles(&bbox, zoom)?;
            println!("bbox: {}", bbox);
            println!("zoom: {} ({} tiles)", zoom, tiles.len());
            for tile in tiles {
                println!("  {}", tile);
            }
        }
        Commands::Interactive {
            area,
            format,
            output,
        } => {
            let polygon = area.polygon()?;
            interactive(config, polygon, &format, output).await?;
        }
    }

    Ok(())
}

impl AreaArgs {
    fn polygon(&self) -> Result<BoundingPolygon> {
        if let Some(path) = &self.geojson {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return Ok(BoundingPolygon::from_geojson_str(&text)?);
        }
        let Some(text) = &self.bbox else {
            bail!("either --bbox or --geojson is required");
        };
        let bbox = BoundingBox::parse(text)
            .with_context(|| format!("invalid bbox '{}', expected minLng,minLat,maxLng,maxLat", text))?;
        Ok(BoundingPolygon::from_bbox(bbox)?)
    }
}

fn list_tiles(bbox: &BoundingBox, zoom: u8) -> Result<Vec<Tile>> {
    if zoom > MAX_SUPPORTED_ZOOM {
        bail!("zoom {} is above the supported maximum of {}", zoom, MAX_SUPPORTED_ZOOM);
    }
    let count = tile_count(bbox, zoom);
    if count > MAX_LISTED_TILES {
        bail!(
            "zoom {} needs {} tiles for this area, more than the {} this command lists",
            zoom,
            count,
            MAX_LISTED_TILES
        );
    }
    Ok(tiles_for_bbox(bbox, zoom))
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn generate(
    config: PipelineConfig,
    request: GenerationRequest,
    format: &str,
    output: &Path,
) -> Result<()> {
    let exporter = exporter_for(format)?;
    let pipeline = Pipeline::from_config(config)?;
    let ctx = GenerationContext::new(1);

    let model = pipeline.generate(&request, &ctx).await?;
    exporter
        .write_file(&model.mesh, output)
        .with_context(|| format!("writing {}", output.display()))?;

    println!(
        "wrote {} ({} vertices, {} triangles, {} buildings, zoom {})",
        output.display(),
        model.mesh.vertex_count(),
        model.mesh.triangle_count(),
        model.mesh_stats.buildings,
        model.elevation_zoom
    );
    Ok(())
}

async fn interactive(
    config: PipelineConfig,
    polygon: BoundingPolygon,
    format: &str,
    output: PathBuf,
) -> Result<()> {
    let exporter = exporter_for(format)?;
    let scheduler_config = config.scheduler.clone();
    let mut request = GenerationRequest::new(polygon, &config);
    let pipeline = Arc::new(Pipeline::from_config(config)?);
    let scheduler = GenerationScheduler::spawn(pipeline, &scheduler_config);

    let mut updates = scheduler.subscribe();
    let writer = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let Some(model) = updates.borrow_and_update().clone() else {
                continue;
            };
            match exporter.write_file(&model.mesh, &output) {
                Ok(()) => println!(
                    "generation {}: wrote {} ({} triangles)",
                    model.id,
                    output.display(),
                    model.mesh.triangle_count()
                ),
                Err(e) => eprintln!("failed to write {}: {}", output.display(), e),
            }
        }
    });

    println!("commands: exaggeration=F, building_scale=F, quit");
    scheduler.submit(request.clone())?;

    let mut quit = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            quit = true;
            break;
        }
        match apply_change(&mut request, line) {
            Ok(()) => scheduler.submit(request.clone())?,
            Err(e) => eprintln!("{}", e),
        }
    }

    // End of input lets the last change settle; an explicit quit abandons it
    if quit {
        scheduler.shutdown().await?;
    } else {
        scheduler.finish().await?;
    }
    writer.await?;
    Ok(())
}

fn apply_change(request: &mut GenerationRequest, line: &str) -> Result<()> {
    let Some((key, value)) = line.split_once('=') else {
        bail!("expected key=value, got '{}'", line);
    };
    let value: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a number", value.trim()))?;
    let mut changed = request.clone();
    match key.trim() {
        "exaggeration" => changed.exaggeration = value,
        "building_scale" | "building-scale" => changed.building_scale = value,
        other => bail!("unknown parameter '{}'", other),
    }
    changed.validate()?;
    *request = changed;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BoundingBox {
        BoundingBox::new(13.30, 52.45, 13.50, 52.58)
    }

    #[test]
    fn test_list_tiles_rejects_unsupported_zoom() {
        assert!(list_tiles(&bbox(), 40).is_err());
        assert!(list_tiles(&bbox(), MAX_SUPPORTED_ZOOM + 1).is_err());
    }

    #[test]
    fn test_list_tiles_caps_large_listings() {
        assert!(list_tiles(&bbox(), MAX_SUPPORTED_ZOOM).is_err());
        let tiles = list_tiles(&bbox(), 10).unwrap();
        assert_eq!(tiles.len(), tile_count(&bbox(), 10));
    }

    #[test]
    fn test_apply_change_keeps_request_on_invalid_value() {
        let polygon = BoundingPolygon::from_bbox(bbox()).unwrap();
        let mut request = GenerationRequest::new(polygon, &PipelineConfig::default());
        apply_change(&mut request, "exaggeration=2.5").unwrap();
        assert_eq!(request.exaggeration, 2.5);

        assert!(apply_change(&mut request, "building_scale=-1").is_err());
        assert!(apply_change(&mut request, "height=3").is_err());
        assert_eq!(request.building_scale, PipelineConfig::default().mesh.building_scale);
    }
}
