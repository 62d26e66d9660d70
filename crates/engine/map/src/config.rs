//! Pipeline configuration
//!
//! Settings load from TOML, then `TERRAMESH_*` environment variables override
//! individual values, then [`PipelineConfig::validate`] rejects nonsense before
//! any tile is requested.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MapError, MapResult};
use crate::features::{ContainmentPolicy, HeightRange};
use crate::mesh::color::parse_hex_color;
use crate::tiles::{
    MAX_ELEVATION_TILES, MAX_ELEVATION_ZOOM, MAX_SUPPORTED_ZOOM, MAX_VECTOR_TILES, VECTOR_TILE_ZOOM,
};

/// Default terrain-RGB elevation endpoint
pub const DEFAULT_ELEVATION_URL: &str =
    "https://wms.wheregroup.com/dem_tileserver/raster_dem/{z}/{x}/{y}.webp";

/// Default vector endpoint used when no style is configured or the style yields nothing
pub const DEFAULT_VECTOR_URL: &str =
    "https://wms.wheregroup.com/tileserver/tile/world-0-14/{z}/{x}/{y}.pbf";

/// Complete configuration for one pipeline instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tiles: TileConfig,
    pub sources: SourceConfig,
    pub grid: GridConfig,
    pub mesh: MeshConfig,
    pub features: FeatureConfig,
    pub polygon_layers: Vec<PolygonLayerStyle>,
    pub scheduler: SchedulerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tiles: TileConfig::default(),
            sources: SourceConfig::default(),
            grid: GridConfig::default(),
            mesh: MeshConfig::default(),
            features: FeatureConfig::default(),
            polygon_layers: default_polygon_layers(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Zoom and request-volume limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Elevation zoom selection starts here
    pub max_elevation_zoom: u8,
    /// Elevation zoom is lowered until at most this many tiles are needed
    pub max_elevation_tiles: usize,
    /// Fixed zoom for vector tiles
    pub vector_zoom: u8,
    /// Vector fetches are skipped above this tile count
    pub max_vector_tiles: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            max_elevation_zoom: MAX_ELEVATION_ZOOM,
            max_elevation_tiles: MAX_ELEVATION_TILES,
            vector_zoom: VECTOR_TILE_ZOOM,
            max_vector_tiles: MAX_VECTOR_TILES,
        }
    }
}

/// Where tiles come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Terrain-RGB raster template with `{z}`, `{x}`, `{y}`
    pub elevation_url: String,
    /// Mapbox-GL style document used to discover the building source
    pub style_url: Option<String>,
    /// Fallback vector tile template
    pub vector_url: String,
    /// Name of the building layer inside the vector tiles
    pub building_layer: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            elevation_url: DEFAULT_ELEVATION_URL.to_string(),
            style_url: None,
            vector_url: DEFAULT_VECTOR_URL.to_string(),
            building_layer: "building".to_string(),
            timeout_secs: crate::source::DEFAULT_TIMEOUT.as_secs(),
            user_agent: crate::source::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Elevation grid resolution and smoothing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub width: usize,
    pub height: usize,
    /// Gaussian kernel radius; the window is `2r + 1` cells wide
    pub smoothing_radius: usize,
    pub smoothing_passes: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: 150,
            height: 150,
            smoothing_radius: 2,
            smoothing_passes: 2,
        }
    }
}

/// Mesh dimensions and scale factors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Edge length of the square terrain plane in mesh units
    pub terrain_size: f64,
    /// Mesh height of the full elevation range at exaggeration 1
    pub vertical_span: f64,
    /// Thickness of the slab below the lowest terrain point
    pub base_height: f64,
    /// Default vertical exaggeration
    pub exaggeration: f64,
    /// Default user scale for building heights
    pub building_scale: f64,
    /// How far building bases sink below the terrain surface
    pub submerge_offset: f64,
    pub building_color: String,
    /// Emit per-vertex colors
    pub vertex_colors: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            terrain_size: 200.0,
            vertical_span: 40.0,
            base_height: 5.0,
            exaggeration: 1.0,
            building_scale: 1.0,
            submerge_offset: 0.01,
            building_color: "#d8d0c4".to_string(),
            vertex_colors: true,
        }
    }
}

/// Feature filtering and height resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub height_range: HeightRange,
    /// Height used when a building carries no usable height attribute
    pub default_height: f64,
    pub containment: ContainmentPolicy,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            height_range: HeightRange::BUILDINGS,
            default_height: 5.0,
            containment: ContainmentPolicy::default(),
        }
    }
}

/// Style of one non-building polygon layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonLayerStyle {
    /// Source layer name in the vector tiles
    pub layer: String,
    pub color: String,
    /// Extrusion depth in mesh units
    pub depth: f64,
    /// Lift above the terrain base so coplanar layers don't fight
    pub z_offset: f64,
}

impl PolygonLayerStyle {
    pub fn new(layer: &str, color: &str, depth: f64, z_offset: f64) -> Self {
        Self {
            layer: layer.to_string(),
            color: color.to_string(),
            depth,
            z_offset,
        }
    }
}

fn default_polygon_layers() -> Vec<PolygonLayerStyle> {
    vec![
        PolygonLayerStyle::new("landuse", "#7cb342", 0.4, 0.1),
        PolygonLayerStyle::new("water", "#4a90d9", 0.3, 0.05),
        PolygonLayerStyle::new("transportation", "#8d8d8d", 0.2, 0.15),
    ]
}

/// Debounce and registry sizing for interactive use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period before a burst of changes is run
    pub debounce_ms: u64,
    /// Generations remembered before the oldest is evicted
    pub registry_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            registry_capacity: 8,
        }
    }
}

impl SchedulerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl PipelineConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> MapResult<Self> {
        toml::from_str(text).map_err(|e| MapError::Configuration(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> MapResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| MapError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> MapResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> MapResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TERRAMESH_ELEVATION_URL") {
            self.sources.elevation_url = url;
        }
        if let Some(url) = lookup("TERRAMESH_STYLE_URL") {
            self.sources.style_url = (!url.is_empty()).then_some(url);
        }
        if let Some(url) = lookup("TERRAMESH_VECTOR_URL") {
            self.sources.vector_url = url;
        }
        if let Some(layer) = lookup("TERRAMESH_BUILDING_LAYER") {
            self.sources.building_layer = layer;
        }
        if let Some(name) = lookup("TERRAMESH_HEIGHT_RANGE") {
            self.features.height_range = HeightRange::preset(&name).ok_or_else(|| {
                MapError::Configuration(format!(
                    "TERRAMESH_HEIGHT_RANGE must be buildings or footprints, got '{}'",
                    name
                ))
            })?;
        }
        if let Some(secs) = parse_var(&lookup, "TERRAMESH_HTTP_TIMEOUT_SECS")? {
            self.sources.timeout_secs = secs;
        }
        if let Some(size) = parse_var(&lookup, "TERRAMESH_GRID_SIZE")? {
            self.grid.width = size;
            self.grid.height = size;
        }
        if let Some(value) = parse_var(&lookup, "TERRAMESH_EXAGGERATION")? {
            self.mesh.exaggeration = value;
        }
        if let Some(value) = parse_var(&lookup, "TERRAMESH_BUILDING_SCALE")? {
            self.mesh.building_scale = value;
        }
        if let Some(value) = parse_var(&lookup, "TERRAMESH_DEBOUNCE_MS")? {
            self.scheduler.debounce_ms = value;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> MapResult<()> {
        let fail = |message: String| Err(MapError::Configuration(message));

        if self.grid.width < 2 || self.grid.height < 2 {
            return fail(format!(
                "grid must be at least 2x2, got {}x{}",
                self.grid.width, self.grid.height
            ));
        }
        if self.tiles.max_elevation_zoom > MAX_SUPPORTED_ZOOM
            || self.tiles.vector_zoom > MAX_SUPPORTED_ZOOM
        {
            return fail(format!("zoom levels must not exceed {}", MAX_SUPPORTED_ZOOM));
        }
        if self.tiles.max_elevation_tiles == 0 {
            return fail("max_elevation_tiles must be at least 1".to_string());
        }

        let range = &self.features.height_range;
        if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
            return fail(format!("invalid height range [{}, {}]", range.min, range.max));
        }
        if !self.features.default_height.is_finite() {
            return fail("default_height must be finite".to_string());
        }

        let mesh = &self.mesh;
        if !(mesh.terrain_size.is_finite() && mesh.terrain_size > 0.0) {
            return fail(format!("terrain_size must be positive, got {}", mesh.terrain_size));
        }
        for (name, value) in [
            ("vertical_span", mesh.vertical_span),
            ("base_height", mesh.base_height),
            ("exaggeration", mesh.exaggeration),
            ("building_scale", mesh.building_scale),
            ("submerge_offset", mesh.submerge_offset),
        ] {
            if !value.is_finite() || value < 0.0 {
                return fail(format!("{} must be finite and non-negative, got {}", name, value));
            }
        }

        for template in [&self.sources.elevation_url, &self.sources.vector_url] {
            if !["{z}", "{x}", "{y}"].iter().all(|p| template.contains(p)) {
                return fail(format!("tile template '{}' lacks {{z}}/{{x}}/{{y}}", template));
            }
        }

        parse_hex_color(&mesh.building_color)?;
        for style in &self.polygon_layers {
            parse_hex_color(&style.color)?;
            if !style.depth.is_finite() || style.depth <= 0.0 {
                return fail(format!("layer '{}' needs a positive depth", style.layer));
            }
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> MapResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MapError::Configuration(format!("{}: cannot parse '{}'", key, raw))),
    }
}
