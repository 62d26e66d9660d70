//! Vector tile feature extraction
//!
//! Decodes Mapbox Vector Tiles and pulls polygon features out of named layers.
//! Multipolygons are split into independent single-ring features; holes are
//! discarded. Building tiles are acquired through a list of
//! [`FeatureStrategy`] values tried in order until one yields features.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use geozero::mvt::{self, tile, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::area::BoundingBox;
use crate::config::{SourceConfig, TileConfig};
use crate::coords::{mercator_row_to_lat, tile_column_to_lon, GeoCoord};
use crate::error::{MapError, MapResult};
use crate::source::{fetch_all, fetch_json, HttpTileSource, TileSource};
use crate::tiles::{tile_count, tiles_for_bbox, Tile};

/// Tile extent assumed when a layer omits it
pub const DEFAULT_EXTENT: u32 = 4096;

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

/// Height attributes a building may carry
///
/// Resolution order is `render_height`, then `height`; the first finite value
/// wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeightAttributes {
    pub render_height: Option<f64>,
    pub height: Option<f64>,
}

impl HeightAttributes {
    pub fn resolve(&self) -> Option<f64> {
        [self.render_height, self.height]
            .into_iter()
            .flatten()
            .find(|h| h.is_finite())
    }
}

/// One polygon ring extracted from a vector tile
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolygonFeature {
    /// Source layer name
    pub layer: String,
    pub id: Option<u64>,
    /// Open ring in (lng, lat), closing duplicate removed
    pub ring: Vec<GeoCoord>,
    pub heights: HeightAttributes,
}

/// Decode a protobuf vector tile
pub fn decode_tile(bytes: &[u8]) -> MapResult<mvt::Tile> {
    mvt::Tile::decode(bytes).map_err(|e| MapError::decode("vector tile", e))
}

fn zigzag(value: u32) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Decode a feature's command stream into rings of tile-local coordinates
///
/// Each `MoveTo` starts a new ring; the cursor carries over between rings as
/// the encoding requires.
pub fn decode_geometry(commands: &[u32]) -> MapResult<Vec<Vec<(i64, i64)>>> {
    let mut rings: Vec<Vec<(i64, i64)>> = Vec::new();
    let mut current: Vec<(i64, i64)> = Vec::new();
    let (mut x, mut y) = (0i64, 0i64);
    let mut i = 0;

    while i < commands.len() {
        let command = commands[i] & 0x7;
        let count = (commands[i] >> 3) as usize;
        i += 1;

        match command {
            CMD_MOVE_TO | CMD_LINE_TO => {
                if i + 2 * count > commands.len() {
                    return Err(MapError::decode(
                        "geometry",
                        format!("command at {} needs {} parameters", i - 1, 2 * count),
                    ));
                }
                for _ in 0..count {
                    x += zigzag(commands[i]);
                    y += zigzag(commands[i + 1]);
                    i += 2;
                    if command == CMD_MOVE_TO && !current.is_empty() {
                        rings.push(std::mem::take(&mut current));
                    }
                    current.push((x, y));
                }
            }
            CMD_CLOSE_PATH => {
                if !current.is_empty() {
                    rings.push(std::mem::take(&mut current));
                }
            }
            other => {
                return Err(MapError::decode(
                    "geometry",
                    format!("unknown command {}", other),
                ))
            }
        }
    }
    if !current.is_empty() {
        rings.push(current);
    }

    for ring in &mut rings {
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
    }
    Ok(rings)
}

/// Surveyor's-formula area in tile coordinates (y down)
///
/// Exterior rings are positive, holes negative.
pub fn ring_area(ring: &[(i64, i64)]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut twice_area = 0i128;
    for i in 0..n {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % n];
        twice_area += (x0 as i128) * (y1 as i128) - (x1 as i128) * (y0 as i128);
    }
    twice_area as f64 / 2.0
}

/// Convert a tile-local point to longitude/latitude
pub fn tile_point_to_geo(tile: Tile, extent: u32, x: i64, y: i64) -> GeoCoord {
    let n = Tile::tiles_per_axis(tile.z) as f64;
    let extent = extent.max(1) as f64;
    let column = tile.x as f64 + x as f64 / extent;
    let row = tile.y as f64 + y as f64 / extent;
    GeoCoord::from_lng_lat(tile_column_to_lon(column, n), mercator_row_to_lat(row, n))
}

fn value_as_f64(value: &tile::Value) -> Option<f64> {
    value
        .double_value
        .or(value.float_value.map(f64::from))
        .or(value.int_value.map(|v| v as f64))
        .or(value.sint_value.map(|v| v as f64))
        .or(value.uint_value.map(|v| v as f64))
        .or_else(|| {
            value
                .string_value
                .as_deref()
                .and_then(|s| s.trim().parse::<f64>().ok())
        })
}

fn height_attributes(layer: &tile::Layer, feature: &tile::Feature) -> HeightAttributes {
    let mut heights = HeightAttributes::default();
    for pair in feature.tags.chunks_exact(2) {
        let (Some(key), Some(value)) = (
            layer.keys.get(pair[0] as usize),
            layer.values.get(pair[1] as usize),
        ) else {
            continue;
        };
        match key.as_str() {
            "render_height" => heights.render_height = value_as_f64(value),
            "height" => heights.height = value_as_f64(value),
            _ => {}
        }
    }
    heights
}

/// Split one decoded polygon geometry into single-ring features
///
/// The orientation of the first ring marks exteriors, so tiles written with
/// the legacy reversed winding still work.
fn exterior_rings(rings: Vec<Vec<(i64, i64)>>) -> Vec<Vec<(i64, i64)>> {
    let mut exterior_sign = 0.0;
    let mut exteriors = Vec::new();
    for ring in rings {
        let area = ring_area(&ring);
        if area == 0.0 {
            continue;
        }
        if exterior_sign == 0.0 {
            exterior_sign = area.signum();
        }
        if area.signum() == exterior_sign {
            exteriors.push(ring);
        }
    }
    exteriors
}

/// Extract the polygon features of one layer
///
/// Non-polygon geometries are ignored. Malformed geometry drops only the
/// affected feature.
pub fn extract_polygons(tile: Tile, decoded: &mvt::Tile, layer_name: &str) -> Vec<PolygonFeature> {
    let mut features = Vec::new();
    let Some(layer) = decoded.layers.iter().find(|l| l.name == layer_name) else {
        return features;
    };
    let extent = layer.extent.unwrap_or(DEFAULT_EXTENT);

    for feature in &layer.features {
        if feature.r#type() != tile::GeomType::Polygon {
            continue;
        }
        let rings = match decode_geometry(&feature.geometry) {
            Ok(rings) => rings,
            Err(e) => {
                debug!(%tile, layer = layer_name, error = %e, "skipping feature");
                continue;
            }
        };
        let heights = height_attributes(layer, feature);

        for ring in exterior_rings(rings) {
            let ring: Vec<GeoCoord> = ring
                .into_iter()
                .map(|(x, y)| tile_point_to_geo(tile, extent, x, y))
                .collect();
            if ring.iter().any(|c| !c.is_finite()) {
                debug!(%tile, layer = layer_name, "dropping ring with non-finite coordinate");
                continue;
            }
            features.push(PolygonFeature {
                layer: layer_name.to_string(),
                id: feature.id,
                ring,
                heights,
            });
        }
    }
    features
}

/// A vector tile source together with the layer that holds buildings
#[derive(Clone)]
pub struct ResolvedSource {
    pub source: Arc<dyn TileSource>,
    pub building_layer: String,
}

impl std::fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSource")
            .field("source", &self.source.describe())
            .field("building_layer", &self.building_layer)
            .finish()
    }
}

/// One way of acquiring building tiles
#[async_trait]
pub trait FeatureStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Work out which tile source and layer to read
    async fn resolve(&self) -> MapResult<ResolvedSource>;
}

/// Fixed tile endpoint and layer name
pub struct FixedStrategy {
    name: String,
    resolved: ResolvedSource,
}

impl FixedStrategy {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn TileSource>,
        building_layer: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resolved: ResolvedSource {
                source,
                building_layer: building_layer.into(),
            },
        }
    }
}

#[async_trait]
impl FeatureStrategy for FixedStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self) -> MapResult<ResolvedSource> {
        Ok(self.resolved.clone())
    }
}

/// Where a style says its building tiles live
#[derive(Debug, Clone, PartialEq)]
pub enum StyleTiles {
    /// Tile URL template listed directly in the source
    Template(String),
    /// TileJSON document that lists the templates
    TileJson(String),
}

/// Building source discovered in a map style
#[derive(Debug, Clone, PartialEq)]
pub struct StyleBuildingSource {
    pub tiles: StyleTiles,
    pub source_layer: String,
}

#[derive(Debug, Deserialize)]
struct StyleDocument {
    #[serde(default)]
    sources: HashMap<String, StyleSource>,
    #[serde(default)]
    layers: Vec<StyleLayer>,
}

#[derive(Debug, Deserialize)]
struct StyleSource {
    #[serde(default)]
    tiles: Vec<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StyleLayer {
    #[serde(default, rename = "type")]
    kind: String,
    source: Option<String>,
    #[serde(rename = "source-layer")]
    source_layer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TileJson {
    #[serde(default)]
    tiles: Vec<String>,
}

/// Find the building layer in a Mapbox-GL style document
///
/// A layer matches when it is a `fill-extrusion` layer or reads the
/// `layer_hint` source layer.
pub fn find_building_source(
    style: &serde_json::Value,
    layer_hint: &str,
) -> MapResult<Option<StyleBuildingSource>> {
    let style: StyleDocument = serde_json::from_value(style.clone())?;

    for layer in &style.layers {
        let reads_hint = layer.source_layer.as_deref() == Some(layer_hint);
        if layer.kind != "fill-extrusion" && !reads_hint {
            continue;
        }
        let Some(source) = layer.source.as_ref().and_then(|s| style.sources.get(s)) else {
            continue;
        };
        let tiles = if let Some(template) = source.tiles.first() {
            StyleTiles::Template(template.clone())
        } else if let Some(url) = &source.url {
            StyleTiles::TileJson(url.clone())
        } else {
            continue;
        };
        return Ok(Some(StyleBuildingSource {
            tiles,
            source_layer: layer
                .source_layer
                .clone()
                .unwrap_or_else(|| layer_hint.to_string()),
        }));
    }
    Ok(None)
}

/// Resolve buildings through the hosting map's style document
pub struct StyleStrategy {
    client: reqwest::Client,
    style_url: String,
    layer_hint: String,
    resolved: OnceCell<ResolvedSource>,
}

impl StyleStrategy {
    pub fn new(client: reqwest::Client, style_url: impl Into<String>, layer_hint: impl Into<String>) -> Self {
        Self {
            client,
            style_url: style_url.into(),
            layer_hint: layer_hint.into(),
            resolved: OnceCell::new(),
        }
    }

    async fn discover(&self) -> MapResult<ResolvedSource> {
        let style: serde_json::Value = fetch_json(&self.client, &self.style_url).await?;
        let found = find_building_source(&style, &self.layer_hint)?.ok_or_else(|| {
            MapError::Resource(format!("no building layer in style {}", self.style_url))
        })?;

        let template = match found.tiles {
            StyleTiles::Template(template) => template,
            StyleTiles::TileJson(url) => {
                let tilejson: TileJson = fetch_json(&self.client, &url).await?;
                tilejson.tiles.into_iter().next().ok_or_else(|| {
                    MapError::Resource(format!("TileJSON {} lists no tiles", url))
                })?
            }
        };
        info!(%template, layer = %found.source_layer, "resolved building source from style");

        Ok(ResolvedSource {
            source: Arc::new(HttpTileSource::with_client(self.client.clone(), template)),
            building_layer: found.source_layer,
        })
    }
}

#[async_trait]
impl FeatureStrategy for StyleStrategy {
    fn name(&self) -> &str {
        "style"
    }

    async fn resolve(&self) -> MapResult<ResolvedSource> {
        self.resolved
            .get_or_try_init(|| self.discover())
            .await
            .cloned()
    }
}

/// Features gathered for one request
#[derive(Debug, Clone, Default)]
pub struct ExtractedFeatures {
    pub buildings: Vec<PolygonFeature>,
    /// Extra polygon layers keyed by layer name
    pub layers: BTreeMap<String, Vec<PolygonFeature>>,
    /// Strategy that produced the buildings
    pub strategy: Option<String>,
}

impl ExtractedFeatures {
    pub fn is_empty(&self) -> bool {
        self.buildings.is_empty() && self.layers.values().all(Vec::is_empty)
    }
}

/// Fetches vector tiles and extracts building and polygon-layer features
pub struct VectorFeatureExtractor {
    strategies: Vec<Box<dyn FeatureStrategy>>,
    polygon_layers: Vec<String>,
    zoom: u8,
    max_tiles: usize,
}

impl VectorFeatureExtractor {
    pub fn new(strategies: Vec<Box<dyn FeatureStrategy>>, tiles: &TileConfig) -> Self {
        Self {
            strategies,
            polygon_layers: Vec::new(),
            zoom: tiles.vector_zoom,
            max_tiles: tiles.max_vector_tiles,
        }
    }

    /// Standard strategy chain: the configured style first, then the fixed endpoint
    pub fn from_config(
        client: reqwest::Client,
        sources: &SourceConfig,
        tiles: &TileConfig,
    ) -> Self {
        let mut strategies: Vec<Box<dyn FeatureStrategy>> = Vec::new();
        if let Some(style_url) = &sources.style_url {
            strategies.push(Box::new(StyleStrategy::new(
                client.clone(),
                style_url.clone(),
                sources.building_layer.clone(),
            )));
        }
        strategies.push(Box::new(FixedStrategy::new(
            "fixed",
            Arc::new(HttpTileSource::with_client(client, sources.vector_url.clone())),
            sources.building_layer.clone(),
        )));
        Self::new(strategies, tiles)
    }

    /// Also extract these layers for the flat polygon path
    pub fn with_polygon_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.polygon_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// Extract features for a bounding box
    ///
    /// Returns nothing when the box needs more than the tile limit. Per-tile
    /// and per-strategy failures are logged and skipped.
    pub async fn extract(
        &self,
        bbox: &BoundingBox,
        cancel: &CancellationToken,
    ) -> MapResult<ExtractedFeatures> {
        let count = tile_count(bbox, self.zoom);
        if count > self.max_tiles {
            info!(
                tiles = count,
                limit = self.max_tiles,
                "area too large for vector tiles, skipping features"
            );
            return Ok(ExtractedFeatures::default());
        }
        let tiles = tiles_for_bbox(bbox, self.zoom);
        let mut fallback_layers = None;

        for strategy in &self.strategies {
            // Style and TileJSON lookups hit the network too
            let resolution = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MapError::Cancelled),
                resolution = strategy.resolve() => resolution,
            };
            let resolved = match resolution {
                Ok(resolved) => resolved,
                Err(MapError::Cancelled) => return Err(MapError::Cancelled),
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "feature strategy unavailable");
                    continue;
                }
            };

            let extracted = self.extract_from(&resolved, &tiles, cancel).await?;
            debug!(
                strategy = strategy.name(),
                buildings = extracted.buildings.len(),
                "feature strategy finished"
            );
            if !extracted.buildings.is_empty() {
                return Ok(ExtractedFeatures {
                    strategy: Some(strategy.name().to_string()),
                    ..extracted
                });
            }
            if fallback_layers.is_none() && extracted.layers.values().any(|l| !l.is_empty()) {
                fallback_layers = Some(extracted.layers);
            }
        }

        if cancel.is_cancelled() {
            return Err(MapError::Cancelled);
        }
        Ok(ExtractedFeatures {
            layers: fallback_layers.unwrap_or_default(),
            ..ExtractedFeatures::default()
        })
    }

    async fn extract_from(
        &self,
        resolved: &ResolvedSource,
        tiles: &[Tile],
        cancel: &CancellationToken,
    ) -> MapResult<ExtractedFeatures> {
        let fetched = fetch_all(resolved.source.as_ref(), tiles, cancel).await?;
        let mut extracted = ExtractedFeatures::default();

        for (tile, bytes) in fetched {
            let decoded = match decode_tile(&bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(%tile, error = %e, "dropping undecodable vector tile");
                    continue;
                }
            };
            extracted
                .buildings
                .extend(extract_polygons(tile, &decoded, &resolved.building_layer));
            for layer in &self.polygon_layers {
                extracted
                    .layers
                    .entry(layer.clone())
                    .or_default()
                    .extend(extract_polygons(tile, &decoded, layer));
            }
        }
        Ok(extracted)
    }
}
