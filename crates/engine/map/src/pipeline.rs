//! End-to-end generation
//!
//! A [`Pipeline`] turns one [`GenerationRequest`] into one [`GeneratedModel`]:
//!
//! 1. validate the request (bad input fails here, before any fetch)
//! 2. fetch elevation and vector tiles concurrently
//! 3. fuse the elevation grid and normalize features
//! 4. synthesize and center the mesh
//!
//! Numeric work runs on the blocking pool. The request's cancellation token is
//! checked between stages and inside every long loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::area::BoundingBox;
use crate::config::PipelineConfig;
use crate::coords::GeoCoord;
use crate::elevation::ElevationTileDecoder;
use crate::error::{MapError, MapResult};
use crate::features::FeatureNormalizer;
use crate::grid::{CpuGridBackend, GridBackend, GridStats};
use crate::mesh::{MeshBuffer, MeshStats, MeshSynthesizer, SynthesisInput};
use crate::source::{build_http_client, HttpTileSource, TileSource};
use crate::tiles::{select_zoom, tiles_for_bbox};
use crate::vector::{FeatureStrategy, VectorFeatureExtractor};

/// The area a request covers, as an outer ring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingPolygon {
    ring: Vec<GeoCoord>,
}

impl BoundingPolygon {
    /// Polygon covering a bounding box
    pub fn from_bbox(bbox: BoundingBox) -> MapResult<Self> {
        Self::from_ring(vec![
            GeoCoord::new(bbox.min_lat, bbox.min_lng),
            GeoCoord::new(bbox.min_lat, bbox.max_lng),
            GeoCoord::new(bbox.max_lat, bbox.max_lng),
            GeoCoord::new(bbox.max_lat, bbox.min_lng),
        ])
    }

    /// Polygon from an outer ring
    pub fn from_ring(mut ring: Vec<GeoCoord>) -> MapResult<Self> {
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < 3 {
            return Err(MapError::Configuration(format!(
                "polygon needs at least 3 points, got {}",
                ring.len()
            )));
        }
        if let Some(bad) = ring.iter().find(|c| !c.is_finite() || !c.is_valid()) {
            return Err(MapError::Configuration(format!(
                "invalid polygon coordinate ({}, {})",
                bad.lon, bad.lat
            )));
        }
        let polygon = Self { ring };
        let bbox = polygon.bbox();
        if bbox.width_deg() <= 0.0 || bbox.height_deg() <= 0.0 {
            return Err(MapError::Configuration(format!(
                "polygon has no area: {}",
                bbox
            )));
        }
        Ok(polygon)
    }

    /// Parse GeoJSON and use the first ring of the first polygon
    ///
    /// Accepts a bare geometry, a feature or a feature collection. Anything
    /// other than a Polygon or MultiPolygon is a configuration error.
    pub fn from_geojson_str(text: &str) -> MapResult<Self> {
        let geojson: geojson::GeoJson = text
            .parse()
            .map_err(|e: geojson::Error| MapError::Configuration(format!("invalid GeoJSON: {}", e)))?;

        let geometry = match geojson {
            geojson::GeoJson::Geometry(geometry) => Some(geometry),
            geojson::GeoJson::Feature(feature) => feature.geometry,
            geojson::GeoJson::FeatureCollection(collection) => collection
                .features
                .into_iter()
                .next()
                .and_then(|feature| feature.geometry),
        }
        .ok_or_else(|| MapError::Configuration("GeoJSON contains no geometry".to_string()))?;

        let outer = match geometry.value {
            geojson::Value::Polygon(rings) => rings.into_iter().next(),
            geojson::Value::MultiPolygon(polygons) => polygons
                .into_iter()
                .next()
                .and_then(|rings| rings.into_iter().next()),
            _ => {
                return Err(MapError::Configuration(
                    "expected a Polygon or MultiPolygon geometry".to_string(),
                ))
            }
        }
        .ok_or_else(|| MapError::Configuration("polygon has no rings".to_string()))?;

        let ring = outer
            .iter()
            .map(|position| match position.as_slice() {
                [lng, lat, ..] => Ok(GeoCoord::from_lng_lat(*lng, *lat)),
                _ => Err(MapError::Configuration(
                    "position needs longitude and latitude".to_string(),
                )),
            })
            .collect::<MapResult<Vec<_>>>()?;
        Self::from_ring(ring)
    }

    pub fn ring(&self) -> &[GeoCoord] {
        &self.ring
    }

    pub fn bbox(&self) -> BoundingBox {
        // from_ring guarantees at least three points
        BoundingBox::from_coords(&self.ring).unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0))
    }
}

/// User-adjustable inputs for one generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub polygon: BoundingPolygon,
    pub exaggeration: f64,
    pub building_scale: f64,
}

impl GenerationRequest {
    /// Request with the configured default scale factors
    pub fn new(polygon: BoundingPolygon, config: &PipelineConfig) -> Self {
        Self {
            polygon,
            exaggeration: config.mesh.exaggeration,
            building_scale: config.mesh.building_scale,
        }
    }

    pub fn validate(&self) -> MapResult<()> {
        for (name, value) in [
            ("exaggeration", self.exaggeration),
            ("building_scale", self.building_scale),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MapError::Configuration(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Per-request state: identity, cancellation and the result slot
#[derive(Debug)]
pub struct GenerationContext {
    id: u64,
    cancel: CancellationToken,
    result: Mutex<Option<Arc<GeneratedModel>>>,
}

impl GenerationContext {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            result: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_result(&self, model: Arc<GeneratedModel>) {
        *self.result.lock() = Some(model);
    }

    pub fn result(&self) -> Option<Arc<GeneratedModel>> {
        self.result.lock().clone()
    }

    fn check(&self) -> MapResult<()> {
        if self.is_cancelled() {
            Err(MapError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Output of one successful generation
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedModel {
    pub id: u64,
    pub bbox: BoundingBox,
    pub mesh: MeshBuffer,
    pub elevation_zoom: u8,
    pub elevation_tiles: usize,
    pub min_elevation: f32,
    pub max_elevation: f32,
    pub grid: GridStats,
    pub mesh_stats: MeshStats,
    /// Strategy that supplied the buildings, if any did
    pub feature_strategy: Option<String>,
    pub request: GenerationRequest,
}

/// The complete bbox-to-mesh pipeline
pub struct Pipeline {
    config: PipelineConfig,
    elevation: Arc<dyn TileSource>,
    extractor: Arc<VectorFeatureExtractor>,
    backend: Arc<dyn GridBackend>,
}

impl Pipeline {
    /// Pipeline over explicit sources
    pub fn new(
        config: PipelineConfig,
        elevation: Arc<dyn TileSource>,
        extractor: VectorFeatureExtractor,
    ) -> Self {
        Self {
            config,
            elevation,
            extractor: Arc::new(extractor),
            backend: Arc::new(CpuGridBackend),
        }
    }

    /// Pipeline over an elevation source and a chain of feature strategies
    ///
    /// The configured polygon layers are extracted alongside the buildings.
    pub fn with_sources(
        config: PipelineConfig,
        elevation: Arc<dyn TileSource>,
        strategies: Vec<Box<dyn FeatureStrategy>>,
    ) -> Self {
        let extractor = VectorFeatureExtractor::new(strategies, &config.tiles)
            .with_polygon_layers(config.polygon_layers.iter().map(|s| s.layer.clone()));
        Self::new(config, elevation, extractor)
    }

    /// Pipeline over the HTTP endpoints named in the configuration
    pub fn from_config(config: PipelineConfig) -> MapResult<Self> {
        config.validate()?;
        let client = build_http_client(config.sources.timeout(), &config.sources.user_agent)?;
        let elevation = Arc::new(HttpTileSource::with_client(
            client.clone(),
            config.sources.elevation_url.clone(),
        ));
        let extractor = VectorFeatureExtractor::from_config(client, &config.sources, &config.tiles)
            .with_polygon_layers(config.polygon_layers.iter().map(|s| s.layer.clone()));
        Ok(Self::new(config, elevation, extractor))
    }

    /// Replace the grid backend
    pub fn with_backend(mut self, backend: Arc<dyn GridBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one generation
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        ctx: &GenerationContext,
    ) -> MapResult<GeneratedModel> {
        let span = info_span!("generation", id = ctx.id());
        self.run(request, ctx).instrument(span).await
    }

    async fn run(&self, request: &GenerationRequest, ctx: &GenerationContext) -> MapResult<GeneratedModel> {
        request.validate()?;
        let bbox = request.polygon.bbox();
        let tile_config = &self.config.tiles;
        let zoom = select_zoom(
            &bbox,
            tile_config.max_elevation_zoom,
            tile_config.max_elevation_tiles,
        );
        let tiles = tiles_for_bbox(&bbox, zoom);
        info!(%bbox, zoom, tiles = tiles.len(), "starting generation");

        let cancel = ctx.token();
        let (elevation, features) = tokio::join!(
            ElevationTileDecoder::fetch_and_decode(self.elevation.as_ref(), &tiles, cancel),
            self.extractor.extract(&bbox, cancel),
        );
        let decoded = elevation?;
        let features = features?;
        ctx.check()?;
        info!(
            elevation_tiles = decoded.len(),
            buildings = features.buildings.len(),
            "tiles fetched"
        );

        let backend = Arc::clone(&self.backend);
        let grid_config = self.config.grid.clone();
        let grid_cancel = cancel.clone();
        let elevation_tiles = decoded.len();
        let grid = tokio::task::spawn_blocking(move || {
            backend.build(&bbox, &decoded, &grid_config, &grid_cancel)
        })
        .await??;
        ctx.check()?;

        let normalizer = FeatureNormalizer::new(bbox, &self.config.features);
        let buildings = normalizer.normalize_all(&features.buildings, &grid);
        let polygons: BTreeMap<String, Vec<_>> = features
            .layers
            .iter()
            .map(|(layer, found)| (layer.clone(), normalizer.filter_polygons(found)))
            .collect();

        let synthesizer = MeshSynthesizer::new(self.config.mesh.clone(), self.config.polygon_layers.clone());
        let mesh_cancel = cancel.clone();
        let (exaggeration, building_scale) = (request.exaggeration, request.building_scale);
        let (mesh, mesh_stats, grid) = tokio::task::spawn_blocking(move || {
            let input = SynthesisInput {
                grid: &grid,
                buildings: &buildings,
                polygons: &polygons,
                exaggeration,
                building_scale,
            };
            synthesizer
                .synthesize(&input, &mesh_cancel)
                .map(|(mesh, stats)| (mesh, stats, grid))
        })
        .await??;
        ctx.check()?;

        Ok(GeneratedModel {
            id: ctx.id(),
            bbox,
            mesh,
            elevation_zoom: zoom,
            elevation_tiles,
            min_elevation: grid.min_elevation,
            max_elevation: grid.max_elevation,
            grid: grid.stats,
            mesh_stats,
            feature_strategy: features.strategy,
            request: request.clone(),
        })
    }
}
