//! End-to-end generation against in-memory and file-backed tile sources

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use geozero::mvt::{self, tile, Message};
use terramesh_map::coords::{lat_to_mercator_row, lon_to_tile_column};
use terramesh_map::elevation::encode_terrain_rgb;
use terramesh_map::export::{MeshExporter, ObjExporter};
use terramesh_map::tiles::{select_zoom, tiles_for_bbox};
use terramesh_map::vector::FixedStrategy;
use terramesh_map::{
    BoundingBox, BoundingPolygon, FileTileSource, GenerationContext, GenerationRequest, MapError,
    MapResult, MemoryTileSource, Pipeline, PipelineConfig, Tile, TileSource,
};

const EXTENT: u32 = 4096;

/// Tile at zoom 14 that every scenario works inside
fn home_tile() -> Tile {
    Tile::new(8647, 5564, 14)
}

/// Small box around the center of the home tile
fn query_bbox() -> BoundingBox {
    let bounds = home_tile().bounds();
    let center = bounds.center();
    BoundingBox::new(
        center.lon - 0.002,
        center.lat - 0.002,
        center.lon + 0.002,
        center.lat + 0.002,
    )
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.grid.width = 24;
    config.grid.height = 24;
    config
}

fn terrain_png(meters: f64, size: u32) -> Vec<u8> {
    let [r, g, b] = encode_terrain_rgb(meters).unwrap();
    let image = image::RgbaImage::from_pixel(size, size, image::Rgba([r, g, b, 255]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// Elevation source covering every tile the query box needs
fn elevation_source(bbox: &BoundingBox, meters: f64) -> MemoryTileSource {
    let config = config();
    let zoom = select_zoom(
        bbox,
        config.tiles.max_elevation_zoom,
        config.tiles.max_elevation_tiles,
    );
    let mut source = MemoryTileSource::new("elevation");
    for tile in tiles_for_bbox(bbox, zoom) {
        source.insert(tile, terrain_png(meters, 32));
    }
    source
}

fn zz(value: i64) -> u32 {
    ((value << 1) ^ (value >> 63)) as u32
}

/// Tile-local pixel for a position inside `tile`
fn to_tile_px(tile: Tile, lng: f64, lat: f64) -> (i64, i64) {
    let n = Tile::tiles_per_axis(tile.z) as f64;
    let x = (lon_to_tile_column(lng, n) - tile.x as f64) * EXTENT as f64;
    let y = (lat_to_mercator_row(lat, n) - tile.y as f64) * EXTENT as f64;
    (x.round() as i64, y.round() as i64)
}

/// Polygon command stream for an axis-aligned geographic rectangle
fn rectangle_geometry(tile: Tile, west: f64, south: f64, east: f64, north: f64) -> Vec<u32> {
    let corners = [
        to_tile_px(tile, west, north),
        to_tile_px(tile, east, north),
        to_tile_px(tile, east, south),
        to_tile_px(tile, west, south),
    ];
    let mut out = vec![(1 << 3) | 1, zz(corners[0].0), zz(corners[0].1), (3 << 3) | 2];
    let mut cursor = corners[0];
    for &(x, y) in &corners[1..] {
        out.extend([zz(x - cursor.0), zz(y - cursor.1)]);
        cursor = (x, y);
    }
    out.push((1 << 3) | 7);
    out
}

fn layer(name: &str, geometries: Vec<Vec<u32>>) -> tile::Layer {
    tile::Layer {
        version: 2,
        name: name.to_string(),
        features: geometries
            .into_iter()
            .enumerate()
            .map(|(i, geometry)| tile::Feature {
                id: Some(i as u64 + 1),
                tags: vec![0, 0],
                r#type: Some(tile::GeomType::Polygon as i32),
                geometry,
            })
            .collect(),
        keys: vec!["height".to_string()],
        values: vec![tile::Value {
            double_value: Some(12.0),
            ..Default::default()
        }],
        extent: Some(EXTENT),
    }
}

/// Vector tile with one building at the query center, one building far
/// outside the query box and one landuse area
fn vector_tile_bytes() -> Vec<u8> {
    let tile = home_tile();
    let bbox = query_bbox();
    let center = bbox.center();
    let bounds = tile.bounds();

    let inside = rectangle_geometry(
        tile,
        center.lon - 0.0002,
        center.lat - 0.0002,
        center.lon + 0.0002,
        center.lat + 0.0002,
    );
    let outside = rectangle_geometry(
        tile,
        bounds.min_lng + 0.0005,
        bounds.min_lat + 0.0005,
        bounds.min_lng + 0.0009,
        bounds.min_lat + 0.0009,
    );
    let park = rectangle_geometry(
        tile,
        center.lon - 0.001,
        center.lat + 0.0005,
        center.lon - 0.0005,
        center.lat + 0.001,
    );

    mvt::Tile {
        layers: vec![
            layer("building", vec![inside, outside]),
            layer("landuse", vec![park]),
        ],
    }
    .encode_to_vec()
}

fn request(config: &PipelineConfig) -> GenerationRequest {
    GenerationRequest::new(BoundingPolygon::from_bbox(query_bbox()).unwrap(), config)
}

/// Counts fetches and serves nothing
#[derive(Default)]
struct CountingSource {
    fetches: AtomicUsize,
}

#[async_trait]
impl TileSource for CountingSource {
    async fn fetch(&self, tile: Tile) -> MapResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Err(MapError::network(tile, "unavailable"))
    }

    fn describe(&self) -> String {
        "counting".to_string()
    }
}

#[tokio::test]
async fn test_generates_terrain_buildings_and_layers() {
    let config = config();
    let vectors = MemoryTileSource::new("vector").with_tile(home_tile(), vector_tile_bytes());
    let pipeline = Pipeline::with_sources(
        config.clone(),
        Arc::new(elevation_source(&query_bbox(), 100.0)),
        vec![Box::new(FixedStrategy::new("primary", Arc::new(vectors), "building"))],
    );

    let ctx = GenerationContext::new(1);
    let model = pipeline.generate(&request(&config), &ctx).await.unwrap();

    assert_eq!(model.feature_strategy.as_deref(), Some("primary"));
    assert_eq!(model.mesh_stats.buildings, 1);
    assert_eq!(model.mesh_stats.polygons, 1);
    assert!((model.min_elevation - 100.0).abs() < 0.05);
    assert!((model.max_elevation - 100.0).abs() < 0.05);
    assert!(!model.grid.used_fallback);

    model.mesh.validate().unwrap();
    assert!(model.mesh.signed_volume() > 0.0);
    let (lo, hi) = model.mesh.bounding_box().unwrap();
    let center = (lo + hi) / 2.0;
    assert!(center.length() < 1e-3);
    assert!((hi.x - lo.x - config.mesh.terrain_size).abs() < 1e-3);
}

#[tokio::test]
async fn test_falls_back_to_next_strategy() {
    let config = config();
    let empty = MemoryTileSource::new("empty");
    let vectors = MemoryTileSource::new("vector").with_tile(home_tile(), vector_tile_bytes());
    let pipeline = Pipeline::with_sources(
        config.clone(),
        Arc::new(elevation_source(&query_bbox(), 100.0)),
        vec![
            Box::new(FixedStrategy::new("primary", Arc::new(empty), "building")),
            Box::new(FixedStrategy::new("fallback", Arc::new(vectors), "building")),
        ],
    );

    let model = pipeline
        .generate(&request(&config), &GenerationContext::new(1))
        .await
        .unwrap();

    assert_eq!(model.feature_strategy.as_deref(), Some("fallback"));
    // The building outside the query box is filtered the same way
    assert_eq!(model.mesh_stats.buildings, 1);
}

#[tokio::test]
async fn test_missing_elevation_uses_fallback_grid() {
    let config = config();
    let pipeline = Pipeline::with_sources(
        config.clone(),
        Arc::new(MemoryTileSource::new("elevation")),
        vec![Box::new(FixedStrategy::new(
            "primary",
            Arc::new(MemoryTileSource::new("vector")),
            "building",
        ))],
    );

    let model = pipeline
        .generate(&request(&config), &GenerationContext::new(1))
        .await
        .unwrap();

    assert!(model.grid.used_fallback);
    assert_eq!(model.mesh_stats.buildings, 0);
    assert!(model.feature_strategy.is_none());
    model.mesh.validate().unwrap();
    assert!(model.mesh.signed_volume() > 0.0);
}

#[tokio::test]
async fn test_invalid_request_fails_before_fetching() {
    let config = config();
    let elevation = Arc::new(CountingSource::default());
    let vectors = Arc::new(CountingSource::default());
    let pipeline = Pipeline::with_sources(
        config.clone(),
        elevation.clone(),
        vec![Box::new(FixedStrategy::new("primary", vectors.clone(), "building"))],
    );

    let mut bad = request(&config);
    bad.building_scale = -1.0;
    let result = pipeline.generate(&bad, &GenerationContext::new(1)).await;

    assert!(matches!(result, Err(MapError::Configuration(_))));
    assert_eq!(elevation.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(vectors.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_non_polygon_geojson_is_rejected() {
    let line = r#"{
        "type": "Feature",
        "properties": {},
        "geometry": { "type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]] }
    }"#;
    assert!(matches!(
        BoundingPolygon::from_geojson_str(line),
        Err(MapError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_cancelled_context_returns_cancelled() {
    let config = config();
    let pipeline = Pipeline::with_sources(
        config.clone(),
        Arc::new(elevation_source(&query_bbox(), 100.0)),
        vec![],
    );

    let ctx = GenerationContext::new(1);
    ctx.cancel();
    let result = pipeline.generate(&request(&config), &ctx).await;
    assert!(matches!(result, Err(MapError::Cancelled)));
}

#[tokio::test]
async fn test_file_backed_sources_and_obj_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let bbox = query_bbox();

    let elevation = FileTileSource::new(dir.path().join("terrain"), "{z}/{x}/{y}.png");
    let zoom = select_zoom(
        &bbox,
        config.tiles.max_elevation_zoom,
        config.tiles.max_elevation_tiles,
    );
    for tile in tiles_for_bbox(&bbox, zoom) {
        let path = elevation.path_for(tile);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, terrain_png(250.0, 16)).unwrap();
    }

    let vectors = FileTileSource::new(dir.path().join("vector"), "{z}/{x}/{y}.mvt");
    let path = vectors.path_for(home_tile());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vector_tile_bytes()).unwrap();

    let pipeline = Pipeline::with_sources(
        config.clone(),
        Arc::new(elevation),
        vec![Box::new(FixedStrategy::new("files", Arc::new(vectors), "building"))],
    );
    let model = pipeline
        .generate(&request(&config), &GenerationContext::new(1))
        .await
        .unwrap();
    assert_eq!(model.mesh_stats.buildings, 1);

    let out = dir.path().join("model.obj");
    ObjExporter::default().write_file(&model.mesh, &out).unwrap();
    let text = std::fs::read_to_string(&out).unwrap();
    let vertices = text.lines().filter(|l| l.starts_with("v ")).count();
    let faces = text.lines().filter(|l| l.starts_with("f ")).count();
    assert_eq!(vertices, model.mesh.vertex_count());
    assert_eq!(faces, model.mesh.triangle_count());
}
