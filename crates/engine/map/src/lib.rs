//! Geospatial-to-mesh synthesis
//!
//! This crate turns a geographic bounding box into a single closed 3D mesh:
//! terrain from terrain-RGB elevation tiles, extruded buildings and flat
//! polygon layers from Mapbox Vector Tiles.
//!
//! # Modules
//!
//! - [`coords`], [`area`]: geographic positions, query boxes and the mesh-plane projection
//! - [`tiles`]: slippy-map tile addressing and zoom selection
//! - [`source`]: tile sources (HTTP, filesystem, in-memory)
//! - [`elevation`]: terrain-RGB decoding
//! - [`grid`]: fusing elevation tiles into one smoothed grid
//! - [`vector`]: MVT decoding and feature extraction strategies
//! - [`features`]: filtering and normalizing building footprints
//! - [`mesh`]: terrain, building and polygon-layer mesh synthesis
//! - [`export`]: OBJ and JSON writers
//! - [`pipeline`], [`scheduler`]: end-to-end generation and debounced scheduling
//! - [`config`]: TOML and environment configuration

pub mod area;
pub mod config;
pub mod coords;
pub mod elevation;
pub mod error;
pub mod export;
pub mod features;
pub mod grid;
pub mod mesh;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod tiles;
pub mod vector;

pub use area::BoundingBox;
pub use config::PipelineConfig;
pub use coords::{GeoCoord, MeshProjection};
pub use error::{MapError, MapResult};
pub use export::{exporter_for, JsonExporter, MeshExporter, ObjExporter};
pub use grid::{ElevationGrid, ElevationGridBuilder, GridBackend};
pub use mesh::{MeshBuffer, MeshSynthesizer};
pub use pipeline::{BoundingPolygon, GeneratedModel, GenerationContext, GenerationRequest, Pipeline};
pub use scheduler::{GenerationRegistry, GenerationScheduler};
pub use source::{FileTileSource, HttpTileSource, MemoryTileSource, TileSource};
pub use tiles::Tile;
pub use vector::{FeatureStrategy, VectorFeatureExtractor};
