//! Mesh synthesis
//!
//! Everything ends up in one [`MeshBuffer`]: the terrain solid, one extrusion
//! per building and flat extrusions for the extra polygon layers. Coordinates
//! are X east, Y north, Z up; every triangle is wound counter-clockwise when
//! seen from outside the solid.

pub mod building;
pub mod color;
pub mod polygon;
pub mod terrain;

use std::collections::BTreeMap;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{MeshConfig, PolygonLayerStyle};
use crate::coords::MeshProjection;
use crate::error::{MapError, MapResult};
use crate::features::BuildingData;
use crate::grid::ElevationGrid;
use crate::vector::PolygonFeature;

pub use building::{adaptive_scale_factor, extrude_building, BuildingParams};
pub use color::{elevation_color, parse_hex_color};
pub use polygon::{polygon_signature, PolygonLayerMesher};
pub use terrain::{build_terrain, TerrainSurface};

const DEFAULT_COLOR: [f32; 3] = [1.0, 1.0, 1.0];

/// Flat triangle mesh with optional per-vertex colors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshBuffer {
    /// Vertex positions as consecutive x, y, z triples
    pub positions: Vec<f32>,
    /// Triangle vertex indices
    pub indices: Vec<u32>,
    /// Vertex colors as consecutive r, g, b triples
    pub colors: Option<Vec<f32>>,
}

impl MeshBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty buffer that records vertex colors
    pub fn with_colors() -> Self {
        Self {
            colors: Some(Vec::new()),
            ..Self::default()
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Add a vertex and return its index
    pub fn push_vertex(&mut self, position: DVec3, color: [f32; 3]) -> u32 {
        let index = self.vertex_count() as u32;
        self.positions
            .extend_from_slice(&[position.x as f32, position.y as f32, position.z as f32]);
        if let Some(colors) = &mut self.colors {
            colors.extend_from_slice(&color);
        }
        index
    }

    pub fn push_triangle(&mut self, a: u32, b: u32, c: u32) {
        self.indices.extend_from_slice(&[a, b, c]);
    }

    pub fn position(&self, index: usize) -> DVec3 {
        let p = &self.positions[index * 3..index * 3 + 3];
        DVec3::new(p[0] as f64, p[1] as f64, p[2] as f64)
    }

    fn triangles(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        self.indices
            .chunks_exact(3)
            .map(|t| [t[0] as usize, t[1] as usize, t[2] as usize])
    }

    /// Append another buffer, renumbering its indices past our vertices
    pub fn append(&mut self, other: &MeshBuffer) {
        if other.is_empty() {
            return;
        }
        let offset = self.vertex_count() as u32;

        match (&mut self.colors, &other.colors) {
            (Some(colors), Some(other_colors)) => colors.extend_from_slice(other_colors),
            (Some(colors), None) => {
                colors.extend(std::iter::repeat_n(DEFAULT_COLOR, other.vertex_count()).flatten())
            }
            (None, Some(other_colors)) => {
                let mut colors: Vec<f32> = std::iter::repeat_n(DEFAULT_COLOR, self.vertex_count())
                    .flatten()
                    .collect();
                colors.extend_from_slice(other_colors);
                self.colors = Some(colors);
            }
            (None, None) => {}
        }

        self.positions.extend_from_slice(&other.positions);
        self.indices.extend(other.indices.iter().map(|i| i + offset));
    }

    /// Axis-aligned bounds, `None` for an empty buffer
    pub fn bounding_box(&self) -> Option<(DVec3, DVec3)> {
        (0..self.vertex_count()).map(|i| self.position(i)).fold(None, |acc, p| {
            Some(match acc {
                None => (p, p),
                Some((lo, hi)) => (lo.min(p), hi.max(p)),
            })
        })
    }

    pub fn translate(&mut self, offset: DVec3) {
        for p in self.positions.chunks_exact_mut(3) {
            p[0] = (p[0] as f64 + offset.x) as f32;
            p[1] = (p[1] as f64 + offset.y) as f32;
            p[2] = (p[2] as f64 + offset.z) as f32;
        }
    }

    /// Move the bounding-box center to the origin; returns the applied offset
    pub fn center_at_origin(&mut self) -> DVec3 {
        let Some((lo, hi)) = self.bounding_box() else {
            return DVec3::ZERO;
        };
        let offset = -(lo + hi) / 2.0;
        self.translate(offset);
        offset
    }

    /// Area-weighted smooth vertex normals
    pub fn vertex_normals(&self) -> Vec<[f32; 3]> {
        let mut normals = vec![DVec3::ZERO; self.vertex_count()];
        for [a, b, c] in self.triangles() {
            let (pa, pb, pc) = (self.position(a), self.position(b), self.position(c));
            let face = (pb - pa).cross(pc - pa);
            normals[a] += face;
            normals[b] += face;
            normals[c] += face;
        }
        normals
            .into_iter()
            .map(|n| {
                let n = n.normalize_or_zero();
                [n.x as f32, n.y as f32, n.z as f32]
            })
            .collect()
    }

    /// Signed volume enclosed by the triangles; positive when they face outward
    pub fn signed_volume(&self) -> f64 {
        self.triangles()
            .map(|[a, b, c]| {
                let (pa, pb, pc) = (self.position(a), self.position(b), self.position(c));
                pa.dot(pb.cross(pc)) / 6.0
            })
            .sum()
    }

    /// Check structural invariants
    pub fn validate(&self) -> MapResult<()> {
        if self.positions.len() % 3 != 0 || self.indices.len() % 3 != 0 {
            return Err(MapError::Validation(
                "position or index count not a multiple of 3".to_string(),
            ));
        }
        let count = self.vertex_count();
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= count) {
            return Err(MapError::Validation(format!(
                "index {} out of range for {} vertices",
                bad, count
            )));
        }
        if let Some(colors) = &self.colors {
            if colors.len() != self.positions.len() {
                return Err(MapError::Validation(format!(
                    "{} color components for {} position components",
                    colors.len(),
                    self.positions.len()
                )));
            }
        }
        if self.positions.iter().any(|v| !v.is_finite()) {
            return Err(MapError::Validation("non-finite vertex position".to_string()));
        }
        Ok(())
    }
}

/// Everything the synthesizer consumes for one request
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub grid: &'a ElevationGrid,
    pub buildings: &'a [BuildingData],
    /// Extra polygon layers keyed by layer name
    pub polygons: &'a BTreeMap<String, Vec<PolygonFeature>>,
    pub exaggeration: f64,
    pub building_scale: f64,
}

/// Counts reported after synthesis
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeshStats {
    pub terrain_triangles: usize,
    pub buildings: usize,
    pub polygons: usize,
    pub duplicate_polygons: usize,
    /// Translation applied when centering the merged mesh
    pub center_offset: [f64; 3],
}

/// Builds the merged model mesh
#[derive(Debug, Clone)]
pub struct MeshSynthesizer {
    config: MeshConfig,
    polygon_styles: Vec<PolygonLayerStyle>,
}

impl MeshSynthesizer {
    pub fn new(config: MeshConfig, polygon_styles: Vec<PolygonLayerStyle>) -> Self {
        Self {
            config,
            polygon_styles,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Build terrain, buildings and polygon layers, then center the result once
    pub fn synthesize(
        &self,
        input: &SynthesisInput<'_>,
        cancel: &CancellationToken,
    ) -> MapResult<(MeshBuffer, MeshStats)> {
        let grid = input.grid;
        let surface = TerrainSurface::new(grid, &self.config, input.exaggeration);
        let projection = MeshProjection::new(grid.bbox, self.config.terrain_size);
        let mut stats = MeshStats::default();

        let mut mesh = build_terrain(grid, &surface, &self.config);
        stats.terrain_triangles = mesh.triangle_count();

        if cancel.is_cancelled() {
            return Err(MapError::Cancelled);
        }

        let params = BuildingParams {
            adaptive_scale: adaptive_scale_factor(&grid.bbox, self.config.terrain_size),
            user_scale: input.building_scale,
            submerge_offset: self.config.submerge_offset,
            color: parse_hex_color(&self.config.building_color)?,
        };
        debug!(adaptive_scale = params.adaptive_scale, "building scale");

        for building in input.buildings {
            if let Some(extruded) = extrude_building(building, &projection, &surface, &params) {
                mesh.append(&extruded);
                stats.buildings += 1;
            }
        }

        if cancel.is_cancelled() {
            return Err(MapError::Cancelled);
        }

        let base_z = surface.lowest_z(&grid.bbox, polygon::BASE_SAMPLES);
        for style in &self.polygon_styles {
            let Some(features) = input.polygons.get(&style.layer) else {
                continue;
            };
            let mut mesher = PolygonLayerMesher::new(style)?;
            for feature in features {
                if let Some(extruded) = mesher.extrude(&feature.ring, &projection, base_z) {
                    mesh.append(&extruded);
                    stats.polygons += 1;
                }
            }
            stats.duplicate_polygons += mesher.duplicates();
        }

        let offset = mesh.center_at_origin();
        stats.center_offset = offset.to_array();
        if !self.config.vertex_colors {
            mesh.colors = None;
        }
        mesh.validate()?;

        info!(
            vertices = mesh.vertex_count(),
            triangles = mesh.triangle_count(),
            buildings = stats.buildings,
            polygons = stats.polygons,
            "mesh synthesized"
        );
        Ok((mesh, stats))
    }
}
