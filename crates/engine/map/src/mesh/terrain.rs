//! Terrain solid
//!
//! One top and one bottom vertex per grid cell. The top follows the smoothed
//! elevation, the bottom is flat at z = 0, and walls along the four borders
//! close the solid.

use glam::DVec3;

use super::color::{elevation_color, shade};
use super::MeshBuffer;
use crate::area::BoundingBox;
use crate::config::MeshConfig;
use crate::coords::GeoCoord;
use crate::grid::ElevationGrid;

/// Maps elevations and positions onto terrain-surface Z
#[derive(Debug, Clone, Copy)]
pub struct TerrainSurface<'a> {
    grid: &'a ElevationGrid,
    base_height: f64,
    vertical_scale: f64,
}

impl<'a> TerrainSurface<'a> {
    pub fn new(grid: &'a ElevationGrid, config: &MeshConfig, exaggeration: f64) -> Self {
        Self {
            grid,
            base_height: config.base_height,
            vertical_scale: config.vertical_span * exaggeration,
        }
    }

    /// Surface Z for an elevation in meters
    pub fn z_for_elevation(&self, elevation: f64) -> f64 {
        self.base_height + self.grid.normalized(elevation as f32) * self.vertical_scale
    }

    /// Surface Z under a geographic position; outside the grid this is the base
    pub fn z_at(&self, coord: &GeoCoord) -> f64 {
        self.z_for_elevation(self.grid.sample_bilinear(coord) as f64)
    }

    /// Lowest surface Z over an evenly spaced `samples x samples` lattice
    pub fn lowest_z(&self, bbox: &BoundingBox, samples: usize) -> f64 {
        let samples = samples.max(2);
        let step = |i: usize| i as f64 / (samples - 1) as f64;
        let mut lowest = f64::INFINITY;
        for iy in 0..samples {
            for ix in 0..samples {
                let coord = GeoCoord::new(
                    bbox.min_lat + bbox.height_deg() * step(iy),
                    bbox.min_lng + bbox.width_deg() * step(ix),
                );
                lowest = lowest.min(self.z_at(&coord));
            }
        }
        lowest
    }
}

/// Build the closed terrain solid for a grid
pub fn build_terrain(grid: &ElevationGrid, surface: &TerrainSurface<'_>, config: &MeshConfig) -> MeshBuffer {
    let (w, h) = (grid.width, grid.height);
    let size = config.terrain_size;
    let mut mesh = MeshBuffer::with_colors();
    if w < 2 || h < 2 {
        return mesh;
    }

    let plane = |i: usize, n: usize| -size / 2.0 + size * i as f64 / (n - 1) as f64;

    // Top vertices: index y * w + x
    for y in 0..h {
        for x in 0..w {
            let elevation = grid.data[y * w + x];
            let color = elevation_color(grid.normalized(elevation));
            let z = surface.z_for_elevation(elevation as f64);
            mesh.push_vertex(DVec3::new(plane(x, w), plane(y, h), z), color);
        }
    }
    // Bottom vertices: index w * h + y * w + x
    for y in 0..h {
        for x in 0..w {
            let color = shade(elevation_color(0.0), 0.6);
            mesh.push_vertex(DVec3::new(plane(x, w), plane(y, h), 0.0), color);
        }
    }

    let top = |x: usize, y: usize| (y * w + x) as u32;
    let bottom = |x: usize, y: usize| (w * h + y * w + x) as u32;

    for y in 0..h - 1 {
        for x in 0..w - 1 {
            let (a, b, c, d) = (top(x, y), top(x + 1, y), top(x, y + 1), top(x + 1, y + 1));
            mesh.push_triangle(a, b, d);
            mesh.push_triangle(a, d, c);

            let (a, b, c, d) = (
                bottom(x, y),
                bottom(x + 1, y),
                bottom(x, y + 1),
                bottom(x + 1, y + 1),
            );
            mesh.push_triangle(a, d, b);
            mesh.push_triangle(a, c, d);
        }
    }

    // South (y = 0) and north (y = h - 1) walls
    for x in 0..w - 1 {
        let (ab, bb, at, bt) = (bottom(x, 0), bottom(x + 1, 0), top(x, 0), top(x + 1, 0));
        mesh.push_triangle(ab, bb, bt);
        mesh.push_triangle(ab, bt, at);

        let y = h - 1;
        let (ab, bb, at, bt) = (bottom(x, y), bottom(x + 1, y), top(x, y), top(x + 1, y));
        mesh.push_triangle(ab, bt, bb);
        mesh.push_triangle(ab, at, bt);
    }

    // West (x = 0) and east (x = w - 1) walls
    for y in 0..h - 1 {
        let (pb, qb, pt, qt) = (bottom(0, y), bottom(0, y + 1), top(0, y), top(0, y + 1));
        mesh.push_triangle(pb, qt, qb);
        mesh.push_triangle(pb, pt, qt);

        let x = w - 1;
        let (pb, qb, pt, qt) = (bottom(x, y), bottom(x, y + 1), top(x, y), top(x, y + 1));
        mesh.push_triangle(pb, qb, qt);
        mesh.push_triangle(pb, qt, pt);
    }

    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_with(data: Vec<f32>, w: usize, h: usize) -> ElevationGrid {
        ElevationGrid::from_data(BoundingBox::new(0.0, 0.0, 0.01, 0.01), w, h, data)
    }

    #[test]
    fn test_terrain_counts() {
        let grid = grid_with(vec![0.0; 12], 4, 3);
        let config = MeshConfig::default();
        let mesh = build_terrain(&grid, &TerrainSurface::new(&grid, &config, 1.0), &config);

        assert_eq!(mesh.vertex_count(), 2 * 12);
        // 2 * 2 per quad on top and bottom, 2 per border segment
        let quads = 3 * 2;
        let border = 2 * (3 + 2);
        assert_eq!(mesh.triangle_count(), 4 * quads + 2 * border);
        mesh.validate().unwrap();
    }

    #[test]
    fn test_flat_terrain_volume_is_slab() {
        let grid = grid_with(vec![50.0; 25], 5, 5);
        let config = MeshConfig::default();
        let mesh = build_terrain(&grid, &TerrainSurface::new(&grid, &config, 1.0), &config);

        let expected = config.terrain_size * config.terrain_size * config.base_height;
        assert!((mesh.signed_volume() - expected).abs() / expected < 1e-4);
    }

    #[test]
    fn test_rugged_terrain_has_positive_volume() {
        let data: Vec<f32> = (0..64)
            .map(|i| ((i * 37) % 11) as f32 * 120.0 - 300.0)
            .collect();
        let grid = grid_with(data, 8, 8);
        let config = MeshConfig::default();
        for exaggeration in [0.0, 1.0, 3.5] {
            let surface = TerrainSurface::new(&grid, &config, exaggeration);
            let mesh = build_terrain(&grid, &surface, &config);
            assert!(mesh.signed_volume() > 0.0);
        }
    }

    #[test]
    fn test_top_faces_point_up() {
        let grid = grid_with(vec![0.0; 9], 3, 3);
        let config = MeshConfig::default();
        let mesh = build_terrain(&grid, &TerrainSurface::new(&grid, &config, 1.0), &config);
        let normals = mesh.vertex_normals();
        // Center top vertex only touches top triangles
        assert!(normals[4][2] > 0.99);
        // Center bottom vertex only touches bottom triangles
        assert!(normals[9 + 4][2] < -0.99);
    }

    #[test]
    fn test_surface_z_mapping() {
        let grid = grid_with(vec![0.0, 100.0, 100.0, 200.0], 2, 2);
        let config = MeshConfig::default();
        let surface = TerrainSurface::new(&grid, &config, 2.0);
        assert_eq!(surface.z_for_elevation(0.0), config.base_height);
        let top = surface.z_for_elevation(200.0);
        assert!((top - (config.base_height + 2.0 * config.vertical_span)).abs() < 1e-9);
        // Outside the grid samples the minimum elevation
        assert_eq!(surface.z_at(&GeoCoord::new(5.0, 5.0)), config.base_height);
        assert_eq!(surface.lowest_z(&grid.bbox, 10), config.base_height);
    }
}
