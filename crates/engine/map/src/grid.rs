//! Elevation grid fusion
//!
//! Several decoded DEM tiles are resampled onto one uniform `width x height`
//! grid covering the request's bounding box:
//!
//! 1. scan the tiles for the global min/max elevation
//! 2. bilinearly sample every tile covering a cell, weighting each sample by
//!    its distance from the tile center so overlapping tiles blend
//! 3. divide by coverage, fill uncovered cells from the nearest covered cell
//! 4. smooth with a 5x5 Gaussian kernel, two passes, never in place
//!
//! Missing tiles degrade the result; they never abort it.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::area::BoundingBox;
use crate::config::GridConfig;
use crate::coords::GeoCoord;
use crate::elevation::DecodedTile;
use crate::error::{MapError, MapResult};

/// How much of a sample's weight fades out between tile center and edge
pub const EDGE_FADE: f64 = 0.7;

/// Covered-cell count below which nearest-fill scans the covered list
/// instead of searching outward ring by ring
const SPARSE_COVERAGE_LIMIT: usize = 1024;

/// Diagnostics gathered while building a grid
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GridStats {
    /// Tiles that contributed to the grid
    pub tiles: usize,
    /// Cells that received at least one tile sample
    pub covered_cells: usize,
    /// Cells filled from their nearest covered neighbour
    pub filled_cells: usize,
    /// True when no cell was covered and every cell holds the fallback value
    pub used_fallback: bool,
}

/// A uniform elevation grid over a bounding box
///
/// Row 0 lies on the southern edge (`min_lat`), column 0 on the western edge.
#[derive(Debug, Clone, Serialize)]
pub struct ElevationGrid {
    pub bbox: BoundingBox,
    pub width: usize,
    pub height: usize,
    /// Elevation values in meters, row-major
    pub data: Vec<f32>,
    /// Lowest elevation seen in the source tiles (before smoothing)
    pub min_elevation: f32,
    /// Highest elevation seen in the source tiles (before smoothing)
    pub max_elevation: f32,
    pub stats: GridStats,
}

impl ElevationGrid {
    /// Create a flat grid at the given elevation
    pub fn flat(bbox: BoundingBox, width: usize, height: usize, elevation: f32) -> Self {
        Self {
            bbox,
            width,
            height,
            data: vec![elevation; width * height],
            min_elevation: elevation,
            max_elevation: elevation,
            stats: GridStats::default(),
        }
    }

    /// Create a grid from existing data
    ///
    /// # Panics
    /// Panics if data length doesn't match width * height
    pub fn from_data(bbox: BoundingBox, width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "Data length must equal width * height"
        );
        let (min_elevation, max_elevation) = finite_min_max(&data).unwrap_or((0.0, 0.0));
        Self {
            bbox,
            width,
            height,
            data,
            min_elevation,
            max_elevation,
            stats: GridStats::default(),
        }
    }

    /// Elevation at a grid cell
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x < self.width && y < self.height {
            Some(self.data[y * self.width + x])
        } else {
            None
        }
    }

    /// Geographic position of a grid cell
    pub fn cell_coord(&self, x: usize, y: usize) -> GeoCoord {
        cell_coord(&self.bbox, self.width, self.height, x, y)
    }

    /// Fractional grid position of a geographic coordinate (unclamped)
    fn grid_position(&self, coord: &GeoCoord) -> (f64, f64) {
        let u = (coord.lon - self.bbox.min_lng) / self.bbox.width_deg().max(f64::EPSILON);
        let v = (coord.lat - self.bbox.min_lat) / self.bbox.height_deg().max(f64::EPSILON);
        (
            u * (self.width.saturating_sub(1)) as f64,
            v * (self.height.saturating_sub(1)) as f64,
        )
    }

    /// Grid cell nearest to a coordinate, clamped to the grid bounds
    pub fn nearest_cell(&self, coord: &GeoCoord) -> (usize, usize) {
        let (gx, gy) = self.grid_position(coord);
        let clamp = |value: f64, len: usize| -> usize {
            if value.is_nan() {
                0
            } else {
                value.round().clamp(0.0, len.saturating_sub(1) as f64) as usize
            }
        };
        (clamp(gx, self.width), clamp(gy, self.height))
    }

    /// Elevation of the nearest grid cell
    pub fn sample_nearest(&self, coord: &GeoCoord) -> f32 {
        let (x, y) = self.nearest_cell(coord);
        self.get(x, y).unwrap_or(self.min_elevation)
    }

    /// Bilinearly interpolated elevation; outside the bbox returns the minimum
    pub fn sample_bilinear(&self, coord: &GeoCoord) -> f32 {
        if !coord.is_finite() || !self.bbox.contains(coord) || self.data.is_empty() {
            return self.min_elevation;
        }
        let (gx, gy) = self.grid_position(coord);

        let x0 = (gx.floor() as usize).min(self.width - 1);
        let y0 = (gy.floor() as usize).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = (gx - x0 as f64).clamp(0.0, 1.0) as f32;
        let fy = (gy - y0 as f64).clamp(0.0, 1.0) as f32;

        let v00 = self.data[y0 * self.width + x0];
        let v10 = self.data[y0 * self.width + x1];
        let v01 = self.data[y1 * self.width + x0];
        let v11 = self.data[y1 * self.width + x1];

        let v0 = v00 * (1.0 - fx) + v10 * fx;
        let v1 = v01 * (1.0 - fx) + v11 * fx;
        v0 * (1.0 - fy) + v1 * fy
    }

    /// Elevation range used for normalization, never below one meter
    pub fn elevation_range(&self) -> f64 {
        (self.max_elevation as f64 - self.min_elevation as f64).max(1.0)
    }

    /// Map an elevation into `[0, 1]` relative to the source min/max
    pub fn normalized(&self, elevation: f32) -> f64 {
        (elevation as f64 - self.min_elevation as f64) / self.elevation_range()
    }
}

fn finite_min_max(values: &[f32]) -> Option<(f32, f32)> {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

fn cell_coord(bbox: &BoundingBox, width: usize, height: usize, x: usize, y: usize) -> GeoCoord {
    let fraction = |index: usize, len: usize| -> f64 {
        if len <= 1 {
            0.5
        } else {
            index as f64 / (len - 1) as f64
        }
    };
    GeoCoord::new(
        bbox.min_lat + bbox.height_deg() * fraction(y, height),
        bbox.min_lng + bbox.width_deg() * fraction(x, width),
    )
}

/// Sample weight for a position inside a tile
///
/// 1.0 at the tile center, fading quadratically to `1 - EDGE_FADE` at the edge.
pub fn edge_weight(x_frac: f64, y_frac: f64) -> f64 {
    let dx = (2.0 * (x_frac - 0.5)).abs();
    let dy = (2.0 * (y_frac - 0.5)).abs();
    let edge = dx.max(dy).min(1.0);
    1.0 - edge * edge * EDGE_FADE
}

/// Bilinear sample at fractional pixel coordinates
///
/// Returns `None` when any of the four surrounding pixels is non-finite.
pub fn sample_tile_bilinear(tile: &DecodedTile, px: f64, py: f64) -> Option<f64> {
    let max_x = tile.width.checked_sub(1)?;
    let max_y = tile.height.checked_sub(1)?;
    let px = px.clamp(0.0, max_x as f64);
    let py = py.clamp(0.0, max_y as f64);

    let x0 = px.floor() as u32;
    let y0 = py.floor() as u32;
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let fx = px - x0 as f64;
    let fy = py - y0 as f64;

    let v00 = tile.get(x0, y0)? as f64;
    let v10 = tile.get(x1, y0)? as f64;
    let v01 = tile.get(x0, y1)? as f64;
    let v11 = tile.get(x1, y1)? as f64;
    if !(v00.is_finite() && v10.is_finite() && v01.is_finite() && v11.is_finite()) {
        return None;
    }

    let top = v00 * (1.0 - fx) + v10 * fx;
    let bottom = v01 * (1.0 - fx) + v11 * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}

/// Global min/max over every finite pixel of every tile
///
/// Falls back to `(0, 0)` when nothing finite was decoded, so the fill value
/// (their midpoint) is always defined.
pub fn global_min_max(tiles: &[DecodedTile]) -> (f32, f32) {
    tiles
        .iter()
        .filter_map(DecodedTile::finite_min_max)
        .reduce(|(lo_a, hi_a), (lo_b, hi_b)| (lo_a.min(lo_b), hi_a.max(hi_b)))
        .unwrap_or((0.0, 0.0))
}

/// Weighted elevation sums and coverage weights per cell
#[derive(Debug, Clone)]
pub struct Coverage {
    pub width: usize,
    pub height: usize,
    pub weighted_sum: Vec<f64>,
    pub weight: Vec<f64>,
}

impl Coverage {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            weighted_sum: vec![0.0; width * height],
            weight: vec![0.0; width * height],
        }
    }

    pub fn is_covered(&self, index: usize) -> bool {
        self.weight[index] > 0.0
    }
}

/// Accumulate every tile's samples onto the grid
pub fn accumulate_tiles(
    bbox: &BoundingBox,
    width: usize,
    height: usize,
    tiles: &[DecodedTile],
    cancel: &CancellationToken,
) -> MapResult<Coverage> {
    let mut coverage = Coverage::new(width, height);
    let bounds: Vec<BoundingBox> = tiles.iter().map(|t| t.tile.bounds()).collect();

    for y in 0..height {
        if cancel.is_cancelled() {
            return Err(MapError::Cancelled);
        }
        for x in 0..width {
            let coord = cell_coord(bbox, width, height, x, y);
            let index = y * width + x;

            for (tile, tile_bounds) in tiles.iter().zip(&bounds) {
                if !tile_bounds.contains(&coord) {
                    continue;
                }
                let x_frac = (coord.lon - tile_bounds.min_lng) / tile_bounds.width_deg();
                let y_frac = (tile_bounds.max_lat - coord.lat) / tile_bounds.height_deg();
                let px = x_frac * (tile.width.saturating_sub(1)) as f64;
                let py = y_frac * (tile.height.saturating_sub(1)) as f64;

                let Some(elevation) = sample_tile_bilinear(tile, px, py) else {
                    continue;
                };
                let weight = edge_weight(x_frac, y_frac);
                coverage.weighted_sum[index] += elevation * weight;
                coverage.weight[index] += weight;
            }
        }
    }
    Ok(coverage)
}

/// Divide by coverage and fill uncovered cells
///
/// Uncovered cells copy the nearest covered cell (Euclidean distance in grid
/// space). With no coverage at all every cell gets `fallback`.
pub fn normalize_coverage(coverage: &Coverage, fallback: f32) -> (Vec<f32>, GridStats) {
    let (width, height) = (coverage.width, coverage.height);
    let mut data = vec![fallback; width * height];
    let mut covered = Vec::new();

    for index in 0..width * height {
        if coverage.is_covered(index) {
            data[index] = (coverage.weighted_sum[index] / coverage.weight[index]) as f32;
            covered.push((index % width, index / width));
        }
    }

    let mut stats = GridStats {
        covered_cells: covered.len(),
        ..GridStats::default()
    };
    if covered.is_empty() {
        stats.used_fallback = true;
        return (data, stats);
    }
    if covered.len() == data.len() {
        return (data, stats);
    }

    let source = data.clone();
    for y in 0..height {
        for x in 0..width {
            let index = y * width + x;
            if coverage.is_covered(index) {
                continue;
            }
            let (nx, ny) = if covered.len() < SPARSE_COVERAGE_LIMIT {
                nearest_in_list(&covered, x, y)
            } else {
                nearest_by_rings(coverage, x, y)
            };
            data[index] = source[ny * width + nx];
            stats.filled_cells += 1;
        }
    }
    (data, stats)
}

fn distance_sq(ax: usize, ay: usize, bx: usize, by: usize) -> usize {
    let dx = ax.abs_diff(bx);
    let dy = ay.abs_diff(by);
    dx * dx + dy * dy
}

fn nearest_in_list(covered: &[(usize, usize)], x: usize, y: usize) -> (usize, usize) {
    covered
        .iter()
        .copied()
        .min_by_key(|&(cx, cy)| distance_sq(x, y, cx, cy))
        .unwrap_or((x, y))
}

/// Search square rings of growing radius until no closer cell can exist
fn nearest_by_rings(coverage: &Coverage, x: usize, y: usize) -> (usize, usize) {
    let (width, height) = (coverage.width, coverage.height);
    let max_radius = width.max(height);
    let mut best: Option<((usize, usize), usize)> = None;

    for radius in 1..=max_radius {
        if let Some((_, best_dist)) = best {
            // Every cell on this ring is at least `radius` away
            if radius * radius > best_dist {
                break;
            }
        }
        let x_lo = x.saturating_sub(radius);
        let x_hi = (x + radius).min(width - 1);
        let y_lo = y.saturating_sub(radius);
        let y_hi = (y + radius).min(height - 1);

        for cy in y_lo..=y_hi {
            for cx in x_lo..=x_hi {
                let on_ring = cx.abs_diff(x) == radius || cy.abs_diff(y) == radius;
                if !on_ring || !coverage.is_covered(cy * width + cx) {
                    continue;
                }
                let dist = distance_sq(x, y, cx, cy);
                if best.is_none_or(|(_, best_dist)| dist < best_dist) {
                    best = Some(((cx, cy), dist));
                }
            }
        }
    }
    best.map(|(cell, _)| cell).unwrap_or((x, y))
}

/// Gaussian kernel weights for a square window of the given radius
pub fn gaussian_kernel(radius: usize) -> Vec<f64> {
    let size = 2 * radius + 1;
    let sigma = radius.max(1) as f64;
    let mut kernel = Vec::with_capacity(size * size);
    for ky in 0..size {
        for kx in 0..size {
            let dx = kx as f64 - radius as f64;
            let dy = ky as f64 - radius as f64;
            kernel.push((-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp());
        }
    }
    kernel
}

/// One smoothing pass, reading only from `input`
///
/// Kernel taps outside the grid are skipped and the remaining weights
/// renormalized, so a constant grid stays constant.
pub fn smooth_pass(input: &[f32], width: usize, height: usize, radius: usize) -> Vec<f32> {
    let kernel = gaussian_kernel(radius);
    let size = 2 * radius + 1;
    let mut output = vec![0.0f32; input.len()];

    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0f64;
            let mut weight_sum = 0.0f64;
            for ky in 0..size {
                let Some(sy) = (y + ky).checked_sub(radius).filter(|&sy| sy < height) else {
                    continue;
                };
                for kx in 0..size {
                    let Some(sx) = (x + kx).checked_sub(radius).filter(|&sx| sx < width) else {
                        continue;
                    };
                    let weight = kernel[ky * size + kx];
                    sum += input[sy * width + sx] as f64 * weight;
                    weight_sum += weight;
                }
            }
            output[y * width + x] = (sum / weight_sum) as f32;
        }
    }
    output
}

/// Apply `passes` smoothing passes, each from the previous pass's output
pub fn smooth(
    data: Vec<f32>,
    width: usize,
    height: usize,
    radius: usize,
    passes: usize,
    cancel: &CancellationToken,
) -> MapResult<Vec<f32>> {
    let mut current = data;
    for _ in 0..passes {
        if cancel.is_cancelled() {
            return Err(MapError::Cancelled);
        }
        current = smooth_pass(&current, width, height, radius);
    }
    Ok(current)
}

/// Backend that fuses decoded tiles into an elevation grid
///
/// Implementations must produce the same grid for the same inputs; an
/// accelerated backend can replace the CPU one without touching callers.
pub trait GridBackend: Send + Sync {
    fn build(
        &self,
        bbox: &BoundingBox,
        tiles: &[DecodedTile],
        config: &GridConfig,
        cancel: &CancellationToken,
    ) -> MapResult<ElevationGrid>;
}

/// Reference CPU implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuGridBackend;

impl GridBackend for CpuGridBackend {
    fn build(
        &self,
        bbox: &BoundingBox,
        tiles: &[DecodedTile],
        config: &GridConfig,
        cancel: &CancellationToken,
    ) -> MapResult<ElevationGrid> {
        ElevationGridBuilder::new(config.clone()).build(bbox, tiles, cancel)
    }
}

/// Builds an [`ElevationGrid`] from decoded tiles
#[derive(Debug, Clone)]
pub struct ElevationGridBuilder {
    config: GridConfig,
}

impl ElevationGridBuilder {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        bbox: &BoundingBox,
        tiles: &[DecodedTile],
        cancel: &CancellationToken,
    ) -> MapResult<ElevationGrid> {
        let (width, height) = (self.config.width, self.config.height);
        if width == 0 || height == 0 {
            return Err(MapError::Configuration(format!(
                "grid size must be positive, got {}x{}",
                width, height
            )));
        }

        let (min_elevation, max_elevation) = global_min_max(tiles);
        debug!(
            tiles = tiles.len(),
            min_elevation, max_elevation, "scanned elevation tiles"
        );

        let coverage = accumulate_tiles(bbox, width, height, tiles, cancel)?;
        let fallback = (min_elevation + max_elevation) / 2.0;
        let (normalized, mut stats) = normalize_coverage(&coverage, fallback);
        stats.tiles = tiles.len();

        if stats.used_fallback {
            let err = MapError::Resource(format!(
                "no elevation coverage for {}, using fallback {} m",
                bbox, fallback
            ));
            warn!(error = %err, "elevation grid degraded");
        } else if stats.filled_cells > 0 {
            debug!(
                filled = stats.filled_cells,
                covered = stats.covered_cells,
                "filled uncovered cells from nearest neighbours"
            );
        }

        let data = smooth(
            normalized,
            width,
            height,
            self.config.smoothing_radius,
            self.config.smoothing_passes,
            cancel,
        )?;

        Ok(ElevationGrid {
            bbox: *bbox,
            width,
            height,
            data,
            min_elevation,
            max_elevation,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::{lng_lat_to_tile, Tile};

    fn uniform_tile(tile: Tile, size: u32, value: f32) -> DecodedTile {
        DecodedTile::from_elevations(tile, size, size, vec![value; (size * size) as usize])
    }

    fn small_config(size: usize) -> GridConfig {
        GridConfig {
            width: size,
            height: size,
            ..GridConfig::default()
        }
    }

    #[test]
    fn test_edge_weight_profile() {
        assert!((edge_weight(0.5, 0.5) - 1.0).abs() < 1e-12);
        assert!((edge_weight(0.0, 0.5) - 0.3).abs() < 1e-12);
        assert!((edge_weight(0.5, 1.0) - 0.3).abs() < 1e-12);
        assert!((edge_weight(0.75, 0.5) - 0.825).abs() < 1e-12);
    }

    #[test]
    fn test_sample_tile_bilinear_interpolates() {
        let tile = DecodedTile::from_elevations(Tile::new(0, 0, 0), 2, 2, vec![0.0, 10.0, 20.0, 30.0]);
        assert!((sample_tile_bilinear(&tile, 0.5, 0.5).unwrap() - 15.0).abs() < 1e-9);
        assert!((sample_tile_bilinear(&tile, 1.0, 0.0).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_tile_bilinear_rejects_non_finite_neighbours() {
        let tile = DecodedTile::from_elevations(
            Tile::new(0, 0, 0),
            2,
            2,
            vec![0.0, f32::NAN, 20.0, 30.0],
        );
        assert!(sample_tile_bilinear(&tile, 0.5, 0.5).is_none());
    }

    #[test]
    fn test_global_min_max_defaults_without_data() {
        assert_eq!(global_min_max(&[]), (0.0, 0.0));
        let nan_tile = uniform_tile(Tile::new(0, 0, 0), 2, f32::NAN);
        assert_eq!(global_min_max(&[nan_tile]), (0.0, 0.0));
    }

    #[test]
    fn test_single_uniform_tile_yields_uniform_grid() {
        let tile = Tile::new(33, 21, 6);
        let b = tile.bounds();
        // 1 degree square well inside the tile
        let bbox = BoundingBox::new(b.min_lng + 1.0, b.min_lat + 1.0, b.min_lng + 2.0, b.min_lat + 2.0);
        assert_eq!(crate::tiles::tiles_for_bbox(&bbox, 6), vec![tile]);

        let grid = ElevationGridBuilder::new(small_config(40))
            .build(&bbox, &[uniform_tile(tile, 256, 100.0)], &CancellationToken::new())
            .unwrap();

        assert!(grid.data.iter().all(|v| (v - 100.0).abs() < 1e-4));
        assert_eq!(grid.stats.covered_cells, 40 * 40);
        assert_eq!((grid.min_elevation, grid.max_elevation), (100.0, 100.0));
    }

    #[test]
    fn test_empty_tile_set_uses_fallback_everywhere() {
        let bbox = BoundingBox::new(10.0, 50.0, 10.1, 50.1);
        let grid = ElevationGridBuilder::new(small_config(16))
            .build(&bbox, &[], &CancellationToken::new())
            .unwrap();
        assert!(grid.stats.used_fallback);
        assert!(grid.data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_partial_coverage_is_filled_and_finite() {
        // A box straddling two tiles, only the western one available
        let zoom = 10;
        let west = lng_lat_to_tile(13.0, 52.5, zoom);
        let wb = west.bounds();
        let bbox = BoundingBox::new(
            wb.max_lng - 0.2 * wb.width_deg(),
            wb.min_lat + 0.3 * wb.height_deg(),
            wb.max_lng + 0.2 * wb.width_deg(),
            wb.min_lat + 0.6 * wb.height_deg(),
        );

        let grid = ElevationGridBuilder::new(small_config(20))
            .build(&bbox, &[uniform_tile(west, 64, 42.0)], &CancellationToken::new())
            .unwrap();

        assert!(grid.stats.filled_cells > 0);
        assert!(grid.stats.covered_cells > 0);
        assert!(grid.data.iter().all(|v| v.is_finite()));
        assert!(grid.data.iter().all(|v| (v - 42.0).abs() < 1e-3));
    }

    #[test]
    fn test_overlapping_tiles_blend_by_edge_weight() {
        // Same tile twice with different values: result is the weight-neutral mean
        let tile = Tile::new(0, 0, 1);
        let b = tile.bounds();
        let bbox = BoundingBox::new(b.min_lng + 10.0, b.min_lat + 10.0, b.min_lng + 20.0, b.min_lat + 20.0);
        let coverage = accumulate_tiles(
            &bbox,
            4,
            4,
            &[uniform_tile(tile, 16, 10.0), uniform_tile(tile, 16, 30.0)],
            &CancellationToken::new(),
        )
        .unwrap();
        let (data, _) = normalize_coverage(&coverage, 0.0);
        assert!(data.iter().all(|v| (v - 20.0).abs() < 1e-4));
    }

    #[test]
    fn test_nearest_fill_strategies_agree() {
        let mut coverage = Coverage::new(12, 9);
        for &(x, y, value) in &[(1usize, 1usize, 5.0), (10, 2, 7.0), (6, 8, 9.0)] {
            let index = y * 12 + x;
            coverage.weighted_sum[index] = value;
            coverage.weight[index] = 1.0;
        }
        let covered: Vec<(usize, usize)> = vec![(1, 1), (10, 2), (6, 8)];
        for y in 0..9 {
            for x in 0..12 {
                let by_list = nearest_in_list(&covered, x, y);
                let by_rings = if coverage.is_covered(y * 12 + x) {
                    (x, y)
                } else {
                    nearest_by_rings(&coverage, x, y)
                };
                assert_eq!(
                    distance_sq(x, y, by_list.0, by_list.1),
                    distance_sq(x, y, by_rings.0, by_rings.1),
                    "cell ({}, {})",
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn test_smoothing_constant_grid_is_idempotent() {
        let data = vec![123.5f32; 30 * 20];
        let smoothed = smooth(data.clone(), 30, 20, 2, 2, &CancellationToken::new()).unwrap();
        for (a, b) in data.iter().zip(&smoothed) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_smoothing_is_not_in_place() {
        // A single spike must spread symmetrically; in-place updates would skew it
        let mut data = vec![0.0f32; 9 * 9];
        data[4 * 9 + 4] = 81.0;
        let smoothed = smooth_pass(&data, 9, 9, 2);
        let at = |x: usize, y: usize| smoothed[y * 9 + x];
        assert!((at(3, 4) - at(5, 4)).abs() < 1e-5);
        assert!((at(4, 3) - at(4, 5)).abs() < 1e-5);
        assert!((at(3, 3) - at(5, 5)).abs() < 1e-5);
        assert!(at(4, 4) < 81.0);
    }

    #[test]
    fn test_build_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ElevationGridBuilder::new(small_config(8)).build(
            &BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            &[],
            &cancel,
        );
        assert!(matches!(result, Err(MapError::Cancelled)));
    }

    #[test]
    fn test_grid_sampling() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let grid = ElevationGrid::from_data(bbox, 2, 2, vec![0.0, 100.0, 100.0, 200.0]);

        assert!((grid.sample_bilinear(&GeoCoord::new(0.5, 0.5)) - 100.0).abs() < 1e-3);
        assert_eq!(grid.sample_bilinear(&GeoCoord::new(2.0, 0.5)), 0.0);
        assert_eq!(grid.nearest_cell(&GeoCoord::new(0.9, 0.1)), (0, 1));
        assert_eq!(grid.nearest_cell(&GeoCoord::new(-5.0, 7.0)), (1, 0));
        assert_eq!(grid.sample_nearest(&GeoCoord::new(0.95, 0.95)), 200.0);
        assert!((grid.normalized(100.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_elevation_range_never_below_one() {
        let grid = ElevationGrid::flat(BoundingBox::new(0.0, 0.0, 1.0, 1.0), 3, 3, 12.0);
        assert_eq!(grid.elevation_range(), 1.0);
        assert_eq!(grid.normalized(12.0), 0.0);
    }
}
