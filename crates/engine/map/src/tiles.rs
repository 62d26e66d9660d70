//! Slippy-map tile addressing
//!
//! Converts between bounding boxes and Web Mercator `{z}/{x}/{y}` tiles,
//! enumerates the tiles covering a box and picks the elevation zoom level.

use serde::{Deserialize, Serialize};

use crate::area::BoundingBox;
use crate::coords::{lat_to_mercator_row, lon_to_tile_column, mercator_row_to_lat, tile_column_to_lon};

/// Highest zoom any tile server in practice serves
pub const MAX_SUPPORTED_ZOOM: u8 = 22;

/// Highest zoom requested for elevation tiles
pub const MAX_ELEVATION_ZOOM: u8 = 12;

/// Elevation zoom is lowered until the box needs at most this many tiles
pub const MAX_ELEVATION_TILES: usize = 4;

/// Fixed zoom for building and other vector tiles
pub const VECTOR_TILE_ZOOM: u8 = 14;

/// Vector fetches are skipped when the box needs more tiles than this
pub const MAX_VECTOR_TILES: usize = 9;

/// A map tile coordinate in the standard Web Mercator tile scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tile {
    /// X tile coordinate (0 to 2^z - 1), west to east
    pub x: u32,
    /// Y tile coordinate (0 to 2^z - 1), north to south
    pub y: u32,
    /// Zoom level
    pub z: u8,
}

impl Tile {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Number of tiles per axis at a zoom level
    pub fn tiles_per_axis(zoom: u8) -> u32 {
        1_u32 << zoom
    }

    /// Geographic bounds of this tile
    ///
    /// Latitude edges come from the inverse Mercator projection, longitude
    /// edges are linear in the column index.
    pub fn bounds(&self) -> BoundingBox {
        let n = Self::tiles_per_axis(self.z) as f64;
        BoundingBox::new(
            tile_column_to_lon(self.x as f64, n),
            mercator_row_to_lat((self.y + 1) as f64, n),
            tile_column_to_lon((self.x + 1) as f64, n),
            mercator_row_to_lat(self.y as f64, n),
        )
    }

    /// Expand a `{z}/{x}/{y}` URL or path template
    pub fn fill_template(&self, template: &str) -> String {
        template
            .replace("{z}", &self.z.to_string())
            .replace("{x}", &self.x.to_string())
            .replace("{y}", &self.y.to_string())
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Tile containing a position at the given zoom (floor-based)
///
/// Positions on the antimeridian or the Mercator poles are clamped into the
/// valid tile range.
pub fn lng_lat_to_tile(lng: f64, lat: f64, zoom: u8) -> Tile {
    let n = Tile::tiles_per_axis(zoom) as f64;
    let max_index = n - 1.0;
    let x = lon_to_tile_column(lng, n).floor().clamp(0.0, max_index);
    let y = lat_to_mercator_row(lat, n).floor();
    // NaN rows (lat beyond +-90) fall through clamp unchanged; map them to row 0
    let y = if y.is_nan() { 0.0 } else { y.clamp(0.0, max_index) };
    Tile::new(x as u32, y as u32, zoom)
}

fn corner_tiles(bbox: &BoundingBox, zoom: u8) -> (Tile, Tile) {
    // North-west corner has the smallest row index
    let north_west = lng_lat_to_tile(bbox.min_lng, bbox.max_lat, zoom);
    let south_east = lng_lat_to_tile(bbox.max_lng, bbox.min_lat, zoom);
    (north_west, south_east)
}

/// Number of tiles needed to cover a box: `(|dx| + 1) * (|dy| + 1)`
pub fn tile_count(bbox: &BoundingBox, zoom: u8) -> usize {
    let (a, b) = corner_tiles(bbox, zoom);
    let dx = a.x.abs_diff(b.x) as usize;
    let dy = a.y.abs_diff(b.y) as usize;
    (dx + 1) * (dy + 1)
}

/// Every tile in the inclusive rectangle between the box's corner tiles
pub fn tiles_for_bbox(bbox: &BoundingBox, zoom: u8) -> Vec<Tile> {
    let (a, b) = corner_tiles(bbox, zoom);
    let (x_start, x_end) = (a.x.min(b.x), a.x.max(b.x));
    let (y_start, y_end) = (a.y.min(b.y), a.y.max(b.y));

    let mut tiles = Vec::with_capacity(tile_count(bbox, zoom));
    for y in y_start..=y_end {
        for x in x_start..=x_end {
            tiles.push(Tile::new(x, y, zoom));
        }
    }
    tiles
}

/// Pick the elevation zoom for a box
///
/// Starts at `max_zoom` and steps down until the box fits in `max_tiles`
/// tiles or zoom 0 is reached, bounding request volume regardless of size.
pub fn select_zoom(bbox: &BoundingBox, max_zoom: u8, max_tiles: usize) -> u8 {
    let mut zoom = max_zoom;
    while zoom > 0 && tile_count(bbox, zoom) > max_tiles {
        zoom -= 1;
    }
    zoom
}

/// Elevation zoom with the default limits
pub fn select_elevation_zoom(bbox: &BoundingBox) -> u8 {
    select_zoom(bbox, MAX_ELEVATION_ZOOM, MAX_ELEVATION_TILES)
}
