//! Terrain-RGB elevation tiles
//!
//! Each raster DEM tile stores height per pixel as
//! `elevation_m = -10000 + (R * 65536 + G * 256 + B) * 0.1`. Alpha is ignored.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MapError, MapResult};
use crate::source::{fetch_all, TileSource};
use crate::tiles::Tile;

/// Elevation of the all-zero pixel
pub const TERRAIN_RGB_OFFSET: f64 = -10_000.0;

/// Meters per unit of the packed 24-bit value
pub const TERRAIN_RGB_SCALE: f64 = 0.1;

/// Largest packed value (`0xFFFFFF`)
const TERRAIN_RGB_MAX: u32 = 0x00FF_FFFF;

/// Decode one terrain-RGB pixel to meters
pub fn decode_terrain_rgb(r: u8, g: u8, b: u8) -> f64 {
    let packed = (r as u32) * 65_536 + (g as u32) * 256 + b as u32;
    TERRAIN_RGB_OFFSET + packed as f64 * TERRAIN_RGB_SCALE
}

/// Encode meters to the nearest terrain-RGB pixel
///
/// Returns `None` outside `[-10000, 1667721.5]`.
pub fn encode_terrain_rgb(meters: f64) -> Option<[u8; 3]> {
    if !meters.is_finite() {
        return None;
    }
    let packed = ((meters - TERRAIN_RGB_OFFSET) / TERRAIN_RGB_SCALE).round();
    if packed < 0.0 || packed > TERRAIN_RGB_MAX as f64 {
        return None;
    }
    let packed = packed as u32;
    Some([(packed >> 16) as u8, (packed >> 8) as u8, packed as u8])
}

/// One decoded elevation tile
#[derive(Debug, Clone)]
pub struct DecodedTile {
    pub tile: Tile,
    pub width: u32,
    pub height: u32,
    /// Elevation in meters, row-major, top (north) row first
    pub elevations: Vec<f32>,
}

impl DecodedTile {
    /// Decode an encoded image (PNG, WebP, ...) holding terrain-RGB pixels
    pub fn decode(tile: Tile, bytes: &[u8]) -> MapResult<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| MapError::decode(format!("elevation tile {}", tile), e))?
            .to_rgba8();
        let (width, height) = image.dimensions();
        Self::from_rgba(tile, width, height, image.as_raw())
    }

    /// Decode raw RGBA pixels
    pub fn from_rgba(tile: Tile, width: u32, height: u32, rgba: &[u8]) -> MapResult<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        if width == 0 || height == 0 || rgba.len() != expected {
            return Err(MapError::decode(
                format!("elevation tile {}", tile),
                format!(
                    "expected {} RGBA bytes for {}x{}, got {}",
                    expected,
                    width,
                    height,
                    rgba.len()
                ),
            ));
        }
        let elevations = rgba
            .chunks_exact(4)
            .map(|px| decode_terrain_rgb(px[0], px[1], px[2]) as f32)
            .collect();
        Ok(Self {
            tile,
            width,
            height,
            elevations,
        })
    }

    /// Build a tile directly from elevation samples
    pub fn from_elevations(tile: Tile, width: u32, height: u32, elevations: Vec<f32>) -> Self {
        assert_eq!(
            elevations.len(),
            (width * height) as usize,
            "Elevation count must equal width * height"
        );
        Self {
            tile,
            width,
            height,
            elevations,
        }
    }

    /// Elevation at a pixel, `None` out of range
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x < self.width && y < self.height {
            Some(self.elevations[(y * self.width + x) as usize])
        } else {
            None
        }
    }

    /// Minimum and maximum of the finite samples
    pub fn finite_min_max(&self) -> Option<(f32, f32)> {
        self.elevations
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// Fetches and decodes the elevation tiles for one request
pub struct ElevationTileDecoder;

impl ElevationTileDecoder {
    /// Fetch all tiles concurrently and decode the ones that arrive
    ///
    /// Fetch and decode failures drop only the affected tile.
    pub async fn fetch_and_decode(
        source: &dyn TileSource,
        tiles: &[Tile],
        cancel: &CancellationToken,
    ) -> MapResult<Vec<DecodedTile>> {
        let fetched = fetch_all(source, tiles, cancel).await?;

        let mut decoded = Vec::with_capacity(fetched.len());
        for (tile, bytes) in fetched {
            if cancel.is_cancelled() {
                return Err(MapError::Cancelled);
            }
            match DecodedTile::decode(tile, &bytes) {
                Ok(tile_data) => {
                    debug!(
                        %tile,
                        width = tile_data.width,
                        height = tile_data.height,
                        "decoded elevation tile"
                    );
                    decoded.push(tile_data);
                }
                Err(e) => warn!(%tile, error = %e, "dropping undecodable elevation tile"),
            }
        }
        Ok(decoded)
    }
}
