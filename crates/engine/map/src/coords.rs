//! Coordinate types for geographic and mesh-space positions
//!
//! Geographic positions are WGS84 degrees. Mesh positions live on a square
//! plane of `terrain_size` units centered at the origin, X east and Y north,
//! with Z up.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::area::BoundingBox;

/// Mean Earth radius used for distance approximations
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Geographic coordinate using WGS84 datum (latitude/longitude)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    /// Latitude in degrees (-90 to 90, positive = north)
    pub lat: f64,
    /// Longitude in degrees (-180 to 180, positive = east)
    pub lon: f64,
}

impl GeoCoord {
    /// Create a new geographic coordinate
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Create from a `(lng, lat)` pair, the order used by vector tiles and GeoJSON
    pub fn from_lng_lat(lng: f64, lat: f64) -> Self {
        Self { lat, lon: lng }
    }

    /// Check if the coordinate is within valid ranges
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }

    /// Both components are finite numbers
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }

    /// Approximate distance to another coordinate in meters (Haversine)
    pub fn distance_to(&self, other: &GeoCoord) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_M * c
    }
}

impl Default for GeoCoord {
    fn default() -> Self {
        Self { lat: 0.0, lon: 0.0 }
    }
}

/// Web Mercator latitude for a fractional tile row at the given tile count per axis
pub fn mercator_row_to_lat(row: f64, tiles_per_axis: f64) -> f64 {
    (std::f64::consts::PI * (1.0 - 2.0 * row / tiles_per_axis))
        .sinh()
        .atan()
        .to_degrees()
}

/// Fractional Web Mercator tile row for a latitude
pub fn lat_to_mercator_row(lat: f64, tiles_per_axis: f64) -> f64 {
    let lat_rad = lat.to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0
        * tiles_per_axis
}

/// Fractional tile column for a longitude
pub fn lon_to_tile_column(lon: f64, tiles_per_axis: f64) -> f64 {
    (lon + 180.0) / 360.0 * tiles_per_axis
}

/// Longitude of a fractional tile column
pub fn tile_column_to_lon(column: f64, tiles_per_axis: f64) -> f64 {
    column / tiles_per_axis * 360.0 - 180.0
}

/// Linear projection from a bounding box onto the square mesh plane
///
/// The bbox maps onto `[-size/2, size/2]` on both axes regardless of its
/// aspect ratio, matching how the terrain grid is laid out.
#[derive(Debug, Clone, Copy)]
pub struct MeshProjection {
    pub bbox: BoundingBox,
    /// Edge length of the terrain plane in mesh units
    pub size: f64,
}

impl MeshProjection {
    pub fn new(bbox: BoundingBox, size: f64) -> Self {
        Self { bbox, size }
    }

    /// Map a geographic position to mesh-plane X/Y
    pub fn to_mesh(&self, coord: &GeoCoord) -> DVec2 {
        let nx = (coord.lon - self.bbox.min_lng) / self.bbox.width_deg().max(f64::EPSILON);
        let ny = (coord.lat - self.bbox.min_lat) / self.bbox.height_deg().max(f64::EPSILON);
        DVec2::new(nx * self.size - self.size / 2.0, ny * self.size - self.size / 2.0)
    }

    /// Map a mesh-plane position back to geographic coordinates
    pub fn to_geo(&self, point: DVec2) -> GeoCoord {
        let nx = (point.x + self.size / 2.0) / self.size;
        let ny = (point.y + self.size / 2.0) / self.size;
        GeoCoord::new(
            self.bbox.min_lat + ny * self.bbox.height_deg(),
            self.bbox.min_lng + nx * self.bbox.width_deg(),
        )
    }
}
