//! Axis-aligned geographic query regions
//!
//! A [`BoundingBox`] is the region a generation request covers. It drives
//! tile enumeration, grid sampling and the mesh-plane projection.

use serde::{Deserialize, Serialize};

use crate::coords::GeoCoord;

/// Approximate meters per degree of latitude
const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// A rectangular area in degrees, `[min_lng, min_lat, max_lng, max_lat]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Create a bounding box from its west, south, east and north edges
    pub fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Self {
        Self {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        }
    }

    /// Smallest box containing every coordinate, or `None` for an empty slice
    pub fn from_coords(coords: &[GeoCoord]) -> Option<Self> {
        let first = coords.first()?;
        let mut bbox = Self::new(first.lon, first.lat, first.lon, first.lat);
        for coord in &coords[1..] {
            bbox.min_lng = bbox.min_lng.min(coord.lon);
            bbox.min_lat = bbox.min_lat.min(coord.lat);
            bbox.max_lng = bbox.max_lng.max(coord.lon);
            bbox.max_lat = bbox.max_lat.max(coord.lat);
        }
        Some(bbox)
    }

    /// Parse `"minLng,minLat,maxLng,maxLat"`
    pub fn parse(text: &str) -> Option<Self> {
        let values: Vec<f64> = text
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match values.as_slice() {
            [min_lng, min_lat, max_lng, max_lat] => {
                Some(Self::new(*min_lng, *min_lat, *max_lng, *max_lat))
            }
            _ => None,
        }
    }

    /// Check if the box is finite, within WGS84 ranges and not inverted
    pub fn is_valid(&self) -> bool {
        self.south_west().is_valid()
            && self.north_east().is_valid()
            && self.min_lat <= self.max_lat
            && self.min_lng <= self.max_lng
    }

    pub fn south_west(&self) -> GeoCoord {
        GeoCoord::new(self.min_lat, self.min_lng)
    }

    pub fn north_east(&self) -> GeoCoord {
        GeoCoord::new(self.max_lat, self.max_lng)
    }

    /// Get the center point of the box
    pub fn center(&self) -> GeoCoord {
        GeoCoord::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Longitude span in degrees
    pub fn width_deg(&self) -> f64 {
        self.max_lng - self.min_lng
    }

    /// Latitude span in degrees
    pub fn height_deg(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    /// Approximate east-west extent in meters at the center latitude
    pub fn width_m(&self) -> f64 {
        let center_lat = self.center().lat.to_radians();
        self.width_deg() * METERS_PER_DEG_LAT * center_lat.cos()
    }

    /// Approximate north-south extent in meters
    pub fn height_m(&self) -> f64 {
        self.height_deg() * METERS_PER_DEG_LAT
    }

    /// Great-circle length of the south-west to north-east diagonal
    pub fn diagonal_m(&self) -> f64 {
        self.south_west().distance_to(&self.north_east())
    }

    /// Check if a point lies inside the box (edges inclusive)
    pub fn contains(&self, point: &GeoCoord) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lon >= self.min_lng
            && point.lon <= self.max_lng
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:.6}, {:.6}, {:.6}, {:.6}]",
            self.min_lng, self.min_lat, self.max_lng, self.max_lat
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_creation() {
        let bbox = BoundingBox::new(-123.0, 45.0, -122.0, 46.0);
        assert!(bbox.is_valid());
        assert_eq!(bbox.width_deg(), 1.0);
        assert_eq!(bbox.height_deg(), 1.0);
        assert!(!BoundingBox::new(-122.0, 45.0, -123.0, 46.0).is_valid());
    }

    #[test]
    fn test_bbox_from_coords() {
        let coords = [
            GeoCoord::new(45.2, -122.9),
            GeoCoord::new(45.8, -122.1),
            GeoCoord::new(45.5, -122.5),
        ];
        let bbox = BoundingBox::from_coords(&coords).unwrap();
        assert_eq!(bbox, BoundingBox::new(-122.9, 45.2, -122.1, 45.8));
        assert!(BoundingBox::from_coords(&[]).is_none());
    }

    #[test]
    fn test_bbox_parse() {
        let bbox = BoundingBox::parse("13.37, 52.50,13.42,52.53").unwrap();
        assert_eq!(bbox, BoundingBox::new(13.37, 52.50, 13.42, 52.53));
        assert!(BoundingBox::parse("1,2,3").is_none());
        assert!(BoundingBox::parse("a,b,c,d").is_none());
    }

    #[test]
    fn test_bbox_contains() {
        let bbox = BoundingBox::new(-123.0, 45.0, -122.0, 46.0);
        assert!(bbox.contains(&GeoCoord::new(45.5, -122.5)));
        assert!(bbox.contains(&GeoCoord::new(45.0, -123.0)));
        assert!(!bbox.contains(&GeoCoord::new(44.9, -122.5)));
    }

    #[test]
    fn test_bbox_extent_in_meters() {
        let bbox = BoundingBox::new(0.0, 0.0, 0.01, 0.01);
        assert!((bbox.height_m() - 1113.2).abs() < 1.0);
        assert!((bbox.width_m() - 1113.2).abs() < 1.0);
        assert!((bbox.diagonal_m() - 1574.0).abs() < 5.0);
    }
}
