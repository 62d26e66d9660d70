//! Feature normalization
//!
//! Turns raw polygon features into [`BuildingData`]: rings are validated,
//! filtered against the query box, given a clamped height and anchored to the
//! terrain through the elevation grid.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::area::BoundingBox;
use crate::config::FeatureConfig;
use crate::coords::GeoCoord;
use crate::error::{MapError, MapResult};
use crate::grid::ElevationGrid;
use crate::vector::{HeightAttributes, PolygonFeature};

/// Which footprints count as inside the query box
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainmentPolicy {
    /// Keep a footprint if any vertex is inside
    #[default]
    AnyVertex,
    /// Keep a footprint only if every vertex is inside
    AllVertices,
}

impl ContainmentPolicy {
    pub fn accepts(&self, bbox: &BoundingBox, ring: &[GeoCoord]) -> bool {
        match self {
            ContainmentPolicy::AnyVertex => ring.iter().any(|c| bbox.contains(c)),
            ContainmentPolicy::AllVertices => {
                !ring.is_empty() && ring.iter().all(|c| bbox.contains(c))
            }
        }
    }
}

/// Inclusive height bounds in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightRange {
    pub min: f64,
    pub max: f64,
}

impl HeightRange {
    /// Range applied to extruded buildings
    pub const BUILDINGS: HeightRange = HeightRange { min: 5.0, max: 500.0 };

    /// Range applied to plain footprints
    pub const FOOTPRINTS: HeightRange = HeightRange { min: 2.0, max: 500.0 };

    /// Preset by name: `buildings` or `footprints`
    pub fn preset(name: &str) -> Option<HeightRange> {
        match name.trim().to_ascii_lowercase().as_str() {
            "buildings" => Some(Self::BUILDINGS),
            "footprints" => Some(Self::FOOTPRINTS),
            _ => None,
        }
    }

    /// Clamp into the range; NaN maps to the minimum
    pub fn clamp(&self, height: f64) -> f64 {
        if height.is_nan() {
            self.min
        } else {
            height.clamp(self.min, self.max)
        }
    }

    pub fn contains(&self, height: f64) -> bool {
        height >= self.min && height <= self.max
    }
}

/// Resolve a feature height: attributes first, then the layer default, then clamp
pub fn resolve_height(attributes: &HeightAttributes, default_height: f64, range: &HeightRange) -> f64 {
    range.clamp(attributes.resolve().unwrap_or(default_height))
}

/// Arithmetic mean of the ring vertices, ignoring a closing duplicate
pub fn footprint_centroid(ring: &[GeoCoord]) -> Option<GeoCoord> {
    let ring = open_ring(ring);
    if ring.is_empty() {
        return None;
    }
    let n = ring.len() as f64;
    let (lat, lon) = ring
        .iter()
        .fold((0.0, 0.0), |(lat, lon), c| (lat + c.lat, lon + c.lon));
    Some(GeoCoord::new(lat / n, lon / n))
}

fn open_ring(ring: &[GeoCoord]) -> &[GeoCoord] {
    match ring {
        [first, .., last] if ring.len() > 1 && first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

/// A building ready for extrusion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildingData {
    /// Open footprint ring
    pub footprint: Vec<GeoCoord>,
    /// Clamped height in meters
    pub height: f64,
    /// Terrain elevation under the footprint centroid, in meters
    pub base_elevation: f64,
}

/// Validates, filters and anchors features for one request
#[derive(Debug, Clone)]
pub struct FeatureNormalizer {
    bbox: BoundingBox,
    policy: ContainmentPolicy,
    range: HeightRange,
    default_height: f64,
}

impl FeatureNormalizer {
    pub fn new(bbox: BoundingBox, config: &FeatureConfig) -> Self {
        Self {
            bbox,
            policy: config.containment,
            range: config.height_range,
            default_height: config.default_height,
        }
    }

    /// Check ring length and coordinate finiteness
    pub fn validate(&self, feature: &PolygonFeature) -> MapResult<()> {
        let ring = open_ring(&feature.ring);
        if ring.len() < 3 {
            return Err(MapError::Validation(format!(
                "ring has {} distinct points, need at least 3",
                ring.len()
            )));
        }
        if ring.iter().any(|c| !c.is_finite()) {
            return Err(MapError::Validation("non-finite ring coordinate".to_string()));
        }
        Ok(())
    }

    /// Validate and apply the containment policy
    pub fn accept(&self, feature: &PolygonFeature) -> MapResult<()> {
        self.validate(feature)?;
        if !self.policy.accepts(&self.bbox, &feature.ring) {
            return Err(MapError::Validation(format!(
                "footprint outside {} ({:?})",
                self.bbox, self.policy
            )));
        }
        Ok(())
    }

    /// Normalize one building feature
    pub fn normalize(&self, feature: &PolygonFeature, grid: &ElevationGrid) -> MapResult<BuildingData> {
        self.accept(feature)?;
        let footprint = open_ring(&feature.ring).to_vec();
        let centroid = footprint_centroid(&footprint)
            .ok_or_else(|| MapError::Validation("empty footprint".to_string()))?;

        Ok(BuildingData {
            height: resolve_height(&feature.heights, self.default_height, &self.range),
            base_elevation: grid.sample_nearest(&centroid) as f64,
            footprint,
        })
    }

    /// Normalize every building, dropping the ones that fail
    pub fn normalize_all(&self, features: &[PolygonFeature], grid: &ElevationGrid) -> Vec<BuildingData> {
        let buildings: Vec<BuildingData> = features
            .iter()
            .filter_map(|feature| match self.normalize(feature, grid) {
                Ok(building) => Some(building),
                Err(e) => {
                    debug!(id = ?feature.id, error = %e, "dropping building");
                    None
                }
            })
            .collect();
        debug!(
            kept = buildings.len(),
            dropped = features.len() - buildings.len(),
            "normalized buildings"
        );
        buildings
    }

    /// Validate and filter non-building polygons without height handling
    pub fn filter_polygons(&self, features: &[PolygonFeature]) -> Vec<PolygonFeature> {
        features
            .iter()
            .filter(|feature| self.accept(feature).is_ok())
            .map(|feature| PolygonFeature {
                ring: open_ring(&feature.ring).to_vec(),
                ..feature.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(ring: Vec<GeoCoord>, heights: HeightAttributes) -> PolygonFeature {
        PolygonFeature {
            layer: "building".to_string(),
            id: None,
            ring,
            heights,
        }
    }

    fn square(lng: f64, lat: f64, size: f64) -> Vec<GeoCoord> {
        vec![
            GeoCoord::from_lng_lat(lng, lat),
            GeoCoord::from_lng_lat(lng + size, lat),
            GeoCoord::from_lng_lat(lng + size, lat + size),
            GeoCoord::from_lng_lat(lng, lat + size),
        ]
    }

    fn bbox() -> BoundingBox {
        BoundingBox::new(10.0, 50.0, 10.1, 50.1)
    }

    #[test]
    fn test_height_clamp_always_in_range() {
        for range in [HeightRange::BUILDINGS, HeightRange::FOOTPRINTS] {
            for raw in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -3.0, 0.0, 1.0, 42.0, 1e9] {
                assert!(range.contains(range.clamp(raw)), "{} -> {}", raw, range.clamp(raw));
            }
        }
        assert_eq!(HeightRange::FOOTPRINTS.clamp(3.0), 3.0);
        assert_eq!(HeightRange::BUILDINGS.clamp(3.0), 5.0);
    }

    #[test]
    fn test_resolve_height_fallback_order() {
        let range = HeightRange::BUILDINGS;
        let render = HeightAttributes {
            render_height: Some(40.0),
            height: Some(20.0),
        };
        assert_eq!(resolve_height(&render, 5.0, &range), 40.0);

        let nan_only = HeightAttributes {
            render_height: Some(f64::NAN),
            height: None,
        };
        assert_eq!(resolve_height(&nan_only, 5.0, &range), 5.0);
        assert_eq!(resolve_height(&HeightAttributes::default(), 5.0, &range), 5.0);

        let huge = HeightAttributes {
            render_height: None,
            height: Some(2_000.0),
        };
        assert_eq!(resolve_height(&huge, 5.0, &range), 500.0);
    }

    #[test]
    fn test_centroid_is_vertex_mean_without_closing_point() {
        let mut ring = square(0.0, 0.0, 2.0);
        ring.push(ring[0]);
        let centroid = footprint_centroid(&ring).unwrap();
        assert!((centroid.lon - 1.0).abs() < 1e-12);
        assert!((centroid.lat - 1.0).abs() < 1e-12);
        assert!(footprint_centroid(&[]).is_none());
    }

    #[test]
    fn test_containment_policies() {
        let straddling = square(10.09, 50.05, 0.02);
        assert!(ContainmentPolicy::AnyVertex.accepts(&bbox(), &straddling));
        assert!(!ContainmentPolicy::AllVertices.accepts(&bbox(), &straddling));

        let inside = square(10.02, 50.02, 0.01);
        assert!(ContainmentPolicy::AllVertices.accepts(&bbox(), &inside));
    }

    #[test]
    fn test_validation_rejects_short_and_non_finite_rings() {
        let normalizer = FeatureNormalizer::new(bbox(), &FeatureConfig::default());
        let mut short = square(10.02, 50.02, 0.01);
        short.truncate(2);
        assert!(matches!(
            normalizer.validate(&feature(short, HeightAttributes::default())),
            Err(MapError::Validation(_))
        ));

        // Three points plus a closing duplicate is still a triangle
        let mut triangle = square(10.02, 50.02, 0.01);
        triangle.truncate(3);
        triangle.push(triangle[0]);
        assert!(normalizer
            .validate(&feature(triangle, HeightAttributes::default()))
            .is_ok());

        let mut broken = square(10.02, 50.02, 0.01);
        broken[1].lat = f64::NAN;
        assert!(normalizer
            .validate(&feature(broken, HeightAttributes::default()))
            .is_err());
    }

    #[test]
    fn test_normalize_anchors_to_grid_centroid_cell() {
        let bbox = bbox();
        // West half low, east half high
        let mut data = vec![0.0f32; 10 * 10];
        for y in 0..10 {
            for x in 5..10 {
                data[y * 10 + x] = 100.0;
            }
        }
        let grid = ElevationGrid::from_data(bbox, 10, 10, data);
        let normalizer = FeatureNormalizer::new(bbox, &FeatureConfig::default());

        let west = feature(square(10.01, 50.04, 0.01), HeightAttributes::default());
        let east = feature(
            square(10.08, 50.04, 0.01),
            HeightAttributes {
                render_height: None,
                height: Some(25.0),
            },
        );
        let outside = feature(square(11.0, 51.0, 0.01), HeightAttributes::default());

        let buildings = normalizer.normalize_all(&[west, east, outside], &grid);
        assert_eq!(buildings.len(), 2);
        assert_eq!(buildings[0].base_elevation, 0.0);
        assert_eq!(buildings[0].height, 5.0);
        assert_eq!(buildings[1].base_elevation, 100.0);
        assert_eq!(buildings[1].height, 25.0);
    }

    #[test]
    fn test_footprint_range_keeps_low_structures() {
        let bbox = bbox();
        let grid = ElevationGrid::from_data(bbox, 4, 4, vec![0.0; 16]);
        let shed = feature(
            square(10.04, 50.04, 0.001),
            HeightAttributes {
                render_height: Some(3.0),
                height: None,
            },
        );

        let buildings = FeatureNormalizer::new(bbox, &FeatureConfig::default());
        assert_eq!(buildings.normalize(&shed, &grid).unwrap().height, 5.0);

        let config = FeatureConfig {
            height_range: HeightRange::preset("footprints").unwrap(),
            ..FeatureConfig::default()
        };
        let footprints = FeatureNormalizer::new(bbox, &config);
        assert_eq!(footprints.normalize(&shed, &grid).unwrap().height, 3.0);
    }
}
