//! Flat extrusions for non-building polygon layers
//!
//! Landuse, water and transportation areas are extruded by a fixed depth from
//! one shared base height instead of following the terrain per vertex. Caps
//! are ear-clipped so concave outlines stay inside their footprint.

use std::collections::HashSet;

use glam::{DVec2, DVec3};
use tracing::debug;

use super::building::{clockwise_ring, push_walls};
use super::color::parse_hex_color;
use super::MeshBuffer;
use crate::config::PolygonLayerStyle;
use crate::coords::{GeoCoord, MeshProjection};
use crate::error::MapResult;

/// Lattice size used to find the lowest terrain point for the shared base
pub const BASE_SAMPLES: usize = 10;

/// Rounding applied to coordinates before building a signature (~0.1 m)
const SIGNATURE_SCALE: f64 = 1e6;

/// Order-independent key for a ring
///
/// Coordinates are rounded, the ring is rotated to start at its smallest
/// vertex and oriented consistently, so the same polygon delivered by two
/// neighbouring tiles yields the same key.
pub fn polygon_signature(ring: &[GeoCoord]) -> String {
    let mut points: Vec<(i64, i64)> = ring
        .iter()
        .map(|c| {
            (
                (c.lon * SIGNATURE_SCALE).round() as i64,
                (c.lat * SIGNATURE_SCALE).round() as i64,
            )
        })
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points.dedup();

    let twice_area: i128 = (0..points.len())
        .map(|i| {
            let (x0, y0) = points[i];
            let (x1, y1) = points[(i + 1) % points.len()];
            x0 as i128 * y1 as i128 - x1 as i128 * y0 as i128
        })
        .sum();
    if twice_area > 0 {
        points.reverse();
    }
    if let Some(start) = (0..points.len()).min_by_key(|&i| points[i]) {
        points.rotate_left(start);
    }

    points
        .iter()
        .map(|(x, y)| format!("{},{}", x, y))
        .collect::<Vec<_>>()
        .join(";")
}

/// Ear-clip a clockwise ring and return counter-clockwise triangles
fn triangulate(ring: &[DVec2]) -> Option<Vec<[usize; 3]>> {
    let flat: Vec<f64> = ring.iter().flat_map(|p| [p.x, p.y]).collect();
    let indices = earcutr::earcut(&flat, &[], 2).ok()?;
    let triangles: Vec<[usize; 3]> = indices
        .chunks_exact(3)
        .filter_map(|t| {
            let (a, b, c) = (ring[t[0]], ring[t[1]], ring[t[2]]);
            let cross = (b - a).perp_dot(c - a);
            if cross > 0.0 {
                Some([t[0], t[1], t[2]])
            } else if cross < 0.0 {
                Some([t[0], t[2], t[1]])
            } else {
                None
            }
        })
        .collect();
    (!triangles.is_empty()).then_some(triangles)
}

/// Extrudes the polygons of one layer, skipping duplicates
#[derive(Debug)]
pub struct PolygonLayerMesher {
    depth: f64,
    z_offset: f64,
    color: [f32; 3],
    seen: HashSet<String>,
    duplicates: usize,
}

impl PolygonLayerMesher {
    pub fn new(style: &PolygonLayerStyle) -> MapResult<Self> {
        Ok(Self {
            depth: style.depth,
            z_offset: style.z_offset,
            color: parse_hex_color(&style.color)?,
            seen: HashSet::new(),
            duplicates: 0,
        })
    }

    /// Number of rings skipped as duplicates so far
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Extrude one ring from `base_z`; `None` for duplicates and degenerate rings
    pub fn extrude(
        &mut self,
        ring: &[GeoCoord],
        projection: &MeshProjection,
        base_z: f64,
    ) -> Option<MeshBuffer> {
        if !self.seen.insert(polygon_signature(ring)) {
            self.duplicates += 1;
            debug!("skipping duplicate polygon");
            return None;
        }

        let ring = clockwise_ring(ring.iter().map(|c| projection.to_mesh(c)))?;
        let triangles = triangulate(&ring)?;
        let z_bottom = base_z + self.z_offset;
        let z_top = z_bottom + self.depth;

        let mut mesh = MeshBuffer::with_colors();
        let bottom: Vec<u32> = ring
            .iter()
            .map(|p| mesh.push_vertex(DVec3::new(p.x, p.y, z_bottom), self.color))
            .collect();
        let top: Vec<u32> = ring
            .iter()
            .map(|p| mesh.push_vertex(DVec3::new(p.x, p.y, z_top), self.color))
            .collect();

        for [a, b, c] in triangles {
            mesh.push_triangle(top[a], top[b], top[c]);
            mesh.push_triangle(bottom[a], bottom[c], bottom[b]);
        }
        push_walls(&mut mesh, &bottom, &top);
        Some(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::BoundingBox;

    fn l_shape() -> Vec<GeoCoord> {
        // Concave L, counter-clockwise
        [
            (0.0, 0.0),
            (0.004, 0.0),
            (0.004, 0.001),
            (0.001, 0.001),
            (0.001, 0.004),
            (0.0, 0.004),
        ]
        .iter()
        .map(|&(lng, lat)| GeoCoord::from_lng_lat(10.0 + lng, 50.0 + lat))
        .collect()
    }

    fn mesher() -> PolygonLayerMesher {
        PolygonLayerMesher::new(&PolygonLayerStyle::new("landuse", "#00ff00", 0.5, 0.1)).unwrap()
    }

    fn projection() -> MeshProjection {
        MeshProjection::new(BoundingBox::new(10.0, 50.0, 10.005, 50.005), 200.0)
    }

    #[test]
    fn test_signature_ignores_rotation_orientation_and_closure() {
        let ring = l_shape();
        let mut rotated = ring.clone();
        rotated.rotate_left(2);
        let mut reversed = ring.clone();
        reversed.reverse();
        let mut closed = ring.clone();
        closed.push(ring[0]);

        let key = polygon_signature(&ring);
        assert_eq!(polygon_signature(&rotated), key);
        assert_eq!(polygon_signature(&reversed), key);
        assert_eq!(polygon_signature(&closed), key);

        let mut moved = ring.clone();
        moved[0].lat += 0.001;
        assert_ne!(polygon_signature(&moved), key);
    }

    #[test]
    fn test_concave_extrusion_volume() {
        let mut mesher = mesher();
        let mesh = mesher.extrude(&l_shape(), &projection(), 5.0).unwrap();

        // L area is 7 unit squares of 0.001 deg; 40 mesh units per 0.001 deg
        let expected = 7.0 * 40.0 * 40.0 * 0.5;
        assert!((mesh.signed_volume() - expected).abs() / expected < 1e-4);

        let (lo, hi) = mesh.bounding_box().unwrap();
        assert!((lo.z - 5.1).abs() < 1e-5);
        assert!((hi.z - 5.6).abs() < 1e-5);
        mesh.validate().unwrap();
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let mut mesher = mesher();
        let mut shifted_start = l_shape();
        shifted_start.rotate_left(3);

        assert!(mesher.extrude(&l_shape(), &projection(), 0.0).is_some());
        assert!(mesher.extrude(&shifted_start, &projection(), 0.0).is_none());
        assert_eq!(mesher.duplicates(), 1);
    }

    #[test]
    fn test_invalid_color_is_rejected() {
        assert!(PolygonLayerMesher::new(&PolygonLayerStyle::new("water", "blue", 1.0, 0.0)).is_err());
    }
}
