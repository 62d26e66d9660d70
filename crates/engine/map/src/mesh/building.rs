//! Building extrusion

use glam::{DVec2, DVec3};

use super::terrain::TerrainSurface;
use super::MeshBuffer;
use crate::area::BoundingBox;
use crate::coords::MeshProjection;
use crate::features::BuildingData;

const MIN_ADAPTIVE_SCALE: f64 = 0.001;
const MAX_ADAPTIVE_SCALE: f64 = 0.5;
const LARGE_AREA_DIAGONAL_M: f64 = 10_000.0;
const SMALL_AREA_DIAGONAL_M: f64 = 2_000.0;

/// Scale that turns real meters into mesh units for a query box
///
/// Starts from the horizontal meters-to-mesh ratio, boosts large areas,
/// damps small ones and clamps to a sane range.
pub fn adaptive_scale_factor(bbox: &BoundingBox, terrain_size: f64) -> f64 {
    let extent_m = bbox.width_m().max(bbox.height_m()).max(1.0);
    let mut factor = terrain_size / extent_m;

    let diagonal = bbox.diagonal_m();
    if diagonal > LARGE_AREA_DIAGONAL_M {
        factor *= 1.5;
    } else if diagonal < SMALL_AREA_DIAGONAL_M {
        factor *= 0.8;
    }
    if factor.is_nan() {
        return MIN_ADAPTIVE_SCALE;
    }
    factor.clamp(MIN_ADAPTIVE_SCALE, MAX_ADAPTIVE_SCALE)
}

/// Per-request building extrusion settings
#[derive(Debug, Clone, Copy)]
pub struct BuildingParams {
    pub adaptive_scale: f64,
    pub user_scale: f64,
    pub submerge_offset: f64,
    pub color: [f32; 3],
}

/// Twice the signed area of a planar ring; negative means clockwise
pub fn signed_area_2d(ring: &[DVec2]) -> f64 {
    let Some(&origin) = ring.first() else {
        return 0.0;
    };
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (a, b) = (ring[i] - origin, ring[(i + 1) % n] - origin);
            a.perp_dot(b)
        })
        .sum()
}

/// Project a footprint onto the mesh plane, oriented clockwise
///
/// Consecutive duplicates are dropped. Returns `None` for degenerate rings.
pub fn clockwise_ring(points: impl IntoIterator<Item = DVec2>) -> Option<Vec<DVec2>> {
    let mut ring: Vec<DVec2> = Vec::new();
    for p in points {
        if ring.last().is_none_or(|last| last.distance_squared(p) > 1e-18) {
            ring.push(p);
        }
    }
    while ring.len() > 1 && ring[0].distance_squared(ring[ring.len() - 1]) <= 1e-18 {
        ring.pop();
    }
    if ring.len() < 3 {
        return None;
    }
    let area = signed_area_2d(&ring);
    if area == 0.0 || !area.is_finite() {
        return None;
    }
    if area > 0.0 {
        ring.reverse();
    }
    Some(ring)
}

/// Emit wall quads for a clockwise ring given bottom and top vertex indices
pub(crate) fn push_walls(mesh: &mut MeshBuffer, bottom: &[u32], top: &[u32]) {
    let n = bottom.len();
    for i in 0..n {
        let j = (i + 1) % n;
        mesh.push_triangle(bottom[i], top[j], bottom[j]);
        mesh.push_triangle(bottom[i], top[i], top[j]);
    }
}

/// Extrude one building into a closed prism
///
/// The base sits at the lowest terrain point under the footprint, sunk by
/// the submerge offset; caps are fan-triangulated.
pub fn extrude_building(
    building: &BuildingData,
    projection: &MeshProjection,
    surface: &TerrainSurface<'_>,
    params: &BuildingParams,
) -> Option<MeshBuffer> {
    let lowest = building
        .footprint
        .iter()
        .map(|c| surface.z_at(c))
        .fold(f64::INFINITY, f64::min);
    let ground = if lowest.is_finite() {
        lowest
    } else {
        surface.z_for_elevation(building.base_elevation)
    };

    let ring = clockwise_ring(building.footprint.iter().map(|c| projection.to_mesh(c)))?;
    let height = building.height * params.adaptive_scale * params.user_scale;
    let z_top = ground + height + params.submerge_offset;
    let z_bottom = ground - params.submerge_offset;

    let mut mesh = MeshBuffer::with_colors();
    let bottom: Vec<u32> = ring
        .iter()
        .map(|p| mesh.push_vertex(DVec3::new(p.x, p.y, z_bottom), params.color))
        .collect();
    let top: Vec<u32> = ring
        .iter()
        .map(|p| mesh.push_vertex(DVec3::new(p.x, p.y, z_top), params.color))
        .collect();

    for i in 1..ring.len() - 1 {
        mesh.push_triangle(top[0], top[i + 1], top[i]);
        mesh.push_triangle(bottom[0], bottom[i], bottom[i + 1]);
    }
    push_walls(&mut mesh, &bottom, &top);
    Some(mesh)
}
