//! Geofence containment and geodesic helpers.
//!
//! All predicates work on the sphere rather than on a flat lat/lon plane:
//! circle membership uses great-circle distance, and polygon edges are
//! great-circle arcs.
//!
//! Evaluation is a linear scan over the active geofences for every update,
//! which is fine for tens to low hundreds of regions. Larger deployments
//! need a bounding-box pre-filter in front of [`contains`].

use std::f64::consts::PI;

use crate::models::{GeofenceShape, Point};

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

const DEG_TO_RAD: f64 = PI / 180.0;

/// Calculate the great-circle distance between two points in meters.
///
/// Uses the haversine formula, which stays accurate over short distances.
pub fn distance_m(from: Point, to: Point) -> f64 {
    let lat1_rad = from.latitude * DEG_TO_RAD;
    let lat2_rad = to.latitude * DEG_TO_RAD;
    let delta_lat = (to.latitude - from.latitude) * DEG_TO_RAD;
    let delta_lon = (to.longitude - from.longitude) * DEG_TO_RAD;

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * c
}

/// Whether `point` lies within `shape`.
///
/// Circles include their boundary. Polygons with fewer than three vertices
/// contain nothing.
pub fn contains(point: Point, shape: &GeofenceShape) -> bool {
    match shape {
        GeofenceShape::Circle { center, radius_m } => distance_m(point, *center) <= *radius_m,
        GeofenceShape::Polygon { vertices } => polygon_contains(point, vertices),
    }
}

/// Point-in-polygon on the sphere.
///
/// Vertices are projected with a gnomonic projection centred on the test
/// point. That projection maps great circles to straight lines, so a planar
/// crossing-number test on the projected ring is exact for great-circle
/// edges. A vertex in the far hemisphere means the polygon cannot surround
/// the point (regions are assumed smaller than a hemisphere).
fn polygon_contains(point: Point, vertices: &[Point]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut projected = Vec::with_capacity(vertices.len());
    for vertex in vertices {
        match gnomonic(point, *vertex) {
            Some(xy) => projected.push(xy),
            None => return false,
        }
    }

    // Cast a ray from the origin (the test point) along +x.
    let mut inside = false;
    let mut j = projected.len() - 1;
    for i in 0..projected.len() {
        let (xi, yi) = projected[i];
        let (xj, yj) = projected[j];
        if (yi > 0.0) != (yj > 0.0) {
            let x_cross = xi + (0.0 - yi) * (xj - xi) / (yj - yi);
            if x_cross > 0.0 {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Gnomonic projection of `vertex` onto the plane tangent at `center`.
///
/// Returns `None` for vertices on or beyond the horizon.
fn gnomonic(center: Point, vertex: Point) -> Option<(f64, f64)> {
    let lat0 = center.latitude * DEG_TO_RAD;
    let lat = vertex.latitude * DEG_TO_RAD;
    let delta_lon = (vertex.longitude - center.longitude) * DEG_TO_RAD;

    let cos_c = lat0.sin() * lat.sin() + lat0.cos() * lat.cos() * delta_lon.cos();
    if cos_c <= 1e-12 {
        return None;
    }

    let x = lat.cos() * delta_lon.sin() / cos_c;
    let y = (lat0.cos() * lat.sin() - lat0.sin() * lat.cos() * delta_lon.cos()) / cos_c;
    Some((x, y))
}
