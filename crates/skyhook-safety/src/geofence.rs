use serde::{Deserialize, Serialize};

/// One polygon vertex in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofencePoint {
    pub lat: f64,
    pub lon: f64,
}

/// Ray-casting point-in-polygon test over (lon, lat).
pub fn point_in_polygon(polygon: &[GeofencePoint], lat: f64, lon: f64) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (lat_i, lon_i) = (polygon[i].lat, polygon[i].lon);
        let (lat_j, lon_j) = (polygon[j].lat, polygon[j].lon);
        let intersects = ((lat_i > lat) != (lat_j > lat))
            && (lon < (lon_j - lon_i) * (lat - lat_i) / (lat_j - lat_i) + lon_i);
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Orientation of the ordered triplet (p, q, r): 0 colinear, 1 clockwise,
/// 2 counterclockwise.
fn orientation(p: GeofencePoint, q: GeofencePoint, r: GeofencePoint) -> u8 {
    let val = (q.lat - p.lat) * (r.lon - q.lon) - (q.lon - p.lon) * (r.lat - q.lat);
    if val > 0.0 {
        1
    } else if val < 0.0 {
        2
    } else {
        0
    }
}

/// True when q lies on the segment pr (assuming colinearity).
fn lies_on_segment(p: GeofencePoint, q: GeofencePoint, r: GeofencePoint) -> bool {
    q.lon <= p.lon.max(r.lon)
        && q.lon >= p.lon.min(r.lon)
        && q.lat <= p.lat.max(r.lat)
        && q.lat >= p.lat.min(r.lat)
}

/// Segment intersection test, colinear overlaps included.
pub fn segments_intersect(
    p1: GeofencePoint,
    q1: GeofencePoint,
    p2: GeofencePoint,
    q2: GeofencePoint,
) -> bool {
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == 0 && lies_on_segment(p1, p2, q1))
        || (o2 == 0 && lies_on_segment(p1, q2, q1))
        || (o3 == 0 && lies_on_segment(p2, p1, q2))
        || (o4 == 0 && lies_on_segment(p2, q1, q2))
}

/// True when the segment `from -> to` crosses any edge of `polygon`.
pub fn path_crosses_polygon(
    from: GeofencePoint,
    to: GeofencePoint,
    polygon: &[GeofencePoint],
) -> bool {
    let n = polygon.len();
    if n < 2 {
        return false;
    }
    (0..n).any(|i| segments_intersect(from, to, polygon[i], polygon[(i + 1) % n]))
}
