//! Minimal planar geometry used for sampling features and sensor positions.
//!
//! Shapes are persisted as WKT text. Only the shapes sensors actually report
//! are decoded: points, line strings and single-ring polygons.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// EPSG code of the default coordinate reference system (WGS84 lon/lat).
pub const DEFAULT_CRS: i64 = 4326;

/// One coordinate pair, `x` = longitude and `y` = latitude in EPSG:4326.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Decoded shape of a feature or a sensor position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Coord>),
}

impl Geometry {
    /// Parses `POINT(x y)`, `LINESTRING(x y, ...)` or `POLYGON((x y, ...))`.
    pub fn from_wkt(raw: &str) -> Result<Self> {
        let text = raw.trim();
        let open = text
            .find('(')
            .ok_or_else(|| StoreError::decode("shape", format!("invalid WKT: {text}")))?;
        let tag = text[..open].trim().to_ascii_uppercase();
        let body = text[open..]
            .trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace());
        let coords = parse_coord_list(body)
            .ok_or_else(|| StoreError::decode("shape", format!("invalid WKT coordinates: {text}")))?;

        match tag.as_str() {
            "POINT" => match coords.as_slice() {
                [single] => Ok(Self::Point(*single)),
                _ => Err(StoreError::decode(
                    "shape",
                    format!("POINT must have exactly one coordinate: {text}"),
                )),
            },
            "LINESTRING" if !coords.is_empty() => Ok(Self::LineString(coords)),
            "POLYGON" if !coords.is_empty() => Ok(Self::Polygon(coords)),
            _ => Err(StoreError::decode(
                "shape",
                format!("unsupported WKT geometry: {text}"),
            )),
        }
    }

    /// Renders the geometry back to WKT.
    pub fn to_wkt(&self) -> String {
        match self {
            Self::Point(c) => format!("POINT({} {})", c.x, c.y),
            Self::LineString(coords) => format!("LINESTRING({})", format_coord_list(coords)),
            Self::Polygon(coords) => format!("POLYGON(({}))", format_coord_list(coords)),
        }
    }

    /// Returns all vertices of the geometry.
    pub fn coords(&self) -> &[Coord] {
        match self {
            Self::Point(c) => std::slice::from_ref(c),
            Self::LineString(coords) | Self::Polygon(coords) => coords.as_slice(),
        }
    }

    /// Envelope of all vertices, `None` for an empty shape.
    pub fn envelope(&self) -> Option<BoundingBox> {
        let coords = self.coords();
        let first = coords.first()?;
        let mut envelope = BoundingBox::new(first.x, first.y, first.x, first.y);
        for c in &coords[1..] {
            envelope.min_x = envelope.min_x.min(c.x);
            envelope.min_y = envelope.min_y.min(c.y);
            envelope.max_x = envelope.max_x.max(c.x);
            envelope.max_y = envelope.max_y.max(c.y);
        }
        Some(envelope)
    }

    /// Returns true when the geometry and `bbox` share at least one point.
    ///
    /// A polygon enclosing the whole box intersects it even though none of
    /// its vertices lies inside.
    pub fn intersects(&self, bbox: &BoundingBox) -> bool {
        match self.envelope() {
            Some(envelope) if envelope.overlaps(bbox) => {}
            _ => return false,
        }
        let coords = self.coords();
        if coords.iter().any(|c| bbox.contains(c)) {
            return true;
        }
        let edges = bbox.edges();
        let crosses = coords.windows(2).any(|segment| {
            edges
                .iter()
                .any(|(a, b)| segments_intersect(segment[0], segment[1], *a, *b))
        });
        if crosses {
            return true;
        }
        match self {
            Self::Polygon(ring) => bbox.corners().iter().any(|c| ring_contains(ring, c)),
            _ => false,
        }
    }
}

/// Even-odd ray casting test of `point` against a closed or open ring.
fn ring_contains(ring: &[Coord], point: &Coord) -> bool {
    let mut inside = false;
    let mut previous = match ring.last() {
        Some(last) => *last,
        None => return false,
    };
    for current in ring {
        if (current.y > point.y) != (previous.y > point.y) {
            let x = (previous.x - current.x) * (point.y - current.y) / (previous.y - current.y)
                + current.x;
            if point.x < x {
                inside = !inside;
            }
        }
        previous = *current;
    }
    inside
}

fn orientation(a: Coord, b: Coord, c: Coord) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: Coord, b: Coord, p: Coord) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

fn segments_intersect(p1: Coord, p2: Coord, q1: Coord, q2: Coord) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

/// Centroid of the union of `geometries`, computed over all their vertices.
///
/// Returns `None` when no vertex is available.
pub fn centroid<'a>(geometries: impl IntoIterator<Item = &'a Geometry>) -> Option<Coord> {
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut count = 0usize;
    for geometry in geometries {
        for c in geometry.coords() {
            sum_x += c.x;
            sum_y += c.y;
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    Some(Coord::new(sum_x / count as f64, sum_y / count as f64))
}

/// Axis-aligned spatial filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub crs: i64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            crs: DEFAULT_CRS,
        }
    }

    /// Full domain of the default CRS.
    pub fn crs_domain() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    pub fn contains(&self, c: &Coord) -> bool {
        c.x >= self.min_x && c.x <= self.max_x && c.y >= self.min_y && c.y <= self.max_y
    }

    /// Returns true when both boxes share at least one point.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Corners in ring order, starting at the minimum.
    pub fn corners(&self) -> [Coord; 4] {
        [
            Coord::new(self.min_x, self.min_y),
            Coord::new(self.max_x, self.min_y),
            Coord::new(self.max_x, self.max_y),
            Coord::new(self.min_x, self.max_y),
        ]
    }

    fn edges(&self) -> [(Coord, Coord); 4] {
        let [a, b, c, d] = self.corners();
        [(a, b), (b, c), (c, d), (d, a)]
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

fn parse_coord_list(body: &str) -> Option<Vec<Coord>> {
    let mut out = Vec::new();
    for pair in body.split(',') {
        let pair = pair.trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace());
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.split_whitespace();
        let x = parts.next()?.parse::<f64>().ok()?;
        let y = parts.next()?.parse::<f64>().ok()?;
        out.push(Coord::new(x, y));
    }
    Some(out)
}

fn format_coord_list(coords: &[Coord]) -> String {
    coords
        .iter()
        .map(|c| format!("{} {}", c.x, c.y))
        .collect::<Vec<_>>()
        .join(", ")
}
