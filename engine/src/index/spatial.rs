//! Geometries and the bounding-box spatial index.
//!
//! Geometries are stored in documents as nested documents:
//!
//! ```text
//! { "type": "point", "x": 1.0, "y": 2.0 }
//! { "type": "rect", "min_x": 0.0, "min_y": 0.0, "max_x": 4.0, "max_y": 3.0 }
//! { "type": "polygon", "points": [[0.0, 0.0], [4.0, 0.0], [2.0, 3.0]] }
//! ```
//!
//! The index stores one [`SpatialKey`] (bounding box plus id) per document.
//! Lookups return every document whose box overlaps the query box; the exact
//! geometry test happens when the filter is applied to the document.

use super::{IndexKind, IndexMeta, Indexer};
use crate::error::Result;
use crate::filter::Filter;
use crate::store::{OrderedMap, Store};
use crate::{Document, DocumentId, Error, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

/// A planar geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    Point {
        x: f64,
        y: f64,
    },
    Rect {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    },
    Polygon {
        points: Vec<[f64; 2]>,
    },
}

type Coord = (f64, f64);

impl Geometry {
    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point { x, y }
    }

    /// Rectangle from two corners in any order.
    pub fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Geometry::Rect {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    pub fn polygon(points: Vec<[f64; 2]>) -> Self {
        Geometry::Polygon { points }
    }

    /// Read a geometry stored in a document field.
    pub fn from_value(value: &Value) -> Result<Self> {
        let doc = value.as_document().ok_or_else(|| {
            Error::Indexing(format!("expected a geometry document, got {}", value.kind_name()))
        })?;
        let number = |name: &str| -> Result<f64> {
            doc.get(name).and_then(Value::as_f64).ok_or_else(|| {
                Error::Indexing(format!("geometry is missing numeric field '{name}'"))
            })
        };

        let geometry = match doc.get("type").and_then(Value::as_str) {
            Some("point") => Geometry::point(number("x")?, number("y")?),
            Some("rect") => Geometry::rect(
                number("min_x")?,
                number("min_y")?,
                number("max_x")?,
                number("max_y")?,
            ),
            Some("polygon") => {
                let items = doc.get("points").and_then(Value::as_array).ok_or_else(|| {
                    Error::Indexing("polygon is missing its 'points' array".into())
                })?;
                let mut points = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_array() {
                        Some([x, y]) => match (x.as_f64(), y.as_f64()) {
                            (Some(x), Some(y)) => points.push([x, y]),
                            _ => return Err(Error::Indexing("polygon point is not numeric".into())),
                        },
                        _ => return Err(Error::Indexing("polygon point must be [x, y]".into())),
                    }
                }
                if points.len() < 3 {
                    return Err(Error::Indexing("polygon needs at least three points".into()));
                }
                Geometry::Polygon { points }
            }
            Some(other) => {
                return Err(Error::Indexing(format!("unknown geometry type '{other}'")))
            }
            None => return Err(Error::Indexing("geometry has no 'type'".into())),
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Encode as a document value for storage in a field.
    pub fn to_value(&self) -> Value {
        let doc = match self {
            Geometry::Point { x, y } => Document::new()
                .with("type", "point")
                .with("x", *x)
                .with("y", *y),
            Geometry::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => Document::new()
                .with("type", "rect")
                .with("min_x", *min_x)
                .with("min_y", *min_y)
                .with("max_x", *max_x)
                .with("max_y", *max_y),
            Geometry::Polygon { points } => Document::new().with("type", "polygon").with(
                "points",
                Value::Array(
                    points
                        .iter()
                        .map(|[x, y]| Value::Array(vec![Value::Float(*x), Value::Float(*y)]))
                        .collect(),
                ),
            ),
        };
        Value::Document(doc)
    }

    fn validate(&self) -> Result<()> {
        if self.vertices().iter().all(|(x, y)| x.is_finite() && y.is_finite()) {
            Ok(())
        } else {
            Err(Error::Indexing("geometry coordinates must be finite".into()))
        }
    }

    pub fn envelope(&self) -> Envelope {
        match self {
            Geometry::Point { x, y } => Envelope {
                min_x: *x,
                min_y: *y,
                max_x: *x,
                max_y: *y,
            },
            Geometry::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => Envelope {
                min_x: *min_x,
                min_y: *min_y,
                max_x: *max_x,
                max_y: *max_y,
            },
            Geometry::Polygon { points } => {
                let mut envelope = Envelope {
                    min_x: f64::INFINITY,
                    min_y: f64::INFINITY,
                    max_x: f64::NEG_INFINITY,
                    max_y: f64::NEG_INFINITY,
                };
                for [x, y] in points {
                    envelope.min_x = envelope.min_x.min(*x);
                    envelope.min_y = envelope.min_y.min(*y);
                    envelope.max_x = envelope.max_x.max(*x);
                    envelope.max_y = envelope.max_y.max(*y);
                }
                envelope
            }
        }
    }

    fn vertices(&self) -> Vec<Coord> {
        match self {
            Geometry::Point { x, y } => vec![(*x, *y)],
            Geometry::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => vec![
                (*min_x, *min_y),
                (*max_x, *min_y),
                (*max_x, *max_y),
                (*min_x, *max_y),
            ],
            Geometry::Polygon { points } => points.iter().map(|[x, y]| (*x, *y)).collect(),
        }
    }

    fn edges(&self) -> Vec<(Coord, Coord)> {
        let vertices = self.vertices();
        if vertices.len() < 2 {
            return Vec::new();
        }
        (0..vertices.len())
            .map(|i| (vertices[i], vertices[(i + 1) % vertices.len()]))
            .collect()
    }

    /// Whether a point lies inside or on the boundary.
    fn covers_point(&self, p: Coord) -> bool {
        match self {
            Geometry::Point { x, y } => *x == p.0 && *y == p.1,
            Geometry::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => p.0 >= *min_x && p.0 <= *max_x && p.1 >= *min_y && p.1 <= *max_y,
            Geometry::Polygon { .. } => {
                self.edges().iter().any(|(a, b)| on_segment(*a, *b, p)) || ray_cast(&self.vertices(), p)
            }
        }
    }

    pub fn intersects(&self, other: &Geometry) -> bool {
        if !self.envelope().intersects(&other.envelope()) {
            return false;
        }
        if self.vertices().iter().any(|p| other.covers_point(*p))
            || other.vertices().iter().any(|p| self.covers_point(*p))
        {
            return true;
        }
        let theirs = other.edges();
        self.edges().iter().any(|(a, b)| {
            theirs
                .iter()
                .any(|(c, d)| segments_intersect(*a, *b, *c, *d))
        })
    }

    /// Whether this geometry lies entirely inside (or on the boundary of)
    /// `container`.
    pub fn within(&self, container: &Geometry) -> bool {
        if !self.vertices().iter().all(|p| container.covers_point(*p)) {
            return false;
        }
        // With every vertex covered, only a proper edge crossing can take
        // part of a concave container's complement.
        let outer = container.edges();
        !self.edges().iter().any(|(a, b)| {
            outer
                .iter()
                .any(|(c, d)| segments_cross_properly(*a, *b, *c, *d))
        })
    }

    /// Whether the geometry lies within `distance` of `(x, y)`.
    pub fn is_near(&self, x: f64, y: f64, distance: f64) -> bool {
        self.vertices()
            .iter()
            .all(|(px, py)| ((px - x).powi(2) + (py - y).powi(2)).sqrt() <= distance)
    }
}

fn orientation(a: Coord, b: Coord, c: Coord) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: Coord, b: Coord, p: Coord) -> bool {
    orientation(a, b, p) == 0.0
        && p.0 >= a.0.min(b.0)
        && p.0 <= a.0.max(b.0)
        && p.1 >= a.1.min(b.1)
        && p.1 <= a.1.max(b.1)
}

fn segments_cross_properly(a: Coord, b: Coord, c: Coord, d: Coord) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);
    o1 * o2 < 0.0 && o3 * o4 < 0.0
}

fn segments_intersect(a: Coord, b: Coord, c: Coord, d: Coord) -> bool {
    segments_cross_properly(a, b, c, d)
        || on_segment(a, b, c)
        || on_segment(a, b, d)
        || on_segment(c, d, a)
        || on_segment(c, d, b)
}

fn ray_cast(vertices: &[Coord], p: Coord) -> bool {
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (xi, yi) = vertices[i];
        let (xj, yj) = vertices[j];
        if (yi > p.1) != (yj > p.1) && p.0 < (xj - xi) * (p.1 - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Index key: bounding box of a document's geometry plus its id.
/// Ordered by `min_x` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialKey {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub id: DocumentId,
}

impl SpatialKey {
    fn new(envelope: Envelope, id: DocumentId) -> Self {
        Self {
            min_x: envelope.min_x,
            min_y: envelope.min_y,
            max_x: envelope.max_x,
            max_y: envelope.max_y,
            id,
        }
    }

    fn envelope(&self) -> Envelope {
        Envelope {
            min_x: self.min_x,
            min_y: self.min_y,
            max_x: self.max_x,
            max_y: self.max_y,
        }
    }
}

impl Ord for SpatialKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.min_x
            .total_cmp(&other.min_x)
            .then(self.min_y.total_cmp(&other.min_y))
            .then(self.max_x.total_cmp(&other.max_x))
            .then(self.max_y.total_cmp(&other.max_y))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for SpatialKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SpatialKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SpatialKey {}

/// Bounding-box index over geometry fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialIndexer;

impl SpatialIndexer {
    fn map(store: &Store, meta: &IndexMeta) -> Result<Arc<OrderedMap<SpatialKey, Geometry>>> {
        store.open_map(&meta.index_map)
    }

    fn geometry(value: Option<&Value>) -> Result<Option<Geometry>> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Geometry::from_value(value).map(Some),
        }
    }
}

impl Indexer for SpatialIndexer {
    fn kind(&self) -> IndexKind {
        IndexKind::Spatial
    }

    fn write_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()> {
        if let Some(geometry) = Self::geometry(value)? {
            let key = SpatialKey::new(geometry.envelope(), id.clone());
            Self::map(store, meta)?.put(key, geometry)?;
        }
        Ok(())
    }

    fn remove_index_entry(
        &self,
        store: &Store,
        meta: &IndexMeta,
        id: &DocumentId,
        value: Option<&Value>,
    ) -> Result<()> {
        // A stored value that no longer parses was never indexed.
        if let Ok(Some(geometry)) = Self::geometry(value) {
            let key = SpatialKey::new(geometry.envelope(), id.clone());
            Self::map(store, meta)?.remove(&key)?;
        }
        Ok(())
    }

    fn find(
        &self,
        store: &Store,
        meta: &IndexMeta,
        filter: &Filter,
    ) -> Result<Option<BTreeSet<DocumentId>>> {
        let query = match filter {
            Filter::Intersects(_, geometry) | Filter::Within(_, geometry) => geometry.envelope(),
            Filter::Near(_, x, y, distance) => Envelope {
                min_x: x - distance,
                min_y: y - distance,
                max_x: x + distance,
                max_y: y + distance,
            },
            _ => return Ok(None),
        };

        let mut ids = BTreeSet::new();
        for (key, _) in Self::map(store, meta)?.entries()? {
            if key.min_x > query.max_x {
                break;
            }
            if key.envelope().intersects(&query) {
                ids.insert(key.id);
            }
        }
        Ok(Some(ids))
    }
}
