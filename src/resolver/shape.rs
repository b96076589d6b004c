use std::convert::TryFrom;

use failure::Fail;
use geo::{Area, BooleanOps, BoundingRect, EuclideanDistance};
use geo_types::{LineString, MultiLineString, MultiPolygon, Point, Polygon, Rect};

/// The geometry kinds the resolver scores: census blocks/tracts/parks are
/// (multi)polygons, road segments are (multi)linestrings, transit stops and
/// geocoded points are points.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum Shape {
    Point(Point<f64>),
    Line(LineString<f64>),
    MultiLine(MultiLineString<f64>),
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
}

#[derive(Debug, Fail)]
pub enum ShapeError {
    #[fail(display = "Unsupported geometry type")]
    Unsupported,
    #[fail(display = "Invalid geometry: {}", _0)]
    Conversion(geojson::Error),
    #[fail(display = "Degenerate geometry (empty, non-finite or collapsed ring)")]
    Degenerate,
}

enum Prim<'a> {
    Pt(&'a Point<f64>),
    Ls(&'a LineString<f64>),
    Poly(&'a Polygon<f64>),
}

impl Shape {
    pub fn from_geojson(value: geojson::Value) -> Result<Shape, ShapeError> {
        let shape = match value {
            geojson::Value::Point(_) => {
                Shape::Point(Point::try_from(value).map_err(ShapeError::Conversion)?)
            }
            geojson::Value::LineString(_) => {
                Shape::Line(LineString::try_from(value).map_err(ShapeError::Conversion)?)
            }
            geojson::Value::MultiLineString(_) => {
                Shape::MultiLine(MultiLineString::try_from(value).map_err(ShapeError::Conversion)?)
            }
            geojson::Value::Polygon(_) => {
                Shape::Polygon(Polygon::try_from(value).map_err(ShapeError::Conversion)?)
            }
            geojson::Value::MultiPolygon(_) => {
                Shape::MultiPolygon(MultiPolygon::try_from(value).map_err(ShapeError::Conversion)?)
            }
            _ => return Err(ShapeError::Unsupported),
        };
        shape.screen()?;
        Ok(shape)
    }

    /// Screens out geometries the scoring primitives cannot handle. Anything
    /// beyond this (self-intersections etc.) is tolerated by the underlying
    /// boolean ops.
    fn screen(&self) -> Result<(), ShapeError> {
        fn ring_ok(ring: &LineString<f64>) -> bool {
            ring.0.len() >= 4 && ring.0.iter().all(|c| c.x.is_finite() && c.y.is_finite())
        }
        fn line_ok(line: &LineString<f64>) -> bool {
            line.0.len() >= 2 && line.0.iter().all(|c| c.x.is_finite() && c.y.is_finite())
        }
        let ok = match self {
            Shape::Point(p) => p.x().is_finite() && p.y().is_finite(),
            Shape::Line(l) => line_ok(l),
            Shape::MultiLine(ml) => !ml.0.is_empty() && ml.0.iter().all(line_ok),
            Shape::Polygon(p) => ring_ok(p.exterior()),
            Shape::MultiPolygon(mp) => !mp.0.is_empty() && mp.0.iter().map(|p| p.exterior()).all(ring_ok),
        };
        if ok {
            Ok(())
        } else {
            Err(ShapeError::Degenerate)
        }
    }

    #[inline]
    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        match self {
            Shape::Point(p) => Some(p.bounding_rect()),
            Shape::Line(l) => l.bounding_rect(),
            Shape::MultiLine(ml) => ml.bounding_rect(),
            Shape::Polygon(p) => p.bounding_rect(),
            Shape::MultiPolygon(mp) => mp.bounding_rect(),
        }
    }

    fn prims(&self) -> Vec<Prim> {
        match self {
            Shape::Point(p) => vec![Prim::Pt(p)],
            Shape::Line(l) => vec![Prim::Ls(l)],
            Shape::MultiLine(ml) => ml.0.iter().map(Prim::Ls).collect(),
            Shape::Polygon(p) => vec![Prim::Poly(p)],
            Shape::MultiPolygon(mp) => mp.0.iter().map(Prim::Poly).collect(),
        }
    }

    /// Exact euclidean distance between two shapes, in the input's own
    /// coordinate units. Zero when the shapes touch or overlap.
    pub fn distance(&self, other: &Shape) -> f64 {
        let mut best = std::f64::INFINITY;
        for a in self.prims() {
            for b in other.prims() {
                let d = prim_distance(&a, &b);
                if d < best {
                    best = d;
                }
                if best == 0.0 {
                    return 0.0;
                }
            }
        }
        best
    }

    /// Intersection area between two shapes. Non-areal shapes (points,
    /// lines) overlap nothing by definition.
    pub fn overlap_area(&self, other: &Shape) -> f64 {
        match (self.to_multi_polygon(), other.to_multi_polygon()) {
            (Some(a), Some(b)) => a.intersection(&b).unsigned_area(),
            _ => 0.0,
        }
    }

    fn to_multi_polygon(&self) -> Option<MultiPolygon<f64>> {
        match self {
            Shape::Polygon(p) => Some(MultiPolygon(vec![p.clone()])),
            Shape::MultiPolygon(mp) => Some(mp.clone()),
            _ => None,
        }
    }
}

fn prim_distance(a: &Prim, b: &Prim) -> f64 {
    match (a, b) {
        (Prim::Pt(a), Prim::Pt(b)) => a.euclidean_distance(*b),
        (Prim::Pt(a), Prim::Ls(b)) => a.euclidean_distance(*b),
        (Prim::Pt(a), Prim::Poly(b)) => a.euclidean_distance(*b),
        (Prim::Ls(a), Prim::Pt(b)) => b.euclidean_distance(*a),
        (Prim::Ls(a), Prim::Ls(b)) => a.euclidean_distance(*b),
        (Prim::Ls(a), Prim::Poly(b)) => a.euclidean_distance(*b),
        (Prim::Poly(a), Prim::Pt(b)) => b.euclidean_distance(*a),
        (Prim::Poly(a), Prim::Ls(b)) => b.euclidean_distance(*a),
        (Prim::Poly(a), Prim::Poly(b)) => a.euclidean_distance(*b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(json: &str) -> Shape {
        let geometry: geojson::Geometry = serde_json::from_str(json).unwrap();
        Shape::from_geojson(geometry.value).unwrap()
    }

    #[test]
    fn it_should_compute_point_to_point_distance() {
        let a = shape(r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#);
        let b = shape(r#"{"type": "Point", "coordinates": [3.0, 4.0]}"#);
        assert_eq!(a.distance(&b), 5.0);
    }

    #[test]
    fn it_should_report_zero_distance_for_a_point_inside_a_polygon() {
        let square = shape(
            r#"{"type": "Polygon", "coordinates": [[[0,0],[10,0],[10,10],[0,10],[0,0]]]}"#,
        );
        let inside = shape(r#"{"type": "Point", "coordinates": [5.0, 5.0]}"#);
        assert_eq!(square.distance(&inside), 0.0);
    }

    #[test]
    fn it_should_measure_distance_to_the_nearest_part_of_a_road() {
        let road = shape(
            r#"{"type": "MultiLineString", "coordinates": [[[0,100],[10,100]], [[0,3],[10,3]]]}"#,
        );
        let parcel_corner = shape(r#"{"type": "Point", "coordinates": [5.0, 0.0]}"#);
        assert_eq!(road.distance(&parcel_corner), 3.0);
    }

    #[test]
    fn it_should_compute_the_intersection_area_of_two_squares() {
        let a = shape(
            r#"{"type": "Polygon", "coordinates": [[[0,0],[4,0],[4,4],[0,4],[0,0]]]}"#,
        );
        let b = shape(
            r#"{"type": "Polygon", "coordinates": [[[2,2],[6,2],[6,6],[2,6],[2,2]]]}"#,
        );
        let area = a.overlap_area(&b);
        assert!((area - 4.0).abs() < 1e-9, "area = {}", area);
    }

    #[test]
    fn it_should_report_zero_overlap_for_disjoint_squares() {
        let a = shape(
            r#"{"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#,
        );
        let b = shape(
            r#"{"type": "Polygon", "coordinates": [[[5,5],[6,5],[6,6],[5,6],[5,5]]]}"#,
        );
        assert_eq!(a.overlap_area(&b), 0.0);
    }

    #[test]
    fn it_should_report_zero_overlap_for_a_line_against_a_polygon() {
        let road = shape(r#"{"type": "LineString", "coordinates": [[0,0],[10,0]]}"#);
        let block = shape(
            r#"{"type": "Polygon", "coordinates": [[[0,-1],[10,-1],[10,1],[0,1],[0,-1]]]}"#,
        );
        assert_eq!(road.overlap_area(&block), 0.0);
    }

    #[test]
    fn it_should_reject_a_collapsed_ring() {
        let geometry: geojson::Geometry =
            serde_json::from_str(r#"{"type": "Polygon", "coordinates": [[[0,0],[1,1],[0,0]]]}"#)
                .unwrap();
        match Shape::from_geojson(geometry.value) {
            Err(ShapeError::Degenerate) => {}
            _ => panic!("Wrong Error"),
        }
    }

    #[test]
    fn it_should_reject_a_geometry_collection() {
        let geometry: geojson::Geometry = serde_json::from_str(
            r#"{"type": "GeometryCollection", "geometries": [{"type": "Point", "coordinates": [0,0]}]}"#,
        )
        .unwrap();
        match Shape::from_geojson(geometry.value) {
            Err(ShapeError::Unsupported) => {}
            _ => panic!("Wrong Error"),
        }
    }
}
