use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::path;

use failure::Fail;
use geojson::GeoJson;
use geo_types::Rect;
use log::{info, warn};
use rstar::{Envelope, PointDistance, RTree, RTreeObject, AABB};

use super::shape::{Shape, ShapeError};
use super::types::{Assignment, PropertyMap, ResolverConfig, ScoringMode};

#[derive(Debug, Fail)]
pub enum FeatureIndexError {
    #[fail(display = "GeoJSON error: {}", _0)]
    Parse(geojson::Error),
    #[fail(display = "Feature collection not found")]
    FeatureCollectionNotFound,
    #[fail(display = "Geometry not found")]
    GeometryNotFound,
    #[fail(display = "{}", _0)]
    Geometry(ShapeError),
    #[fail(display = "Invalid property value: {}", _0)]
    InvalidProperty(serde_json::Value),
    #[fail(display = "Missing identifier property: {}", _0)]
    MissingIdProperty(String),
    #[fail(display = "I/O error: {}", _0)]
    Io(io::Error),
}

impl From<geojson::Error> for FeatureIndexError {
    fn from(err: geojson::Error) -> FeatureIndexError {
        FeatureIndexError::Parse(err)
    }
}

/// One feature of the candidate set: identifier, geometry, bbox for the
/// r-tree, and the attribute payload carried through to the output.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexedFeature {
    id: String,
    bbox: Rect<f64>,
    shape: Shape,
    properties: PropertyMap,
}

impl IndexedFeature {
    fn new(feature: geojson::Feature, id_property: &str) -> Result<IndexedFeature, FeatureIndexError> {
        let geometry = feature
            .geometry
            .ok_or(FeatureIndexError::GeometryNotFound)?;
        let shape = Shape::from_geojson(geometry.value).map_err(FeatureIndexError::Geometry)?;
        let bbox = shape
            .bounding_rect()
            .ok_or(FeatureIndexError::Geometry(ShapeError::Degenerate))?;

        let raw_properties = feature.properties.unwrap_or_default();
        let mut properties = PropertyMap::new();
        for (key, value) in raw_properties {
            match value {
                serde_json::Value::String(text) => {
                    properties.insert(key, text);
                }
                serde_json::Value::Number(number) => {
                    properties.insert(key, number.to_string());
                }
                serde_json::Value::Bool(flag) => {
                    properties.insert(key, flag.to_string());
                }
                serde_json::Value::Null => {}
                other => return Err(FeatureIndexError::InvalidProperty(other)),
            }
        }

        let id = properties
            .get(id_property)
            .cloned()
            .ok_or_else(|| FeatureIndexError::MissingIdProperty(id_property.to_owned()))?;

        Ok(IndexedFeature {
            id,
            bbox,
            shape,
            properties,
        })
    }
}

impl RTreeObject for IndexedFeature {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners(
            [self.bbox.min().x, self.bbox.min().y],
            [self.bbox.max().x, self.bbox.max().y],
        )
    }
}

impl PointDistance for IndexedFeature {
    /// Bbox distance, a cheap lower bound of the exact distance. The exact
    /// test runs only on candidates the bound cannot rule out.
    #[inline]
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        self.envelope().distance_2(point)
    }
}

/// The candidate set behind an r-tree, plus the per-entity top-1 selection.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct FeatureIndex {
    tree: RTree<IndexedFeature>,
    skipped: u32,
}

impl FeatureIndex {
    pub fn from_file<P: AsRef<path::Path>>(
        geojson_path: P,
        id_property: &str,
    ) -> Result<FeatureIndex, FeatureIndexError> {
        let mut file = File::open(&geojson_path).map_err(FeatureIndexError::Io)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(FeatureIndexError::Io)?;

        FeatureIndex::from_geojson_str(&contents, id_property)
    }

    pub fn from_geojson_str(
        geojson_str: &str,
        id_property: &str,
    ) -> Result<FeatureIndex, FeatureIndexError> {
        let geo_json = geojson_str.parse::<GeoJson>()?;

        let feature_collection = if let GeoJson::FeatureCollection(collection) = geo_json {
            collection
        } else {
            return Err(FeatureIndexError::FeatureCollectionNotFound);
        };

        let mut features = Vec::with_capacity(feature_collection.features.len());
        let mut skipped = 0;
        for (position, feature) in feature_collection.features.into_iter().enumerate() {
            match IndexedFeature::new(feature, id_property) {
                Ok(indexed) => features.push(indexed),
                // A bad feature drops out of the candidate set for every
                // entity; it never fails the run.
                Err(err) => {
                    warn!("Skipping feature at position {}: {}", position, err);
                    skipped += 1;
                }
            }
        }

        info!("Indexing {} features ({} skipped)", features.len(), skipped);
        let tree = RTree::bulk_load(features);

        Ok(FeatureIndex { tree, skipped })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    #[inline]
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Top-1 selection for a single entity. Returns `None` when no feature
    /// qualifies (empty candidate set, or a configured cutoff excluded
    /// everything).
    pub fn resolve_one<'a>(
        &'a self,
        entity: &Shape,
        config: &ResolverConfig,
    ) -> Option<Assignment<'a>> {
        match config.scoring_mode {
            ScoringMode::MinDistance => self.closest(entity, config),
            ScoringMode::MaxOverlapArea => self.best_overlap(entity, config),
        }
    }

    fn closest<'a>(&'a self, entity: &Shape, config: &ResolverConfig) -> Option<Assignment<'a>> {
        let (feature, score) = match entity {
            Shape::Point(point) => self.closest_to_point(entity, [point.x(), point.y()], config),
            extended => self.closest_scan(extended, config),
        }?;

        if let Some(cutoff) = config.max_distance {
            if score > cutoff {
                return None;
            }
        }

        Some(Assignment {
            feature_id: &feature.id,
            score,
            properties: &feature.properties,
        })
    }

    /// Point entities walk the r-tree in bbox-distance order and stop as
    /// soon as the lower bound clears the best exact distance found.
    fn closest_to_point(
        &self,
        entity: &Shape,
        origin: [f64; 2],
        config: &ResolverConfig,
    ) -> Option<(&IndexedFeature, f64)> {
        let mut best: Option<(&IndexedFeature, f64)> = None;
        for (feature, bbox_distance_2) in self.tree.nearest_neighbor_iter_with_distance_2(&origin) {
            if let Some((_, score)) = best {
                // Candidates at exactly the bound can still tie, so only a
                // strictly larger bound ends the walk.
                if bbox_distance_2.sqrt() > score {
                    break;
                }
            }
            if !config.filter.is_empty() && !config.filter.matches(&feature.properties) {
                continue;
            }
            let distance = entity.distance(&feature.shape);
            best = pick_min(best, feature, distance);
        }
        best
    }

    /// Extended entity geometries have no single query point, so fall back
    /// to a scan with bbox-to-bbox pruning against the best score so far.
    fn closest_scan(
        &self,
        entity: &Shape,
        config: &ResolverConfig,
    ) -> Option<(&IndexedFeature, f64)> {
        let entity_rect = entity.bounding_rect()?;
        let mut best: Option<(&IndexedFeature, f64)> = None;
        for feature in self.tree.iter() {
            if !config.filter.is_empty() && !config.filter.matches(&feature.properties) {
                continue;
            }
            if let Some((_, score)) = best {
                if rect_distance(&entity_rect, &feature.bbox) > score {
                    continue;
                }
            }
            let distance = entity.distance(&feature.shape);
            best = pick_min(best, feature, distance);
        }
        best
    }

    fn best_overlap<'a>(
        &'a self,
        entity: &Shape,
        config: &ResolverConfig,
    ) -> Option<Assignment<'a>> {
        let entity_rect = entity.bounding_rect()?;
        let envelope = AABB::from_corners(
            [entity_rect.min().x, entity_rect.min().y],
            [entity_rect.max().x, entity_rect.max().y],
        );

        let mut best: Option<(&IndexedFeature, f64)> = None;
        for feature in self.tree.locate_in_envelope_intersecting(&envelope) {
            if !config.filter.is_empty() && !config.filter.matches(&feature.properties) {
                continue;
            }
            let area = entity.overlap_area(&feature.shape);
            best = pick_max(best, feature, area);
        }

        match (best, config.min_overlap) {
            (Some((feature, score)), threshold)
                if score > 0.0 && score >= threshold.unwrap_or(0.0) =>
            {
                Some(Assignment {
                    feature_id: &feature.id,
                    score,
                    properties: &feature.properties,
                })
            }
            (_, Some(_)) => None,
            // Zero best overlap without a threshold: every candidate ties at
            // score 0, including the ones whose bbox never met the entity,
            // so the id tie-break runs over the whole candidate set.
            (_, None) => self
                .smallest_id_candidate(config)
                .map(|feature| Assignment {
                    feature_id: &feature.id,
                    score: 0.0,
                    properties: &feature.properties,
                }),
        }
    }

    fn smallest_id_candidate(&self, config: &ResolverConfig) -> Option<&IndexedFeature> {
        self.tree
            .iter()
            .filter(|feature| config.filter.is_empty() || config.filter.matches(&feature.properties))
            .min_by(|a, b| a.id.cmp(&b.id))
    }
}

/// Keep the smaller score; equal scores go to the smaller feature id.
#[inline]
fn pick_min<'a>(
    best: Option<(&'a IndexedFeature, f64)>,
    feature: &'a IndexedFeature,
    score: f64,
) -> Option<(&'a IndexedFeature, f64)> {
    match best {
        Some((chosen, chosen_score))
            if (score, feature.id.as_str()) < (chosen_score, chosen.id.as_str()) =>
        {
            Some((feature, score))
        }
        None => Some((feature, score)),
        other => other,
    }
}

/// Keep the larger score; equal scores go to the smaller feature id.
#[inline]
fn pick_max<'a>(
    best: Option<(&'a IndexedFeature, f64)>,
    feature: &'a IndexedFeature,
    score: f64,
) -> Option<(&'a IndexedFeature, f64)> {
    match best {
        Some((chosen, chosen_score))
            if score > chosen_score
                || (score == chosen_score && feature.id.as_str() < chosen.id.as_str()) =>
        {
            Some((feature, score))
        }
        None => Some((feature, score)),
        other => other,
    }
}

#[inline]
fn rect_distance(a: &Rect<f64>, b: &Rect<f64>) -> f64 {
    let dx = (a.min().x - b.max().x).max(b.min().x - a.max().x).max(0.0);
    let dy = (a.min().y - b.max().y).max(b.min().y - a.max().y).max(0.0);
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::super::types::CandidateFilter;
    use super::*;

    const CENSUS_BLOCKS_GEOJSON_STR: &str = include_str!("test_resources/census_blocks.json");
    const TRANSIT_STOPS_GEOJSON_STR: &str = include_str!("test_resources/transit_stops.json");
    const ROAD_SEGMENTS_GEOJSON_STR: &str = include_str!("test_resources/road_segments.json");
    const MIXED_BAD_GEOMETRY_GEOJSON_STR: &str =
        include_str!("test_resources/mixed_bad_geometry.json");
    const ONE_FEATURE_GEOJSON_STR: &str = include_str!("test_resources/one_feature.json");
    const MALFORMED_GEOJSON_STR: &str = include_str!("test_resources/malformed.json");

    fn entity(json: &str) -> Shape {
        let geometry: geojson::Geometry = serde_json::from_str(json).unwrap();
        Shape::from_geojson(geometry.value).unwrap()
    }

    fn distance_config() -> ResolverConfig {
        ResolverConfig::new(ScoringMode::MinDistance)
    }

    fn overlap_config() -> ResolverConfig {
        ResolverConfig::new(ScoringMode::MaxOverlapArea)
    }

    #[test]
    fn it_should_parse_a_valid_feature_collection() {
        let index = FeatureIndex::from_geojson_str(CENSUS_BLOCKS_GEOJSON_STR, "GEOID").unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.skipped(), 0);
    }

    #[test]
    fn it_should_fail_without_a_feature_collection() {
        let result = FeatureIndex::from_geojson_str(ONE_FEATURE_GEOJSON_STR, "GEOID");
        match result.err() {
            Some(FeatureIndexError::FeatureCollectionNotFound) => {}
            _ => panic!("Wrong Error"),
        }
    }

    #[test]
    fn it_should_fail_with_malformed_geojson() {
        let result = FeatureIndex::from_geojson_str(MALFORMED_GEOJSON_STR, "GEOID");
        match result.err() {
            Some(FeatureIndexError::Parse(_)) => {}
            _ => panic!("Wrong Error"),
        }
    }

    #[test]
    fn it_should_skip_bad_features_instead_of_failing_the_run() {
        let index = FeatureIndex::from_geojson_str(MIXED_BAD_GEOMETRY_GEOJSON_STR, "park_id").unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.skipped(), 3);

        let parcel = entity(r#"{"type": "Point", "coordinates": [1.0, 1.0]}"#);
        let assignment = index.resolve_one(&parcel, &distance_config()).unwrap();
        assert_eq!(assignment.feature_id, "park-good");
    }

    #[test]
    fn it_should_assign_each_point_its_closest_stop() {
        let index = FeatureIndex::from_geojson_str(TRANSIT_STOPS_GEOJSON_STR, "stop_id").unwrap();

        let a = entity(r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#);
        let b = entity(r#"{"type": "Point", "coordinates": [10.0, 10.0]}"#);

        let assignment_a = index.resolve_one(&a, &distance_config()).unwrap();
        assert_eq!(assignment_a.feature_id, "F1");
        assert_eq!(assignment_a.score, 1.0);

        let assignment_b = index.resolve_one(&b, &distance_config()).unwrap();
        assert_eq!(assignment_b.feature_id, "F2");
        assert!((assignment_b.score - 200.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn it_should_drop_assignments_beyond_max_distance() {
        let index = FeatureIndex::from_geojson_str(TRANSIT_STOPS_GEOJSON_STR, "stop_id").unwrap();
        let mut config = distance_config();
        config.max_distance = Some(5.0);

        let a = entity(r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#);
        let b = entity(r#"{"type": "Point", "coordinates": [10.0, 10.0]}"#);

        assert_eq!(index.resolve_one(&a, &config).unwrap().feature_id, "F1");
        assert!(index.resolve_one(&b, &config).is_none());
    }

    #[test]
    fn it_should_only_add_assignments_when_the_radius_grows() {
        let index = FeatureIndex::from_geojson_str(TRANSIT_STOPS_GEOJSON_STR, "stop_id").unwrap();
        let entities = [
            entity(r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#),
            entity(r#"{"type": "Point", "coordinates": [10.0, 10.0]}"#),
            entity(r#"{"type": "Point", "coordinates": [500.0, 500.0]}"#),
        ];

        let mut narrow = distance_config();
        narrow.max_distance = Some(5.0);
        let mut wide = distance_config();
        wide.max_distance = Some(50.0);

        for entity in &entities {
            if let Some(kept) = index.resolve_one(entity, &narrow) {
                let widened = index.resolve_one(entity, &wide).unwrap();
                assert_eq!(widened.feature_id, kept.feature_id);
                assert_eq!(widened.score, kept.score);
            }
        }
    }

    #[test]
    fn it_should_break_distance_ties_by_smaller_feature_id() {
        // stop-a and stop-b sit at (0, 5) and (0, -5), equidistant from the origin.
        let index = FeatureIndex::from_geojson_str(
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {"stop_id": "stop-b"},
                 "geometry": {"type": "Point", "coordinates": [0.0, -5.0]}},
                {"type": "Feature", "properties": {"stop_id": "stop-a"},
                 "geometry": {"type": "Point", "coordinates": [0.0, 5.0]}}
            ]}"#,
            "stop_id",
        )
        .unwrap();

        let origin = entity(r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#);
        let assignment = index.resolve_one(&origin, &distance_config()).unwrap();
        assert_eq!(assignment.feature_id, "stop-a");
        assert_eq!(assignment.score, 5.0);
    }

    #[test]
    fn it_should_filter_candidates_before_scoring() {
        let index = FeatureIndex::from_geojson_str(ROAD_SEGMENTS_GEOJSON_STR, "road_id").unwrap();

        let parcel = entity(r#"{"type": "Point", "coordinates": [5.0, 0.0]}"#);

        let any_road = index.resolve_one(&parcel, &distance_config()).unwrap();
        assert_eq!(any_road.feature_id, "R2");

        let mut primary_only = distance_config();
        primary_only.filter = CandidateFilter::parse(&["fclass=primary"]).unwrap();
        let primary = index.resolve_one(&parcel, &primary_only).unwrap();
        assert_eq!(primary.feature_id, "R1");
        assert_eq!(primary.properties.get("fclass").unwrap(), "primary");
    }

    #[test]
    fn it_should_measure_distance_from_a_parcel_polygon_not_its_center() {
        let index = FeatureIndex::from_geojson_str(ROAD_SEGMENTS_GEOJSON_STR, "road_id").unwrap();

        // R2 runs along y=2; the parcel edge reaches y=4.
        let parcel = entity(
            r#"{"type": "Polygon", "coordinates": [[[0,4],[10,4],[10,7],[0,7],[0,4]]]}"#,
        );
        let assignment = index.resolve_one(&parcel, &distance_config()).unwrap();
        assert_eq!(assignment.feature_id, "R2");
        assert_eq!(assignment.score, 2.0);
    }

    #[test]
    fn it_should_assign_the_block_with_the_larger_overlap() {
        let index = FeatureIndex::from_geojson_str(CENSUS_BLOCKS_GEOJSON_STR, "GEOID").unwrap();

        // Straddles the boundary at x=10: 4 units of area in block ..1001,
        // 20 in block ..1002.
        let parcel = entity(
            r#"{"type": "Polygon", "coordinates": [[[9,2],[15,2],[15,6],[9,6],[9,2]]]}"#,
        );
        let assignment = index.resolve_one(&parcel, &overlap_config()).unwrap();
        assert_eq!(assignment.feature_id, "510540002001002");
        assert!((assignment.score - 20.0).abs() < 1e-9);
    }

    #[test]
    fn it_should_prefer_full_containment_over_partial_overlap() {
        // F1 and F2 overlap each other; the parcel sits entirely inside F1
        // and only clips the corner of F2.
        let index = FeatureIndex::from_geojson_str(
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {"zone": "F2"},
                 "geometry": {"type": "Polygon", "coordinates": [[[3,3],[20,3],[20,20],[3,20],[3,3]]]}},
                {"type": "Feature", "properties": {"zone": "F1"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[10,0],[10,10],[0,10],[0,0]]]}}
            ]}"#,
            "zone",
        )
        .unwrap();

        let parcel = entity(
            r#"{"type": "Polygon", "coordinates": [[[2,2],[4,2],[4,4],[2,4],[2,2]]]}"#,
        );
        let assignment = index.resolve_one(&parcel, &overlap_config()).unwrap();
        assert_eq!(assignment.feature_id, "F1");
        assert!((assignment.score - 4.0).abs() < 1e-9);
    }

    #[test]
    fn it_should_fall_back_to_the_smallest_id_on_zero_overlap() {
        let index = FeatureIndex::from_geojson_str(CENSUS_BLOCKS_GEOJSON_STR, "GEOID").unwrap();

        // Far outside every block.
        let parcel = entity(
            r#"{"type": "Polygon", "coordinates": [[[100,100],[101,100],[101,101],[100,101],[100,100]]]}"#,
        );
        let assignment = index.resolve_one(&parcel, &overlap_config()).unwrap();
        assert_eq!(assignment.feature_id, "510540002001001");
        assert_eq!(assignment.score, 0.0);
    }

    #[test]
    fn it_should_leave_the_entity_unassigned_when_min_overlap_is_set() {
        let index = FeatureIndex::from_geojson_str(CENSUS_BLOCKS_GEOJSON_STR, "GEOID").unwrap();
        let mut config = overlap_config();
        config.min_overlap = Some(1.0);

        let outside = entity(
            r#"{"type": "Polygon", "coordinates": [[[100,100],[101,100],[101,101],[100,101],[100,100]]]}"#,
        );
        assert!(index.resolve_one(&outside, &config).is_none());

        // A real overlap above the threshold still assigns.
        let inside = entity(
            r#"{"type": "Polygon", "coordinates": [[[1,1],[5,1],[5,5],[1,5],[1,1]]]}"#,
        );
        let assignment = index.resolve_one(&inside, &config).unwrap();
        assert_eq!(assignment.feature_id, "510540002001001");
    }

    #[test]
    fn it_should_return_no_assignment_for_an_empty_feature_set() {
        let index =
            FeatureIndex::from_geojson_str(r#"{"type": "FeatureCollection", "features": []}"#, "id")
                .unwrap();
        assert!(index.is_empty());

        let point = entity(r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#);
        assert!(index.resolve_one(&point, &distance_config()).is_none());
        assert!(index.resolve_one(&point, &overlap_config()).is_none());
    }

    #[test]
    fn it_should_resolve_deterministically() {
        let index = FeatureIndex::from_geojson_str(CENSUS_BLOCKS_GEOJSON_STR, "GEOID").unwrap();
        let parcel = entity(
            r#"{"type": "Polygon", "coordinates": [[[9,9],[12,9],[12,12],[9,12],[9,9]]]}"#,
        );

        let first = index.resolve_one(&parcel, &overlap_config()).unwrap();
        let second = index.resolve_one(&parcel, &overlap_config()).unwrap();
        assert_eq!(first.feature_id, second.feature_id);
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn it_should_carry_feature_properties_through() {
        let index = FeatureIndex::from_geojson_str(CENSUS_BLOCKS_GEOJSON_STR, "GEOID").unwrap();
        let parcel = entity(r#"{"type": "Point", "coordinates": [1.0, 1.0]}"#);

        let assignment = index.resolve_one(&parcel, &distance_config()).unwrap();
        assert_eq!(assignment.properties.get("countyfp").unwrap(), "540");
        // Numeric properties arrive stringified.
        assert_eq!(assignment.properties.get("pop2010").unwrap(), "112");
    }

    #[test]
    fn it_should_survive_a_bincode_round_trip() {
        let index = FeatureIndex::from_geojson_str(TRANSIT_STOPS_GEOJSON_STR, "stop_id").unwrap();
        let bytes = bincode::serialize(&index).unwrap();
        let restored: FeatureIndex = bincode::deserialize(&bytes).unwrap();

        let a = entity(r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#);
        assert_eq!(
            restored.resolve_one(&a, &distance_config()).unwrap().feature_id,
            index.resolve_one(&a, &distance_config()).unwrap().feature_id
        );
    }
}
