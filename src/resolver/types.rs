use std::collections::HashMap;
use std::str::FromStr;

use failure::Fail;

/// Feature attributes, stringified on load and carried through to the output
/// unchanged.
pub type PropertyMap = HashMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ScoringMode {
    /// Score every (entity, feature) pair by geometry distance, keep the minimum.
    MinDistance,
    /// Score by intersection area, keep the maximum.
    MaxOverlapArea,
}

impl FromStr for ScoringMode {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<ScoringMode, ConfigError> {
        match text {
            "min_distance" => Ok(ScoringMode::MinDistance),
            "max_overlap_area" => Ok(ScoringMode::MaxOverlapArea),
            other => Err(ConfigError::UnknownScoringMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "Unknown scoring mode: {}", _0)]
    UnknownScoringMode(String),
    #[fail(display = "max-distance must be finite and non-negative, got {}", _0)]
    InvalidMaxDistance(f64),
    #[fail(display = "min-overlap must be finite and non-negative, got {}", _0)]
    InvalidMinOverlap(f64),
    #[fail(display = "Invalid filter expression (expected PROP=VALUE): {}", _0)]
    InvalidFilter(String),
}

/// Equality predicates over feature properties, applied before scoring.
/// All clauses must hold. Mirrors the `--filter fclass=primary` use case.
#[derive(Clone, Debug, Default)]
pub struct CandidateFilter {
    clauses: Vec<(String, String)>,
}

impl CandidateFilter {
    pub fn parse<S: AsRef<str>>(expressions: &[S]) -> Result<CandidateFilter, ConfigError> {
        let mut clauses = Vec::with_capacity(expressions.len());
        for expression in expressions {
            let expression = expression.as_ref();
            let mut parts = expression.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(prop), Some(value)) if !prop.is_empty() => {
                    clauses.push((prop.to_owned(), value.to_owned()));
                }
                _ => return Err(ConfigError::InvalidFilter(expression.to_owned())),
            }
        }
        Ok(CandidateFilter { clauses })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    #[inline]
    pub fn matches(&self, properties: &PropertyMap) -> bool {
        self.clauses
            .iter()
            .all(|(prop, value)| properties.get(prop).map_or(false, |v| v == value))
    }
}

#[derive(Clone, Debug)]
pub struct ResolverConfig {
    pub scoring_mode: ScoringMode,
    /// Distance mode only: entities farther than this from every feature
    /// stay unassigned.
    pub max_distance: Option<f64>,
    /// Overlap mode only: when set, entities whose best overlap is below the
    /// threshold stay unassigned instead of falling back to the
    /// smallest-id feature.
    pub min_overlap: Option<f64>,
    pub filter: CandidateFilter,
}

impl ResolverConfig {
    pub fn new(scoring_mode: ScoringMode) -> ResolverConfig {
        ResolverConfig {
            scoring_mode,
            max_distance: None,
            min_overlap: None,
            filter: CandidateFilter::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(distance) = self.max_distance {
            if !distance.is_finite() || distance < 0.0 {
                return Err(ConfigError::InvalidMaxDistance(distance));
            }
        }
        if let Some(area) = self.min_overlap {
            if !area.is_finite() || area < 0.0 {
                return Err(ConfigError::InvalidMinOverlap(area));
            }
        }
        Ok(())
    }
}

/// One resolved entity. `score` is a distance or an overlap area depending
/// on the scoring mode that produced it.
#[derive(Debug)]
pub struct Assignment<'a> {
    pub feature_id: &'a str,
    pub score: f64,
    pub properties: &'a PropertyMap,
}
