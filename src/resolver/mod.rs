mod feature_index;
mod shape;
mod types;

pub use feature_index::{FeatureIndex, FeatureIndexError};
pub use shape::{Shape, ShapeError};
pub use types::{Assignment, CandidateFilter, ConfigError, PropertyMap, ResolverConfig, ScoringMode};
