pub mod invariant;
pub mod similarity;

pub use invariant::{FeatureComponent, FeatureExtractor, FeatureVector};
pub use similarity::{similarity, CombinedSimilarity, Comparable, SimilarityScore};
