//! 姿勢・特徴ベクトルの類似度
//!
//! 成分ごとの距離 → 集約（平均/最大/RMS）→ 単調減少関数で [0,1] に写像する。
//! どちらかで欠けている成分は集約から除外する。

use std::f32::consts::PI;

use serde::Serialize;

use crate::analysis::invariant::{FeatureExtractor, FeatureVector};
use crate::config::{Aggregation, Falloff, SimilarityConfig, SimilarityStrategy};
use crate::error::{PoseError, Result};
use crate::pose::angle::wrap_angle;
use crate::pose::{angles, limb_angles, JointAngle, JointId, NormalizedPose};

/// 類似度 [0, 1]。1 = 同一
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct SimilarityScore(f32);

impl SimilarityScore {
    pub const IDENTICAL: SimilarityScore = SimilarityScore(1.0);

    pub fn new(value: f32) -> Self {
        Self(if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) })
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

/// 成分ごとの距離を出せる型
pub trait Comparable {
    /// 両方に存在する成分の距離。比較できる成分が無ければエラー
    fn component_distances(&self, other: &Self, config: &SimilarityConfig) -> Result<Vec<f32>>;
}

impl Comparable for NormalizedPose {
    fn component_distances(&self, other: &Self, config: &SimilarityConfig) -> Result<Vec<f32>> {
        let mut distances = Vec::new();
        let mut missing = Vec::new();
        for joint in JointId::ALL {
            match (self.valid(joint, config.min_score), other.valid(joint, config.min_score)) {
                (Some(a), Some(b)) => {
                    let dz = match (a.z, b.z) {
                        (Some(za), Some(zb)) => za - zb,
                        _ => 0.0,
                    };
                    let (dx, dy) = (a.x - b.x, a.y - b.y);
                    distances.push((dx * dx + dy * dy + dz * dz).sqrt());
                }
                _ => missing.push(joint),
            }
        }
        if distances.is_empty() {
            return Err(PoseError::insufficient("similarity", missing));
        }
        Ok(distances)
    }
}

impl Comparable for FeatureVector {
    fn component_distances(&self, other: &Self, _config: &SimilarityConfig) -> Result<Vec<f32>> {
        if self.len() != other.len() {
            return Err(PoseError::DimensionMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        let distances: Vec<f32> = self
            .values()
            .iter()
            .zip(other.values())
            .filter_map(|(a, b)| Some((a.as_ref()? - b.as_ref()?).abs()))
            .collect();
        if distances.is_empty() {
            return Err(PoseError::insufficient("similarity", Vec::new()));
        }
        Ok(distances)
    }
}

fn aggregate(distances: &[f32], aggregation: Aggregation) -> f32 {
    let n = distances.len() as f32;
    match aggregation {
        Aggregation::Mean => distances.iter().sum::<f32>() / n,
        Aggregation::Max => distances.iter().copied().fold(0.0, f32::max),
        Aggregation::Rms => (distances.iter().map(|d| d * d).sum::<f32>() / n).sqrt(),
    }
}

fn falloff(distance: f32, falloff: Falloff) -> f32 {
    match falloff {
        Falloff::Reciprocal { scale } => 1.0 / (1.0 + distance / scale),
        Falloff::Linear { max_distance } => (1.0 - distance / max_distance).clamp(0.0, 1.0),
    }
}

/// 2入力の類似度。対称で、自分自身とは1
///
/// 不正な設定（scale や max_distance が正でない等）は `InvalidConfiguration`
pub fn similarity<T: Comparable>(a: &T, b: &T, config: &SimilarityConfig) -> Result<SimilarityScore> {
    config.validate()?;
    let distances = a.component_distances(b, config)?;
    let d = aggregate(&distances, config.aggregation);
    Ok(SimilarityScore::new(falloff(d, config.falloff)))
}

impl SimilarityConfig {
    /// 構築時の検証
    pub fn validate(&self) -> Result<()> {
        match self.falloff {
            Falloff::Reciprocal { scale } if !(scale > 0.0) => {
                return Err(PoseError::config(format!("reciprocal scale must be > 0, got {}", scale)));
            }
            Falloff::Linear { max_distance } if !(max_distance > 0.0) => {
                return Err(PoseError::config(format!(
                    "linear max_distance must be > 0, got {}",
                    max_distance
                )));
            }
            _ => {}
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(PoseError::config(format!("similarity min_score {} outside [0, 1]", self.min_score)));
        }
        if !(self.power > 0.0) {
            return Err(PoseError::config(format!("similarity power must be > 0, got {}", self.power)));
        }
        if let Some(ws) = self.strategies.iter().find(|ws| !(ws.weight > 0.0)) {
            return Err(PoseError::config(format!(
                "strategy {:?} has non-positive weight {}",
                ws.strategy, ws.weight
            )));
        }
        Ok(())
    }
}

/// 複数の戦略を重み付き平均した目標姿勢との類似度
#[derive(Debug, Clone)]
pub struct CombinedSimilarity {
    config: SimilarityConfig,
    angle_set: Vec<JointAngle>,
    extractor: FeatureExtractor,
}

impl CombinedSimilarity {
    pub fn new(config: SimilarityConfig, angle_set: Vec<JointAngle>, extractor: FeatureExtractor) -> Result<Self> {
        config.validate()?;
        if config.strategies.is_empty() {
            return Err(PoseError::config("no similarity strategies configured"));
        }
        Ok(Self {
            config,
            angle_set,
            extractor,
        })
    }

    /// 失敗した戦略は除外して重みを再配分する。全滅ならエラー
    pub fn compare(&self, a: &NormalizedPose, b: &NormalizedPose) -> Result<SimilarityScore> {
        let mut total_weight = 0.0;
        let mut weighted = 0.0;
        let mut last_err = None;
        for ws in &self.config.strategies {
            match self.strategy_score(ws.strategy, a, b) {
                Ok(score) => {
                    weighted += score * ws.weight;
                    total_weight += ws.weight;
                }
                Err(e) => {
                    tracing::trace!(strategy = ?ws.strategy, error = %e, "strategy skipped");
                    last_err = Some(e);
                }
            }
        }
        if total_weight <= 0.0 {
            return Err(last_err.unwrap_or_else(|| PoseError::insufficient("combined similarity", Vec::new())));
        }
        Ok(SimilarityScore::new((weighted / total_weight).powf(self.config.power)))
    }

    fn strategy_score(&self, strategy: SimilarityStrategy, a: &NormalizedPose, b: &NormalizedPose) -> Result<f32> {
        let min_score = self.config.min_score;
        match strategy {
            SimilarityStrategy::Keypoints => Ok(similarity(a, b, &self.config)?.value()),
            SimilarityStrategy::KeyAngles => {
                let sa = angles(a, &self.angle_set, min_score);
                let sb = angles(b, &self.angle_set, min_score);
                let diffs: Vec<f32> = sa
                    .iter()
                    .filter_map(|(k, v)| sb.get(k).map(|w| (v - w).abs() / 180.0))
                    .collect();
                mean_to_score(&diffs, "key angles")
            }
            SimilarityStrategy::RelativeAngles => {
                let la = limb_angles(a, min_score)?;
                let lb = limb_angles(b, min_score)?;
                let diffs: Vec<f32> = la
                    .iter()
                    .filter_map(|(k, v)| lb.get(k).map(|w| wrap_angle(v - w).abs() / PI))
                    .collect();
                mean_to_score(&diffs, "relative angles")
            }
            SimilarityStrategy::InvariantFeatures => {
                let fa = self.extractor.features(a)?;
                let fb = self.extractor.features(b)?;
                Ok(similarity(&fa, &fb, &self.config)?.value())
            }
        }
    }
}

/// 正規化済み差分の平均を 1 - mean に変換
fn mean_to_score(diffs: &[f32], context: &'static str) -> Result<f32> {
    if diffs.is_empty() {
        return Err(PoseError::insufficient(context, Vec::new()));
    }
    let mean = diffs.iter().sum::<f32>() / diffs.len() as f32;
    Ok((1.0 - mean).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureConfig, NormalizeConfig, WeightedStrategy};
    use crate::pose::keypoint::fixtures::{standing_pose, without};
    use crate::pose::{normalize, Keypoint, Pose};

    fn normalized(pose: &Pose) -> NormalizedPose {
        normalize(pose, &NormalizeConfig::default()).unwrap()
    }

    /// 両腕を上げた姿勢
    fn arms_up() -> Pose {
        standing_pose().map_points(|kp| match kp.joint {
            JointId::LeftElbow => Keypoint { x: 0.62, y: 0.08, ..*kp },
            JointId::RightElbow => Keypoint { x: 0.38, y: 0.08, ..*kp },
            JointId::LeftWrist => Keypoint { x: 0.64, y: -0.04, ..*kp },
            JointId::RightWrist => Keypoint { x: 0.36, y: -0.04, ..*kp },
            _ => *kp,
        })
    }

    fn combined(config: SimilarityConfig) -> CombinedSimilarity {
        let extractor = FeatureExtractor::new(&FeatureConfig::default()).unwrap();
        CombinedSimilarity::new(config, JointAngle::ALL.to_vec(), extractor).unwrap()
    }

    #[test]
    fn test_self_similarity_is_one() {
        let config = SimilarityConfig::default();
        let p = normalized(&standing_pose());
        assert_eq!(similarity(&p, &p, &config).unwrap(), SimilarityScore::IDENTICAL);

        let f = FeatureVector::new(vec![Some(0.3), None, Some(1.2)]);
        assert_eq!(similarity(&f, &f, &config).unwrap().value(), 1.0);
    }

    #[test]
    fn test_symmetric_for_all_settings() {
        let a = normalized(&standing_pose());
        let b = normalized(&arms_up());
        for aggregation in [Aggregation::Mean, Aggregation::Max, Aggregation::Rms] {
            for falloff in [Falloff::Reciprocal { scale: 0.3 }, Falloff::Linear { max_distance: 2.0 }] {
                let config = SimilarityConfig {
                    aggregation,
                    falloff,
                    ..SimilarityConfig::default()
                };
                let ab = similarity(&a, &b, &config).unwrap();
                let ba = similarity(&b, &a, &config).unwrap();
                assert_eq!(ab, ba);
                assert!(ab.value() < 1.0);
                assert!((0.0..=1.0).contains(&ab.value()));
            }
        }
    }

    #[test]
    fn test_closer_pose_scores_higher() {
        let config = SimilarityConfig::default();
        let base = normalized(&standing_pose());
        let slight = normalized(&standing_pose().map_points(|kp| match kp.joint {
            JointId::LeftWrist => Keypoint { x: kp.x + 0.02, ..*kp },
            _ => *kp,
        }));
        let far = normalized(&arms_up());
        let s_slight = similarity(&base, &slight, &config).unwrap();
        let s_far = similarity(&base, &far, &config).unwrap();
        assert!(s_slight > s_far);
    }

    #[test]
    fn test_missing_joints_excluded() {
        let config = SimilarityConfig::default();
        let full = normalized(&standing_pose());
        let partial = normalized(&without(&standing_pose(), &[JointId::LeftWrist, JointId::Nose]));
        // 欠けた関節は0距離扱いでも失敗でもなく除外される
        assert_eq!(similarity(&full, &partial, &config).unwrap().value(), 1.0);
    }

    #[test]
    fn test_nothing_comparable_is_error() {
        let config = SimilarityConfig::default();
        let a = FeatureVector::new(vec![Some(1.0), None]);
        let b = FeatureVector::new(vec![None, Some(1.0)]);
        assert!(matches!(
            similarity(&a, &b, &config),
            Err(PoseError::InsufficientKeypoints { .. })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let config = SimilarityConfig::default();
        let a = FeatureVector::from_values([1.0, 2.0]);
        let b = FeatureVector::from_values([1.0]);
        assert_eq!(
            similarity(&a, &b, &config),
            Err(PoseError::DimensionMismatch { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_aggregation_and_falloff_values() {
        let a = FeatureVector::from_values([0.0, 0.0]);
        let b = FeatureVector::from_values([0.2, 0.6]);
        let mean = SimilarityConfig {
            falloff: Falloff::Linear { max_distance: 1.0 },
            ..SimilarityConfig::default()
        };
        assert!((similarity(&a, &b, &mean).unwrap().value() - 0.6).abs() < 1e-5);
        let max = SimilarityConfig {
            aggregation: Aggregation::Max,
            ..mean.clone()
        };
        assert!((similarity(&a, &b, &max).unwrap().value() - 0.4).abs() < 1e-5);
        let reciprocal = SimilarityConfig {
            falloff: Falloff::Reciprocal { scale: 0.4 },
            ..SimilarityConfig::default()
        };
        // mean 0.4 → 1 / (1 + 1) = 0.5
        assert!((similarity(&a, &b, &reciprocal).unwrap().value() - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let bad_scale = SimilarityConfig {
            falloff: Falloff::Reciprocal { scale: 0.0 },
            ..SimilarityConfig::default()
        };
        assert!(bad_scale.validate().is_err());
        let bad_weight = SimilarityConfig {
            strategies: vec![WeightedStrategy { strategy: SimilarityStrategy::Keypoints, weight: -1.0 }],
            ..SimilarityConfig::default()
        };
        assert!(bad_weight.validate().is_err());
        assert!(SimilarityConfig::default().validate().is_ok());
    }

    #[test]
    fn test_similarity_rejects_zero_scale() {
        let f = FeatureVector::from_values([0.3, 1.2]);
        for falloff in [Falloff::Reciprocal { scale: 0.0 }, Falloff::Linear { max_distance: 0.0 }] {
            let config = SimilarityConfig {
                falloff,
                ..SimilarityConfig::default()
            };
            assert!(matches!(
                similarity(&f, &f, &config),
                Err(PoseError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_combined_identity_and_symmetry() {
        let strategies = vec![
            WeightedStrategy { strategy: SimilarityStrategy::Keypoints, weight: 1.0 },
            WeightedStrategy { strategy: SimilarityStrategy::KeyAngles, weight: 1.0 },
            WeightedStrategy { strategy: SimilarityStrategy::RelativeAngles, weight: 1.0 },
            WeightedStrategy { strategy: SimilarityStrategy::InvariantFeatures, weight: 1.0 },
        ];
        let sim = combined(SimilarityConfig {
            strategies,
            ..SimilarityConfig::default()
        });
        let a = normalized(&standing_pose());
        let b = normalized(&arms_up());
        assert!((sim.compare(&a, &a).unwrap().value() - 1.0).abs() < 1e-6);
        let ab = sim.compare(&a, &b).unwrap();
        let ba = sim.compare(&b, &a).unwrap();
        assert!((ab.value() - ba.value()).abs() < 1e-6);
        assert!(ab.value() < 0.95);
    }

    #[test]
    fn test_combined_rotation_tolerant() {
        // 角度系の戦略だけなら画像の傾きに影響されない
        let strategies = vec![
            WeightedStrategy { strategy: SimilarityStrategy::KeyAngles, weight: 0.5 },
            WeightedStrategy { strategy: SimilarityStrategy::RelativeAngles, weight: 0.5 },
        ];
        let sim = combined(SimilarityConfig {
            strategies,
            ..SimilarityConfig::default()
        });
        let a = normalized(&standing_pose());
        let tilted = a.rotated_2d(0.6);
        assert!((sim.compare(&a, &tilted).unwrap().value() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_power_sharpens() {
        let linear = combined(SimilarityConfig {
            power: 1.0,
            ..SimilarityConfig::default()
        });
        let squared = combined(SimilarityConfig::default());
        let a = normalized(&standing_pose());
        let b = normalized(&arms_up());
        let s1 = linear.compare(&a, &b).unwrap().value();
        let s2 = squared.compare(&a, &b).unwrap().value();
        assert!((s2 - s1 * s1).abs() < 1e-5);
    }
}
