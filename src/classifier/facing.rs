//! 体の向きの分類
//!
//! 特徴ベクトルを向きごとのプロファイルと比較し、最も近いものを採用する。
//! 最良スコアが閾値未満なら Unknown。
//! `FacingClassifier` は直近 `smoothing_window` フレームの多数決で出力を安定させる。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::analysis::{similarity, FeatureVector};
use crate::classifier::profile::FacingProfile;
use crate::config::{FacingConfig, SimilarityConfig};
use crate::error::{PoseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingDirection {
    Front,
    Back,
    /// 人物が画像の左を向いている
    Left,
    /// 人物が画像の右を向いている
    Right,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FacingEstimate {
    pub direction: FacingDirection,
    /// 採用したプロファイルとの類似度
    pub score: f32,
}

impl FacingEstimate {
    pub const UNKNOWN: FacingEstimate = FacingEstimate {
        direction: FacingDirection::Unknown,
        score: 0.0,
    };
}

/// 1フレーム分の判定。同点ならプロファイルの並びで先のものを採る
pub fn facing(
    features: &FeatureVector,
    profiles: &[FacingProfile],
    threshold: f32,
    config: &SimilarityConfig,
) -> Result<FacingEstimate> {
    let mut best: Option<FacingEstimate> = None;
    for profile in profiles {
        let score = similarity(features, &profile.features, config)?.value();
        if best.map_or(true, |b| score > b.score) {
            best = Some(FacingEstimate {
                direction: profile.direction,
                score,
            });
        }
    }
    let best = best.ok_or_else(|| PoseError::config("no facing profiles"))?;
    if best.score < threshold {
        return Ok(FacingEstimate {
            direction: FacingDirection::Unknown,
            score: best.score,
        });
    }
    Ok(best)
}

/// プロファイルと平滑化の状態を持つ分類器
#[derive(Debug, Clone)]
pub struct FacingClassifier {
    profiles: Vec<FacingProfile>,
    threshold: f32,
    similarity: SimilarityConfig,
    window: usize,
    history: VecDeque<FacingEstimate>,
    current: FacingDirection,
}

impl FacingClassifier {
    /// `expected_len` は特徴抽出器の出力長
    pub fn new(
        config: &FacingConfig,
        profiles: Vec<FacingProfile>,
        expected_len: usize,
        similarity: SimilarityConfig,
    ) -> Result<Self> {
        if profiles.is_empty() {
            return Err(PoseError::config("facing classifier needs at least one profile"));
        }
        for p in &profiles {
            if p.direction == FacingDirection::Unknown {
                return Err(PoseError::config("facing profile direction must not be unknown"));
            }
            if p.features.len() != expected_len {
                return Err(PoseError::config(format!(
                    "{:?} profile has {} features, extractor produces {}",
                    p.direction,
                    p.features.len(),
                    expected_len
                )));
            }
        }
        if !(0.0..=1.0).contains(&config.confidence_threshold) {
            return Err(PoseError::config(format!(
                "confidence_threshold {} outside [0, 1]",
                config.confidence_threshold
            )));
        }
        if config.smoothing_window == 0 {
            return Err(PoseError::config("smoothing_window must be at least 1"));
        }
        similarity.validate()?;

        Ok(Self {
            profiles,
            threshold: config.confidence_threshold,
            similarity,
            window: config.smoothing_window,
            history: VecDeque::with_capacity(config.smoothing_window),
            current: FacingDirection::Unknown,
        })
    }

    pub fn direction(&self) -> FacingDirection {
        self.current
    }

    /// 特徴が取れなかったフレームは None（Unknown として履歴に積む）
    pub fn classify(&mut self, features: Option<&FeatureVector>) -> FacingEstimate {
        let raw = match features {
            Some(f) => match facing(f, &self.profiles, self.threshold, &self.similarity) {
                Ok(estimate) => estimate,
                Err(e) => {
                    tracing::trace!(error = %e, "facing unavailable");
                    FacingEstimate::UNKNOWN
                }
            },
            None => FacingEstimate::UNKNOWN,
        };

        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(raw);

        if let Some(majority) = self.majority() {
            if majority != self.current {
                tracing::debug!(from = ?self.current, to = ?majority, "facing changed");
                self.current = majority;
            }
        }

        // 採用中の向きの平均スコア
        let (sum, n) = self
            .history
            .iter()
            .filter(|e| e.direction == self.current)
            .fold((0.0f32, 0usize), |(s, n), e| (s + e.score, n + 1));
        FacingEstimate {
            direction: self.current,
            score: if n > 0 { sum / n as f32 } else { 0.0 },
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.current = FacingDirection::Unknown;
    }

    /// 履歴の過半数を占める向き
    fn majority(&self) -> Option<FacingDirection> {
        let mut counts = [0usize; 5];
        for e in &self.history {
            counts[e.direction as usize] += 1;
        }
        let (index, &count) = counts.iter().enumerate().max_by_key(|&(_, c)| *c)?;
        if count * 2 > self.history.len() {
            Some(DIRECTIONS[index])
        } else {
            None
        }
    }
}

const DIRECTIONS: [FacingDirection; 5] = [
    FacingDirection::Front,
    FacingDirection::Back,
    FacingDirection::Left,
    FacingDirection::Right,
    FacingDirection::Unknown,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::FeatureExtractor;
    use crate::config::{FeatureConfig, NormalizeConfig};
    use crate::pose::keypoint::fixtures::{standing_pose, without};
    use crate::pose::{normalize, JointId, Keypoint, Pose};

    fn profiles() -> Vec<FacingProfile> {
        vec![
            FacingProfile::new(FacingDirection::Front, FeatureVector::from_values([0.5, 0.5, 0.2])),
            FacingProfile::new(FacingDirection::Back, FeatureVector::from_values([0.5, -0.5, 0.0])),
            FacingProfile::new(FacingDirection::Left, FeatureVector::from_values([0.1, 0.0, 0.6])),
            FacingProfile::new(FacingDirection::Right, FeatureVector::from_values([0.1, 0.0, -0.6])),
        ]
    }

    fn classifier(window: usize) -> FacingClassifier {
        let config = FacingConfig {
            smoothing_window: window,
            ..FacingConfig::default()
        };
        FacingClassifier::new(&config, profiles(), 3, SimilarityConfig::default()).unwrap()
    }

    fn front() -> FeatureVector {
        FeatureVector::from_values([0.5, 0.5, 0.2])
    }

    fn back() -> FeatureVector {
        FeatureVector::from_values([0.5, -0.5, 0.0])
    }

    #[test]
    fn test_profile_match_is_exact() {
        let est = facing(&front(), &profiles(), 0.7, &SimilarityConfig::default()).unwrap();
        assert_eq!(est.direction, FacingDirection::Front);
        assert!((est.score - 1.0).abs() < 1e-6);
        for p in profiles() {
            let est = facing(&p.features, &profiles(), 0.7, &SimilarityConfig::default()).unwrap();
            assert_eq!(est.direction, p.direction);
        }
    }

    #[test]
    fn test_far_from_all_profiles_is_unknown() {
        let far = FeatureVector::from_values([5.0, 5.0, 5.0]);
        let est = facing(&far, &profiles(), 0.7, &SimilarityConfig::default()).unwrap();
        assert_eq!(est.direction, FacingDirection::Unknown);
        assert!(est.score < 0.7);
    }

    #[test]
    fn test_deterministic() {
        let input = FeatureVector::from_values([0.45, 0.4, 0.25]);
        let first = facing(&input, &profiles(), 0.5, &SimilarityConfig::default()).unwrap();
        for _ in 0..10 {
            assert_eq!(facing(&input, &profiles(), 0.5, &SimilarityConfig::default()).unwrap(), first);
        }
    }

    #[test]
    fn test_length_mismatch_propagates() {
        let short = FeatureVector::from_values([0.5]);
        assert!(matches!(
            facing(&short, &profiles(), 0.7, &SimilarityConfig::default()),
            Err(PoseError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_classifier_config() {
        let sim = SimilarityConfig::default();
        let config = FacingConfig::default();
        assert!(FacingClassifier::new(&config, vec![], 3, sim.clone()).is_err());
        assert!(FacingClassifier::new(&config, profiles(), 4, sim.clone()).is_err());

        let mut with_unknown = profiles();
        with_unknown.push(FacingProfile::new(FacingDirection::Unknown, front()));
        assert!(FacingClassifier::new(&config, with_unknown, 3, sim.clone()).is_err());

        let bad_threshold = FacingConfig {
            confidence_threshold: 1.5,
            ..FacingConfig::default()
        };
        assert!(FacingClassifier::new(&bad_threshold, profiles(), 3, sim.clone()).is_err());

        let no_window = FacingConfig {
            smoothing_window: 0,
            ..FacingConfig::default()
        };
        assert!(FacingClassifier::new(&no_window, profiles(), 3, sim).is_err());
    }

    #[test]
    fn test_smoothing_needs_majority() {
        let mut c = classifier(5);
        for _ in 0..5 {
            c.classify(Some(&front()));
        }
        assert_eq!(c.direction(), FacingDirection::Front);

        // 5フレーム中2回の Back では切り替わらない
        c.classify(Some(&back()));
        let est = c.classify(Some(&back()));
        assert_eq!(est.direction, FacingDirection::Front);
        assert!((est.score - 1.0).abs() < 1e-6);

        // 3回目で過半数
        let est = c.classify(Some(&back()));
        assert_eq!(est.direction, FacingDirection::Back);
    }

    #[test]
    fn test_window_one_follows_input() {
        let mut c = classifier(1);
        assert_eq!(c.classify(Some(&front())).direction, FacingDirection::Front);
        assert_eq!(c.classify(Some(&back())).direction, FacingDirection::Back);
        assert_eq!(c.classify(None).direction, FacingDirection::Unknown);
    }

    #[test]
    fn test_missing_frames_decay_to_unknown() {
        let mut c = classifier(3);
        c.classify(Some(&front()));
        c.classify(None);
        assert_eq!(c.direction(), FacingDirection::Front);
        c.classify(None);
        assert_eq!(c.direction(), FacingDirection::Unknown);
        c.reset();
        assert_eq!(c.direction(), FacingDirection::Unknown);
    }

    /// 実際の姿勢から作ったプロファイルで正面と背面を見分ける
    #[test]
    fn test_front_and_back_from_poses() {
        let ex = FeatureExtractor::new(&FeatureConfig::default()).unwrap();
        let config = NormalizeConfig::default();
        let front_pose = standing_pose();
        // 背面: 左右が画像上で入れ替わり、顔は見えない
        let back_pose = without(
            &Pose::from_keypoints(front_pose.iter().map(|kp| Keypoint { x: 1.0 - kp.x, ..*kp })).unwrap(),
            &[JointId::Nose, JointId::LeftEye, JointId::RightEye],
        );

        let front_features = ex.features(&normalize(&front_pose, &config).unwrap()).unwrap();
        let back_features = ex.features(&normalize(&back_pose, &config).unwrap()).unwrap();
        let profiles = vec![
            FacingProfile::new(FacingDirection::Front, front_features.clone()),
            FacingProfile::new(FacingDirection::Back, back_features.clone()),
        ];
        let sim = SimilarityConfig::default();

        let est = facing(&front_features, &profiles, 0.7, &sim).unwrap();
        assert_eq!(est.direction, FacingDirection::Front);

        // 少し回転しても正面のまま
        let tilted = ex
            .features(&normalize(&front_pose, &config).unwrap().rotated_2d(0.4))
            .unwrap();
        assert_eq!(facing(&tilted, &profiles, 0.7, &sim).unwrap().direction, FacingDirection::Front);
        assert_eq!(facing(&back_features, &profiles, 0.7, &sim).unwrap().direction, FacingDirection::Back);
    }
}
