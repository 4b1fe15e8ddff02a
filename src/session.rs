//! 1人分の解析セッション
//!
//! フレームごとに 正規化 → 関節角・特徴量 → スクワット/向き/類似度 を順に通す。
//! 分類器の状態はセッションが所有し、セッションを捨てれば全て破棄される。

use anyhow::Context;
use serde::Serialize;
use std::fs;

use crate::analysis::{CombinedSimilarity, FeatureExtractor, FeatureVector};
use crate::classifier::{
    assess_form, estimate_orientation, load_profiles, FacingClassifier, FacingDirection, FacingEstimate,
    FacingProfile,
    FormFeedback, SquatClassifier, SquatPhase,
};
use crate::config::Config;
use crate::error::{PoseError, Result};
use crate::frame::Frame;
use crate::pose::{angles, normalize, AngleSet, JointAngle, JointId, NormalizedPose, Pose};

/// フレームの処理状態
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameStatus {
    Ok,
    /// 必要な関節が欠けていた（出力は Unknown 寄りに劣化）
    Insufficient { missing: Vec<JointId> },
}

/// 向きの出どころ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingSource {
    Profiles,
    Heuristic,
}

/// 1フレーム分の出力
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub id: u64,
    #[serde(flatten)]
    pub status: FrameStatus,
    pub phase: SquatPhase,
    pub reps: u32,
    pub rep_completed: bool,
    pub knee_angle: Option<f32>,
    pub facing: FacingEstimate,
    pub facing_source: FacingSource,
    /// ヒューリスティック使用時のみ
    pub yaw_degrees: Option<f32>,
    /// 目標姿勢との類似度（目標が無い・比較できないときNone）
    pub similarity: Option<f32>,
    /// しゃがんでいる間のみ
    pub form: Option<FormFeedback>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// 処理済みIDより古いフレーム
    Dropped { id: u64, last_id: u64 },
    Report(FrameReport),
}

pub struct Session {
    config: Config,
    extractor: FeatureExtractor,
    squat: SquatClassifier,
    facing: Option<FacingClassifier>,
    similarity: CombinedSimilarity,
    target: Option<NormalizedPose>,
    last_id: Option<u64>,
}

impl Session {
    /// 設定を検証して分類器を組み立てる。設定エラーはここで失敗する
    ///
    /// `profiles` は `config.facing.profiles` に追加される。
    /// プロファイルが1つも無ければ向きはヒューリスティックで推定する。
    pub fn new(config: &Config, target: Option<Pose>, profiles: Vec<FacingProfile>) -> Result<Self> {
        let config = config.clone();
        validate_scores(&config)?;

        let extractor = FeatureExtractor::new(&config.features)?;
        let squat = SquatClassifier::from_config(&config.squat)?;
        let similarity = CombinedSimilarity::new(
            config.similarity.clone(),
            config.angles.joints.clone(),
            extractor.clone(),
        )?;

        let mut all_profiles = config.facing.profiles.clone();
        all_profiles.extend(profiles);
        let facing = if all_profiles.is_empty() {
            tracing::info!("no facing profiles, using heuristic orientation");
            None
        } else {
            tracing::info!(profiles = all_profiles.len(), "facing profiles loaded");
            Some(FacingClassifier::new(
                &config.facing,
                all_profiles,
                extractor.len(),
                config.similarity.clone(),
            )?)
        };

        let target = match target {
            Some(pose) => Some(normalize(&pose, &config.normalize).map_err(|e| {
                PoseError::config(format!("target pose cannot be normalized: {}", e))
            })?),
            None => None,
        };

        Ok(Self {
            config,
            extractor,
            squat,
            facing,
            similarity,
            target,
            last_id: None,
        })
    }

    /// 設定に書かれたファイル（目標姿勢・プロファイル）を読み込んで作る
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let target = match &config.session.target_pose {
            Some(path) => Some(load_pose(path)?),
            None => None,
        };
        let profiles = match &config.facing.profiles_path {
            Some(path) => load_profiles(path)?,
            None => Vec::new(),
        };
        Ok(Self::new(config, target, profiles)?)
    }

    pub fn phase(&self) -> SquatPhase {
        self.squat.phase()
    }

    pub fn reps(&self) -> u32 {
        self.squat.reps()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.last_id
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// 新しいセットを始める。回数・局面・向きの履歴を初期化する
    pub fn reset(&mut self) {
        self.squat.reset();
        if let Some(f) = self.facing.as_mut() {
            f.reset();
        }
    }

    pub fn process(&mut self, frame: &Frame) -> FrameOutcome {
        if let Some(last_id) = self.last_id {
            if frame.id <= last_id {
                tracing::trace!(id = frame.id, last_id, "frame dropped");
                return FrameOutcome::Dropped { id: frame.id, last_id };
            }
        }
        self.last_id = Some(frame.id);

        let mut missing: Vec<JointId> = Vec::new();
        let (normalized, angle_set, features) = match normalize(&frame.pose, &self.config.normalize) {
            Ok(np) => {
                let set = angles(&np, &self.config.angles.joints, self.config.angles.min_score);
                let features = self.features(&np, &mut missing);
                (Some(np), set, features)
            }
            Err(e) => {
                tracing::debug!(id = frame.id, error = %e, "frame not normalized");
                collect_missing(&e, &mut missing);
                (None, AngleSet::new(), None)
            }
        };

        let squat = self.squat.update(&angle_set);
        if squat.knee_angle.is_none() {
            for knee in [JointAngle::LeftKnee, JointAngle::RightKnee] {
                if angle_set.get(knee).is_none() {
                    let t = knee.triple();
                    missing.extend([t.a, t.vertex, t.b].iter().filter(|&&j| {
                        frame.pose.valid(j, self.config.angles.min_score).is_none()
                    }));
                }
            }
        }

        let (facing, facing_source, yaw_degrees) = match self.facing.as_mut() {
            Some(classifier) => (classifier.classify(features.as_ref()), FacingSource::Profiles, None),
            None => {
                let o = estimate_orientation(&frame.pose, &self.config.orient);
                let estimate = FacingEstimate {
                    direction: o.direction,
                    // ヒューリスティックの確からしさは入力の平均信頼度で代用
                    score: if o.direction == FacingDirection::Unknown {
                        0.0
                    } else {
                        frame.pose.average_score()
                    },
                };
                (estimate, FacingSource::Heuristic, Some(o.yaw_degrees))
            }
        };

        let similarity = match (&normalized, &self.target) {
            (Some(np), Some(target)) => match self.similarity.compare(np, target) {
                Ok(score) => Some(score.value()),
                Err(e) => {
                    tracing::debug!(id = frame.id, error = %e, "similarity unavailable");
                    None
                }
            },
            _ => None,
        };

        let squatting = matches!(
            squat.phase,
            SquatPhase::Descending | SquatPhase::Bottom | SquatPhase::Ascending
        );
        let form = if self.config.form.enabled && squatting {
            assess_form(&angle_set, &self.config.form).ok()
        } else {
            None
        };

        missing.sort();
        missing.dedup();
        let status = if missing.is_empty() {
            FrameStatus::Ok
        } else {
            FrameStatus::Insufficient { missing }
        };

        FrameOutcome::Report(FrameReport {
            id: frame.id,
            status,
            phase: squat.phase,
            reps: squat.reps,
            rep_completed: squat.rep_completed,
            knee_angle: squat.knee_angle,
            facing,
            facing_source,
            yaw_degrees,
            similarity,
            form,
        })
    }

    fn features(&self, pose: &NormalizedPose, missing: &mut Vec<JointId>) -> Option<FeatureVector> {
        match self.extractor.features(pose) {
            Ok(f) => Some(f),
            Err(e) => {
                collect_missing(&e, missing);
                None
            }
        }
    }
}

fn collect_missing(e: &PoseError, missing: &mut Vec<JointId>) {
    if let PoseError::InsufficientKeypoints { joints, .. } = e {
        missing.extend(joints.iter().copied());
    }
}

/// 信頼度閾値は [0, 1]
fn validate_scores(config: &Config) -> Result<()> {
    let scores = [
        ("normalize.min_score", config.normalize.min_score),
        ("angles.min_score", config.angles.min_score),
        ("orient.min_score", config.orient.min_score),
    ];
    for (name, value) in scores {
        if !(0.0..=1.0).contains(&value) {
            return Err(PoseError::config(format!("{} {} outside [0, 1]", name, value)));
        }
    }
    if !(config.normalize.epsilon > 0.0) {
        return Err(PoseError::config("normalize.epsilon must be positive"));
    }
    Ok(())
}

/// 目標姿勢のJSON（キーポイント配列）を読む
pub fn load_pose(path: &str) -> anyhow::Result<Pose> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read pose file: {}", path))?;
    let pose: Pose =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse pose file: {}", path))?;
    Ok(pose)
}
