use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::classifier::profile::FacingProfile;
use crate::pose::{JointAngle, JointId};

/// 全体設定（config.toml）
///
/// セッション生成時に一度だけ読み込み、以降は変更しない
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub angles: AngleConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub squat: SquatConfig,
    #[serde(default)]
    pub form: FormConfig,
    #[serde(default)]
    pub facing: FacingConfig,
    #[serde(default)]
    pub orient: OrientConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// ファイルが無い・壊れている場合はデフォルト設定
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.as_ref().display(), error = %e, "using default config");
                Self::default()
            }
        }
    }
}

/// 正規化の基準点
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePoint {
    Joint(JointId),
    Midpoint(JointId, JointId),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizeConfig {
    /// 原点（デフォルト: 腰の中点）
    #[serde(default = "default_origin")]
    pub origin: ReferencePoint,
    /// スケール基準の2点（デフォルト: 肩中点〜腰中点 = 胴体長）
    #[serde(default = "default_scale_from")]
    pub scale_from: ReferencePoint,
    #[serde(default = "default_scale_to")]
    pub scale_to: ReferencePoint,
    /// 基準関節の最低信頼度
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// これ未満の基準長はDegenerateScale
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

fn default_origin() -> ReferencePoint { ReferencePoint::Midpoint(JointId::LeftHip, JointId::RightHip) }
fn default_scale_from() -> ReferencePoint { ReferencePoint::Midpoint(JointId::LeftShoulder, JointId::RightShoulder) }
fn default_scale_to() -> ReferencePoint { ReferencePoint::Midpoint(JointId::LeftHip, JointId::RightHip) }
fn default_min_score() -> f32 { 0.3 }
fn default_epsilon() -> f32 { 1e-4 }

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            scale_from: default_scale_from(),
            scale_to: default_scale_to(),
            min_score: default_min_score(),
            epsilon: default_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AngleConfig {
    /// 抽出する関節角
    #[serde(default = "default_angle_set")]
    pub joints: Vec<JointAngle>,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

fn default_angle_set() -> Vec<JointAngle> { JointAngle::ALL.to_vec() }

impl Default for AngleConfig {
    fn default() -> Self {
        Self {
            joints: default_angle_set(),
            min_score: default_min_score(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureConfig {
    /// 距離特徴にする関節ペア
    #[serde(default = "default_distance_pairs")]
    pub distance_pairs: Vec<(JointId, JointId)>,
    /// 角度特徴（/180 して 0〜1 に揃える）
    #[serde(default = "default_angle_set")]
    pub angles: Vec<JointAngle>,
    /// 画像平面の符号付き特徴（前後・左右の区別に必要）
    #[serde(default = "default_true")]
    pub signed_descriptors: bool,
    /// 左右対称性（体幹軸方向の左右差）
    #[serde(default = "default_true")]
    pub symmetry: bool,
    /// 腕の交差（画像平面）
    #[serde(default = "default_true")]
    pub arms_crossed: bool,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

fn default_true() -> bool { true }

fn default_distance_pairs() -> Vec<(JointId, JointId)> {
    use JointId::*;
    vec![
        // 体節
        (LeftShoulder, LeftElbow),
        (LeftElbow, LeftWrist),
        (RightShoulder, RightElbow),
        (RightElbow, RightWrist),
        (LeftHip, LeftKnee),
        (LeftKnee, LeftAnkle),
        (RightHip, RightKnee),
        (RightKnee, RightAnkle),
        (LeftShoulder, LeftHip),
        (RightShoulder, RightHip),
        // 左右幅
        (LeftShoulder, RightShoulder),
        (LeftHip, RightHip),
        (LeftWrist, RightWrist),
        (LeftAnkle, RightAnkle),
    ]
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            distance_pairs: default_distance_pairs(),
            angles: default_angle_set(),
            signed_descriptors: true,
            symmetry: true,
            arms_crossed: true,
            min_score: default_min_score(),
        }
    }
}

/// 成分ごとの距離の集約方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    Max,
    Rms,
}

/// 距離 → 類似度 [0,1] の単調減少関数
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Falloff {
    /// 1 / (1 + d / scale)
    Reciprocal { scale: f32 },
    /// clamp(1 - d / max_distance, 0, 1)
    Linear { max_distance: f32 },
}

impl Default for Falloff {
    fn default() -> Self {
        Self::Reciprocal { scale: 0.25 }
    }
}

/// 複合類似度の戦略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityStrategy {
    Keypoints,
    KeyAngles,
    RelativeAngles,
    InvariantFeatures,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct WeightedStrategy {
    pub strategy: SimilarityStrategy,
    pub weight: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimilarityConfig {
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub falloff: Falloff,
    /// キーポイント比較時の最低信頼度
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// 目標姿勢との比較に使う戦略と重み
    #[serde(default = "default_strategies")]
    pub strategies: Vec<WeightedStrategy>,
    /// 区別を強めるためのべき乗（1.0で無効）
    #[serde(default = "default_power")]
    pub power: f32,
}

fn default_strategies() -> Vec<WeightedStrategy> {
    vec![
        WeightedStrategy { strategy: SimilarityStrategy::KeyAngles, weight: 0.5 },
        WeightedStrategy { strategy: SimilarityStrategy::RelativeAngles, weight: 0.3 },
        WeightedStrategy { strategy: SimilarityStrategy::InvariantFeatures, weight: 0.2 },
    ]
}
fn default_power() -> f32 { 2.0 }

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            aggregation: Aggregation::default(),
            falloff: Falloff::default(),
            min_score: default_min_score(),
            strategies: default_strategies(),
            power: default_power(),
        }
    }
}

/// スクワット判定に使う膝角度の選び方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KneeSelection {
    Left,
    Right,
    /// 取得できた膝の平均
    #[default]
    Average,
    /// 取得できた膝のうち深い方
    Min,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SquatConfig {
    #[serde(default)]
    pub knee: KneeSelection,
    /// これを下回るとDescending（度）
    #[serde(default = "default_down_threshold")]
    pub down_threshold: f32,
    /// これを下回るとBottom（度）
    #[serde(default = "default_bottom_threshold")]
    pub bottom_threshold: f32,
    /// 戻り方向の閾値に加える幅（度）
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f32,
    /// Bottom確定に必要な連続フレーム数
    #[serde(default = "default_bottom_hold_frames")]
    pub bottom_hold_frames: u32,
    /// これを超えて連続欠損するとUnknown
    #[serde(default = "default_max_missing_frames")]
    pub max_missing_frames: u32,
    /// 指定時、Bottom確定に股関節角がこの値以下であることも要求
    #[serde(default)]
    pub hip_max_at_bottom: Option<f32>,
}

fn default_down_threshold() -> f32 { 140.0 }
fn default_bottom_threshold() -> f32 { 80.0 }
fn default_hysteresis() -> f32 { 8.0 }
fn default_bottom_hold_frames() -> u32 { 1 }
fn default_max_missing_frames() -> u32 { 4 }

impl Default for SquatConfig {
    fn default() -> Self {
        Self {
            knee: KneeSelection::default(),
            down_threshold: default_down_threshold(),
            bottom_threshold: default_bottom_threshold(),
            hysteresis: default_hysteresis(),
            bottom_hold_frames: default_bottom_hold_frames(),
            max_missing_frames: default_max_missing_frames(),
            hip_max_at_bottom: None,
        }
    }
}

/// フォーム判定の閾値（度）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FormConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 肘角度がこれ以下なら腕が曲がっている
    #[serde(default = "default_min_elbow")]
    pub min_elbow: f32,
    /// 肩角度の許容範囲
    #[serde(default = "default_min_shoulder")]
    pub min_shoulder: f32,
    #[serde(default = "default_max_shoulder")]
    pub max_shoulder: f32,
    /// 股関節角がこれ以上なら腰が高い
    #[serde(default = "default_max_hip")]
    pub max_hip: f32,
    /// 左右の膝角度差の上限
    #[serde(default = "default_max_knee_asymmetry")]
    pub max_knee_asymmetry: f32,
    /// 膝角度の下限（深すぎ）
    #[serde(default = "default_min_knee")]
    pub min_knee: f32,
}

fn default_min_elbow() -> f32 { 130.0 }
fn default_min_shoulder() -> f32 { 30.0 }
fn default_max_shoulder() -> f32 { 120.0 }
fn default_max_hip() -> f32 { 130.0 }
fn default_max_knee_asymmetry() -> f32 { 15.0 }
fn default_min_knee() -> f32 { 60.0 }

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_elbow: default_min_elbow(),
            min_shoulder: default_min_shoulder(),
            max_shoulder: default_max_shoulder(),
            max_hip: default_max_hip(),
            max_knee_asymmetry: default_max_knee_asymmetry(),
            min_knee: default_min_knee(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FacingConfig {
    /// 向きごとの基準特徴量
    #[serde(default)]
    pub profiles: Vec<FacingProfile>,
    /// JSONで保存したプロファイル（capture_profileの出力）
    #[serde(default)]
    pub profiles_path: Option<String>,
    /// これ未満の最良スコアはUnknown
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// 多数決に使う直近フレーム数（1で平滑化なし）
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
}

fn default_confidence_threshold() -> f32 { 0.7 }
fn default_smoothing_window() -> usize { 5 }

impl Default for FacingConfig {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            profiles_path: None,
            confidence_threshold: default_confidence_threshold(),
            smoothing_window: default_smoothing_window(),
        }
    }
}

/// プロファイル無しのときのヒューリスティック向き推定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrientConfig {
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// 鼻の横ずれ / 肩幅 がこれ未満なら正面
    #[serde(default = "default_front_offset_ratio")]
    pub front_offset_ratio: f32,
}

fn default_front_offset_ratio() -> f32 { 0.25 }

impl Default for OrientConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            front_offset_ratio: default_front_offset_ratio(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    /// 目標姿勢（Pose JSON）のパス
    #[serde(default)]
    pub target_pose: Option<String>,
}
