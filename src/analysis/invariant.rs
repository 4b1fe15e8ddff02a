//! 回転・拡大縮小・平行移動に不変な特徴量
//!
//! 正規化済み姿勢から固定長の特徴ベクトルを作る。並びは設定で固定され、
//! 左右ペアは常に `JointId` の順（左が先）に正規化される。

use std::collections::BTreeSet;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::config::FeatureConfig;
use crate::error::{PoseError, Result};
use crate::pose::{joint_angle, JointAngle, JointId, Keypoint, NormalizedPose};

/// 特徴ベクトルの1成分の意味
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureComponent {
    /// 2関節間の距離（正規化済みなので胴体長比）
    Distance(JointId, JointId),
    /// 関節角 / 180
    Angle(JointAngle),
    /// 体幹軸に対する符号付き肩幅。正面と背面で符号が反転する
    SignedShoulderWidth,
    /// 体幹軸からの鼻の符号付き横ずれ。左右の向きで符号が反転する
    NoseOffset,
    /// 左右対称性 [0, 1]。左右ペアの体幹軸方向の差から求める
    Symmetry,
    /// 画像上で肩→手首の線分同士が交差していれば1、していなければ0
    ArmsCrossed,
}

/// 対称性を測る左右ペアの左側
const SYMMETRY_JOINTS: [JointId; 6] = [
    JointId::LeftShoulder,
    JointId::LeftElbow,
    JointId::LeftWrist,
    JointId::LeftHip,
    JointId::LeftKnee,
    JointId::LeftAnkle,
];

impl FeatureComponent {
    /// 計算に必要な関節
    pub fn joints(&self) -> Vec<JointId> {
        use JointId::*;
        match *self {
            Self::Distance(a, b) => vec![a, b],
            Self::Angle(angle) => {
                let t = angle.triple();
                vec![t.a, t.vertex, t.b]
            }
            Self::SignedShoulderWidth => vec![LeftShoulder, RightShoulder, LeftHip, RightHip],
            Self::NoseOffset => vec![Nose, LeftShoulder, RightShoulder, LeftHip, RightHip],
            Self::Symmetry => SYMMETRY_JOINTS.iter().flat_map(|&j| [j, j.mirror()]).collect(),
            Self::ArmsCrossed => vec![LeftShoulder, LeftWrist, RightShoulder, RightWrist],
        }
    }

    /// 画像平面に依存する成分か。面外の3D回転では値が変わる
    pub fn is_view_dependent(&self) -> bool {
        matches!(self, Self::SignedShoulderWidth | Self::NoseOffset | Self::ArmsCrossed)
    }
}

/// 固定長の特徴ベクトル。取得できなかった成分は `None`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: Vec<Option<f32>>,
}

impl FeatureVector {
    pub fn new(values: Vec<Option<f32>>) -> Self {
        Self { values }
    }

    /// 全成分が揃ったベクトル
    pub fn from_values<I: IntoIterator<Item = f32>>(values: I) -> Self {
        Self {
            values: values.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied().flatten()
    }

    pub fn values(&self) -> &[Option<f32>] {
        &self.values
    }

    /// 値のある成分数
    pub fn present(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// 特徴量抽出器。構築時にレイアウトを確定させる
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    components: Vec<FeatureComponent>,
    min_score: f32,
}

impl FeatureExtractor {
    pub fn new(config: &FeatureConfig) -> Result<Self> {
        let mut components = Vec::new();
        let mut seen = BTreeSet::new();
        for &(a, b) in &config.distance_pairs {
            if a == b {
                return Err(PoseError::config(format!("distance pair uses {:?} twice", a)));
            }
            // 左右の入れ替えで成分がずれないよう順序を固定
            let pair = if a < b { (a, b) } else { (b, a) };
            if !seen.insert(pair) {
                return Err(PoseError::config(format!("duplicate distance pair {:?}", pair)));
            }
            components.push(FeatureComponent::Distance(pair.0, pair.1));
        }

        let mut seen_angles = BTreeSet::new();
        for &angle in &config.angles {
            if !seen_angles.insert(angle) {
                return Err(PoseError::config(format!("duplicate feature angle {:?}", angle)));
            }
            components.push(FeatureComponent::Angle(angle));
        }

        if config.signed_descriptors {
            components.push(FeatureComponent::SignedShoulderWidth);
            components.push(FeatureComponent::NoseOffset);
        }
        if config.symmetry {
            components.push(FeatureComponent::Symmetry);
        }
        if config.arms_crossed {
            components.push(FeatureComponent::ArmsCrossed);
        }

        if components.is_empty() {
            return Err(PoseError::config("feature layout is empty"));
        }
        if !(0.0..=1.0).contains(&config.min_score) {
            return Err(PoseError::config(format!(
                "feature min_score {} outside [0, 1]",
                config.min_score
            )));
        }

        let view_dependent = components.iter().filter(|c| c.is_view_dependent()).count();
        if view_dependent > 0 {
            tracing::debug!(
                view_dependent,
                "image-plane components enabled: invariant to in-plane rotation only"
            );
        }

        Ok(Self {
            components,
            min_score: config.min_score,
        })
    }

    pub fn from_config(config: &FeatureConfig) -> Result<Self> {
        Self::new(config)
    }

    /// 成分の並び
    pub fn components(&self) -> &[FeatureComponent] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// 特徴ベクトルを計算する。全成分が欠けたらエラー
    pub fn features(&self, pose: &NormalizedPose) -> Result<FeatureVector> {
        let values: Vec<Option<f32>> = self
            .components
            .iter()
            .map(|c| self.component(pose, *c))
            .collect();

        if values.iter().all(Option::is_none) {
            let missing: BTreeSet<JointId> = self
                .components
                .iter()
                .flat_map(|c| c.joints())
                .filter(|&j| pose.valid(j, self.min_score).is_none())
                .collect();
            return Err(PoseError::insufficient("features", missing.into_iter().collect()));
        }
        Ok(FeatureVector { values })
    }

    fn component(&self, pose: &NormalizedPose, component: FeatureComponent) -> Option<f32> {
        match component {
            FeatureComponent::Distance(a, b) => {
                let ka = pose.valid(a, self.min_score)?;
                let kb = pose.valid(b, self.min_score)?;
                Some(distance(ka, kb))
            }
            FeatureComponent::Angle(angle) => joint_angle(pose, angle.triple(), self.min_score)
                .ok()
                .map(|deg| deg / 180.0),
            FeatureComponent::SignedShoulderWidth => {
                let frame = TorsoFrame::new(pose, self.min_score)?;
                Some(cross(frame.shoulder_line, frame.axis) / frame.axis_len_sq)
            }
            FeatureComponent::NoseOffset => {
                let frame = TorsoFrame::new(pose, self.min_score)?;
                let nose = pose.valid(JointId::Nose, self.min_score)?;
                let w = (nose.x - frame.shoulder_mid.0, nose.y - frame.shoulder_mid.1);
                Some(cross(frame.axis, w) / frame.axis_len_sq)
            }
            FeatureComponent::Symmetry => symmetry(pose, self.min_score),
            FeatureComponent::ArmsCrossed => {
                use JointId::*;
                let [ls, lw, rs, rw] = pose
                    .as_pose()
                    .require([LeftShoulder, LeftWrist, RightShoulder, RightWrist], self.min_score, "arms")
                    .ok()?;
                let crossed = segments_intersect((ls.x, ls.y), (lw.x, lw.y), (rs.x, rs.y), (rw.x, rw.y));
                Some(if crossed { 1.0 } else { 0.0 })
            }
        }
    }
}

/// 左右ペアごとに 1 - min(|体幹軸方向の差|, 1) を取り、平均する
///
/// 体幹長が1に正規化されている前提。全点にzがあれば3Dで測るので任意の回転に不変
fn symmetry(pose: &NormalizedPose, min_score: f32) -> Option<f32> {
    use JointId::*;
    let torso = pose
        .as_pose()
        .require([LeftShoulder, RightShoulder, LeftHip, RightHip], min_score, "symmetry")
        .ok()?;
    let pairs: Vec<(&Keypoint, &Keypoint)> = SYMMETRY_JOINTS
        .iter()
        .filter_map(|&j| Some((pose.valid(j, min_score)?, pose.valid(j.mirror(), min_score)?)))
        .collect();

    let use_z = torso.iter().all(|kp| kp.z.is_some())
        && pairs.iter().all(|(l, r)| l.z.is_some() && r.z.is_some());
    let at = |kp: &Keypoint| Vector3::new(kp.x, kp.y, if use_z { kp.z.unwrap_or(0.0) } else { 0.0 });

    let [ls, rs, lh, rh] = torso.map(|kp| at(&kp));
    let axis = (lh + rh - ls - rs) / 2.0;
    let len = axis.norm();
    if len < 1e-6 || pairs.is_empty() {
        return None;
    }
    let axis = axis / len;
    let total: f32 = pairs
        .iter()
        .map(|&(l, r)| 1.0 - (at(l) - at(r)).dot(&axis).abs().min(1.0))
        .sum();
    Some(total / pairs.len() as f32)
}

/// 線分 p1-p2 と p3-p4 が交差するか（端点の向き判定）
fn segments_intersect(p1: (f32, f32), p2: (f32, f32), p3: (f32, f32), p4: (f32, f32)) -> bool {
    let ccw = |a: (f32, f32), b: (f32, f32), c: (f32, f32)| cross((b.0 - a.0, b.1 - a.1), (c.0 - a.0, c.1 - a.1)) > 0.0;
    ccw(p1, p3, p4) != ccw(p2, p3, p4) && ccw(p1, p2, p3) != ccw(p1, p2, p4)
}

/// 2点間距離。両方にzがあれば3D
fn distance(a: &Keypoint, b: &Keypoint) -> f32 {
    let dz = match (a.z, b.z) {
        (Some(za), Some(zb)) => za - zb,
        _ => 0.0,
    };
    Vector3::new(a.x - b.x, a.y - b.y, dz).norm()
}

fn cross(u: (f32, f32), v: (f32, f32)) -> f32 {
    u.0 * v.1 - u.1 * v.0
}

/// 画像平面での体幹座標系
struct TorsoFrame {
    shoulder_mid: (f32, f32),
    /// 肩中点 → 腰中点
    axis: (f32, f32),
    axis_len_sq: f32,
    /// 左肩 → 右肩
    shoulder_line: (f32, f32),
}

impl TorsoFrame {
    fn new(pose: &NormalizedPose, min_score: f32) -> Option<Self> {
        use JointId::*;
        let [ls, rs, lh, rh] = pose
            .as_pose()
            .require([LeftShoulder, RightShoulder, LeftHip, RightHip], min_score, "torso")
            .ok()?;
        let shoulder_mid = ((ls.x + rs.x) / 2.0, (ls.y + rs.y) / 2.0);
        let hip_mid = ((lh.x + rh.x) / 2.0, (lh.y + rh.y) / 2.0);
        let axis = (hip_mid.0 - shoulder_mid.0, hip_mid.1 - shoulder_mid.1);
        let axis_len_sq = axis.0 * axis.0 + axis.1 * axis.1;
        if axis_len_sq < 1e-10 {
            return None;
        }
        Some(Self {
            shoulder_mid,
            axis,
            axis_len_sq,
            shoulder_line: (rs.x - ls.x, rs.y - ls.y),
        })
    }
}
