use std::collections::{BTreeMap, BTreeSet};
use std::f32::consts::PI;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{PoseError, Result};
use crate::pose::{JointId, Keypoint, NormalizedPose};

/// 角度を測る3関節 (a, vertex, b)。vertexでの角度を求める
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointTriple {
    pub a: JointId,
    pub vertex: JointId,
    pub b: JointId,
}

/// 名前付きの関節角
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointAngle {
    LeftElbow,
    RightElbow,
    LeftShoulder,
    RightShoulder,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
}

impl JointAngle {
    pub const ALL: [JointAngle; 8] = [
        Self::LeftElbow,
        Self::RightElbow,
        Self::LeftShoulder,
        Self::RightShoulder,
        Self::LeftHip,
        Self::RightHip,
        Self::LeftKnee,
        Self::RightKnee,
    ];

    pub fn triple(&self) -> JointTriple {
        use JointId::*;
        let (a, vertex, b) = match self {
            Self::LeftElbow => (LeftShoulder, LeftElbow, LeftWrist),
            Self::RightElbow => (RightShoulder, RightElbow, RightWrist),
            Self::LeftShoulder => (LeftElbow, LeftShoulder, LeftHip),
            Self::RightShoulder => (RightElbow, RightShoulder, RightHip),
            Self::LeftHip => (LeftShoulder, LeftHip, LeftKnee),
            Self::RightHip => (RightShoulder, RightHip, RightKnee),
            Self::LeftKnee => (LeftHip, LeftKnee, LeftAnkle),
            Self::RightKnee => (RightHip, RightKnee, RightAnkle),
        };
        JointTriple { a, vertex, b }
    }
}

/// 関節角の集合（度, 0〜180）。取得できなかった角度も記録する
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AngleSet {
    values: BTreeMap<JointAngle, f32>,
    missing: BTreeSet<JointAngle>,
}

impl AngleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// テストやリプレイ用に値を直接組み立てる
    pub fn from_values<I: IntoIterator<Item = (JointAngle, f32)>>(values: I) -> Self {
        Self {
            values: values.into_iter().map(|(k, v)| (k, v.clamp(0.0, 180.0))).collect(),
            missing: BTreeSet::new(),
        }
    }

    pub fn get(&self, angle: JointAngle) -> Option<f32> {
        self.values.get(&angle).copied()
    }

    /// 角度が無ければ、その角度を構成する関節を挙げてエラー
    pub fn require(&self, angle: JointAngle) -> Result<f32> {
        self.get(angle).ok_or_else(|| {
            let t = angle.triple();
            PoseError::insufficient("angle", vec![t.a, t.vertex, t.b])
        })
    }

    pub fn missing(&self) -> impl Iterator<Item = JointAngle> + '_ {
        self.missing.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JointAngle, f32)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// 3点の座標ベクトル。全点にzがあるときだけ3Dで扱う
fn positions<const N: usize>(points: &[Keypoint; N]) -> [Vector3<f32>; N] {
    let use_z = points.iter().all(|kp| kp.z.is_some());
    points.map(|kp| {
        let z = if use_z { kp.z.unwrap_or(0.0) } else { 0.0 };
        Vector3::new(kp.x, kp.y, z)
    })
}

/// 内積・逆余弦で2ベクトルのなす角（度）
///
/// 0度・180度付近では f32 の acos が 0.02 度ほどずれるため f64 で計算する
pub(crate) fn vector_angle(u: &Vector3<f32>, v: &Vector3<f32>) -> Option<f32> {
    let u: Vector3<f64> = u.cast();
    let v: Vector3<f64> = v.cast();
    let nu = u.norm();
    let nv = v.norm();
    if nu < 1e-6 || nv < 1e-6 {
        return None;
    }
    let cos = (u.dot(&v) / (nu * nv)).clamp(-1.0, 1.0);
    Some((cos.acos().to_degrees() as f32).clamp(0.0, 180.0))
}

/// 単一の関節角（度）
pub fn joint_angle(pose: &NormalizedPose, triple: JointTriple, min_score: f32) -> Result<f32> {
    let points = pose
        .as_pose()
        .require([triple.a, triple.vertex, triple.b], min_score, "angle")?;
    let [a, vertex, b] = positions(&points);
    vector_angle(&(a - vertex), &(b - vertex)).ok_or(PoseError::DegenerateScale {
        context: "angle",
        distance: 0.0,
        epsilon: 1e-6,
    })
}

/// 要求された関節角を計算する。失敗した角度は `missing` に入る
pub fn angles(pose: &NormalizedPose, set: &[JointAngle], min_score: f32) -> AngleSet {
    let mut result = AngleSet::new();
    for &angle in set {
        match joint_angle(pose, angle.triple(), min_score) {
            Ok(deg) => {
                result.values.insert(angle, deg);
            }
            Err(_) => {
                result.missing.insert(angle);
            }
        }
    }
    result
}

/// 全角度が揃わなければ最初の失敗を返す
pub fn angles_strict(pose: &NormalizedPose, set: &[JointAngle], min_score: f32) -> Result<AngleSet> {
    let mut result = AngleSet::new();
    for &angle in set {
        let deg = joint_angle(pose, angle.triple(), min_score)?;
        result.values.insert(angle, deg);
    }
    Ok(result)
}

/// 体幹に対する向きを測る四肢の体節
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limb {
    LeftUpperArm,
    LeftLowerArm,
    RightUpperArm,
    RightLowerArm,
    LeftUpperLeg,
    LeftLowerLeg,
    RightUpperLeg,
    RightLowerLeg,
}

impl Limb {
    pub const ALL: [Limb; 8] = [
        Self::LeftUpperArm,
        Self::LeftLowerArm,
        Self::RightUpperArm,
        Self::RightLowerArm,
        Self::LeftUpperLeg,
        Self::LeftLowerLeg,
        Self::RightUpperLeg,
        Self::RightLowerLeg,
    ];

    /// (始点, 終点)
    pub fn segment(&self) -> (JointId, JointId) {
        use JointId::*;
        match self {
            Self::LeftUpperArm => (LeftShoulder, LeftElbow),
            Self::LeftLowerArm => (LeftElbow, LeftWrist),
            Self::RightUpperArm => (RightShoulder, RightElbow),
            Self::RightLowerArm => (RightElbow, RightWrist),
            Self::LeftUpperLeg => (LeftHip, LeftKnee),
            Self::LeftLowerLeg => (LeftKnee, LeftAnkle),
            Self::RightUpperLeg => (RightHip, RightKnee),
            Self::RightLowerLeg => (RightKnee, RightAnkle),
        }
    }
}

/// [-π, π) に折り返す
pub(crate) fn wrap_angle(radians: f32) -> f32 {
    (radians + PI).rem_euclid(2.0 * PI) - PI
}

/// 体幹軸（肩中点→腰中点）の画像平面上の向き（ラジアン）
pub(crate) fn torso_direction(pose: &NormalizedPose, min_score: f32) -> Result<f32> {
    use JointId::*;
    let [ls, rs, lh, rh] = pose
        .as_pose()
        .require([LeftShoulder, RightShoulder, LeftHip, RightHip], min_score, "torso")?;
    let dx = (lh.x + rh.x - ls.x - rs.x) / 2.0;
    let dy = (lh.y + rh.y - ls.y - rs.y) / 2.0;
    if dx.hypot(dy) < 1e-6 {
        return Err(PoseError::DegenerateScale {
            context: "torso",
            distance: dx.hypot(dy),
            epsilon: 1e-6,
        });
    }
    Ok(dy.atan2(dx))
}

/// 体幹を基準にした各体節の相対角度（ラジアン, [-π, π)）
///
/// 画像平面の回転には不変。体幹が取れなければエラー、個々の体節は欠けてもよい
pub fn limb_angles(pose: &NormalizedPose, min_score: f32) -> Result<BTreeMap<Limb, f32>> {
    let torso = torso_direction(pose, min_score)?;
    let mut result = BTreeMap::new();
    for limb in Limb::ALL {
        let (start, end) = limb.segment();
        let (Some(s), Some(e)) = (pose.valid(start, min_score), pose.valid(end, min_score)) else {
            continue;
        };
        let (dx, dy) = (e.x - s.x, e.y - s.y);
        if dx.hypot(dy) < 1e-6 {
            continue;
        }
        result.insert(limb, wrap_angle(dy.atan2(dx) - torso));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizeConfig;
    use crate::pose::keypoint::fixtures::{standing_pose, without};
    use crate::pose::{normalize, Pose};

    fn normalized(pose: &Pose) -> NormalizedPose {
        normalize(pose, &NormalizeConfig::default()).unwrap()
    }

    /// 腰・膝・足首を指定した脚だけの姿勢
    fn leg_pose(hip: (f32, f32), knee: (f32, f32), ankle: (f32, f32)) -> NormalizedPose {
        use JointId::*;
        let pose = Pose::from_keypoints([
            Keypoint::new(LeftShoulder, 0.45, 0.2, 0.9),
            Keypoint::new(RightShoulder, 0.55, 0.2, 0.9),
            Keypoint::new(LeftHip, hip.0, hip.1, 0.9),
            Keypoint::new(RightHip, 0.55, 0.5, 0.9),
            Keypoint::new(LeftKnee, knee.0, knee.1, 0.9),
            Keypoint::new(LeftAnkle, ankle.0, ankle.1, 0.9),
        ])
        .unwrap();
        normalized(&pose)
    }

    #[test]
    fn test_straight_leg() {
        let pose = leg_pose((0.45, 0.5), (0.45, 0.7), (0.45, 0.9));
        let angle = joint_angle(&pose, JointAngle::LeftKnee.triple(), 0.3).unwrap();
        assert!((angle - 180.0).abs() < 0.1);
    }

    #[test]
    fn test_straight_leg_exact_at_any_rotation() {
        let pose = normalized(&standing_pose());
        for rot in [0.0f32, 0.3, 1.2, 2.9, -1.7] {
            let rotated = pose.rotated_2d(rot);
            for angle in [JointAngle::LeftKnee, JointAngle::RightKnee] {
                let deg = joint_angle(&rotated, angle.triple(), 0.3).unwrap();
                assert!((deg - 180.0).abs() < 1e-3, "rot={} {:?}: {}", rot, angle, deg);
            }
        }
    }

    #[test]
    fn test_right_angle_knee() {
        let pose = leg_pose((0.45, 0.5), (0.45, 0.7), (0.65, 0.7));
        let angle = joint_angle(&pose, JointAngle::LeftKnee.triple(), 0.3).unwrap();
        assert!((angle - 90.0).abs() < 0.1);
    }

    #[test]
    fn test_angles_within_bounds() {
        let pose = normalized(&standing_pose());
        for rot in [0.0f32, 0.5, 1.7, 3.0, -2.2] {
            let set = angles(&pose.rotated_2d(rot), &JointAngle::ALL, 0.3);
            assert!(set.is_complete());
            for (_, deg) in set.iter() {
                assert!((0.0..=180.0).contains(&deg));
            }
        }
    }

    #[test]
    fn test_folded_limb_near_zero() {
        // 足首が腰とほぼ同じ方向に折り返す
        let pose = leg_pose((0.45, 0.5), (0.45, 0.7), (0.4501, 0.5));
        let angle = joint_angle(&pose, JointAngle::LeftKnee.triple(), 0.3).unwrap();
        assert!(angle >= 0.0 && angle < 1.0);
    }

    #[test]
    fn test_missing_joint_recorded() {
        let pose = normalized(&without(&standing_pose(), &[JointId::LeftAnkle]));
        let set = angles(&pose, &JointAngle::ALL, 0.3);
        assert!(set.get(JointAngle::LeftKnee).is_none());
        assert!(set.get(JointAngle::RightKnee).is_some());
        assert_eq!(set.missing().collect::<Vec<_>>(), vec![JointAngle::LeftKnee]);
        assert!(matches!(
            set.require(JointAngle::LeftKnee),
            Err(PoseError::InsufficientKeypoints { .. })
        ));
        assert!(angles_strict(&pose, &JointAngle::ALL, 0.3).is_err());
    }

    #[test]
    fn test_coincident_joints_degenerate() {
        let pose = leg_pose((0.45, 0.5), (0.45, 0.7), (0.45, 0.7));
        let err = joint_angle(&pose, JointAngle::LeftKnee.triple(), 0.3).unwrap_err();
        assert!(matches!(err, PoseError::DegenerateScale { .. }));
    }

    #[test]
    fn test_3d_angle_uses_depth() {
        use JointId::*;
        let pose = Pose::from_keypoints([
            Keypoint::new_3d(LeftShoulder, 0.45, 0.2, 0.0, 0.9),
            Keypoint::new_3d(RightShoulder, 0.55, 0.2, 0.0, 0.9),
            Keypoint::new_3d(LeftHip, 0.45, 0.5, 0.0, 0.9),
            Keypoint::new_3d(RightHip, 0.55, 0.5, 0.0, 0.9),
            Keypoint::new_3d(LeftKnee, 0.45, 0.7, 0.0, 0.9),
            // 足首が奥に向かって曲がっている: 画像上は一直線でも実際は90度
            Keypoint::new_3d(LeftAnkle, 0.45, 0.7, 0.2, 0.9),
        ])
        .unwrap();
        let n = normalized(&pose);
        let angle = joint_angle(&n, JointAngle::LeftKnee.triple(), 0.3).unwrap();
        assert!((angle - 90.0).abs() < 0.1);
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-5);
        assert!((wrap_angle(-3.0 * PI / 2.0) - PI / 2.0).abs() < 1e-5);
        assert!((wrap_angle(0.3) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_limb_angles_rotation_invariant() {
        let pose = normalized(&standing_pose());
        let a = limb_angles(&pose, 0.3).unwrap();
        let b = limb_angles(&pose.rotated_2d(1.1), 0.3).unwrap();
        assert_eq!(a.len(), Limb::ALL.len());
        for (limb, angle) in &a {
            let diff = wrap_angle(angle - b[limb]).abs();
            assert!(diff < 1e-4, "{:?}: {} vs {}", limb, angle, b[limb]);
        }
    }

    #[test]
    fn test_limb_angles_require_torso() {
        let pose = normalized(&standing_pose());
        let partial = without(pose.as_pose(), &[JointId::LeftShoulder]);
        let partial = normalize(&partial, &NormalizeConfig {
            scale_from: crate::config::ReferencePoint::Joint(JointId::RightShoulder),
            ..NormalizeConfig::default()
        })
        .unwrap();
        assert!(limb_angles(&partial, 0.3).is_err());
    }
}
