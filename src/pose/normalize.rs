use nalgebra::{Rotation2, Rotation3, Vector2, Vector3};

use crate::config::{NormalizeConfig, ReferencePoint};
use crate::error::{PoseError, Result};
use crate::pose::{JointId, Keypoint, Pose};

/// 原点を基準点に移し、基準長を1にした姿勢
///
/// 回転はここでは除去しない（回転不変性は特徴量抽出側で扱う）
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPose {
    pose: Pose,
}

impl NormalizedPose {
    pub fn as_pose(&self) -> &Pose {
        &self.pose
    }

    pub fn get(&self, joint: JointId) -> Option<&Keypoint> {
        self.pose.get(joint)
    }

    pub fn valid(&self, joint: JointId, threshold: f32) -> Option<&Keypoint> {
        self.pose.valid(joint, threshold)
    }

    /// 画像平面内で原点まわりに回転した姿勢（zは変えない）
    pub fn rotated_2d(&self, radians: f32) -> Self {
        let rot = Rotation2::new(radians);
        let pose = self.pose.map_points(|kp| {
            let p = rot * Vector2::new(kp.x, kp.y);
            Keypoint { x: p.x, y: p.y, ..*kp }
        });
        Self { pose }
    }

    /// 3D回転。zの無い点は z=0 の平面上にあるものとして回転し、zは付与しない
    pub fn rotated(&self, rotation: &Rotation3<f32>) -> Self {
        let pose = self.pose.map_points(|kp| {
            let p = rotation * kp.position();
            Keypoint {
                x: p.x,
                y: p.y,
                z: kp.z.map(|_| p.z),
                ..*kp
            }
        });
        Self { pose }
    }
}

/// 基準点の座標。構成関節すべてにzがあればSome
fn reference_position(
    pose: &Pose,
    point: ReferencePoint,
    min_score: f32,
) -> Result<(Vector2<f32>, Option<f32>)> {
    match point {
        ReferencePoint::Joint(j) => {
            let [kp] = pose.require([j], min_score, "normalize")?;
            Ok((Vector2::new(kp.x, kp.y), kp.z))
        }
        ReferencePoint::Midpoint(a, b) => {
            let [ka, kb] = pose.require([a, b], min_score, "normalize")?;
            let xy = Vector2::new((ka.x + kb.x) / 2.0, (ka.y + kb.y) / 2.0);
            let z = match (ka.z, kb.z) {
                (Some(za), Some(zb)) => Some((za + zb) / 2.0),
                _ => None,
            };
            Ok((xy, z))
        }
    }
}

/// 姿勢を正規化する
///
/// - 原点: `config.origin`（デフォルトは腰の中点）
/// - スケール: `scale_from`〜`scale_to` の距離（デフォルトは胴体長）
/// - 基準点すべてにzがある場合のみ3Dで原点・距離を計算する
pub fn normalize(pose: &Pose, config: &NormalizeConfig) -> Result<NormalizedPose> {
    let (origin_xy, origin_z) = reference_position(pose, config.origin, config.min_score)?;
    let (from_xy, from_z) = reference_position(pose, config.scale_from, config.min_score)?;
    let (to_xy, to_z) = reference_position(pose, config.scale_to, config.min_score)?;

    let depth = match (from_z, to_z) {
        (Some(a), Some(b)) => a - b,
        _ => 0.0,
    };
    let scale = Vector3::new(from_xy.x - to_xy.x, from_xy.y - to_xy.y, depth).norm();
    if !scale.is_finite() || scale < config.epsilon {
        return Err(PoseError::DegenerateScale {
            context: "normalize",
            distance: scale,
            epsilon: config.epsilon,
        });
    }

    let oz = origin_z.unwrap_or(0.0);
    let normalized = pose.map_points(|kp| Keypoint {
        x: (kp.x - origin_xy.x) / scale,
        y: (kp.y - origin_xy.y) / scale,
        z: kp.z.map(|z| (z - oz) / scale),
        ..*kp
    });
    Ok(NormalizedPose { pose: normalized })
}
