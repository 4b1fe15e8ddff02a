//! プロファイルが無いときの簡易な向き推定
//!
//! 鼻が肩中点からどれだけ横にずれているか（肩幅比）と、目・耳の見え方から決める。
//! 画像座標のまま扱う（比率なので正規化は不要）。

use serde::Serialize;

use crate::classifier::facing::FacingDirection;
use crate::config::OrientConfig;
use crate::pose::{JointId, Pose};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrientationEstimate {
    pub direction: FacingDirection,
    /// 正面を0とした左右の回転（度）。画像の右向きが正、背面は180
    pub yaw_degrees: f32,
}

impl OrientationEstimate {
    const UNKNOWN: OrientationEstimate = OrientationEstimate {
        direction: FacingDirection::Unknown,
        yaw_degrees: 0.0,
    };
}

pub fn estimate_orientation(pose: &Pose, config: &OrientConfig) -> OrientationEstimate {
    use JointId::*;
    let min_score = config.min_score;
    let visible = move |j: JointId| pose.valid(j, min_score);

    let (ls, rs) = match (visible(LeftShoulder), visible(RightShoulder)) {
        (Some(l), Some(r)) => (l, r),
        _ => return OrientationEstimate::UNKNOWN,
    };
    let face_visible = visible(LeftEye).is_some() || visible(RightEye).is_some();
    let nose = match visible(Nose) {
        Some(n) if face_visible => n,
        // 顔が見えなければ背面
        _ => {
            return OrientationEstimate {
                direction: FacingDirection::Back,
                yaw_degrees: 180.0,
            }
        }
    };

    let shoulder_mid_x = (ls.x + rs.x) / 2.0;
    let shoulder_width = (rs.x - ls.x).abs();
    let offset = nose.x - shoulder_mid_x;
    if shoulder_width < 1e-6 && offset.abs() < 1e-6 {
        return OrientationEstimate::UNKNOWN;
    }
    let ratio = offset / shoulder_width.max(1e-6);
    let yaw_degrees = (ratio * 2.0).clamp(-1.0, 1.0).asin().to_degrees();

    let left_ear = visible(LeftEar).is_some();
    let right_ear = visible(RightEar).is_some();
    let direction = if ratio.abs() >= config.front_offset_ratio {
        if offset > 0.0 {
            FacingDirection::Right
        } else {
            FacingDirection::Left
        }
    } else if left_ear == right_ear {
        FacingDirection::Front
    } else if right_ear {
        // 画像の右を向くと右耳だけがカメラ側に残る
        FacingDirection::Right
    } else {
        FacingDirection::Left
    };

    OrientationEstimate {
        direction,
        yaw_degrees,
    }
}
