use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PoseError, Result};

/// COCO / MoveNet の 17 関節
///
/// 左右ペアは常に左が先（`Ord` の順序がそのまま特徴量の並び順になる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(usize)]
pub enum JointId {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl JointId {
    pub const COUNT: usize = 17;

    pub const ALL: [JointId; JointId::COUNT] = [
        Self::Nose,
        Self::LeftEye,
        Self::RightEye,
        Self::LeftEar,
        Self::RightEar,
        Self::LeftShoulder,
        Self::RightShoulder,
        Self::LeftElbow,
        Self::RightElbow,
        Self::LeftWrist,
        Self::RightWrist,
        Self::LeftHip,
        Self::RightHip,
        Self::LeftKnee,
        Self::RightKnee,
        Self::LeftAnkle,
        Self::RightAnkle,
    ];

    /// 左右反対側の関節（鼻はそのまま）
    pub fn mirror(&self) -> Self {
        match self {
            Self::Nose => Self::Nose,
            Self::LeftEye => Self::RightEye,
            Self::RightEye => Self::LeftEye,
            Self::LeftEar => Self::RightEar,
            Self::RightEar => Self::LeftEar,
            Self::LeftShoulder => Self::RightShoulder,
            Self::RightShoulder => Self::LeftShoulder,
            Self::LeftElbow => Self::RightElbow,
            Self::RightElbow => Self::LeftElbow,
            Self::LeftWrist => Self::RightWrist,
            Self::RightWrist => Self::LeftWrist,
            Self::LeftHip => Self::RightHip,
            Self::RightHip => Self::LeftHip,
            Self::LeftKnee => Self::RightKnee,
            Self::RightKnee => Self::LeftKnee,
            Self::LeftAnkle => Self::RightAnkle,
            Self::RightAnkle => Self::LeftAnkle,
        }
    }
}

/// 単一キーポイント
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub joint: JointId,
    pub x: f32,
    pub y: f32,
    /// 3Dモデル（BlazePose等）のみ
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f32>,
    /// 信頼度スコア (0.0〜1.0)
    pub score: f32,
}

impl Keypoint {
    pub fn new(joint: JointId, x: f32, y: f32, score: f32) -> Self {
        Self { joint, x, y, z: None, score }
    }

    pub fn new_3d(joint: JointId, x: f32, y: f32, z: f32, score: f32) -> Self {
        Self { joint, x, y, z: Some(z), score }
    }

    /// 信頼度が閾値以上か
    pub fn is_valid(&self, threshold: f32) -> bool {
        self.score >= threshold
    }

    /// 座標ベクトル。zが無ければ0として扱う
    pub fn position(&self) -> nalgebra::Vector3<f32> {
        nalgebra::Vector3::new(self.x, self.y, self.z.unwrap_or(0.0))
    }

    fn check(&self) -> Result<()> {
        let finite = self.x.is_finite() && self.y.is_finite() && self.z.map_or(true, f32::is_finite);
        if !finite {
            return Err(PoseError::InvalidKeypoint {
                joint: self.joint,
                reason: "non-finite coordinate".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.score) {
            return Err(PoseError::InvalidKeypoint {
                joint: self.joint,
                reason: format!("score {} outside [0, 1]", self.score),
            });
        }
        Ok(())
    }
}

/// 1フレーム分の姿勢（関節ごとに最大1点）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Keypoint>", into = "Vec<Keypoint>")]
pub struct Pose {
    keypoints: BTreeMap<JointId, Keypoint>,
}

impl Pose {
    /// キーポイント列から作成。重複関節・不正スコアはエラー
    pub fn from_keypoints<I: IntoIterator<Item = Keypoint>>(keypoints: I) -> Result<Self> {
        let mut map = BTreeMap::new();
        for kp in keypoints {
            kp.check()?;
            if map.insert(kp.joint, kp).is_some() {
                return Err(PoseError::DuplicateJoint(kp.joint));
            }
        }
        Ok(Self { keypoints: map })
    }

    /// 検証済みのキーポイントから作る（変換結果用）
    pub(crate) fn from_map(keypoints: BTreeMap<JointId, Keypoint>) -> Self {
        Self { keypoints }
    }

    pub fn get(&self, joint: JointId) -> Option<&Keypoint> {
        self.keypoints.get(&joint)
    }

    /// 閾値以上のキーポイントのみ返す
    pub fn valid(&self, joint: JointId, threshold: f32) -> Option<&Keypoint> {
        self.get(joint).filter(|kp| kp.is_valid(threshold))
    }

    /// 必須関節をまとめて取得。欠けていれば欠損関節を列挙してエラー
    pub fn require<const N: usize>(
        &self,
        joints: [JointId; N],
        threshold: f32,
        context: &'static str,
    ) -> Result<[Keypoint; N]> {
        let missing: Vec<JointId> = joints
            .iter()
            .copied()
            .filter(|&j| self.valid(j, threshold).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(PoseError::insufficient(context, missing));
        }
        Ok(joints.map(|j| self.keypoints[&j]))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keypoint> {
        self.keypoints.values()
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// 全キーポイントの平均信頼度
    pub fn average_score(&self) -> f32 {
        if self.keypoints.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.keypoints.values().map(|k| k.score).sum();
        sum / self.keypoints.len() as f32
    }

    /// 各キーポイントに座標変換を適用した新しいPoseを返す
    pub(crate) fn map_points<F>(&self, mut f: F) -> Pose
    where
        F: FnMut(&Keypoint) -> Keypoint,
    {
        Pose::from_map(self.keypoints.iter().map(|(j, kp)| (*j, f(kp))).collect())
    }
}

impl TryFrom<Vec<Keypoint>> for Pose {
    type Error = PoseError;

    fn try_from(keypoints: Vec<Keypoint>) -> Result<Self> {
        Pose::from_keypoints(keypoints)
    }
}

impl From<Pose> for Vec<Keypoint> {
    fn from(pose: Pose) -> Self {
        pose.keypoints.into_values().collect()
    }
}
