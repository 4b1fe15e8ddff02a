//! スクワット中のフォーム判定
//!
//! 上から順に規則を調べ、最初に破られたものを返す。

use serde::Serialize;

use crate::config::FormConfig;
use crate::error::Result;
use crate::pose::{AngleSet, JointAngle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormFeedback {
    Good,
    /// 肘が曲がっている
    ArmsNotStraight,
    /// 腕の上げ方が範囲外
    ArmPosition,
    /// 腰が十分に下がっていない
    HipsTooHigh,
    /// 左右の膝の曲がり方が揃っていない
    KneesUneven,
    /// 深すぎる
    TooDeep,
}

impl FormFeedback {
    pub fn is_good(&self) -> bool {
        matches!(self, FormFeedback::Good)
    }

    pub fn message(&self) -> &'static str {
        match self {
            FormFeedback::Good => "Good squat form!",
            FormFeedback::ArmsNotStraight => "Keep your arms straighter",
            FormFeedback::ArmPosition => "Adjust your arm position",
            FormFeedback::HipsTooHigh => "Lower your hips more",
            FormFeedback::KneesUneven => "Keep your knees aligned",
            FormFeedback::TooDeep => "Don't go too low, protect your knees",
        }
    }
}

/// 8つの関節角すべてが必要。欠けていれば InsufficientKeypoints
pub fn assess_form(angles: &AngleSet, config: &FormConfig) -> Result<FormFeedback> {
    let left_elbow = angles.require(JointAngle::LeftElbow)?;
    let right_elbow = angles.require(JointAngle::RightElbow)?;
    let left_shoulder = angles.require(JointAngle::LeftShoulder)?;
    let right_shoulder = angles.require(JointAngle::RightShoulder)?;
    let left_hip = angles.require(JointAngle::LeftHip)?;
    let right_hip = angles.require(JointAngle::RightHip)?;
    let left_knee = angles.require(JointAngle::LeftKnee)?;
    let right_knee = angles.require(JointAngle::RightKnee)?;

    if left_elbow <= config.min_elbow || right_elbow <= config.min_elbow {
        return Ok(FormFeedback::ArmsNotStraight);
    }
    let shoulder_ok = |a: f32| a > config.min_shoulder && a < config.max_shoulder;
    if !shoulder_ok(left_shoulder) || !shoulder_ok(right_shoulder) {
        return Ok(FormFeedback::ArmPosition);
    }
    if left_hip >= config.max_hip || right_hip >= config.max_hip {
        return Ok(FormFeedback::HipsTooHigh);
    }
    if (left_knee - right_knee).abs() > config.max_knee_asymmetry {
        return Ok(FormFeedback::KneesUneven);
    }
    if left_knee < config.min_knee || right_knee < config.min_knee {
        return Ok(FormFeedback::TooDeep);
    }
    Ok(FormFeedback::Good)
}
