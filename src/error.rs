//! Error types for the pose feature & classification core.

use thiserror::Error;

use crate::pose::JointId;

/// Result type alias for pose operations.
pub type Result<T> = std::result::Result<T, PoseError>;

/// Errors produced by the normalizer, extractors and classifiers.
///
/// Per-frame errors ([`PoseError::is_recoverable`]) degrade the frame to an
/// "unknown" output. Configuration errors are fatal and surface at construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    /// Required joints are missing or below the confidence threshold.
    #[error("insufficient keypoints for {context}: {joints:?}")]
    InsufficientKeypoints {
        context: &'static str,
        joints: Vec<JointId>,
    },

    /// A reference length is too small to divide by.
    #[error("degenerate scale in {context}: {distance} < {epsilon}")]
    DegenerateScale {
        context: &'static str,
        distance: f32,
        epsilon: f32,
    },

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Two feature vectors of different length were compared.
    #[error("feature length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The same joint appeared twice in one pose.
    #[error("duplicate joint in pose: {0:?}")]
    DuplicateJoint(JointId),

    /// Non-finite coordinate or score outside [0, 1].
    #[error("invalid keypoint {joint:?}: {reason}")]
    InvalidKeypoint { joint: JointId, reason: String },
}

impl PoseError {
    pub(crate) fn insufficient(context: &'static str, joints: Vec<JointId>) -> Self {
        Self::InsufficientKeypoints { context, joints }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// フレーム単位で回復可能なエラーか（設定エラーは致命的）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientKeypoints { .. }
                | Self::DegenerateScale { .. }
                | Self::DimensionMismatch { .. }
                | Self::DuplicateJoint(_)
                | Self::InvalidKeypoint { .. }
        )
    }
}
