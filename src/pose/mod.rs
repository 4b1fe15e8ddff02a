pub mod angle;
pub mod keypoint;
pub mod normalize;

pub use angle::{
    angles, angles_strict, joint_angle, limb_angles, AngleSet, JointAngle, JointTriple, Limb,
};
pub use keypoint::{JointId, Keypoint, Pose};
pub use normalize::{normalize, NormalizedPose};
