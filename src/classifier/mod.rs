pub mod facing;
pub mod form;
pub mod orient;
pub mod profile;
pub mod squat;

pub use facing::{facing, FacingClassifier, FacingDirection, FacingEstimate};
pub use form::{assess_form, FormFeedback};
pub use orient::{estimate_orientation, OrientationEstimate};
pub use profile::{load_profiles, save_profiles, FacingProfile, ProfileBuilder};
pub use squat::{KneeReading, SquatClassifier, SquatPhase, SquatUpdate};
