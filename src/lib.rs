pub mod analysis;
pub mod classifier;
pub mod config;
pub mod error;
pub mod frame;
pub mod pose;
pub mod session;

pub use error::{PoseError, Result};
