//! Duty control engine modules
//!
//! Contains the duty profile and the smoothing filter.

mod profile;
mod smoother;

pub use profile::{DutyProfile, ProfilePoint};
pub use smoother::Smoother;
