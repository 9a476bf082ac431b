//! Test support for the vkray crates.
//!
//! [`MockDevice`] stands in for a GPU; [`fixtures`] builds the geometry and
//! shader inputs the tests feed it.

pub mod fixtures;
pub mod mock;

pub use mock::{Call, MockDevice, RecordedBuild, RecordedWrite};
