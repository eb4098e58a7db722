//! Core types and constants for the Ember engine.
//!
//! This crate provides the foundational pieces shared by every other crate:
//! - Engine-wide error type
//! - Engine identity constants (name, version)

pub mod error;

pub use error::{Error, Result};

/// Engine-wide constants
pub mod constants {
    /// Engine name reported to the graphics driver
    pub const ENGINE_NAME: &str = "Ember";
    /// Engine major version
    pub const ENGINE_VERSION_MAJOR: u32 = 0;
    /// Engine minor version
    pub const ENGINE_VERSION_MINOR: u32 = 1;
    /// Engine patch version
    pub const ENGINE_VERSION_PATCH: u32 = 0;
}
