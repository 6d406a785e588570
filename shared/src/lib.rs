//! Shared types and utilities for Aperture
//!
//! This crate contains the capture data model (targets and decoded domain
//! events) and the wire protocol spoken between the capture client and a
//! remote capture service.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{events::*, target::*};
