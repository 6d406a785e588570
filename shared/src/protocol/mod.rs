//! Wire protocol definitions
//!
//! This module defines the messages exchanged between the capture client and
//! a capture service running next to the target process.

pub mod wire;
