//! Capture target: the process to profile and its instrumentation set

use crate::types::events::{FunctionId, Pid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Metadata describing one instrumented function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    /// Display name (possibly mangled)
    pub name: String,

    /// Path of the module the function lives in
    #[serde(default)]
    pub module_path: String,

    /// Size of the function body in bytes (0 = unknown)
    #[serde(default)]
    pub size: u64,
}

impl FunctionInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_path: String::new(),
            size: 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("invalid pid {0}")]
    InvalidPid(Pid),

    #[error("instrumentation set is empty")]
    NoFunctions,
}

/// The process to profile and the functions selected for instrumentation.
///
/// Keyed by absolute function address so that iteration order (and the order
/// functions appear in the start request) is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureTarget {
    pub pid: Pid,
    pub functions: BTreeMap<FunctionId, FunctionInfo>,
}

impl CaptureTarget {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            functions: BTreeMap::new(),
        }
    }

    /// Add a function to the instrumentation set
    pub fn with_function(mut self, address: FunctionId, info: FunctionInfo) -> Self {
        self.functions.insert(address, info);
        self
    }

    pub fn function(&self, id: FunctionId) -> Option<&FunctionInfo> {
        self.functions.get(&id)
    }

    /// Check that the target can be captured
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.pid <= 0 {
            return Err(TargetError::InvalidPid(self.pid));
        }
        if self.functions.is_empty() {
            return Err(TargetError::NoFunctions);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_target() {
        let target = CaptureTarget::new(42).with_function(0x1000, FunctionInfo::new("foo"));
        assert!(target.validate().is_ok());
        assert_eq!(target.function(0x1000).map(|f| f.name.as_str()), Some("foo"));
    }

    #[test]
    fn test_empty_instrumentation_set() {
        let target = CaptureTarget::new(42);
        assert_eq!(target.validate(), Err(TargetError::NoFunctions));
    }

    #[test]
    fn test_invalid_pid() {
        let target = CaptureTarget::new(0).with_function(0x1000, FunctionInfo::new("foo"));
        assert_eq!(target.validate(), Err(TargetError::InvalidPid(0)));
    }
}
