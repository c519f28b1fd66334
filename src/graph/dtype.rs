use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{OpsError, Result};

/// Numeric precision tag carried by every tensor and variable.
///
/// Values are always held as `f32` on the CPU; `Float16` tensors are rounded
/// through `half::f16` whenever the session materializes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float32,
    Float16,
}

impl DType {
    pub fn parse(name: &str) -> Result<DType> {
        match name {
            "float32" => Ok(DType::Float32),
            "float16" => Ok(DType::Float16),
            other => Err(OpsError::Configuration(format!("dtype not defined: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float16 => "float16",
        }
    }

    /// Rounds a value to the precision this dtype can represent.
    pub fn round(&self, x: f32) -> f32 {
        match self {
            DType::Float32 => x,
            DType::Float16 => half::f16::from_f32(x).to_f32(),
        }
    }
}

impl Default for DType {
    fn default() -> Self {
        DType::Float32
    }
}

impl FromStr for DType {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<DType> {
        DType::parse(s)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        assert_eq!(DType::parse("float32"), Ok(DType::Float32));
        assert_eq!("float16".parse::<DType>(), Ok(DType::Float16));
    }

    #[test]
    fn rejects_unknown_names() {
        assert!(matches!(DType::parse("int8"), Err(OpsError::Configuration(_))));
    }

    #[test]
    fn float16_rounds() {
        let x = 0.1_f32;
        assert_ne!(DType::Float16.round(x), x);
        assert_eq!(DType::Float32.round(x), x);
    }
}
