use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};
use crate::graph::{DType, Initializer};
use crate::ops::activations::Activation;

/// Default strategy for the initial value of weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializerKind {
    #[default]
    Orthogonal,
    RandomNormal,
}

/// Variant used by `conv2d` / `deconv2d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRegularizer {
    #[default]
    None,
    CosineNorm,
    WeightNorm,
}

/// Variant used by `linear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearType {
    #[default]
    None,
    Cosine,
}

/// Builder configuration, usually loaded from a JSON object such as
///
/// ```json
/// { "dtype": "float32", "initializer": "random_normal", "random_stddev": 0.02,
///   "layer_regularizer": "weight_norm", "trelu_activation": "selu" }
/// ```
///
/// Every field is optional and unrelated keys are ignored, but unknown enum
/// strings are rejected when parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub dtype: DType,
    pub initializer: InitializerKind,
    pub orthogonal_gain: f32,
    pub random_stddev: f32,
    /// Placement hint passed to variable creation and initialization.
    pub device: String,
    pub layer_regularizer: LayerRegularizer,
    pub linear_type: LinearType,
    /// Inner activation of `trelu`; neither parametric nor `crelu`.
    pub trelu_activation: Activation,
    /// Inner activation of `frelu`; same restriction as `trelu_activation`.
    pub frelu_activation: Activation,
    /// Seed for sessions created with `Ops::new_session`.
    pub seed: Option<u64>,
}

impl Default for OpsConfig {
    fn default() -> Self {
        OpsConfig {
            dtype: DType::Float32,
            initializer: InitializerKind::Orthogonal,
            orthogonal_gain: 1.0,
            random_stddev: 0.02,
            device: "/cpu:0".to_string(),
            layer_regularizer: LayerRegularizer::None,
            linear_type: LinearType::None,
            trelu_activation: Activation::Relu,
            frelu_activation: Activation::Relu,
            seed: None,
        }
    }
}

impl OpsConfig {
    pub fn from_json_str(json: &str) -> Result<OpsConfig> {
        let config: OpsConfig =
            serde_json::from_str(json).map_err(|e| OpsError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json(path: &str) -> Result<OpsConfig> {
        let json = std::fs::read_to_string(path)?;
        OpsConfig::from_json_str(&json)
    }

    pub fn save_json(&self, path: &str) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (field, activation) in [
            ("trelu_activation", self.trelu_activation),
            ("frelu_activation", self.frelu_activation),
        ] {
            if activation.is_parametric() || activation.widens() {
                return Err(OpsError::Configuration(format!(
                    "{field} must be a parameter-free, shape-preserving activation, got {}",
                    activation.name()
                )));
            }
        }
        if !(self.random_stddev.is_finite() && self.random_stddev >= 0.0) {
            return Err(OpsError::Configuration(format!(
                "random_stddev must be a non-negative number, got {}",
                self.random_stddev
            )));
        }
        Ok(())
    }

    /// The initializer `get_weight` uses when none is given.
    pub fn weight_initializer(&self) -> Initializer {
        match self.initializer {
            InitializerKind::Orthogonal => Initializer::orthogonal(self.orthogonal_gain),
            InitializerKind::RandomNormal => Initializer::random_normal(self.random_stddev),
        }
    }
}
