use ferrite_ops::ops::InitializerKind;
use ferrite_ops::{Activation, DType, Initializer, LayerRegularizer, Ops, OpsConfig, OpsError};

#[test]
fn partial_json_fills_defaults() {
    let config = OpsConfig::from_json_str(
        r#"{ "dtype": "float16", "layer_regularizer": "cosine_norm", "discriminator": { "layers": 4 } }"#,
    )
    .unwrap();
    assert_eq!(config.dtype, DType::Float16);
    assert_eq!(config.layer_regularizer, LayerRegularizer::CosineNorm);
    assert_eq!(config.initializer, InitializerKind::Orthogonal);
    assert_eq!(config.device, "/cpu:0");
}

#[test]
fn parametric_inner_activation_is_rejected() {
    let config = OpsConfig { frelu_activation: Activation::Prelu, ..OpsConfig::default() };
    assert!(matches!(Ops::new(config), Err(OpsError::Configuration(_))));
}

#[test]
fn widening_inner_activation_is_rejected() {
    let trelu = OpsConfig { trelu_activation: Activation::Crelu, ..OpsConfig::default() };
    assert!(matches!(Ops::new(trelu), Err(OpsError::Configuration(_))));
    assert!(matches!(
        OpsConfig::from_json_str(r#"{ "frelu_activation": "crelu" }"#),
        Err(OpsError::Configuration(_))
    ));
}

#[test]
fn initializer_follows_configuration() {
    let config = OpsConfig {
        initializer: InitializerKind::RandomNormal,
        random_stddev: 0.05,
        ..OpsConfig::default()
    };
    assert_eq!(config.weight_initializer(), Initializer::random_normal(0.05));

    let config = OpsConfig { orthogonal_gain: 2.0, ..OpsConfig::default() };
    assert_eq!(config.weight_initializer(), Initializer::orthogonal(2.0));
}

#[test]
fn config_file_round_trips() {
    let config = OpsConfig { seed: Some(3), trelu_activation: Activation::Selu, ..OpsConfig::default() };
    let path = std::env::temp_dir().join("ferrite_ops_config_round_trip.json");
    let path = path.to_string_lossy().to_string();
    config.save_json(&path).unwrap();
    assert_eq!(OpsConfig::load_json(&path).unwrap(), config);
    std::fs::remove_file(&path).ok();
}

#[test]
fn missing_config_file_is_an_io_error() {
    assert!(matches!(
        OpsConfig::load_json("/nonexistent/ferrite_ops.json"),
        Err(OpsError::Io(_))
    ));
}
