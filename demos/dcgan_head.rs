use ferrite_ops::{Array, Operand, Ops, OpsConfig, OpsError, Resolved, Result};
use serde_json::json;

/// Generator head driven by a JSON config: the activation names are resolved
/// through `Ops::lookup` the same way a model description would be.
fn main() -> Result<()> {
    let config = OpsConfig::from_json_str(
        r#"{"initializer": "random_normal", "random_stddev": 0.02,
            "layer_regularizer": "weight_norm", "seed": 11}"#,
    )?;
    let mut ops = Ops::new(config)?;
    ops.describe("generator");

    let layers = ops.lookup(&json!({ "activation": "prelu", "final": "tanh" }))?;
    let Resolved::Map(layers) = layers else {
        return Err(OpsError::Configuration("layer table must be an object".to_string()));
    };

    let z = ops.placeholder(vec![Some(4), Some(16)]);
    let net = ops.linear(&z, 4 * 4 * 8)?;
    let net = ops.reshape(&net, &[4, 4, 4, 8])?;
    let net = layers["activation"].apply(&mut ops, &[Operand::from(net)])?;
    let net = ops.deconv2d(&net, 5, 5, 2, 2, 4)?;
    let net = ops.batch_norm(&net)?;
    let net = layers["activation"].apply(&mut ops, &[Operand::from(net)])?;
    let net = ops.deconv2d(&net, 5, 5, 2, 2, 3)?;
    let image = layers["final"].apply(&mut ops, &[Operand::from(net)])?;

    let noise = Array::from_vec(&[4, 16], (0..64).map(|i| ((i * 37) % 17) as f32 / 8.5 - 1.0).collect())?;
    let feeds = [(&z, noise)];

    let mut session = ops.new_session();
    ops.initialize_variables(&mut session)?;
    ops.data_dependent_init(&mut session, &feeds)?;

    let out = session.run_one(ops.graph(), &image, &feeds)?;
    println!("generated {:?}, mean {:.4}", out.shape, out.mean());
    for var in ops.variables() {
        println!("  {:<24} {}", var.name(), var.shape());
    }
    Ok(())
}
