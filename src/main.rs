// Builds a small discriminator twice (the second pass reusing the first
// pass's parameters), initializes it, and prints what was registered.
//
//   cargo run -- [config.json]
use ferrite_ops::{Array, Ops, OpsConfig, Result};
use rand::Rng;

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => OpsConfig::load_json(&path)?,
        None => OpsConfig { seed: Some(7), ..OpsConfig::default() },
    };
    let mut ops = Ops::new(config)?;
    ops.describe("discriminator");

    let real = ops.placeholder(vec![Some(2), Some(8), Some(8), Some(3)]);
    let fake = ops.placeholder(vec![Some(2), Some(8), Some(8), Some(3)]);

    let d_real = discriminator(&mut ops, &real)?;
    ops.reuse();
    let d_fake = discriminator(&mut ops, &fake)?;
    ops.stop_reuse();

    println!("ferrite-ops: {} parameters registered", ops.variables().len());
    for var in ops.variables() {
        println!("  {:<28} {}", var.name(), var.shape());
    }

    let mut rng = rand::thread_rng();
    let mut batch = || {
        let data = (0..2 * 8 * 8 * 3).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
        Array::from_vec(&[2, 8, 8, 3], data)
    };
    let feeds = [(&real, batch()?), (&fake, batch()?)];

    let mut session = ops.new_session();
    ops.initialize_variables(&mut session)?;
    ops.data_dependent_init(&mut session, &feeds)?;

    let out = session.run(ops.graph(), &[&d_real, &d_fake], &feeds)?;
    println!("D(real) = {:?}", out[0].data);
    println!("D(fake) = {:?}", out[1].data);
    Ok(())
}

fn discriminator(ops: &mut Ops, x: &ferrite_ops::Tensor) -> Result<ferrite_ops::Tensor> {
    let net = ops.conv2d(x, 3, 3, 2, 2, 8)?;
    let net = ops.lrelu(&net);
    let net = ops.conv2d(&net, 3, 3, 2, 2, 16)?;
    let net = ops.lrelu(&net);
    let net = ops.reshape(&net, &[2, -1])?;
    ops.linear(&net, 1)
}
