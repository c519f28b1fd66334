use approx::{assert_abs_diff_eq, assert_relative_eq};
use ferrite_ops::{Array, DType, Initializer, LayerRegularizer, LinearType, Ops, OpsConfig, OpsError, Reduction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_batch(shape: &[usize], seed: u64) -> Array {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = shape.iter().product();
    Array::from_vec(shape, (0..n).map(|_| rng.gen_range(0.5..1.5)).collect()).unwrap()
}

fn with(config: OpsConfig) -> Ops {
    Ops::new(OpsConfig { seed: Some(5), ..config }).unwrap()
}

#[test]
fn conv2d_output_shape_follows_strides() {
    let mut ops = with(OpsConfig::default());
    let x = ops.placeholder(vec![None, Some(8), Some(6), Some(3)]);
    let y = ops.conv2d(&x, 3, 3, 2, 2, 5).unwrap();
    assert_eq!(ops.shape(&y), vec![-1, 4, 3, 5]);
}

fn channel_stats(out: &Array, channels: usize, c: usize) -> (f32, f32) {
    let values: Vec<f32> = out.data.iter().skip(c).step_by(channels).copied().collect();
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
    (mean, var)
}

#[test]
fn weight_norm_standardizes_the_first_batch() {
    let mut ops = with(OpsConfig { layer_regularizer: LayerRegularizer::WeightNorm, ..OpsConfig::default() });
    let x = ops.placeholder(vec![Some(4), Some(5), Some(5), Some(3)]);
    let y = ops.conv2d(&x, 3, 3, 1, 1, 6).unwrap();

    let feeds = [(&x, random_batch(&[4, 5, 5, 3], 1))];
    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    ops.data_dependent_init(&mut session, &feeds).unwrap();
    let out = session.run_one(ops.graph(), &y, &feeds).unwrap();
    assert_eq!(out.shape, vec![4, 5, 5, 6]);

    for c in 0..6 {
        let (mean, var) = channel_stats(&out, 6, c);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
    }
}

#[test]
fn weight_norm_parameters_stay_fixed_after_init() {
    let mut ops = with(OpsConfig { layer_regularizer: LayerRegularizer::WeightNorm, ..OpsConfig::default() });
    let x = ops.placeholder(vec![Some(2), Some(4), Some(4), Some(2)]);
    let y = ops.conv2d(&x, 3, 3, 1, 1, 3).unwrap();

    let batch = random_batch(&[2, 4, 4, 2], 7);
    let scaled = batch.map(|v| v * 10.0);
    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    ops.data_dependent_init(&mut session, &[(&x, batch.clone())]).unwrap();

    let bias = session.value(&ops.biases()[0]).unwrap().data.clone();
    let a = session.run_one(ops.graph(), &y, &[(&x, batch)]).unwrap();
    let b = session.run_one(ops.graph(), &y, &[(&x, scaled)]).unwrap();
    for (i, (p, q)) in a.data.iter().zip(&b.data).enumerate() {
        let offset = bias[i % 3];
        assert_relative_eq!(q - offset, 10.0 * (p - offset), epsilon = 1e-3, max_relative = 1e-4);
    }

    let (_, var) = channel_stats(&b, 3, 0);
    assert!(var > 10.0, "a scaled batch must not be re-standardized, got variance {var}");
}

#[test]
fn weight_norm_init_runs_once_per_layer() {
    let mut ops = with(OpsConfig { layer_regularizer: LayerRegularizer::WeightNorm, ..OpsConfig::default() });
    let x = ops.placeholder(vec![Some(2), Some(4), Some(4), Some(2)]);
    let first = ops.conv2d(&x, 3, 3, 1, 1, 3).unwrap();
    ops.reuse();
    let second = ops.conv2d(&x, 3, 3, 1, 1, 3).unwrap();
    ops.stop_reuse();

    let feeds = [(&x, random_batch(&[2, 4, 4, 2], 8))];
    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    ops.data_dependent_init(&mut session, &feeds).unwrap();
    let gain = session.value(&ops.weights()[0]).unwrap().clone();

    ops.data_dependent_init(&mut session, &[(&x, random_batch(&[2, 4, 4, 2], 9))]).unwrap();
    assert_eq!(session.value(&ops.weights()[0]).unwrap(), &gain);

    let out = session.run(ops.graph(), &[&first, &second], &feeds).unwrap();
    assert_eq!(out[0], out[1]);
}

#[test]
fn weight_norm_registers_gain_bias_and_direction() {
    let mut ops = with(OpsConfig { layer_regularizer: LayerRegularizer::WeightNorm, ..OpsConfig::default() });
    let x = ops.placeholder(vec![Some(2), Some(4), Some(4), Some(3)]);
    let y = ops.deconv2d(&x, 3, 3, 2, 2, 2).unwrap();
    assert_eq!(ops.shape(&y), vec![2, 8, 8, 2]);
    let names: Vec<&str> = ops.weights().iter().map(|w| w.name()).collect();
    assert_eq!(names, vec!["1/g", "1/v"]);
    assert_eq!(ops.biases()[0].name(), "1/b");
}

#[test]
fn cosine_conv2d_ignores_input_scale() {
    let mut ops = with(OpsConfig { layer_regularizer: LayerRegularizer::CosineNorm, ..OpsConfig::default() });
    let x = ops.placeholder(vec![Some(1), Some(4), Some(4), Some(2)]);
    let y = ops.conv2d(&x, 3, 3, 1, 1, 3).unwrap();

    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    let bias = ops.biases()[0].clone();
    session.assign(ops.graph(), &bias, Array::zeros(&[3])).unwrap();

    let batch = random_batch(&[1, 4, 4, 2], 2);
    let scaled = batch.map(|v| v * 3.0);
    let a = session.run_one(ops.graph(), &y, &[(&x, batch)]).unwrap();
    let b = session.run_one(ops.graph(), &y, &[(&x, scaled)]).unwrap();
    for (p, q) in a.data.iter().zip(&b.data) {
        assert_abs_diff_eq!(p, q, epsilon = 1e-3);
    }
}

#[test]
fn cosine_linear_is_bounded_and_scale_invariant() {
    let mut ops = with(OpsConfig { linear_type: LinearType::Cosine, ..OpsConfig::default() });
    let x = ops.placeholder(vec![None, Some(5)]);
    let y = ops.linear(&x, 4).unwrap();
    assert_eq!(ops.weights()[0].name(), "1/cos_w");

    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    let batch = random_batch(&[3, 5], 3);
    let scaled = batch.map(|v| v * 10.0);
    let a = session.run_one(ops.graph(), &y, &[(&x, batch)]).unwrap();
    let b = session.run_one(ops.graph(), &y, &[(&x, scaled)]).unwrap();
    for (p, q) in a.data.iter().zip(&b.data) {
        assert!(p.abs() <= 1.0 + 1e-4);
        assert_abs_diff_eq!(p, q, epsilon = 1e-3);
    }
}

#[test]
fn deconv2d_upsamples_by_stride() {
    let mut ops = with(OpsConfig::default());
    let x = ops.placeholder(vec![Some(2), Some(3), Some(5), Some(4)]);
    let y = ops.deconv2d(&x, 5, 5, 2, 3, 7).unwrap();
    assert_eq!(ops.shape(&y), vec![2, 9, 10, 7]);

    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    let out = session.run_one(ops.graph(), &y, &[(&x, random_batch(&[2, 3, 5, 4], 4))]).unwrap();
    assert_eq!(out.shape, vec![2, 9, 10, 7]);
}

#[test]
fn deconv2d_needs_a_known_shape() {
    let mut ops = with(OpsConfig::default());
    let x = ops.placeholder(vec![None, Some(3), Some(3), Some(4)]);
    assert!(matches!(ops.deconv2d(&x, 3, 3, 2, 2, 2), Err(OpsError::ShapeMismatch { .. })));
    assert!(ops.weights().is_empty());
}

#[test]
fn linear_needs_rank_two() {
    let mut ops = with(OpsConfig::default());
    let x = ops.placeholder(vec![Some(2), Some(3), Some(4)]);
    assert!(matches!(ops.linear(&x, 2), Err(OpsError::ShapeMismatch { .. })));
}

#[test]
fn parametric_activations_keep_the_input_shape() {
    let mut ops = with(OpsConfig { trelu_activation: ferrite_ops::Activation::Selu, ..OpsConfig::default() });
    let x = ops.placeholder(vec![Some(2), Some(3), Some(3), Some(2)]);
    let p = ops.prelu(&x).unwrap();
    let t = ops.trelu(&x).unwrap();
    let f = ops.frelu(&x).unwrap();
    let c = ops.crelu(&x).unwrap();
    assert_eq!(ops.shape(&p), vec![2, 3, 3, 2]);
    assert_eq!(ops.shape(&t), vec![2, 3, 3, 2]);
    assert_eq!(ops.shape(&f), vec![2, 3, 3, 2]);
    assert_eq!(ops.shape(&c), vec![2, 3, 3, 4]);

    let shapes: Vec<Vec<usize>> = ops
        .weights()
        .iter()
        .map(|w| w.shape().to_concrete().unwrap())
        .collect();
    assert_eq!(shapes, vec![vec![18], vec![18], vec![1]]);
}

#[test]
fn prelu_scales_negative_inputs() {
    let mut ops = with(OpsConfig::default());
    let x = ops.placeholder(vec![Some(1), Some(2)]);
    let y = ops.prelu(&x).unwrap();
    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    let alphas = ops.weights()[0].clone();
    session
        .assign(ops.graph(), &alphas, Array::from_vec(&[2], vec![0.25, 0.5]).unwrap())
        .unwrap();
    let out = session
        .run_one(ops.graph(), &y, &[(&x, Array::from_vec(&[1, 2], vec![-4.0, 3.0]).unwrap())])
        .unwrap();
    assert_abs_diff_eq!(out.data[0], -1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(out.data[1], 3.0, epsilon = 1e-6);
}

#[test]
fn batch_norm_centres_each_channel() {
    let mut ops = with(OpsConfig::default());
    let x = ops.placeholder(vec![Some(3), Some(2), Some(2), Some(2)]);
    let y = ops.batch_norm(&x).unwrap();
    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    let out = session.run_one(ops.graph(), &y, &[(&x, random_batch(&[3, 2, 2, 2], 6))]).unwrap();
    for c in 0..2 {
        let values: Vec<f32> = out.data.iter().skip(c).step_by(2).copied().collect();
        assert_abs_diff_eq!(values.iter().sum::<f32>() / values.len() as f32, 0.0, epsilon = 1e-4);
    }
}

#[test]
fn squash_with_linear_reduction_yields_a_scalar() {
    let mut ops = with(OpsConfig::default());
    let row = ops.placeholder(vec![Some(1), Some(3)]);
    let reduction = ops.reduce_linear();
    let s = ops.squash(&row, reduction).unwrap();
    assert_eq!(s.shape().rank(), 0);

    let x = ops.placeholder(vec![Some(4), Some(3)]);
    let m = ops.squash(&x, Reduction::Mean).unwrap();
    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    let batch = Array::full(&[4, 3], 2.0);
    let out = session.run_one(ops.graph(), &m, &[(&x, batch)]).unwrap();
    assert_abs_diff_eq!(out.data[0], 2.0, epsilon = 1e-6);
}

#[test]
fn float16_builder_rounds_parameters() {
    let mut ops = Ops::with_dtype("float16").unwrap();
    let b = ops.get_bias(&[1], 0.1, None).unwrap();
    assert_eq!(b.tensor().dtype(), DType::Float16);
    let mut session = ops.new_session();
    ops.initialize_variables(&mut session).unwrap();
    let stored = session.value(&b).unwrap().data[0];
    assert_eq!(stored, half::f16::from_f32(0.1).to_f32());
}

#[test]
fn orthogonal_initializer_has_orthonormal_columns() {
    let gain = 1.5;
    let mut rng = StdRng::seed_from_u64(9);
    let w = Initializer::orthogonal(gain).sample(&[2, 3, 5], DType::Float32, &mut rng).unwrap();
    let (rows, cols) = (6, 5);
    for i in 0..cols {
        for j in 0..cols {
            let dot: f32 = (0..rows).map(|r| w.data[r * cols + i] * w.data[r * cols + j]).sum();
            let expected = if i == j { gain * gain } else { 0.0 };
            assert_abs_diff_eq!(dot, expected, epsilon = 1e-4);
        }
    }
}

#[test]
fn resize_images_changes_spatial_dims() {
    let mut ops = with(OpsConfig::default());
    let x = ops.placeholder(vec![Some(1), Some(2), Some(2), Some(1)]);
    let y = ops.resize_images(&x, (4, 4), ferrite_ops::ResizeMethod::NearestNeighbor).unwrap();
    assert_eq!(ops.shape(&y), vec![1, 4, 4, 1]);
    let session = ops.new_session();
    let out = session
        .run_one(ops.graph(), &y, &[(&x, Array::from_vec(&[1, 2, 2, 1], vec![0., 1., 2., 3.]).unwrap())])
        .unwrap();
    assert_abs_diff_eq!(out.data[0], 0.0, epsilon = 1e-4);
    assert_abs_diff_eq!(out.data[15], 3.0, epsilon = 1e-4);
}
