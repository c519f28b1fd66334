use crate::error::{OpsError, Result};
use crate::graph::{Array, Initializer, ReduceKind, Session, Tensor, UnaryOp, Variable};
use crate::ops::builder::{Ops, WeightNormInit};
use crate::ops::config::{LayerRegularizer, LinearType};

/// Guards the square roots of the cosine-normalized convolution.
const COSINE_CONV_EPSILON: f32 = 1e-4;
/// Guards the norms of the cosine-normalized dense layer.
const COSINE_LINEAR_EPSILON: f32 = 1e-6;
/// Added to the variance when deriving the weight-norm gain.
const WEIGHT_NORM_EPSILON: f32 = 1e-8;
const NORM_EPSILON: f32 = 1e-5;

impl Ops {
    /// SAME-padded 2-D convolution plus bias, or its cosine / weight-norm
    /// variant when `layer_regularizer` selects one.
    pub fn conv2d(
        &mut self,
        net: &Tensor,
        filter_w: usize,
        filter_h: usize,
        stride_w: usize,
        stride_h: usize,
        output_dim: usize,
    ) -> Result<Tensor> {
        match self.config().layer_regularizer {
            LayerRegularizer::CosineNorm => {
                tracing::debug!("conv2d: cosine norm");
                return self.cosine_conv2d(net, filter_w, filter_h, stride_w, stride_h, output_dim);
            }
            LayerRegularizer::WeightNorm => {
                tracing::debug!("conv2d: weight norm");
                return self.weightnorm_conv2d(net, filter_w, filter_h, stride_w, stride_h, output_dim);
            }
            LayerRegularizer::None => {}
        }

        let in_dim = channels("conv2d", net)?;
        self.scoped(|ops| {
            let w = ops.get_weight(&[filter_h, filter_w, in_dim, output_dim], None, None)?;
            let conv = ops.graph.conv2d(net, w.tensor(), (stride_h, stride_w))?;
            let b = ops.get_bias(&[output_dim], 0.0, None)?;
            ops.graph.add(&conv, b.tensor())
        })
    }

    /// Convolution divided by the L2 norms of the filter and of each input
    /// patch, so the response is a cosine similarity.
    pub fn cosine_conv2d(
        &mut self,
        net: &Tensor,
        filter_w: usize,
        filter_h: usize,
        stride_w: usize,
        stride_h: usize,
        output_dim: usize,
    ) -> Result<Tensor> {
        let in_dim = channels("cosine_conv2d", net)?;
        let strides = (stride_h, stride_w);
        self.scoped(|ops| {
            let w = ops.get_weight(&[filter_h, filter_w, in_dim, output_dim], None, None)?;
            let b = ops.get_bias(&[output_dim], 0.001, None)?;
            let g = &mut ops.graph;

            let conv = g.conv2d(net, w.tensor(), strides)?;
            let conv = g.add(&conv, b.tensor())?;

            let w_square = g.square(w.tensor());
            let ones = g.ones_like(net);
            let w_sum = g.conv2d(&ones, &w_square, strides)?;
            let w_sum = g.add_scalar(&w_sum, COSINE_CONV_EPSILON)?;
            let w_norm = g.sqrt(&w_sum);

            let net_square = g.square(net);
            let w_ones = g.ones_like(w.tensor());
            let net_sum = g.conv2d(&net_square, &w_ones, strides)?;
            let net_sum = g.add_scalar(&net_sum, COSINE_CONV_EPSILON)?;
            let net_norm = g.sqrt(&net_sum);

            let denom = g.mul(&w_norm, &net_norm)?;
            g.div(&conv, &denom)
        })
    }

    /// Weight-normalized convolution `g * conv(net, V / |V|) + b`.
    ///
    /// `g` starts at 1 and `b` at 0. Call `data_dependent_init` with the
    /// first batch to set them so that batch comes out with zero mean and
    /// unit variance per channel. After that the three parameters are fixed
    /// and later batches are not re-standardized.
    pub fn weightnorm_conv2d(
        &mut self,
        net: &Tensor,
        filter_w: usize,
        filter_h: usize,
        stride_w: usize,
        stride_h: usize,
        output_dim: usize,
    ) -> Result<Tensor> {
        let in_dim = channels("weightnorm_conv2d", net)?;
        self.scoped(|ops| {
            let g = ops.get_weight(&[1, 1, 1, output_dim], Some("g"), Some(Initializer::constant(1.0)))?;
            let b = ops.get_bias(&[output_dim], 0.0, None)?;
            let v = ops.get_weight(&[filter_h, filter_w, in_dim, output_dim], Some("v"), None)?;

            let v_norm = ops.graph.l2_normalize(v.tensor(), &[0, 1, 2])?;
            let x = ops.graph.conv2d(net, &v_norm, (stride_h, stride_w))?;
            ops.weight_norm_output(x, g, b)
        })
    }

    /// Transposed-convolution counterpart of `weightnorm_conv2d`.
    pub fn weightnorm_deconv2d(
        &mut self,
        net: &Tensor,
        filter_w: usize,
        filter_h: usize,
        stride_w: usize,
        stride_h: usize,
        output_dim: usize,
    ) -> Result<Tensor> {
        let [batch, height, width, in_dim] = known_nhwc("weightnorm_deconv2d", net)?;
        let target = [batch, height * stride_h, width * stride_w, output_dim];
        self.scoped(|ops| {
            let g = ops.get_weight(&[1, 1, 1, output_dim], Some("g"), Some(Initializer::constant(1.0)))?;
            let b = ops.get_bias(&[output_dim], 0.0, None)?;
            let v = ops.get_weight(&[filter_h, filter_w, output_dim, in_dim], Some("v"), None)?;

            let v_norm = ops.graph.l2_normalize(v.tensor(), &[0, 1, 2])?;
            let x = ops.graph.conv2d_transpose(net, &v_norm, target, (stride_h, stride_w))?;
            ops.weight_norm_output(x, g, b)
        })
    }

    /// `g * x + b`. A first pass also queues `x` for `data_dependent_init`.
    fn weight_norm_output(&mut self, provisional: Tensor, gain: Variable, bias: Variable) -> Result<Tensor> {
        let scaled = self.graph.mul(gain.tensor(), &provisional)?;
        let out = self.graph.add(&scaled, bias.tensor())?;
        if !self.is_reusing() {
            self.weight_norm_inits.push(WeightNormInit { provisional, gain, bias });
        }
        Ok(out)
    }

    /// Sets the gain and bias of every weight-norm layer built since the
    /// last call from the statistics of one batch: with `m` and `v` the
    /// per-channel mean and variance of `conv(net, V_norm)`,
    /// `g = 1 / sqrt(v + 1e-8)` and `b = -m * g`.
    ///
    /// Layers are processed in construction order, so a layer sees the
    /// already-initialized output of the layers feeding it. Run this after
    /// `initialize_variables`; it does nothing when no layer is waiting.
    pub fn data_dependent_init(&mut self, session: &mut Session, feeds: &[(&Tensor, Array)]) -> Result<()> {
        if self.weight_norm_inits.is_empty() {
            return Ok(());
        }
        for init in &self.weight_norm_inits {
            let x = session.run_one(&self.graph, &init.provisional, feeds)?;
            let (mean, variance) = x.channel_moments();
            let gain: Vec<f32> = variance.iter().map(|v| 1.0 / (v + WEIGHT_NORM_EPSILON).sqrt()).collect();
            let bias: Vec<f32> = mean.iter().zip(&gain).map(|(m, g)| -m * g).collect();
            session.assign(&self.graph, &init.gain, Array::from_vec(&[1, 1, 1, gain.len()], gain)?)?;
            session.assign(&self.graph, &init.bias, Array::from_vec(&[bias.len()], bias)?)?;
        }
        tracing::info!(layers = self.weight_norm_inits.len(), "weight norm initialized from batch");
        self.weight_norm_inits.clear();
        Ok(())
    }

    /// Transposed convolution to `[batch, h * stride_h, w * stride_w, output_dim]`.
    /// The input's static shape must be fully known.
    pub fn deconv2d(
        &mut self,
        net: &Tensor,
        filter_w: usize,
        filter_h: usize,
        stride_w: usize,
        stride_h: usize,
        output_dim: usize,
    ) -> Result<Tensor> {
        let [batch, height, width, in_dim] = known_nhwc("deconv2d", net)?;
        if self.config().layer_regularizer == LayerRegularizer::WeightNorm {
            tracing::debug!("deconv2d: weight norm");
            return self.weightnorm_deconv2d(net, filter_w, filter_h, stride_w, stride_h, output_dim);
        }
        let output_shape = [batch, height * stride_h, width * stride_w, output_dim];
        self.scoped(|ops| {
            // filter: [height, width, output_channels, in_channels]
            let w = ops.get_weight(&[filter_h, filter_w, output_dim, in_dim], None, None)?;
            let deconv = ops.graph.conv2d_transpose(net, w.tensor(), output_shape, (stride_h, stride_w))?;
            let b = ops.get_bias(&[output_dim], 0.0, None)?;
            ops.graph.add(&deconv, b.tensor())
        })
    }

    /// Dense layer `net · w + b`, or `cosine_linear` when configured.
    pub fn linear(&mut self, net: &Tensor, output_dim: usize) -> Result<Tensor> {
        if self.config().linear_type == LinearType::Cosine {
            return self.cosine_linear(net, output_dim);
        }
        let in_dim = features("linear", net)?;
        self.scoped(|ops| {
            let w = ops.get_weight(&[in_dim, output_dim], None, None)?;
            let b = ops.get_bias(&[output_dim], 0.0, None)?;
            let product = ops.graph.matmul(net, w.tensor())?;
            ops.graph.add(&product, b.tensor())
        })
    }

    pub fn cosine_linear(&mut self, net: &Tensor, output_dim: usize) -> Result<Tensor> {
        let in_dim = features("cosine_linear", net)?;
        self.scoped(|ops| {
            let w = ops.get_weight(&[in_dim, output_dim], Some("cos_w"), None)?;
            let b = ops.get_bias(&[output_dim], 0.001, None)?;
            let g = &mut ops.graph;

            let w_square = g.square(w.tensor());
            let w_sum = g.reduce(ReduceKind::Sum, &w_square, Some(&[0]), true)?;
            let b_square = g.square(b.tensor());
            let w_sum = g.add(&w_sum, &b_square)?;
            let w_norm = g.sqrt(&w_sum);
            let w_norm = g.add_scalar(&w_norm, COSINE_LINEAR_EPSILON)?;

            let x_square = g.square(net);
            let x_sum = g.reduce(ReduceKind::Sum, &x_square, Some(&[1]), true)?;
            let x_sum = g.add_scalar(&x_sum, COSINE_LINEAR_EPSILON)?;
            let x_norm = g.sqrt(&x_sum);

            let product = g.matmul(net, w.tensor())?;
            let bias = g.mul_scalar(b.tensor(), 0.001)?;
            let logits = g.add(&product, &bias)?;
            let logits = g.div(&logits, &w_norm)?;
            g.div(&logits, &x_norm)
        })
    }

    /// Normalizes over the batch and spatial axes, with a learned per-channel
    /// scale and offset.
    pub fn batch_norm(&mut self, net: &Tensor) -> Result<Tensor> {
        let axes: Vec<isize> = (0..net.shape().rank().saturating_sub(1) as isize).collect();
        self.normalize("batch_norm", net, &axes)
    }

    /// Normalizes each example over all of its non-batch axes, with a learned
    /// per-channel scale and offset.
    pub fn layer_norm(&mut self, net: &Tensor) -> Result<Tensor> {
        let axes: Vec<isize> = (1..net.shape().rank() as isize).collect();
        self.normalize("layer_norm", net, &axes)
    }

    fn normalize(&mut self, operation: &str, net: &Tensor, axes: &[isize]) -> Result<Tensor> {
        if axes.is_empty() {
            return Err(OpsError::shape_mismatch(operation, "rank 2 or more", net.shape()));
        }
        let channels = channels(operation, net)?;
        self.scoped(|ops| {
            let gamma = ops.get_weight(&[channels], Some("gamma"), Some(Initializer::constant(1.0)))?;
            let beta = ops.get_bias(&[channels], 0.0, Some("beta"))?;
            let g = &mut ops.graph;

            let mean = g.reduce(ReduceKind::Mean, net, Some(axes), true)?;
            let centered = g.sub(net, &mean)?;
            let squared = g.square(&centered);
            let variance = g.reduce(ReduceKind::Mean, &squared, Some(axes), true)?;
            let variance = g.add_scalar(&variance, NORM_EPSILON)?;
            let std = g.sqrt(&variance);
            let normalized = g.div(&centered, &std)?;
            let scaled = g.mul(&normalized, gamma.tensor())?;
            g.add(&scaled, beta.tensor())
        })
    }

    pub fn l1_distance(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let diff = self.graph.sub(a, b)?;
        Ok(self.graph.unary(UnaryOp::Abs, &diff))
    }

    pub fn l2_distance(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let diff = self.graph.sub(a, b)?;
        Ok(self.graph.square(&diff))
    }
}

/// Known size of the last axis.
fn channels(operation: &str, net: &Tensor) -> Result<usize> {
    net.shape()
        .last()
        .ok_or_else(|| OpsError::shape_mismatch(operation, "known channel dimension", net.shape()))
}

/// Known feature size of a rank-2 input.
fn features(operation: &str, net: &Tensor) -> Result<usize> {
    match (net.shape().rank(), net.shape().dim(1)) {
        (2, Some(n)) => Ok(n),
        _ => Err(OpsError::shape_mismatch(operation, "[batch, known features]", net.shape())),
    }
}

fn known_nhwc(operation: &str, net: &Tensor) -> Result<[usize; 4]> {
    match net.shape().to_concrete().as_deref() {
        Some(&[b, h, w, c]) => Ok([b, h, w, c]),
        _ => Err(OpsError::shape_mismatch(operation, "fully known [batch, height, width, channels]", net.shape())),
    }
}
