//! CPU kernels evaluated by `Session`. Inputs have already passed the
//! graph's static shape checks; these re-check only what depends on the
//! concrete values fed at run time.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};

use crate::error::{OpsError, Result};
use crate::graph::array::{strides_of, Array};
use crate::graph::graph::{BinaryOp, ReduceKind, ResizeMethod, UnaryOp};

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;

pub fn unary(op: UnaryOp, x: &Array) -> Array {
    match op {
        UnaryOp::Square => x.map(|v| v * v),
        UnaryOp::Sqrt => x.map(f32::sqrt),
        UnaryOp::Abs => x.map(f32::abs),
        UnaryOp::Neg => x.map(|v| -v),
        UnaryOp::Relu => x.map(|v| v.max(0.0)),
        UnaryOp::Tanh => x.map(f32::tanh),
        UnaryOp::Sigmoid => x.map(|v| 1.0 / (1.0 + (-v).exp())),
        UnaryOp::Exp => x.map(f32::exp),
        UnaryOp::Selu => x.map(|v| {
            if v > 0.0 { SELU_SCALE * v } else { SELU_SCALE * SELU_ALPHA * (v.exp() - 1.0) }
        }),
        UnaryOp::LeakyRelu(leak) => x.map(|v| v.max(leak * v)),
    }
}

pub fn binary(op: BinaryOp, a: &Array, b: &Array) -> Result<Array> {
    match op {
        BinaryOp::Add => a.zip_with(b, |x, y| x + y),
        BinaryOp::Sub => a.zip_with(b, |x, y| x - y),
        BinaryOp::Mul => a.zip_with(b, |x, y| x * y),
        BinaryOp::Div => a.zip_with(b, |x, y| x / y),
        BinaryOp::Maximum => a.zip_with(b, f32::max),
    }
}

pub fn matmul(a: &Array, b: &Array) -> Result<Array> {
    let (m, k) = (a.shape[0], a.shape[1]);
    let n = b.shape[1];
    if b.shape[0] != k {
        return Err(OpsError::shape_mismatch("matmul", k, b.shape[0]));
    }
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let lhs = a.data[i * k + p];
            for j in 0..n {
                out[i * n + j] += lhs * b.data[p * n + j];
            }
        }
    }
    Array::from_vec(&[m, n], out)
}

/// Leading padding for SAME convolution along one spatial axis.
fn same_padding(input: usize, output: usize, kernel: usize, stride: usize) -> usize {
    ((output.saturating_sub(1)) * stride + kernel).saturating_sub(input) / 2
}

pub fn conv2d(x: &Array, w: &Array, strides: (usize, usize)) -> Result<Array> {
    let [n, h, wd, c] = dims4("conv2d", x)?;
    let [kh, kw, ci, co] = dims4("conv2d", w)?;
    if ci != c {
        return Err(OpsError::shape_mismatch("conv2d", ci, c));
    }
    let (sh, sw) = strides;
    let (oh, ow) = (h.div_ceil(sh), wd.div_ceil(sw));
    let (pt, pl) = (same_padding(h, oh, kh, sh), same_padding(wd, ow, kw, sw));

    let mut out = vec![0.0; n * oh * ow * co];
    for b in 0..n {
        for y in 0..oh {
            for xo in 0..ow {
                let base = ((b * oh + y) * ow + xo) * co;
                for ky in 0..kh {
                    let Some(iy) = (y * sh + ky).checked_sub(pt).filter(|&v| v < h) else { continue };
                    for kx in 0..kw {
                        let Some(ix) = (xo * sw + kx).checked_sub(pl).filter(|&v| v < wd) else { continue };
                        let in_base = ((b * h + iy) * wd + ix) * c;
                        let w_base = (ky * kw + kx) * ci * co;
                        for ch in 0..c {
                            let v = x.data[in_base + ch];
                            let row = &w.data[w_base + ch * co..w_base + (ch + 1) * co];
                            for (acc, wv) in out[base..base + co].iter_mut().zip(row) {
                                *acc += v * wv;
                            }
                        }
                    }
                }
            }
        }
    }
    Array::from_vec(&[n, oh, ow, co], out)
}

/// Gradient of a SAME `conv2d` with respect to its input; `w` is HWOI.
pub fn conv2d_transpose(
    x: &Array,
    w: &Array,
    output_shape: [usize; 4],
    strides: (usize, usize),
) -> Result<Array> {
    let [n, h, wd, c] = dims4("conv2d_transpose", x)?;
    let [kh, kw, co, ci] = dims4("conv2d_transpose", w)?;
    let [on, oh, ow, oc] = output_shape;
    if ci != c || co != oc || on != n {
        return Err(OpsError::shape_mismatch(
            "conv2d_transpose",
            format!("input {:?} and filter {:?} consistent with {output_shape:?}", x.shape, w.shape),
            "inconsistent operands",
        ));
    }
    let (sh, sw) = strides;
    let (pt, pl) = (same_padding(oh, h, kh, sh), same_padding(ow, wd, kw, sw));

    let mut out = vec![0.0; n * oh * ow * oc];
    for b in 0..n {
        for y in 0..h {
            for xi in 0..wd {
                let in_base = ((b * h + y) * wd + xi) * c;
                for ky in 0..kh {
                    let Some(oy) = (y * sh + ky).checked_sub(pt).filter(|&v| v < oh) else { continue };
                    for kx in 0..kw {
                        let Some(ox) = (xi * sw + kx).checked_sub(pl).filter(|&v| v < ow) else { continue };
                        let out_base = ((b * oh + oy) * ow + ox) * oc;
                        let w_base = (ky * kw + kx) * co * ci;
                        for o in 0..oc {
                            let row = &w.data[w_base + o * ci..w_base + (o + 1) * ci];
                            let dot: f32 = x.data[in_base..in_base + c].iter().zip(row).map(|(a, b)| a * b).sum();
                            out[out_base + o] += dot;
                        }
                    }
                }
            }
        }
    }
    Array::from_vec(&output_shape, out)
}

pub fn reduce(kind: ReduceKind, x: &Array, axes: &[usize], keep_dims: bool) -> Array {
    let kept_shape: Vec<usize> = x
        .shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect();
    let out_strides = strides_of(&kept_shape);
    let in_strides = x.strides();
    let out_len: usize = kept_shape.iter().product();

    let mut groups: Vec<Vec<f32>> = vec![Vec::new(); out_len];
    for (flat, &v) in x.data.iter().enumerate() {
        let mut target = 0;
        for axis in 0..x.shape.len() {
            let coord = (flat / in_strides[axis]) % x.shape[axis];
            if !axes.contains(&axis) {
                target += coord * out_strides[axis];
            }
        }
        groups[target].push(v);
    }

    let data = groups.iter().map(|g| reduce_group(kind, g)).collect();
    let shape = if keep_dims {
        kept_shape
    } else {
        x.shape.iter().enumerate().filter(|(i, _)| !axes.contains(i)).map(|(_, &d)| d).collect()
    };
    Array { shape, data }
}

fn reduce_group(kind: ReduceKind, values: &[f32]) -> f32 {
    match kind {
        ReduceKind::Sum => values.iter().sum(),
        ReduceKind::Mean => {
            if values.is_empty() { f32::NAN } else { values.iter().sum::<f32>() / values.len() as f32 }
        }
        ReduceKind::Min => values.iter().copied().fold(f32::INFINITY, f32::min),
        ReduceKind::Max => values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        ReduceKind::LogSumExp => {
            let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if !max.is_finite() {
                return max;
            }
            max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
        }
    }
}

pub fn reshape(x: &Array, target: &[i64]) -> Result<Array> {
    let known: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    let shape: Vec<usize> = target
        .iter()
        .map(|&d| if d == -1 { if known == 0 { 0 } else { x.len() / known } } else { d as usize })
        .collect();
    x.reshaped(&shape)
}

pub fn slice(x: &Array, begin: &[usize], size: &[i64]) -> Result<Array> {
    let extent: Vec<usize> = x
        .shape
        .iter()
        .zip(begin.iter().zip(size))
        .map(|(&d, (&b, &s))| if s < 0 { d.saturating_sub(b) } else { s as usize })
        .collect();
    for (axis, ((&d, &b), &e)) in x.shape.iter().zip(begin).zip(&extent).enumerate() {
        if b + e > d {
            return Err(OpsError::shape_mismatch("slice", format!("begin + size <= {d} on axis {axis}"), b + e));
        }
    }
    let in_strides = x.strides();
    let out_strides = strides_of(&extent);
    let total: usize = extent.iter().product();
    let data = (0..total)
        .map(|flat| {
            let src: usize = (0..extent.len())
                .map(|axis| ((flat / out_strides[axis]) % extent[axis] + begin[axis]) * in_strides[axis])
                .sum();
            x.data[src]
        })
        .collect();
    Array::from_vec(&extent, data)
}

pub fn concat(values: &[&Array], axis: usize) -> Result<Array> {
    let first = values[0];
    let mut shape = first.shape.clone();
    shape[axis] = values.iter().map(|a| a.shape[axis]).sum();
    for a in values {
        let same_elsewhere = a.shape.len() == first.shape.len()
            && a.shape.iter().zip(&first.shape).enumerate().all(|(i, (x, y))| i == axis || x == y);
        if !same_elsewhere {
            return Err(OpsError::shape_mismatch("concat", format!("{:?}", first.shape), format!("{:?}", a.shape)));
        }
    }
    let outer: usize = shape[..axis].iter().product();
    let mut data = Vec::with_capacity(shape.iter().product());
    for o in 0..outer {
        for a in values {
            let chunk: usize = a.shape[axis..].iter().product();
            data.extend_from_slice(&a.data[o * chunk..(o + 1) * chunk]);
        }
    }
    Array::from_vec(&shape, data)
}

pub fn squeeze(x: &Array, axes: &[usize]) -> Result<Array> {
    if axes.iter().any(|&a| x.shape.get(a) != Some(&1)) {
        return Err(OpsError::shape_mismatch("squeeze", format!("size 1 on axes {axes:?}"), format!("{:?}", x.shape)));
    }
    let shape: Vec<usize> = x.shape.iter().enumerate().filter(|(i, _)| !axes.contains(i)).map(|(_, &d)| d).collect();
    x.reshaped(&shape)
}

/// Resizes every (batch, channel) plane of an NHWC array with `image`'s
/// resampler. Planes are mapped into [0, 1] around the call because the
/// resampler clamps float pixels to that range.
pub fn resize_images(x: &Array, height: usize, width: usize, method: ResizeMethod) -> Result<Array> {
    let [n, h, w, c] = dims4("resize_images", x)?;
    let filter = match method {
        ResizeMethod::Bilinear => FilterType::Triangle,
        ResizeMethod::NearestNeighbor => FilterType::Nearest,
        ResizeMethod::Bicubic => FilterType::CatmullRom,
    };
    let mut out = vec![0.0; n * height * width * c];
    for b in 0..n {
        for ch in 0..c {
            let plane: Vec<f32> = (0..h * w).map(|p| x.data[(b * h * w + p) * c + ch]).collect();
            let lo = plane.iter().copied().fold(f32::INFINITY, f32::min);
            let hi = plane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let range = hi - lo;

            let resized: Vec<f32> = if range > 0.0 {
                let unit: Vec<f32> = plane.iter().map(|v| (v - lo) / range).collect();
                let img: ImageBuffer<Luma<f32>, Vec<f32>> =
                    ImageBuffer::from_raw(w as u32, h as u32, unit).ok_or_else(|| {
                        OpsError::backend("resize_images", "plane does not match its dimensions")
                    })?;
                imageops::resize(&img, width as u32, height as u32, filter)
                    .into_raw()
                    .into_iter()
                    .map(|v| v * range + lo)
                    .collect()
            } else {
                vec![lo; height * width]
            };

            for (p, v) in resized.into_iter().enumerate() {
                out[(b * height * width + p) * c + ch] = v;
            }
        }
    }
    Array::from_vec(&[n, height, width, c], out)
}

fn dims4(operation: &str, x: &Array) -> Result<[usize; 4]> {
    match x.shape.as_slice() {
        &[a, b, c, d] => Ok([a, b, c, d]),
        other => Err(OpsError::shape_mismatch(operation, "rank 4", format!("{other:?}"))),
    }
}
