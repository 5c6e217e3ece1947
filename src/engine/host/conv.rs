use super::{load, store};
use crate::{
    engine::{ConvDesc, ExecArgs, PrimitiveDesc, Propagation, Role},
    error::KernelError,
};
use ndarray::{Array1, Array4, ArrayView4, Axis, Ix1, Ix4, Zip};

/// Output size of a strided window over a padded input.
pub(super) fn output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    pad_l: usize,
    pad_r: usize,
) -> Option<usize> {
    if stride == 0 || kernel == 0 {
        return None;
    }
    let padded = input.checked_add(pad_l)?.checked_add(pad_r)?;
    Some(padded.checked_sub(kernel)? / stride + 1)
}

/// Input position of output `o` and kernel offset `k`, if it is not padding.
fn input_index(o: usize, k: usize, stride: usize, pad: usize, input: usize) -> Option<usize> {
    (o * stride + k).checked_sub(pad).filter(|i| *i < input)
}

/// Output position covering input `i` with kernel offset `k`, if any.
fn output_index(i: usize, k: usize, stride: usize, pad: usize, output: usize) -> Option<usize> {
    let t = (i + pad).checked_sub(k)?;
    if t % stride == 0 && t / stride < output {
        Some(t / stride)
    } else {
        None
    }
}

pub(super) fn check(desc: &ConvDesc, deconv: bool) -> Result<(), KernelError> {
    let ConvDesc {
        src,
        weights,
        dst,
        strides,
        padding_l,
        padding_r,
        ..
    } = desc;
    let unsupported = |reason: &str| {
        Err(KernelError::Unsupported(format!(
            "{} {reason}: {desc:?}",
            if deconv {
                "deconvolution"
            } else {
                "convolution"
            }
        )))
    };
    if src.iter().chain(weights).chain(dst).any(|d| *d == 0) {
        return unsupported("with zero sized dims");
    }
    if src[0] != dst[0] {
        return unsupported("batch mismatch");
    }
    let (src_channels, dst_channels) = if deconv {
        (weights[0], weights[1])
    } else {
        (weights[1], weights[0])
    };
    if src[1] != src_channels || dst[1] != dst_channels {
        return unsupported("channel mismatch");
    }
    for i in 0..2 {
        // deconvolution is checked as the convolution from dst to src
        let (input, output) = if deconv {
            (dst[2 + i], src[2 + i])
        } else {
            (src[2 + i], dst[2 + i])
        };
        if output_size(input, weights[2 + i], strides[i], padding_l[i], padding_r[i])
            != Some(output)
        {
            return unsupported("output size mismatch");
        }
    }
    Ok(())
}

fn forward(
    x: ArrayView4<f32>,
    w: ArrayView4<f32>,
    desc: &ConvDesc,
    dst: [usize; 4],
) -> Array4<f32> {
    let (kh, kw) = (w.dim().2, w.dim().3);
    let (ih, iw) = (x.dim().2, x.dim().3);
    let [sy, sx] = desc.strides;
    let [py, px] = desc.padding_l;
    let mut y = Array4::zeros(dst);
    Zip::indexed(&mut y).par_for_each(|(n, o, oh, ow), y| {
        let mut acc = 0f32;
        for i in 0..x.dim().1 {
            for ky in 0..kh {
                let Some(h) = input_index(oh, ky, sy, py, ih) else {
                    continue;
                };
                for kx in 0..kw {
                    if let Some(w_) = input_index(ow, kx, sx, px, iw) {
                        acc += x[[n, i, h, w_]] * w[[o, i, ky, kx]];
                    }
                }
            }
        }
        *y = acc;
    });
    y
}

fn backward_data(
    dy: ArrayView4<f32>,
    w: ArrayView4<f32>,
    desc: &ConvDesc,
    src: [usize; 4],
) -> Array4<f32> {
    let (kh, kw) = (w.dim().2, w.dim().3);
    let (oh, ow) = (dy.dim().2, dy.dim().3);
    let [sy, sx] = desc.strides;
    let [py, px] = desc.padding_l;
    let mut dx = Array4::zeros(src);
    Zip::indexed(&mut dx).par_for_each(|(n, i, h, w_), dx| {
        let mut acc = 0f32;
        for o in 0..dy.dim().1 {
            for ky in 0..kh {
                let Some(y) = output_index(h, ky, sy, py, oh) else {
                    continue;
                };
                for kx in 0..kw {
                    if let Some(x) = output_index(w_, kx, sx, px, ow) {
                        acc += dy[[n, o, y, x]] * w[[o, i, ky, kx]];
                    }
                }
            }
        }
        *dx = acc;
    });
    dx
}

fn backward_weights(
    x: ArrayView4<f32>,
    dy: ArrayView4<f32>,
    desc: &ConvDesc,
    weights: [usize; 4],
) -> Array4<f32> {
    let (ih, iw) = (x.dim().2, x.dim().3);
    let (oh, ow) = (dy.dim().2, dy.dim().3);
    let [sy, sx] = desc.strides;
    let [py, px] = desc.padding_l;
    let mut dw = Array4::zeros(weights);
    Zip::indexed(&mut dw).par_for_each(|(o, i, ky, kx), dw| {
        let mut acc = 0f32;
        for n in 0..x.dim().0 {
            for y in 0..oh {
                let Some(h) = input_index(y, ky, sy, py, ih) else {
                    continue;
                };
                for x_ in 0..ow {
                    if let Some(w_) = input_index(x_, kx, sx, px, iw) {
                        acc += dy[[n, o, y, x_]] * x[[n, i, h, w_]];
                    }
                }
            }
        }
        *dw = acc;
    });
    dw
}

fn add_bias(y: &mut Array4<f32>, b: &[f32]) {
    for (mut y, b) in y.axis_iter_mut(Axis(1)).zip(b) {
        y += *b;
    }
}

fn bias_grad(dy: ArrayView4<f32>) -> Array1<f32> {
    dy.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0))
}

pub(super) fn convolution(
    pd: &PrimitiveDesc,
    prop: Propagation,
    desc: &ConvDesc,
    mut args: ExecArgs,
) -> Result<(), KernelError> {
    match prop {
        Propagation::Forward => {
            let x = load::<Ix4>(pd, &args, Role::Src)?;
            let w = load::<Ix4>(pd, &args, Role::Weights)?;
            let mut y = forward(x.view(), w.view(), desc, desc.dst);
            if desc.bias {
                add_bias(&mut y, args.get(Role::Bias)?);
            }
            store(pd, &mut args, Role::Dst, y)
        }
        Propagation::BackwardData => {
            let w = load::<Ix4>(pd, &args, Role::Weights)?;
            let dy = load::<Ix4>(pd, &args, Role::DiffDst)?;
            let dx = backward_data(dy.view(), w.view(), desc, desc.src);
            store(pd, &mut args, Role::DiffSrc, dx)
        }
        Propagation::BackwardWeights => {
            let x = load::<Ix4>(pd, &args, Role::Src)?;
            let dy = load::<Ix4>(pd, &args, Role::DiffDst)?;
            let dw = backward_weights(x.view(), dy.view(), desc, desc.weights);
            store(pd, &mut args, Role::DiffWeights, dw)?;
            if desc.bias {
                store::<Ix1>(pd, &mut args, Role::DiffBias, bias_grad(dy.view()))?;
            }
            Ok(())
        }
    }
}

/// Transposed convolution.
///
/// Weights are `(src channels, dst channels, kh, kw)`, so the forward pass is the data gradient of a convolution
/// from `dst` to `src` and vice versa.
pub(super) fn deconvolution(
    pd: &PrimitiveDesc,
    prop: Propagation,
    desc: &ConvDesc,
    mut args: ExecArgs,
) -> Result<(), KernelError> {
    match prop {
        Propagation::Forward => {
            let x = load::<Ix4>(pd, &args, Role::Src)?;
            let w = load::<Ix4>(pd, &args, Role::Weights)?;
            let mut y = backward_data(x.view(), w.view(), desc, desc.dst);
            if desc.bias {
                add_bias(&mut y, args.get(Role::Bias)?);
            }
            store(pd, &mut args, Role::Dst, y)
        }
        Propagation::BackwardData => {
            let w = load::<Ix4>(pd, &args, Role::Weights)?;
            let dy = load::<Ix4>(pd, &args, Role::DiffDst)?;
            let dx = forward(dy.view(), w.view(), desc, desc.src);
            store(pd, &mut args, Role::DiffSrc, dx)
        }
        Propagation::BackwardWeights => {
            let x = load::<Ix4>(pd, &args, Role::Src)?;
            let dy = load::<Ix4>(pd, &args, Role::DiffDst)?;
            let dw = backward_weights(dy.view(), x.view(), desc, desc.weights);
            store(pd, &mut args, Role::DiffWeights, dw)?;
            if desc.bias {
                store::<Ix1>(pd, &mut args, Role::DiffBias, bias_grad(dy.view()))?;
            }
            Ok(())
        }
    }
}
