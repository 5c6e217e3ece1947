use super::{conv::output_size, load, store};
use crate::{
    engine::{ExecArgs, PoolAlgorithm, PoolDesc, PrimitiveDesc, Propagation, Role},
    error::KernelError,
};
use ndarray::{Array4, ArrayView4, Ix4, Zip};
use std::ops::Range;

pub(super) fn check(desc: &PoolDesc) -> Result<(), KernelError> {
    let PoolDesc {
        src,
        dst,
        kernel,
        strides,
        padding_l,
        padding_r,
        ..
    } = desc;
    let valid = src.iter().chain(dst).all(|d| *d > 0)
        && src[..2] == dst[..2]
        && (0..2).all(|i| {
            output_size(src[2 + i], kernel[i], strides[i], padding_l[i], padding_r[i])
                == Some(dst[2 + i])
        });
    if valid {
        Ok(())
    } else {
        Err(KernelError::Unsupported(format!("pooling {desc:?}")))
    }
}

/// The in bounds input rows or columns of window `o`.
fn window(o: usize, kernel: usize, stride: usize, pad: usize, input: usize) -> Range<usize> {
    let start = o * stride;
    let end = (start + kernel).saturating_sub(pad).min(input);
    start.saturating_sub(pad).min(end)..end
}

fn max_forward(x: ArrayView4<f32>, desc: &PoolDesc) -> Array4<f32> {
    let PoolDesc {
        kernel,
        strides,
        padding_l,
        ..
    } = desc;
    let (ih, iw) = (x.dim().2, x.dim().3);
    let mut y = Array4::zeros(desc.dst);
    Zip::indexed(&mut y).par_for_each(|(n, c, oh, ow), y| {
        // windows entirely in padding are 0
        let mut max = None;
        for h in window(oh, kernel[0], strides[0], padding_l[0], ih) {
            for w in window(ow, kernel[1], strides[1], padding_l[1], iw) {
                let x = x[[n, c, h, w]];
                max = Some(max.map_or(x, |max: f32| max.max(x)));
            }
        }
        *y = max.unwrap_or(0.);
    });
    y
}

fn avg_forward(x: ArrayView4<f32>, desc: &PoolDesc) -> Array4<f32> {
    let PoolDesc {
        kernel,
        strides,
        padding_l,
        ..
    } = desc;
    let (ih, iw) = (x.dim().2, x.dim().3);
    let scale = 1. / (kernel[0] * kernel[1]) as f32;
    let mut y = Array4::zeros(desc.dst);
    Zip::indexed(&mut y).par_for_each(|(n, c, oh, ow), y| {
        let mut sum = 0f32;
        for h in window(oh, kernel[0], strides[0], padding_l[0], ih) {
            for w in window(ow, kernel[1], strides[1], padding_l[1], iw) {
                sum += x[[n, c, h, w]];
            }
        }
        *y = sum * scale;
    });
    y
}

/// Routes each output gradient to the first maximum of its window.
fn max_backward(x: ArrayView4<f32>, dy: ArrayView4<f32>, desc: &PoolDesc) -> Array4<f32> {
    let PoolDesc {
        kernel,
        strides,
        padding_l,
        ..
    } = desc;
    let (ih, iw) = (x.dim().2, x.dim().3);
    let (oh, ow) = (dy.dim().2, dy.dim().3);
    let mut dx = Array4::zeros(desc.src);
    // windows overlap, so each (n, c) plane is accumulated by one thread
    Zip::from(dx.outer_iter_mut())
        .and(x.outer_iter())
        .and(dy.outer_iter())
        .par_for_each(|mut dx, x, dy| {
            for c in 0..x.dim().0 {
                for y in 0..oh {
                    for x_ in 0..ow {
                        let mut argmax = None;
                        let mut max = f32::NEG_INFINITY;
                        for h in window(y, kernel[0], strides[0], padding_l[0], ih) {
                            for w in window(x_, kernel[1], strides[1], padding_l[1], iw) {
                                if argmax.is_none() || x[[c, h, w]] > max {
                                    max = x[[c, h, w]];
                                    argmax.replace((h, w));
                                }
                            }
                        }
                        if let Some((h, w)) = argmax {
                            dx[[c, h, w]] += dy[[c, y, x_]];
                        }
                    }
                }
            }
        });
    dx
}

fn avg_backward(dy: ArrayView4<f32>, desc: &PoolDesc) -> Array4<f32> {
    let PoolDesc {
        kernel,
        strides,
        padding_l,
        ..
    } = desc;
    let (oh, ow) = (dy.dim().2, dy.dim().3);
    let scale = 1. / (kernel[0] * kernel[1]) as f32;
    let mut dx = Array4::zeros(desc.src);
    Zip::indexed(&mut dx).par_for_each(|(n, c, h, w), dx| {
        let mut sum = 0f32;
        for y in 0..oh {
            if !window(y, kernel[0], strides[0], padding_l[0], usize::MAX).contains(&h) {
                continue;
            }
            for x in 0..ow {
                if window(x, kernel[1], strides[1], padding_l[1], usize::MAX).contains(&w) {
                    sum += dy[[n, c, y, x]];
                }
            }
        }
        *dx = sum * scale;
    });
    dx
}

pub(super) fn pooling(
    pd: &PrimitiveDesc,
    prop: Propagation,
    desc: &PoolDesc,
    mut args: ExecArgs,
) -> Result<(), KernelError> {
    match prop {
        Propagation::Forward => {
            let x = load::<Ix4>(pd, &args, Role::Src)?;
            let y = match desc.algorithm {
                PoolAlgorithm::Max => max_forward(x.view(), desc),
                PoolAlgorithm::Avg => avg_forward(x.view(), desc),
            };
            store(pd, &mut args, Role::Dst, y)
        }
        Propagation::BackwardData => {
            let dy = load::<Ix4>(pd, &args, Role::DiffDst)?;
            let dx = match desc.algorithm {
                PoolAlgorithm::Max => {
                    let x = load::<Ix4>(pd, &args, Role::Src)?;
                    max_backward(x.view(), dy.view(), desc)
                }
                PoolAlgorithm::Avg => avg_backward(dy.view(), desc),
            };
            store(pd, &mut args, Role::DiffSrc, dx)
        }
        Propagation::BackwardWeights => {
            Err(KernelError::Unsupported("pooling has no weights".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn desc(algorithm: PoolAlgorithm, pad: usize) -> PoolDesc {
        let out = (4 + 2 * pad - 2) / 2 + 1;
        PoolDesc {
            algorithm,
            src: [1, 1, 4, 4],
            dst: [1, 1, out, out],
            kernel: [2, 2],
            strides: [2, 2],
            padding_l: [pad; 2],
            padding_r: [pad; 2],
        }
    }

    #[test]
    fn windows_clip_padding() {
        assert_eq!(window(0, 3, 2, 1, 5), 0..2);
        assert_eq!(window(2, 3, 2, 1, 5), 3..5);
        assert_eq!(window(1, 2, 2, 0, 4), 2..4);
    }

    #[test]
    fn max_and_avg() {
        let x = Array::from_shape_vec([1, 1, 4, 4], (0..16).map(|x| x as f32).collect()).unwrap();
        let max = desc(PoolAlgorithm::Max, 0);
        check(&max).unwrap();
        let y = max_forward(x.view(), &max);
        assert_eq!(y.into_raw_vec(), [5., 7., 13., 15.]);
        let avg = desc(PoolAlgorithm::Avg, 0);
        let y = avg_forward(x.view(), &avg);
        assert_eq!(y.into_raw_vec(), [2.5, 4.5, 10.5, 12.5]);
    }

    #[test]
    fn avg_divides_by_window_with_padding() {
        let x = Array::from_elem([1, 1, 4, 4], 1f32);
        let avg = desc(PoolAlgorithm::Avg, 1);
        check(&avg).unwrap();
        let y = avg_forward(x.view(), &avg);
        // the corner window holds a single element
        assert_eq!(y[[0, 0, 0, 0]], 0.25);
        assert_eq!(y[[0, 0, 1, 1]], 1.);
    }

    #[test]
    fn max_backward_first_maximum() {
        let x = Array::from_elem([1, 1, 4, 4], 1f32);
        let dy = Array::from_elem([1, 1, 2, 2], 1f32);
        let max = desc(PoolAlgorithm::Max, 0);
        let dx = max_backward(x.view(), dy.view(), &max);
        assert_eq!(dx[[0, 0, 0, 0]], 1.);
        assert_eq!(dx[[0, 0, 0, 1]], 0.);
        assert_eq!(dx.sum(), 4.);
    }

    #[test]
    fn max_padding_only_windows() {
        let x = Array::from_elem([1, 1, 4, 4], -1f32);
        let max = desc(PoolAlgorithm::Max, 2);
        check(&max).unwrap();
        let y = max_forward(x.view(), &max);
        assert_eq!(y.dim(), (1, 1, 4, 4));
        assert_eq!(y[[0, 0, 0, 0]], 0.);
        assert_eq!(y[[0, 0, 3, 1]], 0.);
        assert_eq!(y[[0, 0, 1, 1]], -1.);
        assert_eq!(y[[0, 0, 2, 1]], -1.);
        let dy = Array::from_elem([1, 1, 4, 4], 1f32);
        let dx = max_backward(x.view(), dy.view(), &max);
        // only the 2x2 windows over the input route gradient
        assert_eq!(dx.sum(), 4.);
    }

    #[test]
    fn max_keeps_infinities() {
        let mut x = Array::zeros([1, 1, 4, 4]);
        x[[0, 0, 0, 1]] = f32::INFINITY;
        for h in 2..4 {
            for w in 2..4 {
                x[[0, 0, h, w]] = f32::NEG_INFINITY;
            }
        }
        let max = desc(PoolAlgorithm::Max, 0);
        let y = max_forward(x.view(), &max);
        assert_eq!(y.into_raw_vec(), [f32::INFINITY, 0., 0., f32::NEG_INFINITY]);
        let dy = Array::from_elem([1, 1, 2, 2], 1f32);
        let dx = max_backward(x.view(), dy.view(), &max);
        assert_eq!(dx[[0, 0, 0, 1]], 1.);
        assert_eq!(dx[[0, 0, 2, 2]], 1.);
        assert_eq!(dx.sum(), 4.);
    }

    #[test]
    fn avg_backward_spreads_gradient() {
        let dy = Array::from_elem([1, 1, 2, 2], 4f32);
        let avg = desc(PoolAlgorithm::Avg, 0);
        let dx = avg_backward(dy.view(), &avg);
        assert!(dx.iter().all(|x| *x == 1.));
    }
}
