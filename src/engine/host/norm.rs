use super::{load, store};
use crate::{
    engine::{ExecArgs, PrimitiveDesc, Propagation, Role},
    error::KernelError,
};
use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD, Axis, Ix4, IxDyn, Zip};
use std::ops::RangeInclusive;

/// Channels `c - n / 2 ..= c + n / 2`, clipped to `channels`.
fn channel_window(c: usize, local_size: usize, channels: usize) -> RangeInclusive<usize> {
    let half = local_size / 2;
    c.saturating_sub(half)..=(c + half).min(channels - 1)
}

/// `k + alpha * sum(x^2)` over the channel window of each element.
fn lrn_scale(x: ArrayView4<f32>, local_size: usize, alpha: f64, k: f64) -> Array4<f64> {
    let channels = x.dim().1;
    let mut scale = Array4::zeros(x.raw_dim());
    Zip::indexed(&mut scale).par_for_each(|(n, c, h, w), scale| {
        let sum: f64 = channel_window(c, local_size, channels)
            .map(|c| {
                let x = x[[n, c, h, w]] as f64;
                x * x
            })
            .sum();
        *scale = k + alpha * sum;
    });
    scale
}

fn lrn_forward(
    x: ArrayView4<f32>,
    local_size: usize,
    alpha: f64,
    beta: f64,
    k: f64,
) -> Array4<f32> {
    let scale = lrn_scale(x, local_size, alpha, k);
    let mut y = Array4::zeros(x.raw_dim());
    Zip::from(&mut y)
        .and(&x)
        .and(&scale)
        .par_for_each(|y, x, scale| *y = (*x as f64 * scale.powf(-beta)) as f32);
    y
}

/// `dx = dy * s^-beta - 2 alpha beta x sum(dy y / s)`
fn lrn_backward(
    x: ArrayView4<f32>,
    dy: ArrayView4<f32>,
    local_size: usize,
    alpha: f64,
    beta: f64,
    k: f64,
) -> Array4<f32> {
    let channels = x.dim().1;
    let scale = lrn_scale(x, local_size, alpha, k);
    // dy * y / s
    let mut t = Array4::<f64>::zeros(x.raw_dim());
    Zip::from(&mut t)
        .and(&x)
        .and(&dy)
        .and(&scale)
        .par_for_each(|t, x, dy, s| *t = *dy as f64 * *x as f64 * s.powf(-beta) / s);
    let mut dx = Array4::zeros(x.raw_dim());
    Zip::indexed(&mut dx).par_for_each(|(n, c, h, w), dx| {
        let s = scale[[n, c, h, w]];
        let sum: f64 = channel_window(c, local_size, channels)
            .map(|c| t[[n, c, h, w]])
            .sum();
        let x = x[[n, c, h, w]] as f64;
        let dy = dy[[n, c, h, w]] as f64;
        *dx = (dy * s.powf(-beta) - 2. * alpha * beta * x * sum) as f32;
    });
    dx
}

pub(super) fn lrn(
    pd: &PrimitiveDesc,
    prop: Propagation,
    local_size: usize,
    alpha: f64,
    beta: f64,
    k: f64,
    mut args: ExecArgs,
) -> Result<(), KernelError> {
    match prop {
        Propagation::Forward => {
            let x = load::<Ix4>(pd, &args, Role::Src)?;
            let y = lrn_forward(x.view(), local_size, alpha, beta, k);
            store(pd, &mut args, Role::Dst, y)
        }
        Propagation::BackwardData => {
            let x = load::<Ix4>(pd, &args, Role::Src)?;
            let dy = load::<Ix4>(pd, &args, Role::DiffDst)?;
            let dx = lrn_backward(x.view(), dy.view(), local_size, alpha, beta, k);
            store(pd, &mut args, Role::DiffSrc, dx)
        }
        Propagation::BackwardWeights => {
            Err(KernelError::Unsupported("lrn has no weights".into()))
        }
    }
}

fn softmax_forward(x: ArrayViewD<f32>, axis: Axis) -> ArrayD<f32> {
    let mut y = ArrayD::zeros(x.raw_dim());
    Zip::from(y.lanes_mut(axis))
        .and(x.lanes(axis))
        .par_for_each(|mut y, x| {
            let max = x.fold(f32::NEG_INFINITY, |m, x| m.max(*x));
            y.zip_mut_with(&x, |y, x| *y = (x - max).exp());
            let sum = y.sum();
            y /= sum;
        });
    y
}

/// `dx = y * (dy - sum(dy * y))`
fn softmax_backward(y: ArrayViewD<f32>, dy: ArrayViewD<f32>, axis: Axis) -> ArrayD<f32> {
    let mut dx = ArrayD::zeros(y.raw_dim());
    Zip::from(dx.lanes_mut(axis))
        .and(y.lanes(axis))
        .and(dy.lanes(axis))
        .par_for_each(|mut dx, y, dy| {
            let dot = y.dot(&dy);
            Zip::from(&mut dx)
                .and(&y)
                .and(&dy)
                .for_each(|dx, y, dy| *dx = y * (dy - dot));
        });
    dx
}

pub(super) fn softmax(
    pd: &PrimitiveDesc,
    prop: Propagation,
    axis: usize,
    mut args: ExecArgs,
) -> Result<(), KernelError> {
    let axis = Axis(axis);
    match prop {
        Propagation::Forward => {
            let x = load::<IxDyn>(pd, &args, Role::Src)?;
            let y = softmax_forward(x.view(), axis);
            store(pd, &mut args, Role::Dst, y)
        }
        Propagation::BackwardData => {
            let y = load::<IxDyn>(pd, &args, Role::Dst)?;
            let dy = load::<IxDyn>(pd, &args, Role::DiffDst)?;
            let dx = softmax_backward(y.view(), dy.view(), axis);
            store(pd, &mut args, Role::DiffSrc, dx)
        }
        Propagation::BackwardWeights => {
            Err(KernelError::Unsupported("softmax has no weights".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array};

    #[test]
    fn channel_windows() {
        assert_eq!(channel_window(0, 5, 8), 0..=2);
        assert_eq!(channel_window(4, 5, 8), 2..=6);
        assert_eq!(channel_window(7, 5, 8), 5..=7);
    }

    #[test]
    fn lrn_single_channel() {
        let x = Array::from_elem([1, 1, 1, 2], 2f32);
        let y = lrn_forward(x.view(), 5, 1., 0.5, 0.);
        // 2 / sqrt(4)
        assert_relative_eq!(y[[0, 0, 0, 0]], 1.);
    }

    #[test]
    fn lrn_backward_matches_finite_difference() {
        let x = Array::from_shape_fn([1, 6, 2, 2], |(_, c, h, w)| {
            0.5 + (c as f32) * 0.3 - (h as f32) * 0.2 + w as f32 * 0.1
        });
        let dy = Array::from_shape_fn([1, 6, 2, 2], |(_, c, h, _)| 1. + (c * h) as f32 * 0.1);
        let (n, alpha, beta, k) = (3, 1e-1, 0.75, 2.);
        let dx = lrn_backward(x.view(), dy.view(), n, alpha, beta, k);
        let loss = |x: &Array4<f32>| {
            let y = lrn_forward(x.view(), n, alpha, beta, k);
            (&y * &dy).mapv(f64::from).sum()
        };
        let eps = 1e-2;
        for index in [[0, 0, 0, 0], [0, 3, 1, 0], [0, 5, 1, 1]] {
            let mut xp = x.clone();
            xp[index] += eps;
            let mut xm = x.clone();
            xm[index] -= eps;
            let numeric = (loss(&xp) - loss(&xm)) / (2. * eps as f64);
            assert_relative_eq!(
                dx[index] as f64,
                numeric,
                epsilon = 1e-3,
                max_relative = 1e-2
            );
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = arr2(&[[1f32, 2., 3.], [0., 0., 0.]]).into_dyn();
        let y = softmax_forward(x.view(), Axis(1));
        for row in y.outer_iter() {
            assert_relative_eq!(row.sum(), 1., epsilon = 1e-6);
        }
        assert_relative_eq!(y[[1, 0]], 1. / 3., epsilon = 1e-6);
    }

    #[test]
    fn softmax_backward_of_uniform_gradient_is_zero() {
        let x = arr2(&[[1f32, -2., 0.5]]).into_dyn();
        let y = softmax_forward(x.view(), Axis(1));
        let dy = ArrayD::from_elem(y.raw_dim(), 3f32);
        let dx = softmax_backward(y.view(), dy.view(), Axis(1));
        assert!(dx.iter().all(|dx| dx.abs() < 1e-6));
    }
}
