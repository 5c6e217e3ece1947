use super::{load, store};
use crate::{
    engine::{ExecArgs, PrimitiveDesc, Propagation, Role},
    error::KernelError,
};
use ndarray::{Axis, Ix1, Ix2, IxDyn, Zip};

pub(super) fn check(
    src: [usize; 2],
    weights: [usize; 2],
    dst: [usize; 2],
) -> Result<(), KernelError> {
    if src.iter().chain(&weights).any(|d| *d == 0)
        || src[1] != weights[1]
        || dst != [src[0], weights[0]]
    {
        return Err(KernelError::Unsupported(format!(
            "inner product {src:?} x {weights:?} -> {dst:?}"
        )));
    }
    Ok(())
}

/// `y = x W^T + b`
pub(super) fn inner_product(
    pd: &PrimitiveDesc,
    prop: Propagation,
    mut args: ExecArgs,
) -> Result<(), KernelError> {
    let bias = pd.memory_desc(Role::Bias).is_some() || pd.memory_desc(Role::DiffBias).is_some();
    match prop {
        Propagation::Forward => {
            let x = load::<Ix2>(pd, &args, Role::Src)?;
            let w = load::<Ix2>(pd, &args, Role::Weights)?;
            let mut y = x.dot(&w.t());
            if bias {
                let b = load::<Ix1>(pd, &args, Role::Bias)?;
                y += &b;
            }
            store(pd, &mut args, Role::Dst, y)
        }
        Propagation::BackwardData => {
            let w = load::<Ix2>(pd, &args, Role::Weights)?;
            let dy = load::<Ix2>(pd, &args, Role::DiffDst)?;
            store(pd, &mut args, Role::DiffSrc, dy.dot(&w))
        }
        Propagation::BackwardWeights => {
            let x = load::<Ix2>(pd, &args, Role::Src)?;
            let dy = load::<Ix2>(pd, &args, Role::DiffDst)?;
            store(pd, &mut args, Role::DiffWeights, dy.t().dot(&x))?;
            if bias {
                store(pd, &mut args, Role::DiffBias, dy.sum_axis(Axis(0)))?;
            }
            Ok(())
        }
    }
}

pub(super) fn relu(
    pd: &PrimitiveDesc,
    prop: Propagation,
    mut args: ExecArgs,
) -> Result<(), KernelError> {
    match prop {
        Propagation::Forward => {
            let x = load::<IxDyn>(pd, &args, Role::Src)?;
            let y = x.map(|x| x.max(0.));
            store(pd, &mut args, Role::Dst, y)
        }
        Propagation::BackwardData => {
            let x = load::<IxDyn>(pd, &args, Role::Src)?;
            let dy = load::<IxDyn>(pd, &args, Role::DiffDst)?;
            let mut dx = dy.to_owned();
            Zip::from(&mut dx).and(&x).par_for_each(|dx, x| {
                if *x <= 0. {
                    *dx = 0.;
                }
            });
            store(pd, &mut args, Role::DiffSrc, dx)
        }
        Propagation::BackwardWeights => {
            Err(KernelError::Unsupported("relu has no weights".into()))
        }
    }
}
