use super::{invalid_shape, plan, positive, Layer, Plan, PoolKindBase};
use crate::{
    engine::{Engine, OpDesc, PoolAlgorithm, PoolDesc, Propagation, Role},
    factory::{LayerFactory, Store},
    signature::{Kind, Signature},
};
use anyhow::Result;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
};

/// Pooling algorithms.
///
/// Implemented for [`PoolMax`] and [`PoolAvg`], cannot be implemented outside the crate.
pub trait PoolKind: Default + Send + Sync + 'static + PoolKindBase {
    #[doc(hidden)]
    const ALGORITHM: PoolAlgorithm;
    #[doc(hidden)]
    const KIND: Kind;
    #[doc(hidden)]
    fn store(factory: &LayerFactory) -> &Store<PoolBase<Self>>;
}

/// Marker for [`MaxPool`].
#[derive(Default, Clone, Copy, Debug)]
pub struct PoolMax;

impl PoolKindBase for PoolMax {}

impl PoolKind for PoolMax {
    const ALGORITHM: PoolAlgorithm = PoolAlgorithm::Max;
    const KIND: Kind = Kind::MaxPool;
    fn store(factory: &LayerFactory) -> &Store<MaxPool> {
        &factory.max_pool
    }
}

/// Marker for [`AvgPool`].
#[derive(Default, Clone, Copy, Debug)]
pub struct PoolAvg;

impl PoolKindBase for PoolAvg {}

impl PoolKind for PoolAvg {
    const ALGORITHM: PoolAlgorithm = PoolAlgorithm::Avg;
    const KIND: Kind = Kind::AvgPool;
    fn store(factory: &LayerFactory) -> &Store<AvgPool> {
        &factory.avg_pool
    }
}

/// Shape parameters of [`MaxPool`] and [`AvgPool`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pool2dParams {
    /// Input dims `(n, c, h, w)`.
    pub x: [usize; 4],
    /// `(y, x)`
    pub stride: [usize; 2],
    /// `(h, w)`
    pub kernel: [usize; 2],
    /// Padding `(up, down, left, right)`.
    pub pad: [usize; 4],
}

impl Pool2dParams {
    /// Parameters for input `x` and `kernel`.
    ///
    /// Defaults:
    /// - stride: `kernel`
    /// - padding: 0
    pub fn new(x: [usize; 4], kernel: [usize; 2]) -> Self {
        Self {
            x,
            stride: kernel,
            kernel,
            pad: [0; 4],
        }
    }
    /// With `stride`.
    pub fn with_stride(self, stride: [usize; 2]) -> Self {
        Self { stride, ..self }
    }
    /// With padding `(up, down, left, right)`.
    pub fn with_pad(self, pad: [usize; 4]) -> Self {
        Self { pad, ..self }
    }
}

/// 2d pooling.
///
/// Windows are clipped to the input, [`AvgPool`] divides by the full window size.
pub struct PoolBase<K: PoolKind> {
    params: Pool2dParams,
    signature: Signature,
    desc: PoolDesc,
    forward: Option<Plan>,
    backward: Option<Plan>,
    _m: PhantomData<K>,
}

/// Max pooling.
///
/// Backward routes each output gradient to the first maximum of its window.
pub type MaxPool = PoolBase<PoolMax>;

/// Average pooling.
pub type AvgPool = PoolBase<PoolAvg>;

impl<K: PoolKind> PoolBase<K> {
    /// The output dims `(n, c, oh, ow)`.
    pub fn output_dims(&self) -> [usize; 4] {
        self.desc.dst
    }
    fn forward(&mut self, engine: &dyn Engine, x: &[f32], y: &mut [f32]) -> Result<()> {
        let op = OpDesc::Pooling(Propagation::Forward, self.desc.clone());
        let signature = &self.signature;
        let plan = plan::ensure(&mut self.forward, || {
            Plan::new(engine, &op, None, signature)
        })?;
        log::trace!("{signature} forward");
        plan.execute(engine, &[(Role::Src, x)], &mut [(Role::Dst, y)])
    }
    fn backward(
        &mut self,
        engine: &dyn Engine,
        x: &[f32],
        gy: &[f32],
        gx: &mut [f32],
    ) -> Result<()> {
        let op = OpDesc::Pooling(Propagation::BackwardData, self.desc.clone());
        let signature = &self.signature;
        let hint = self.forward.as_ref().map(Plan::primitive_desc);
        let plan = plan::ensure(&mut self.backward, || {
            Plan::new(engine, &op, hint, signature)
        })?;
        log::trace!("{signature} backward");
        plan.execute(
            engine,
            &[(Role::Src, x), (Role::DiffDst, gy)],
            &mut [(Role::DiffSrc, gx)],
        )
    }
    /// Computes `y` with the cached layer for `params`, creating it on first use.
    ///
    /// **Errors**
    /// - [`LayerError::InvalidShape`](crate::error::LayerError::InvalidShape)
    /// - [`LayerError::BufferSize`](crate::error::LayerError::BufferSize)
    /// - The engine failed.
    pub fn do_forward(
        factory: &LayerFactory,
        params: &Pool2dParams,
        x: &[f32],
        y: &mut [f32],
    ) -> Result<()> {
        let layer = factory.get_or_create::<Self>(params)?;
        let mut layer = layer.lock();
        layer.forward(factory.engine(), x, y)
    }
    /// Computes `gx` with the cached layer for `params`, creating it on first use.
    ///
    /// **Errors**
    /// See [`do_forward()`](Self::do_forward).
    pub fn do_backward(
        factory: &LayerFactory,
        params: &Pool2dParams,
        x: &[f32],
        gy: &[f32],
        gx: &mut [f32],
    ) -> Result<()> {
        let layer = factory.get_or_create::<Self>(params)?;
        let mut layer = layer.lock();
        layer.backward(factory.engine(), x, gy, gx)
    }
}

impl<K: PoolKind> Debug for PoolBase<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ty = match K::ALGORITHM {
            PoolAlgorithm::Max => "MaxPool",
            PoolAlgorithm::Avg => "AvgPool",
        };
        f.debug_struct(ty)
            .field("params", &self.params)
            .field("forward", &self.forward.is_some())
            .field("backward", &self.backward.is_some())
            .finish()
    }
}

impl<K: PoolKind> Layer for PoolBase<K> {
    type Params = Pool2dParams;
    const KIND: Kind = K::KIND;
    fn signature(params: &Pool2dParams) -> Signature {
        Signature::builder(Self::KIND)
            .dims(&params.x)
            .dims(&params.stride)
            .dims(&params.kernel)
            .dims(&params.pad)
            .build()
    }
    fn new(params: &Pool2dParams) -> Result<Self> {
        let Pool2dParams {
            x,
            stride,
            kernel,
            pad,
        } = params;
        let kind = Self::KIND;
        positive(kind, "x", x)?;
        positive(kind, "stride", stride)?;
        positive(kind, "kernel", kernel)?;
        let [up, down, left, right] = *pad;
        let (padding_l, padding_r) = ([up, left], [down, right]);
        let mut y = [x[0], x[1], 0, 0];
        for i in 0..2 {
            y[2 + i] = x[2 + i]
                .checked_add(padding_l[i])
                .and_then(|d| d.checked_add(padding_r[i]))
                .and_then(|padded| padded.checked_sub(kernel[i]))
                .map(|d| d / stride[i] + 1)
                .ok_or_else(|| {
                    invalid_shape(kind, format!("kernel {kernel:?} over x {x:?} padded {pad:?}"))
                })?;
        }
        let desc = PoolDesc {
            algorithm: K::ALGORITHM,
            src: *x,
            dst: y,
            kernel: *kernel,
            strides: *stride,
            padding_l,
            padding_r,
        };
        Ok(Self {
            params: params.clone(),
            signature: Self::signature(params),
            desc,
            forward: None,
            backward: None,
            _m: PhantomData,
        })
    }
    fn store(factory: &LayerFactory) -> &Store<Self> {
        K::store(factory)
    }
    fn params(&self) -> &Pool2dParams {
        &self.params
    }
    fn forward_plan(&self) -> Option<&Plan> {
        self.forward.as_ref()
    }
    fn is_backward_ready(&self) -> bool {
        self.backward.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LayerError;

    #[test]
    fn output_dims() {
        let pool = MaxPool::new(&Pool2dParams::new([2, 3, 4, 4], [2, 2])).unwrap();
        assert_eq!(pool.output_dims(), [2, 3, 2, 2]);
        let params = Pool2dParams::new([1, 1, 5, 5], [3, 3])
            .with_stride([2, 2])
            .with_pad([1, 1, 1, 1]);
        let pool = AvgPool::new(&params).unwrap();
        assert_eq!(pool.output_dims(), [1, 1, 3, 3]);
    }

    #[test]
    fn max_and_avg_keys_differ() {
        let params = Pool2dParams::new([1, 1, 4, 4], [2, 2]);
        assert_ne!(MaxPool::signature(&params), AvgPool::signature(&params));
        assert_eq!(
            MaxPool::signature(&params).to_string(),
            "maxpool_I1_I1_I4_I4_I2_I2_I2_I2_I0_I0_I0_I0_"
        );
    }

    #[test]
    fn kernel_larger_than_input() {
        assert!(MaxPool::new(&Pool2dParams::new([1, 1, 2, 2], [3, 3])).is_err());
        let params = Pool2dParams::new([1, 1, 2, 2], [2, 2]).with_stride([0, 1]);
        assert!(AvgPool::new(&params).is_err());
    }

    #[test]
    fn huge_padding_is_invalid() {
        for pad in [[usize::MAX, 0, 0, 0], [usize::MAX, 1, 0, 0], [0, 0, 1, usize::MAX]] {
            let params = Pool2dParams::new([1, 1, 4, 4], [2, 2]).with_pad(pad);
            let error = MaxPool::new(&params).unwrap_err();
            assert!(error
                .downcast_ref::<LayerError>()
                .unwrap()
                .is_invalid_shape());
        }
    }

    #[test]
    fn debug() {
        let pool = AvgPool::new(&Pool2dParams::new([1, 1, 2, 2], [2, 2])).unwrap();
        assert!(format!("{pool:?}").starts_with("AvgPool"));
    }
}
