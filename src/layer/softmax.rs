use super::{invalid_shape, plan, positive, Layer, Plan};
use crate::{
    engine::{Engine, OpDesc, Propagation, Role},
    factory::{LayerFactory, Store},
    signature::{Kind, Signature},
};
use anyhow::Result;
use paste::paste;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Shape parameters of [`Softmax2D`] and [`Softmax4D`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftmaxParams<const N: usize> {
    /// Input dims.
    #[cfg_attr(feature = "serde", serde(with = "serde_dims"))]
    pub dims: [usize; N],
    /// The normalized axis.
    pub axis: usize,
}

impl<const N: usize> SoftmaxParams<N> {
    /// Softmax of `dims` along axis 1.
    pub fn new(dims: [usize; N]) -> Self {
        Self { dims, axis: 1 }
    }
    /// With `axis`.
    pub fn with_axis(self, axis: usize) -> Self {
        Self { axis, ..self }
    }
}

#[cfg(feature = "serde")]
mod serde_dims {
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer, const N: usize>(
        dims: &[usize; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        dims.as_slice().serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[usize; N], D::Error> {
        let dims = Vec::<usize>::deserialize(deserializer)?;
        let len = dims.len();
        dims.try_into()
            .map_err(|_| D::Error::invalid_length(len, &"N dims"))
    }
}

/// Softmax along an axis.
///
/// Backward uses the output: `gx = y * (gy - sum(gy * y))`.
#[derive(Debug)]
pub struct Softmax<const N: usize> {
    params: SoftmaxParams<N>,
    signature: Signature,
    forward: Option<Plan>,
    backward: Option<Plan>,
}

/// Softmax of `(n, c)`.
pub type Softmax2D = Softmax<2>;

/// Softmax of `(n, c, h, w)`.
pub type Softmax4D = Softmax<4>;

impl<const N: usize> Softmax<N> {
    fn op(&self, prop: Propagation) -> OpDesc {
        OpDesc::Softmax {
            prop,
            dims: self.params.dims.to_vec(),
            axis: self.params.axis,
        }
    }
    fn forward(&mut self, engine: &dyn Engine, x: &[f32], y: &mut [f32]) -> Result<()> {
        let op = self.op(Propagation::Forward);
        let signature = &self.signature;
        let plan = plan::ensure(&mut self.forward, || {
            Plan::new(engine, &op, None, signature)
        })?;
        plan.execute(engine, &[(Role::Src, x)], &mut [(Role::Dst, y)])
    }
    fn backward(
        &mut self,
        engine: &dyn Engine,
        y: &[f32],
        gy: &[f32],
        gx: &mut [f32],
    ) -> Result<()> {
        let op = self.op(Propagation::BackwardData);
        let signature = &self.signature;
        let hint = self.forward.as_ref().map(Plan::primitive_desc);
        let plan = plan::ensure(&mut self.backward, || {
            Plan::new(engine, &op, hint, signature)
        })?;
        plan.execute(
            engine,
            &[(Role::Dst, y), (Role::DiffDst, gy)],
            &mut [(Role::DiffSrc, gx)],
        )
    }
    fn validate(kind: Kind, params: &SoftmaxParams<N>) -> Result<Self> {
        positive(kind, "dims", &params.dims)?;
        if params.axis >= N {
            return Err(invalid_shape(
                kind,
                format!("axis {} of {:?}", params.axis, params.dims),
            ));
        }
        Ok(Self {
            params: params.clone(),
            signature: Self::key(kind, params),
            forward: None,
            backward: None,
        })
    }
    fn key(kind: Kind, params: &SoftmaxParams<N>) -> Signature {
        Signature::builder(kind)
            .dims(&params.dims)
            .dim(params.axis)
            .build()
    }
}

macro_rules! impl_softmax {
    ($($n:literal),*) => {
        $(
            paste! {
                impl Softmax<$n> {
                    /// Computes `y` with the cached layer for `params`, creating it on first use.
                    ///
                    /// **Errors**
                    /// - [`LayerError::InvalidShape`](crate::error::LayerError::InvalidShape)
                    /// - [`LayerError::BufferSize`](crate::error::LayerError::BufferSize)
                    /// - The engine failed.
                    pub fn do_forward(
                        factory: &LayerFactory,
                        params: &SoftmaxParams<$n>,
                        x: &[f32],
                        y: &mut [f32],
                    ) -> Result<()> {
                        let layer = factory.get_or_create::<Self>(params)?;
                        let mut layer = layer.lock();
                        layer.forward(factory.engine(), x, y)
                    }
                    /// Computes `gx` from the output `y` with the cached layer for `params`, creating it on
                    /// first use.
                    ///
                    /// **Errors**
                    /// See [`do_forward()`](Self::do_forward).
                    pub fn do_backward(
                        factory: &LayerFactory,
                        params: &SoftmaxParams<$n>,
                        y: &[f32],
                        gy: &[f32],
                        gx: &mut [f32],
                    ) -> Result<()> {
                        let layer = factory.get_or_create::<Self>(params)?;
                        let mut layer = layer.lock();
                        layer.backward(factory.engine(), y, gy, gx)
                    }
                }

                impl Layer for Softmax<$n> {
                    type Params = SoftmaxParams<$n>;
                    const KIND: Kind = Kind::[<Softmax $n d>];
                    fn signature(params: &Self::Params) -> Signature {
                        Self::key(Self::KIND, params)
                    }
                    fn new(params: &Self::Params) -> Result<Self> {
                        Self::validate(Self::KIND, params)
                    }
                    fn store(factory: &LayerFactory) -> &Store<Self> {
                        &factory.[<softmax $n d>]
                    }
                    fn params(&self) -> &Self::Params {
                        &self.params
                    }
                    fn forward_plan(&self) -> Option<&Plan> {
                        self.forward.as_ref()
                    }
                    fn is_backward_ready(&self) -> bool {
                        self.backward.is_some()
                    }
                }
            }
        )*
    };
}

impl_softmax!(2, 4);
