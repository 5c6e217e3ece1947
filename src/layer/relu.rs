use super::{plan, positive, Layer, Plan};
use crate::{
    engine::{Engine, OpDesc, Propagation, Role},
    factory::{LayerFactory, Store},
    signature::{Kind, Signature},
};
use anyhow::Result;

/// Rectified linear unit over `N` dims, `y = max(x, 0)`.
///
/// Parameters are the dims of `x`.
#[derive(Debug)]
pub struct ReluNd<const N: usize> {
    dims: [usize; N],
    signature: Signature,
    forward: Option<Plan>,
    backward: Option<Plan>,
}

/// ReLU of a flat buffer, parameterized by its length.
pub type Relu = ReluNd<1>;

/// ReLU of `(n, c, h, w)`.
pub type Relu4d = ReluNd<4>;

impl<const N: usize> ReluNd<N> {
    fn op(&self, prop: Propagation) -> OpDesc {
        OpDesc::Relu {
            prop,
            dims: self.dims.to_vec(),
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
        x: &[f32],
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
            &[(Role::Src, x), (Role::DiffDst, gy)],
            &mut [(Role::DiffSrc, gx)],
        )
    }
    fn validate(kind: Kind, dims: &[usize; N]) -> Result<Self> {
        positive(kind, "dims", dims)?;
        Ok(Self {
            dims: *dims,
            signature: Signature::builder(kind).dims(dims).build(),
            forward: None,
            backward: None,
        })
    }
}

macro_rules! impl_relu {
    ($($n:literal => $kind:ident, $store:ident);*) => {
        $(
            impl ReluNd<$n> {
                /// Computes `y` with the cached layer for `dims`, creating it on first use.
                ///
                /// **Errors**
                /// - [`LayerError::InvalidShape`](crate::error::LayerError::InvalidShape)
                /// - [`LayerError::BufferSize`](crate::error::LayerError::BufferSize)
                /// - The engine failed.
                pub fn do_forward(
                    factory: &LayerFactory,
                    dims: &[usize; $n],
                    x: &[f32],
                    y: &mut [f32],
                ) -> Result<()> {
                    let layer = factory.get_or_create::<Self>(dims)?;
                    let mut layer = layer.lock();
                    layer.forward(factory.engine(), x, y)
                }
                /// Computes `gx` with the cached layer for `dims`, creating it on first use.
                ///
                /// **Errors**
                /// See [`do_forward()`](Self::do_forward).
                pub fn do_backward(
                    factory: &LayerFactory,
                    dims: &[usize; $n],
                    x: &[f32],
                    gy: &[f32],
                    gx: &mut [f32],
                ) -> Result<()> {
                    let layer = factory.get_or_create::<Self>(dims)?;
                    let mut layer = layer.lock();
                    layer.backward(factory.engine(), x, gy, gx)
                }
            }

            impl Layer for ReluNd<$n> {
                type Params = [usize; $n];
                const KIND: Kind = Kind::$kind;
                fn signature(dims: &[usize; $n]) -> Signature {
                    Signature::builder(Self::KIND).dims(dims).build()
                }
                fn new(dims: &[usize; $n]) -> Result<Self> {
                    Self::validate(Self::KIND, dims)
                }
                fn store(factory: &LayerFactory) -> &Store<Self> {
                    &factory.$store
                }
                fn params(&self) -> &[usize; $n] {
                    &self.dims
                }
                fn forward_plan(&self) -> Option<&Plan> {
                    self.forward.as_ref()
                }
                fn is_backward_ready(&self) -> bool {
                    self.backward.is_some()
                }
            }
        )*
    };
}

impl_relu!(1 => Relu, relu; 4 => Relu4d, relu4d);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures() {
        assert_eq!(Relu::signature(&[16]).to_string(), "relu_I10_");
        assert_eq!(
            Relu4d::signature(&[1, 2, 3, 4]).to_string(),
            "relu4d_I1_I2_I3_I4_"
        );
        assert!(Relu::new(&[0]).is_err());
    }
}
