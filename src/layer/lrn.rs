use super::{invalid_shape, plan, positive, Layer, Plan};
use crate::{
    engine::{Engine, OpDesc, Propagation, Role},
    factory::{LayerFactory, Store},
    signature::{Kind, Signature},
};
use anyhow::Result;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Shape parameters of [`Lrn`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LrnParams {
    /// Input dims `(n, c, h, w)`.
    pub x: [usize; 4],
    /// Channels in the window.
    pub n: usize,
    /// Offset.
    pub k: f64,
    /// Scale of the sum of squares.
    pub alpha: f64,
    /// Exponent.
    pub beta: f64,
}

impl LrnParams {
    /// Parameters for input `x`.
    ///
    /// Defaults: `n = 5, k = 2, alpha = 1e-4, beta = 0.75`.
    pub fn new(x: [usize; 4]) -> Self {
        Self {
            x,
            n: 5,
            k: 2.,
            alpha: 1e-4,
            beta: 0.75,
        }
    }
    /// With `n`, `k`, `alpha`, and `beta`.
    pub fn with_window(self, n: usize, k: f64, alpha: f64, beta: f64) -> Self {
        Self {
            n,
            k,
            alpha,
            beta,
            ..self
        }
    }
}

/// Local response normalization across channels.
///
/// `y = x / (k + alpha * sum(x^2))^beta`, summing over the `n` channels centered on each element.
#[derive(Debug)]
pub struct Lrn {
    params: LrnParams,
    signature: Signature,
    forward: Option<Plan>,
    backward: Option<Plan>,
}

impl Lrn {
    fn op(&self, prop: Propagation) -> OpDesc {
        let LrnParams {
            x,
            n,
            k,
            alpha,
            beta,
        } = self.params;
        OpDesc::Lrn {
            prop,
            src: x,
            local_size: n,
            alpha,
            beta,
            k,
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
    /// Computes `y` with the cached layer for `params`, creating it on first use.
    ///
    /// **Errors**
    /// - [`LayerError::InvalidShape`](crate::error::LayerError::InvalidShape)
    /// - [`LayerError::BufferSize`](crate::error::LayerError::BufferSize)
    /// - The engine failed.
    pub fn do_forward(
        factory: &LayerFactory,
        params: &LrnParams,
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
        params: &LrnParams,
        x: &[f32],
        gy: &[f32],
        gx: &mut [f32],
    ) -> Result<()> {
        let layer = factory.get_or_create::<Self>(params)?;
        let mut layer = layer.lock();
        layer.backward(factory.engine(), x, gy, gx)
    }
}

impl Layer for Lrn {
    type Params = LrnParams;
    const KIND: Kind = Kind::Lrn;
    fn signature(params: &LrnParams) -> Signature {
        Signature::builder(Self::KIND)
            .dims(&params.x)
            .dim(params.n)
            .double(params.k)
            .double(params.alpha)
            .double(params.beta)
            .build()
    }
    fn new(params: &LrnParams) -> Result<Self> {
        positive(Self::KIND, "x", &params.x)?;
        if params.n == 0 {
            return Err(invalid_shape(Self::KIND, "n must be positive"));
        }
        if ![params.k, params.alpha, params.beta]
            .iter()
            .all(|x| x.is_finite())
        {
            return Err(invalid_shape(
                Self::KIND,
                format!("non finite coefficients {params:?}"),
            ));
        }
        Ok(Self {
            params: params.clone(),
            signature: Self::signature(params),
            forward: None,
            backward: None,
        })
    }
    fn store(factory: &LayerFactory) -> &Store<Self> {
        &factory.lrn
    }
    fn params(&self) -> &LrnParams {
        &self.params
    }
    fn forward_plan(&self) -> Option<&Plan> {
        self.forward.as_ref()
    }
    fn is_backward_ready(&self) -> bool {
        self.backward.is_some()
    }
}
