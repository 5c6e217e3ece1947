use super::{check_optional, invalid_shape, plan, positive, Layer, Plan};
use crate::{
    engine::{Engine, OpDesc, Propagation, Role},
    factory::{LayerFactory, Store},
    signature::{Kind, Signature},
};
use anyhow::Result;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Shape parameters of [`Linear`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinearParams {
    /// Input dims `(n, inputs)`.
    pub x: [usize; 2],
    /// Weight dims `(outputs, inputs)`.
    pub w: [usize; 2],
    /// Bias length, if any.
    pub b: Option<usize>,
}

impl LinearParams {
    /// Parameters for input `x` and weights `w`, without bias.
    pub fn new(x: [usize; 2], w: [usize; 2]) -> Self {
        Self { x, w, b: None }
    }
    /// With a bias of length `b`.
    pub fn with_bias(self, b: Option<usize>) -> Self {
        Self { b, ..self }
    }
}

/// Fully connected layer, `y = x W^T + b`.
#[derive(Debug)]
pub struct Linear {
    params: LinearParams,
    signature: Signature,
    forward: Option<Plan>,
    backward_data: Option<Plan>,
    backward_weights: Option<Plan>,
}

impl Linear {
    /// The output dims `(n, outputs)`.
    pub fn output_dims(&self) -> [usize; 2] {
        [self.params.x[0], self.params.w[0]]
    }
    fn op(&self, prop: Propagation) -> OpDesc {
        OpDesc::InnerProduct {
            prop,
            src: self.params.x,
            weights: self.params.w,
            bias: self.params.b.is_some(),
            dst: self.output_dims(),
        }
    }
    fn forward(
        &mut self,
        engine: &dyn Engine,
        x: &[f32],
        w: &[f32],
        b: Option<&[f32]>,
        y: &mut [f32],
    ) -> Result<()> {
        check_optional(Role::Bias, self.params.b, b.map(<[f32]>::len))?;
        let op = self.op(Propagation::Forward);
        let signature = &self.signature;
        let plan = plan::ensure(&mut self.forward, || {
            Plan::new(engine, &op, None, signature)
        })?;
        let mut inputs = vec![(Role::Src, x), (Role::Weights, w)];
        inputs.extend(b.map(|b| (Role::Bias, b)));
        plan.execute(engine, &inputs, &mut [(Role::Dst, y)])
    }
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &mut self,
        engine: &dyn Engine,
        x: &[f32],
        w: &[f32],
        gy: &[f32],
        gw: &mut [f32],
        gb: Option<&mut [f32]>,
        gx: Option<&mut [f32]>,
    ) -> Result<()> {
        check_optional(Role::DiffBias, self.params.b, gb.as_ref().map(|gb| gb.len()))?;
        let weights_op = self.op(Propagation::BackwardWeights);
        let data_op = self.op(Propagation::BackwardData);
        let signature = &self.signature;
        let hint = self.forward.as_ref().map(Plan::primitive_desc);
        let plan = plan::ensure(&mut self.backward_weights, || {
            Plan::new(engine, &weights_op, hint, signature)
        })?;
        let mut outputs = vec![(Role::DiffWeights, gw)];
        outputs.extend(gb.map(|gb| (Role::DiffBias, gb)));
        plan.execute(
            engine,
            &[(Role::Src, x), (Role::DiffDst, gy)],
            &mut outputs,
        )?;
        if let Some(gx) = gx {
            let plan = plan::ensure(&mut self.backward_data, || {
                Plan::new(engine, &data_op, hint, signature)
            })?;
            plan.execute(
                engine,
                &[(Role::Weights, w), (Role::DiffDst, gy)],
                &mut [(Role::DiffSrc, gx)],
            )?;
        }
        Ok(())
    }
    /// Computes `y` with the cached layer for `params`, creating it on first use.
    ///
    /// **Errors**
    /// - [`LayerError::InvalidShape`](crate::error::LayerError::InvalidShape)
    /// - [`LayerError::BufferSize`](crate::error::LayerError::BufferSize)
    /// - The engine failed.
    pub fn do_forward(
        factory: &LayerFactory,
        params: &LinearParams,
        x: &[f32],
        w: &[f32],
        b: Option<&[f32]>,
        y: &mut [f32],
    ) -> Result<()> {
        let layer = factory.get_or_create::<Self>(params)?;
        let mut layer = layer.lock();
        layer.forward(factory.engine(), x, w, b, y)
    }
    /// [`do_forward()`](Self::do_forward) without bias.
    pub fn do_forward_no_bias(
        factory: &LayerFactory,
        params: &LinearParams,
        x: &[f32],
        w: &[f32],
        y: &mut [f32],
    ) -> Result<()> {
        let params = params.clone().with_bias(None);
        Self::do_forward(factory, &params, x, w, None, y)
    }
    /// Computes `gw`, `gb`, and unless `first_layer` `gx`, with the cached layer for `params`.
    ///
    /// **Errors**
    /// See [`do_forward()`](Self::do_forward).
    #[allow(clippy::too_many_arguments)]
    pub fn do_backward(
        factory: &LayerFactory,
        params: &LinearParams,
        x: &[f32],
        w: &[f32],
        gy: &[f32],
        gw: &mut [f32],
        gb: Option<&mut [f32]>,
        gx: &mut [f32],
        first_layer: bool,
    ) -> Result<()> {
        let layer = factory.get_or_create::<Self>(params)?;
        let mut layer = layer.lock();
        let gx = if first_layer { None } else { Some(gx) };
        layer.backward(factory.engine(), x, w, gy, gw, gb, gx)
    }
    /// [`do_backward()`](Self::do_backward) without bias.
    #[allow(clippy::too_many_arguments)]
    pub fn do_backward_no_bias(
        factory: &LayerFactory,
        params: &LinearParams,
        x: &[f32],
        w: &[f32],
        gy: &[f32],
        gw: &mut [f32],
        gx: &mut [f32],
        first_layer: bool,
    ) -> Result<()> {
        let params = params.clone().with_bias(None);
        Self::do_backward(factory, &params, x, w, gy, gw, None, gx, first_layer)
    }
}

impl Layer for Linear {
    type Params = LinearParams;
    const KIND: Kind = Kind::Linear;
    fn signature(params: &LinearParams) -> Signature {
        Signature::builder(Self::KIND)
            .dims(&params.x)
            .dims(&params.w)
            .optional_dim(params.b)
            .build()
    }
    fn new(params: &LinearParams) -> Result<Self> {
        let LinearParams { x, w, b } = params;
        positive(Self::KIND, "x", x)?;
        positive(Self::KIND, "w", w)?;
        if x[1] != w[1] {
            return Err(invalid_shape(
                Self::KIND,
                format!("x {x:?} has {} inputs, w {w:?} expects {}", x[1], w[1]),
            ));
        }
        if let Some(b) = b {
            if *b != w[0] {
                return Err(invalid_shape(
                    Self::KIND,
                    format!("bias of length {b} for {} outputs", w[0]),
                ));
            }
        }
        Ok(Self {
            params: params.clone(),
            signature: Self::signature(params),
            forward: None,
            backward_data: None,
            backward_weights: None,
        })
    }
    fn store(factory: &LayerFactory) -> &Store<Self> {
        &factory.linear
    }
    fn params(&self) -> &LinearParams {
        &self.params
    }
    fn forward_plan(&self) -> Option<&Plan> {
        self.forward.as_ref()
    }
    fn is_backward_ready(&self) -> bool {
        self.backward_weights.is_some()
    }
}
