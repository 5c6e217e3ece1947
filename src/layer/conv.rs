use super::{check_optional, invalid_shape, plan, positive, Layer, Plan};
use crate::{
    engine::{ConvDesc, Engine, OpDesc, Propagation, Role},
    error::LayerError,
    factory::{LayerFactory, Store},
    signature::{Kind, Signature},
};
use anyhow::Result;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Shape parameters of [`Convolution2D`] and [`DeConvolution2D`].
///
/// Weights are `(out channels, in channels, kh, kw)` for convolution and `(in channels, out channels, kh, kw)`
/// for deconvolution. The output shape is derived from the parameters.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Conv2dParams {
    /// Input dims `(n, c, h, w)`.
    pub x: [usize; 4],
    /// Weight dims.
    pub w: [usize; 4],
    /// Bias length, if any.
    pub b: Option<usize>,
    /// `(h, w)`
    pub kernel: [usize; 2],
    /// `(y, x)`
    pub stride: [usize; 2],
    /// Top and left padding.
    pub pad_l: [usize; 2],
    /// Bottom and right padding.
    pub pad_r: [usize; 2],
}

impl Conv2dParams {
    /// Parameters for input `x` and weights `w`.
    ///
    /// Defaults:
    /// - kernel: the spatial dims of `w`
    /// - stride: 1
    /// - padding: 0
    /// - no bias
    pub fn new(x: [usize; 4], w: [usize; 4]) -> Self {
        Self {
            x,
            w,
            b: None,
            kernel: [w[2], w[3]],
            stride: [1, 1],
            pad_l: [0, 0],
            pad_r: [0, 0],
        }
    }
    /// With a bias of length `b`.
    pub fn with_bias(self, b: Option<usize>) -> Self {
        Self { b, ..self }
    }
    /// With `stride`.
    pub fn with_stride(self, stride: [usize; 2]) -> Self {
        Self { stride, ..self }
    }
    /// With padding, `pad_l` is top / left and `pad_r` bottom / right.
    pub fn with_padding(self, pad_l: [usize; 2], pad_r: [usize; 2]) -> Self {
        Self {
            pad_l,
            pad_r,
            ..self
        }
    }
    fn signature(&self, kind: Kind) -> Signature {
        Signature::builder(kind)
            .dims(&self.x)
            .dims(&self.w)
            .optional_dim(self.b)
            .dims(&self.kernel)
            .dims(&self.stride)
            .dims(&self.pad_l)
            .dims(&self.pad_r)
            .build()
    }
}

/// Computes padding and output sizes the way frameworks with symmetric padding do.
///
/// Convolution output is `(i + 2p - k) / s + 1`, with `cover_all` an extra `s - 1` is added so that every input
/// element is covered by a window. The bottom / right padding is adjusted to yield that output.
///
/// ```
/// # use dnn_layers::layer::ConvGeometry;
/// let params = ConvGeometry::new([2, 2], [1, 1])
///     .with_cover_all(true)
///     .conv2d([1, 3, 6, 6], [8, 3, 3, 3], Some(8))
///     .unwrap();
/// assert_eq!(params.pad_r, [2, 2]);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvGeometry {
    stride: [usize; 2],
    pad: [usize; 2],
    cover_all: bool,
}

impl ConvGeometry {
    /// Geometry with `stride` and symmetric padding `pad`.
    pub fn new(stride: [usize; 2], pad: [usize; 2]) -> Self {
        Self {
            stride,
            pad,
            cover_all: false,
        }
    }
    /// Whether windows cover the whole input.
    pub fn with_cover_all(self, cover_all: bool) -> Self {
        Self { cover_all, ..self }
    }
    /// The convolution output size of `input` with `kernel`.
    pub fn output_size(&self, input: [usize; 2], kernel: [usize; 2]) -> Option<[usize; 2]> {
        let mut output = [0; 2];
        for i in 0..2 {
            let s = self.stride[i];
            let extra = if self.cover_all { s.checked_sub(1)? } else { 0 };
            let padded = self.pad[i]
                .checked_mul(2)?
                .checked_add(input[i])?
                .checked_add(extra)?
                .checked_sub(kernel[i])?;
            output[i] = padded.checked_div(s)? + 1;
        }
        Some(output)
    }
    /// Convolution parameters.
    ///
    /// **Errors**
    /// The kernel is larger than the padded input or the stride is 0.
    pub fn conv2d(&self, x: [usize; 4], w: [usize; 4], b: Option<usize>) -> Result<Conv2dParams> {
        let kernel = [w[2], w[3]];
        let output = self
            .output_size([x[2], x[3]], kernel)
            .ok_or_else(|| invalid_shape(Kind::Conv2d, format!("{self:?} of {x:?} with {w:?}")))?;
        let mut pad_r = [0; 2];
        for i in 0..2 {
            // may be negative without cover_all, which yields the same output as 0
            pad_r[i] = (self.stride[i] * (output[i] - 1) + kernel[i])
                .saturating_sub(x[2 + i].saturating_add(self.pad[i]));
        }
        Ok(Conv2dParams::new(x, w)
            .with_bias(b)
            .with_stride(self.stride)
            .with_padding(self.pad, pad_r))
    }
    /// Deconvolution parameters.
    ///
    /// The output is `s (i - 1) + k - 2p`, with `cover_all` it is reduced by `s - 1`.
    pub fn deconv2d(&self, x: [usize; 4], w: [usize; 4], b: Option<usize>) -> Conv2dParams {
        let mut pad_r = self.pad;
        if self.cover_all {
            for i in 0..2 {
                pad_r[i] = pad_r[i].saturating_add(self.stride[i].saturating_sub(1));
            }
        }
        Conv2dParams::new(x, w)
            .with_bias(b)
            .with_stride(self.stride)
            .with_padding(self.pad, pad_r)
    }
}

/// Shared state of convolution and deconvolution.
#[derive(Debug)]
struct Conv {
    params: Conv2dParams,
    signature: Signature,
    desc: ConvDesc,
    deconv: bool,
    forward: Option<Plan>,
    backward_data: Option<Plan>,
    backward_weights: Option<Plan>,
}

impl Conv {
    fn new(params: &Conv2dParams, deconv: bool) -> Result<Self> {
        let kind = if deconv { Kind::DeConv2d } else { Kind::Conv2d };
        let Conv2dParams {
            x,
            w,
            b,
            kernel,
            stride,
            pad_l,
            pad_r,
        } = params;
        positive(kind, "x", x)?;
        positive(kind, "w", w)?;
        positive(kind, "stride", stride)?;
        if kernel[..] != w[2..] {
            return Err(invalid_shape(
                kind,
                format!("kernel {kernel:?} does not match w {w:?}"),
            ));
        }
        let (in_channels, out_channels) = if deconv { (w[0], w[1]) } else { (w[1], w[0]) };
        if x[1] != in_channels {
            return Err(invalid_shape(
                kind,
                format!("x {x:?} has {} channels, w {w:?} expects {in_channels}", x[1]),
            ));
        }
        if let Some(b) = b {
            if *b != out_channels {
                return Err(invalid_shape(
                    kind,
                    format!("bias of length {b} for {out_channels} output channels"),
                ));
            }
        }
        let mut y = [x[0], out_channels, 0, 0];
        for i in 0..2 {
            let (input, k, s, pl, pr) = (x[2 + i], kernel[i], stride[i], pad_l[i], pad_r[i]);
            let output = if deconv {
                s.checked_mul(input - 1)
                    .and_then(|d| d.checked_add(k))
                    .zip(pl.checked_add(pr))
                    .and_then(|(full, pad)| full.checked_sub(pad))
                    .filter(|output| *output > 0)
            } else {
                input
                    .checked_add(pl)
                    .and_then(|d| d.checked_add(pr))
                    .and_then(|padded| padded.checked_sub(k))
                    .map(|padded| padded / s + 1)
            };
            y[2 + i] = output.ok_or_else(|| {
                invalid_shape(
                    kind,
                    format!("kernel {kernel:?} with padding {pad_l:?} {pad_r:?} over x {x:?}"),
                )
            })?;
        }
        let desc = ConvDesc {
            src: *x,
            weights: *w,
            bias: b.is_some(),
            dst: y,
            strides: *stride,
            padding_l: *pad_l,
            padding_r: *pad_r,
        };
        Ok(Self {
            params: params.clone(),
            signature: params.signature(kind),
            desc,
            deconv,
            forward: None,
            backward_data: None,
            backward_weights: None,
        })
    }
    fn op(&self, prop: Propagation) -> OpDesc {
        if self.deconv {
            OpDesc::Deconvolution(prop, self.desc.clone())
        } else {
            OpDesc::Convolution(prop, self.desc.clone())
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
        if let Some(b) = b {
            inputs.push((Role::Bias, b));
        }
        log::trace!("{signature} forward");
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
        let build_data = gx.is_some() && self.backward_data.is_none();
        let hint = if self.backward_weights.is_none() || build_data {
            let hint = match self.forward.as_ref() {
                Some(forward) => forward.primitive_desc().clone(),
                None => engine.primitive_desc(&self.op(Propagation::Forward), None)?,
            };
            Some(hint)
        } else {
            None
        };
        let weights_op = self.op(Propagation::BackwardWeights);
        let data_op = self.op(Propagation::BackwardData);
        let signature = &self.signature;
        log::trace!("{signature} backward");
        let plan = plan::ensure(&mut self.backward_weights, || {
            Plan::new(engine, &weights_op, hint.as_ref(), signature)
        })?;
        let mut outputs = vec![(Role::DiffWeights, gw)];
        if let Some(gb) = gb {
            outputs.push((Role::DiffBias, gb));
        }
        plan.execute(
            engine,
            &[(Role::Src, x), (Role::DiffDst, gy)],
            &mut outputs,
        )?;
        if let Some(gx) = gx {
            let plan = plan::ensure(&mut self.backward_data, || {
                Plan::new(engine, &data_op, hint.as_ref(), signature)
            })?;
            plan.execute(
                engine,
                &[(Role::Weights, w), (Role::DiffDst, gy)],
                &mut [(Role::DiffSrc, gx)],
            )?;
        }
        Ok(())
    }
}

/// 2d convolution.
///
/// `y = conv(x, W) + b` with weights `(out channels, in channels, kh, kw)`.
#[derive(Debug)]
pub struct Convolution2D {
    conv: Conv,
}

impl Convolution2D {
    /// The output dims `(n, out channels, oh, ow)`.
    pub fn output_dims(&self) -> [usize; 4] {
        self.conv.desc.dst
    }
    /// Computes `y` with the cached layer for `params`, creating it on first use.
    ///
    /// **Errors**
    /// - [`LayerError::InvalidShape`]
    /// - [`LayerError::BufferSize`]
    /// - The engine failed.
    pub fn do_forward(
        factory: &LayerFactory,
        params: &Conv2dParams,
        x: &[f32],
        w: &[f32],
        b: Option<&[f32]>,
        y: &mut [f32],
    ) -> Result<()> {
        let layer = factory.get_or_create::<Self>(params)?;
        let mut layer = layer.lock();
        layer.conv.forward(factory.engine(), x, w, b, y)
    }
    /// [`do_forward()`](Self::do_forward) without bias.
    ///
    /// The bias of `params` is ignored, the layer is cached without bias.
    pub fn do_forward_no_bias(
        factory: &LayerFactory,
        params: &Conv2dParams,
        x: &[f32],
        w: &[f32],
        y: &mut [f32],
    ) -> Result<()> {
        let params = params.clone().with_bias(None);
        Self::do_forward(factory, &params, x, w, None, y)
    }
    /// Computes `gw`, `gb`, and unless `first_layer` `gx`, with the cached layer for `params`.
    ///
    /// Forward is not required to have run.
    ///
    /// **Errors**
    /// See [`do_forward()`](Self::do_forward).
    #[allow(clippy::too_many_arguments)]
    pub fn do_backward(
        factory: &LayerFactory,
        params: &Conv2dParams,
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
        layer.conv.backward(factory.engine(), x, w, gy, gw, gb, gx)
    }
    /// [`do_backward()`](Self::do_backward) without bias.
    #[allow(clippy::too_many_arguments)]
    pub fn do_backward_no_bias(
        factory: &LayerFactory,
        params: &Conv2dParams,
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

impl Layer for Convolution2D {
    type Params = Conv2dParams;
    const KIND: Kind = Kind::Conv2d;
    fn signature(params: &Conv2dParams) -> Signature {
        params.signature(Self::KIND)
    }
    fn new(params: &Conv2dParams) -> Result<Self> {
        Ok(Self {
            conv: Conv::new(params, false)?,
        })
    }
    fn store(factory: &LayerFactory) -> &Store<Self> {
        &factory.conv2d
    }
    fn params(&self) -> &Conv2dParams {
        &self.conv.params
    }
    fn forward_plan(&self) -> Option<&Plan> {
        self.conv.forward.as_ref()
    }
    fn is_backward_ready(&self) -> bool {
        self.conv.backward_weights.is_some()
    }
}

/// 2d transposed convolution.
///
/// Weights are `(in channels, out channels, kh, kw)`. Backward requires that forward has run for the same
/// parameters, on the same [`LayerFactory`].
#[derive(Debug)]
pub struct DeConvolution2D {
    conv: Conv,
}

impl DeConvolution2D {
    /// The output dims `(n, out channels, oh, ow)`.
    pub fn output_dims(&self) -> [usize; 4] {
        self.conv.desc.dst
    }
    /// Computes `y` with the cached layer for `params`, creating it on first use.
    ///
    /// **Errors**
    /// - [`LayerError::InvalidShape`]
    /// - [`LayerError::BufferSize`]
    /// - The engine failed.
    pub fn do_forward(
        factory: &LayerFactory,
        params: &Conv2dParams,
        x: &[f32],
        w: &[f32],
        b: Option<&[f32]>,
        y: &mut [f32],
    ) -> Result<()> {
        let layer = factory.get_or_create::<Self>(params)?;
        let mut layer = layer.lock();
        layer.conv.forward(factory.engine(), x, w, b, y)
    }
    /// [`do_forward()`](Self::do_forward) without bias.
    pub fn do_forward_no_bias(
        factory: &LayerFactory,
        params: &Conv2dParams,
        x: &[f32],
        w: &[f32],
        y: &mut [f32],
    ) -> Result<()> {
        let params = params.clone().with_bias(None);
        Self::do_forward(factory, &params, x, w, None, y)
    }
    /// Computes `gw`, `gb`, and unless `first_layer` `gx`, with the layer cached by
    /// [`do_forward()`](Self::do_forward).
    ///
    /// **Errors**
    /// - [`LayerError::BackwardBeforeForward`]: forward has not run for `params`. Nothing is cached.
    /// - See [`do_forward()`](Self::do_forward).
    #[allow(clippy::too_many_arguments)]
    pub fn do_backward(
        factory: &LayerFactory,
        params: &Conv2dParams,
        x: &[f32],
        w: &[f32],
        gy: &[f32],
        gw: &mut [f32],
        gb: Option<&mut [f32]>,
        gx: &mut [f32],
        first_layer: bool,
    ) -> Result<()> {
        let before_forward = || LayerError::BackwardBeforeForward {
            signature: Self::signature(params),
        };
        let layer = factory.get::<Self>(params).ok_or_else(before_forward)?;
        let mut layer = layer.lock();
        if layer.conv.forward.is_none() {
            return Err(before_forward().into());
        }
        let gx = if first_layer { None } else { Some(gx) };
        layer.conv.backward(factory.engine(), x, w, gy, gw, gb, gx)
    }
    /// [`do_backward()`](Self::do_backward) without bias.
    #[allow(clippy::too_many_arguments)]
    pub fn do_backward_no_bias(
        factory: &LayerFactory,
        params: &Conv2dParams,
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

impl Layer for DeConvolution2D {
    type Params = Conv2dParams;
    const KIND: Kind = Kind::DeConv2d;
    fn signature(params: &Conv2dParams) -> Signature {
        params.signature(Self::KIND)
    }
    fn new(params: &Conv2dParams) -> Result<Self> {
        Ok(Self {
            conv: Conv::new(params, true)?,
        })
    }
    fn store(factory: &LayerFactory) -> &Store<Self> {
        &factory.deconv2d
    }
    fn params(&self) -> &Conv2dParams {
        &self.conv.params
    }
    fn forward_plan(&self) -> Option<&Plan> {
        self.conv.forward.as_ref()
    }
    fn is_backward_ready(&self) -> bool {
        self.conv.backward_weights.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerState;

    fn layer_error(error: anyhow::Error) -> LayerError {
        error.downcast::<LayerError>().unwrap()
    }

    #[test]
    fn conv_output_dims() {
        let params = Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]);
        let conv = Convolution2D::new(&params).unwrap();
        assert_eq!(conv.output_dims(), [1, 1, 3, 3]);
        assert_eq!(conv.state(), LayerState::Uninitialized);
        let params = Conv2dParams::new([2, 3, 7, 7], [4, 3, 3, 3])
            .with_stride([2, 2])
            .with_padding([1, 1], [1, 1]);
        let conv = Convolution2D::new(&params).unwrap();
        assert_eq!(conv.output_dims(), [2, 4, 4, 4]);
    }

    #[test]
    fn deconv_output_dims() {
        let params = Conv2dParams::new([1, 3, 2, 2], [3, 5, 2, 2]).with_stride([2, 2]);
        let deconv = DeConvolution2D::new(&params).unwrap();
        assert_eq!(deconv.output_dims(), [1, 5, 4, 4]);
    }

    #[test]
    fn invalid_shapes() {
        let cases = [
            Conv2dParams::new([1, 2, 4, 4], [1, 1, 2, 2]),
            Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]).with_bias(Some(2)),
            Conv2dParams::new([1, 1, 4, 4], [1, 1, 5, 5]),
            Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]).with_stride([0, 1]),
            Conv2dParams::new([0, 1, 4, 4], [1, 1, 2, 2]),
            Conv2dParams {
                kernel: [3, 3],
                ..Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2])
            },
            Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]).with_padding([usize::MAX, 0], [1, 0]),
        ];
        for params in cases {
            let error = layer_error(Convolution2D::new(&params).unwrap_err());
            assert!(error.is_invalid_shape(), "{params:?}");
        }
        let cases = [
            Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]).with_stride([usize::MAX, 1]),
            Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]).with_padding([usize::MAX, 0], [1, 0]),
        ];
        for params in cases {
            let error = layer_error(DeConvolution2D::new(&params).unwrap_err());
            assert!(error.is_invalid_shape(), "{params:?}");
        }
    }

    #[test]
    fn signature_has_every_field() {
        let params = Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]);
        let signature = Convolution2D::signature(&params);
        assert_eq!(signature.kind(), Kind::Conv2d);
        assert_eq!(
            signature.to_string(),
            "conv2d_I1_I1_I4_I4_I1_I1_I2_I2_Iffffffffffffffff_I2_I2_I1_I1_I0_I0_I0_I0_"
        );
        assert_ne!(
            signature,
            Convolution2D::signature(&params.clone().with_bias(Some(1)))
        );
        assert_ne!(signature, DeConvolution2D::signature(&params));
    }

    #[test]
    fn geometry() {
        let geometry = ConvGeometry::new([1, 1], [0, 0]);
        let params = geometry
            .conv2d([1, 1, 4, 4], [1, 1, 2, 2], None)
            .unwrap();
        assert_eq!(params, Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]));
        let geometry = ConvGeometry::new([2, 2], [0, 0]);
        assert_eq!(geometry.output_size([5, 5], [2, 2]), Some([2, 2]));
        let cover_all = geometry.with_cover_all(true);
        assert_eq!(cover_all.output_size([5, 5], [2, 2]), Some([3, 3]));
        let params = cover_all.conv2d([1, 1, 5, 5], [1, 1, 2, 2], None).unwrap();
        assert_eq!(params.pad_r, [1, 1]);
        let conv = Convolution2D::new(&params).unwrap();
        assert_eq!(conv.output_dims(), [1, 1, 3, 3]);
        assert!(geometry.conv2d([1, 1, 1, 1], [1, 1, 2, 2], None).is_err());
        let huge = ConvGeometry::new([1, 1], [usize::MAX / 2 + 1, 0]);
        assert_eq!(huge.output_size([4, 4], [2, 2]), None);
        assert!(huge.conv2d([1, 1, 4, 4], [1, 1, 2, 2], None).is_err());
    }

    #[test]
    fn deconv_geometry() {
        let params = ConvGeometry::new([2, 2], [1, 1]).deconv2d([1, 2, 3, 3], [2, 4, 4, 4], Some(4));
        let deconv = DeConvolution2D::new(&params).unwrap();
        // 2 * (3 - 1) + 4 - 2
        assert_eq!(deconv.output_dims(), [1, 4, 6, 6]);
    }
}
