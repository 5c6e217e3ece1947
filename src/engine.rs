//! The math kernel library capability.
//!
//! Layers never compute anything themselves. They describe an operation with an [`OpDesc`], ask an [`Engine`]
//! for a [`PrimitiveDesc`] (which reports the memory layout the primitive wants for each [`Role`]), and execute it
//! over buffers in those layouts.
//!
//! [`HostEngine`] is a reference implementation in Rust.
use crate::{
    error::KernelError,
    memory::{self, MemoryDesc},
};
use std::fmt::Debug;

mod host;
pub use host::{HostEngine, HostEngineBuilder};

/// The role of a buffer in a primitive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum Role {
    /// Input `x`.
    #[display(fmt = "src")]
    Src,
    /// Weights `W`.
    #[display(fmt = "weights")]
    Weights,
    /// Bias `b`.
    #[display(fmt = "bias")]
    Bias,
    /// Output `y`.
    #[display(fmt = "dst")]
    Dst,
    /// Input gradient `gx`.
    #[display(fmt = "diff_src")]
    DiffSrc,
    /// Weight gradient `gW`.
    #[display(fmt = "diff_weights")]
    DiffWeights,
    /// Bias gradient `gb`.
    #[display(fmt = "diff_bias")]
    DiffBias,
    /// Output gradient `gy`.
    #[display(fmt = "diff_dst")]
    DiffDst,
}

impl Role {
    /// The forward role a gradient role shares its layout with.
    pub fn forward(&self) -> Self {
        match self {
            Self::DiffSrc => Self::Src,
            Self::DiffWeights => Self::Weights,
            Self::DiffBias => Self::Bias,
            Self::DiffDst => Self::Dst,
            role => *role,
        }
    }
}

/// Propagation kind of a primitive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::IsVariant)]
pub enum Propagation {
    /// Computes the output.
    Forward,
    /// Computes the gradient of the input.
    BackwardData,
    /// Computes the gradients of the weights and bias.
    BackwardWeights,
}

/// Pooling algorithm.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PoolAlgorithm {
    /// Maximum of the window.
    Max,
    /// Mean of the window, padding included.
    Avg,
}

/// Geometry of a 2d convolution.
///
/// For deconvolutions `src` is the smaller input and `dst` the larger output, weights are `(src channels, dst
/// channels, kh, kw)`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConvDesc {
    /// `(n, c, h, w)`
    pub src: [usize; 4],
    /// Weight dims.
    pub weights: [usize; 4],
    /// Whether there is a bias.
    pub bias: bool,
    /// `(n, c, h, w)`
    pub dst: [usize; 4],
    /// `(y, x)`
    pub strides: [usize; 2],
    /// Top and left padding.
    pub padding_l: [usize; 2],
    /// Bottom and right padding.
    pub padding_r: [usize; 2],
}

/// Geometry of a 2d pooling.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PoolDesc {
    /// The algorithm.
    pub algorithm: PoolAlgorithm,
    /// `(n, c, h, w)`
    pub src: [usize; 4],
    /// `(n, c, h, w)`
    pub dst: [usize; 4],
    /// `(h, w)`
    pub kernel: [usize; 2],
    /// `(y, x)`
    pub strides: [usize; 2],
    /// Top and left padding.
    pub padding_l: [usize; 2],
    /// Bottom and right padding.
    pub padding_r: [usize; 2],
}

/// Describes an operation independent of memory layouts.
#[derive(Clone, Debug, PartialEq)]
pub enum OpDesc {
    /// 2d convolution.
    Convolution(Propagation, ConvDesc),
    /// 2d transposed convolution.
    Deconvolution(Propagation, ConvDesc),
    /// 2d pooling.
    Pooling(Propagation, PoolDesc),
    /// Local response normalization across channels.
    Lrn {
        /// The propagation.
        prop: Propagation,
        /// `(n, c, h, w)`
        src: [usize; 4],
        /// Channels in the window.
        local_size: usize,
        /// Scale of the sum of squares.
        alpha: f64,
        /// Exponent.
        beta: f64,
        /// Offset.
        k: f64,
    },
    /// Softmax along `axis`.
    Softmax {
        /// The propagation.
        prop: Propagation,
        /// Dims of the input.
        dims: Vec<usize>,
        /// The reduced axis.
        axis: usize,
    },
    /// Fully connected `y = x W^T + b`.
    InnerProduct {
        /// The propagation.
        prop: Propagation,
        /// `(n, k)`
        src: [usize; 2],
        /// `(m, k)`
        weights: [usize; 2],
        /// Whether there is a bias.
        bias: bool,
        /// `(n, m)`
        dst: [usize; 2],
    },
    /// Rectified linear unit.
    Relu {
        /// The propagation.
        prop: Propagation,
        /// Dims of the input.
        dims: Vec<usize>,
    },
}

impl OpDesc {
    /// The propagation kind.
    pub fn prop(&self) -> Propagation {
        match self {
            Self::Convolution(prop, _) | Self::Deconvolution(prop, _) | Self::Pooling(prop, _) => {
                *prop
            }
            Self::Lrn { prop, .. }
            | Self::Softmax { prop, .. }
            | Self::InnerProduct { prop, .. }
            | Self::Relu { prop, .. } => *prop,
        }
    }
    /// The same operation with a different propagation.
    pub fn with_prop(&self, prop: Propagation) -> Self {
        let mut op = self.clone();
        match &mut op {
            Self::Convolution(p, _) | Self::Deconvolution(p, _) | Self::Pooling(p, _) => *p = prop,
            Self::Lrn { prop: p, .. }
            | Self::Softmax { prop: p, .. }
            | Self::InnerProduct { prop: p, .. }
            | Self::Relu { prop: p, .. } => *p = prop,
        }
        op
    }
    /// The roles read by the primitive.
    pub fn inputs(&self) -> Vec<Role> {
        use Propagation::*;
        use Role::*;
        let bias = match self {
            Self::Convolution(_, desc) | Self::Deconvolution(_, desc) => desc.bias,
            Self::InnerProduct { bias, .. } => *bias,
            _ => false,
        };
        let weighted = matches!(
            self,
            Self::Convolution(..) | Self::Deconvolution(..) | Self::InnerProduct { .. }
        );
        match (self.prop(), weighted) {
            (Forward, true) if bias => vec![Src, Weights, Bias],
            (Forward, true) => vec![Src, Weights],
            (Forward, false) => vec![Src],
            (BackwardData, true) => vec![Weights, DiffDst],
            (BackwardData, false) if matches!(self, Self::Softmax { .. }) => vec![Dst, DiffDst],
            (BackwardData, false) => vec![Src, DiffDst],
            (BackwardWeights, _) => vec![Src, DiffDst],
        }
    }
    /// The roles written by the primitive.
    pub fn outputs(&self) -> Vec<Role> {
        use Role::*;
        match self.prop() {
            Propagation::Forward => vec![Dst],
            Propagation::BackwardData => vec![DiffSrc],
            Propagation::BackwardWeights => {
                let bias = match self {
                    Self::Convolution(_, desc) | Self::Deconvolution(_, desc) => desc.bias,
                    Self::InnerProduct { bias, .. } => *bias,
                    _ => false,
                };
                if bias {
                    vec![DiffWeights, DiffBias]
                } else {
                    vec![DiffWeights]
                }
            }
        }
    }
}

/// A primitive descriptor.
///
/// The operation plus the memory layout the engine chose for each of its buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimitiveDesc {
    op: OpDesc,
    mds: Vec<(Role, MemoryDesc)>,
}

impl PrimitiveDesc {
    /// Creates a new descriptor, for use by engines.
    pub fn new(op: OpDesc, mds: Vec<(Role, MemoryDesc)>) -> Self {
        Self { op, mds }
    }
    /// The operation.
    pub fn op(&self) -> &OpDesc {
        &self.op
    }
    /// The memory descriptor of `role`.
    pub fn memory_desc(&self, role: Role) -> Option<&MemoryDesc> {
        self.mds
            .iter()
            .find_map(|(r, md)| if *r == role { Some(md) } else { None })
    }
    /// The memory descriptors.
    pub fn memory_descs(&self) -> impl Iterator<Item = &(Role, MemoryDesc)> {
        self.mds.iter()
    }
}

/// Buffers passed to [`Engine::execute()`].
///
/// Buffers are in the layouts of the [`PrimitiveDesc`].
#[derive(Default)]
pub struct ExecArgs<'a> {
    inputs: Vec<(Role, &'a [f32])>,
    outputs: Vec<(Role, &'a mut [f32])>,
}

impl<'a> ExecArgs<'a> {
    /// Adds an input.
    pub fn input(&mut self, role: Role, data: &'a [f32]) -> &mut Self {
        self.inputs.push((role, data));
        self
    }
    /// Adds an output.
    pub fn output(&mut self, role: Role, data: &'a mut [f32]) -> &mut Self {
        self.outputs.push((role, data));
        self
    }
    /// Gets the input `role`.
    ///
    /// **Errors**
    /// [`KernelError::MissingArgument`]
    pub fn get(&self, role: Role) -> Result<&'a [f32], KernelError> {
        self.inputs
            .iter()
            .find_map(|(r, data)| if *r == role { Some(*data) } else { None })
            .ok_or(KernelError::MissingArgument(role))
    }
    /// Removes the output `role`.
    ///
    /// **Errors**
    /// [`KernelError::MissingArgument`]
    pub fn take(&mut self, role: Role) -> Result<&'a mut [f32], KernelError> {
        let index = self
            .outputs
            .iter()
            .position(|(r, _)| *r == role)
            .ok_or(KernelError::MissingArgument(role))?;
        Ok(self.outputs.swap_remove(index).1)
    }
}

/// A math kernel library.
///
/// Implementations must be deterministic: executing the same primitive over the same buffers produces the same
/// result.
pub trait Engine: Debug + Send + Sync + 'static {
    /// Builds a primitive descriptor for `op`.
    ///
    /// Backward primitives may be given the forward descriptor as a `hint`, the engine should then prefer the
    /// layouts already chosen for forward.
    ///
    /// **Errors**
    /// The operation is not supported or is inconsistent.
    fn primitive_desc(
        &self,
        op: &OpDesc,
        hint: Option<&PrimitiveDesc>,
    ) -> Result<PrimitiveDesc, KernelError>;
    /// Executes the primitive.
    ///
    /// Blocks until the outputs are written.
    ///
    /// **Errors**
    /// - An argument is missing or does not match its memory descriptor.
    /// - The kernel failed.
    fn execute(&self, pd: &PrimitiveDesc, args: ExecArgs) -> Result<(), KernelError>;
    /// Reorders `src` into `dst`.
    ///
    /// See [`memory::reorder()`].
    fn reorder(
        &self,
        src_md: &MemoryDesc,
        src: &[f32],
        dst_md: &MemoryDesc,
        dst: &mut [f32],
    ) -> Result<(), KernelError> {
        memory::reorder(src_md, src, dst_md, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_desc(bias: bool) -> ConvDesc {
        ConvDesc {
            src: [1, 1, 4, 4],
            weights: [1, 1, 2, 2],
            bias,
            dst: [1, 1, 3, 3],
            strides: [1, 1],
            padding_l: [0, 0],
            padding_r: [0, 0],
        }
    }

    #[test]
    fn conv_roles() {
        use Role::*;
        let op = OpDesc::Convolution(Propagation::Forward, conv_desc(true));
        assert_eq!(op.inputs(), [Src, Weights, Bias]);
        assert_eq!(op.outputs(), [Dst]);
        let op = op.with_prop(Propagation::BackwardData);
        assert_eq!(op.inputs(), [Weights, DiffDst]);
        assert_eq!(op.outputs(), [DiffSrc]);
        let op = OpDesc::Convolution(Propagation::BackwardWeights, conv_desc(false));
        assert_eq!(op.inputs(), [Src, DiffDst]);
        assert_eq!(op.outputs(), [DiffWeights]);
    }

    #[test]
    fn softmax_backward_reads_dst() {
        let op = OpDesc::Softmax {
            prop: Propagation::BackwardData,
            dims: vec![2, 3],
            axis: 1,
        };
        assert_eq!(op.inputs(), [Role::Dst, Role::DiffDst]);
    }

    #[test]
    fn exec_args() {
        let x = [1f32, 2.];
        let mut y = [0f32; 2];
        let mut args = ExecArgs::default();
        args.input(Role::Src, &x).output(Role::Dst, &mut y);
        assert_eq!(args.get(Role::Src).unwrap(), &x);
        assert!(args.get(Role::Weights).unwrap_err().is_missing_argument());
        args.take(Role::Dst).unwrap()[0] = 1.;
        assert!(args.take(Role::Dst).is_err());
        assert_eq!(y[0], 1.);
    }

    #[test]
    fn gradient_roles_share_forward_layout() {
        assert_eq!(Role::DiffSrc.forward(), Role::Src);
        assert_eq!(Role::DiffDst.forward(), Role::Dst);
        assert_eq!(Role::Weights.forward(), Role::Weights);
    }
}
