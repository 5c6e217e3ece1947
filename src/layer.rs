//! Layers.
//!
//! A layer owns the setup state of one operator for one fixed shape: the validated parameters and lazily built
//! [`Plan`]s for forward and backward. Layers are created and cached by the [`LayerFactory`], callers use the
//! associated `do_forward` / `do_backward` functions of each layer.
//!
//! Forward and backward setup are independent, a layer may be backward ready before it has run forward, except
//! [`DeConvolution2D`], which fails with
//! [`LayerError::BackwardBeforeForward`](crate::error::LayerError::BackwardBeforeForward).
use crate::{
    engine::Role,
    error::LayerError,
    factory::{LayerFactory, Store},
    signature::{Kind, Signature},
};
use anyhow::Result;
use std::fmt::Debug;

mod conv;
pub use conv::{Conv2dParams, ConvGeometry, Convolution2D, DeConvolution2D};

mod linear;
pub use linear::{Linear, LinearParams};

mod lrn;
pub use lrn::{Lrn, LrnParams};

mod plan;
pub use plan::Plan;

mod pool;
pub use pool::{AvgPool, MaxPool, Pool2dParams, PoolAvg, PoolBase, PoolKind, PoolMax};

mod relu;
pub use relu::{Relu, Relu4d, ReluNd};

mod softmax;
pub use softmax::{Softmax, Softmax2D, Softmax4D, SoftmaxParams};

mod sealed {
    pub trait PoolKindBase {}
}
use sealed::PoolKindBase;

/// Setup state of a layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::IsVariant)]
pub enum LayerState {
    /// Neither forward nor backward has been set up.
    Uninitialized,
    /// Forward has been set up.
    ForwardReady,
    /// Backward has been set up.
    BackwardReady,
    /// Both forward and backward have been set up.
    Ready,
}

/// A cached layer.
pub trait Layer: Sized + Send + 'static {
    /// Shape parameters, everything that goes into the [`Signature`].
    type Params: Clone + Debug + Send + Sync;
    /// The operator kind.
    const KIND: Kind;
    /// The cache key of `params`.
    fn signature(params: &Self::Params) -> Signature;
    /// Validates `params` and creates an uninitialized layer.
    ///
    /// **Errors**
    /// [`LayerError::InvalidShape`]
    fn new(params: &Self::Params) -> Result<Self>;
    /// The store of this layer type in `factory`.
    fn store(factory: &LayerFactory) -> &Store<Self>;
    /// The parameters.
    fn params(&self) -> &Self::Params;
    /// The forward plan, if forward has been set up.
    fn forward_plan(&self) -> Option<&Plan>;
    /// Whether backward has been set up.
    fn is_backward_ready(&self) -> bool;
    /// The setup state.
    fn state(&self) -> LayerState {
        match (self.forward_plan().is_some(), self.is_backward_ready()) {
            (false, false) => LayerState::Uninitialized,
            (true, false) => LayerState::ForwardReady,
            (false, true) => LayerState::BackwardReady,
            (true, true) => LayerState::Ready,
        }
    }
    /// Roles reordered by forward, if forward has been set up.
    fn forward_reorders(&self) -> Option<Vec<Role>> {
        self.forward_plan().map(Plan::reorders)
    }
}

/// Checks that an optional buffer is given iff the layer expects it.
fn check_optional(
    role: Role,
    expected: Option<usize>,
    actual: Option<usize>,
) -> Result<(), LayerError> {
    match (expected, actual) {
        (Some(_), Some(_)) | (None, None) => Ok(()),
        (expected, actual) => Err(LayerError::BufferSize {
            role,
            expected: expected.unwrap_or(0),
            actual: actual.unwrap_or(0),
        }),
    }
}

fn invalid_shape(kind: Kind, reason: impl Into<String>) -> anyhow::Error {
    LayerError::invalid_shape(kind, reason).into()
}

fn positive(kind: Kind, what: &str, dims: &[usize]) -> Result<()> {
    if dims.iter().any(|d| *d == 0) {
        return Err(invalid_shape(kind, format!("{what} {dims:?} must be positive")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_buffers() {
        check_optional(Role::Bias, Some(3), Some(3)).unwrap();
        check_optional(Role::Bias, None, None).unwrap();
        let error = check_optional(Role::Bias, Some(3), None).unwrap_err();
        assert!(matches!(
            error,
            LayerError::BufferSize {
                role: Role::Bias,
                expected: 3,
                actual: 0
            }
        ));
        assert!(check_optional(Role::DiffBias, None, Some(2)).is_err());
    }

    #[test]
    fn zero_dims_are_invalid() {
        let error = positive(Kind::Relu, "dims", &[1, 0]).unwrap_err();
        assert!(error
            .downcast_ref::<LayerError>()
            .unwrap()
            .is_invalid_shape());
    }
}
