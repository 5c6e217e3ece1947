use crate::{
    engine::Role,
    signature::{Kind, Signature},
};
use ndarray::ShapeError;

/// Errors raised by layers and the [`LayerFactory`](crate::factory::LayerFactory).
///
/// Returned wrapped in [`anyhow::Error`], use [`downcast_ref`](anyhow::Error::downcast_ref()) to inspect.
///
/// [`DuplicateKey`](Self::DuplicateKey), [`SignatureMismatch`](Self::SignatureMismatch) and
/// [`BackwardBeforeForward`](Self::BackwardBeforeForward) are contract violations, the caller is broken and the call
/// must not be retried.
#[derive(Clone, Debug, derive_more::IsVariant, thiserror::Error)]
pub enum LayerError {
    /// A layer is already cached for the signature.
    #[error("cannot set {signature}, a layer is already cached for it")]
    DuplicateKey {
        /// The key that was inserted twice.
        signature: Signature,
    },
    /// A layer was set under the signature of other parameters.
    #[error("cannot set a layer for {layer} under {signature}")]
    SignatureMismatch {
        /// The key requested by the caller.
        signature: Signature,
        /// The key of the layer's own parameters.
        layer: Signature,
    },
    /// Backward was requested for a layer that requires a prior forward.
    #[error("backward of {signature} requested before forward")]
    BackwardBeforeForward {
        /// The key of the missing forward.
        signature: Signature,
    },
    /// Shape parameters that no primitive can be built for.
    #[error("invalid {kind} shape: {reason}")]
    InvalidShape {
        /// The operator.
        kind: Kind,
        /// What is wrong.
        reason: String,
    },
    /// A caller buffer does not match the shape of the layer.
    #[error("{role} buffer has {actual} elements, expected {expected}")]
    BufferSize {
        /// The buffer.
        role: Role,
        /// Elements implied by the shape.
        expected: usize,
        /// Elements provided.
        actual: usize,
    },
}

impl LayerError {
    /// Whether the error signals a bug in the caller rather than bad input.
    pub fn is_contract_violation(&self) -> bool {
        self.is_duplicate_key() || self.is_signature_mismatch() || self.is_backward_before_forward()
    }
    pub(crate) fn invalid_shape(kind: Kind, reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            kind,
            reason: reason.into(),
        }
    }
}

/// Errors raised by an [`Engine`](crate::engine::Engine).
#[derive(Clone, Debug, derive_more::IsVariant, thiserror::Error)]
pub enum KernelError {
    /// The engine cannot build or run the primitive.
    #[error("unsupported primitive: {0}")]
    Unsupported(String),
    /// An argument required by the primitive was not provided.
    #[error("missing {0} argument")]
    MissingArgument(Role),
    /// An argument does not match its memory descriptor.
    #[error("{role} argument has {actual} elements, expected {expected}")]
    ArgumentSize {
        /// The argument.
        role: Role,
        /// Elements of the memory descriptor.
        expected: usize,
        /// Elements provided.
        actual: usize,
    },
    /// Memory descriptors that cannot be reordered into each other.
    #[error("cannot reorder {src} into {dst}")]
    Layout {
        /// The source descriptor.
        src: String,
        /// The destination descriptor.
        dst: String,
    },
    /// A buffer could not be viewed with the dims of its descriptor.
    #[error(transparent)]
    Shape(#[from] ShapeError),
}
