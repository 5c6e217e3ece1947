/*!
# dnn_layers
Shape-keyed caching of forward and backward deep learning primitives.

Setting up a primitive (choosing memory layouts, building a primitive descriptor, allocating scratch buffers for
reorders) is expensive relative to executing it, and networks execute the same shapes over and over. A
[`LayerFactory`](factory::LayerFactory) caches one layer per distinct [`Signature`](signature::Signature), layers build
their [`Plan`](layer::Plan)s on first use and reuse them afterwards.

Layers:
- [`Convolution2D`](layer::Convolution2D) and [`DeConvolution2D`](layer::DeConvolution2D)
- [`MaxPool`](layer::MaxPool) and [`AvgPool`](layer::AvgPool)
- [`Lrn`](layer::Lrn)
- [`Softmax2D`](layer::Softmax2D) and [`Softmax4D`](layer::Softmax4D)
- [`Linear`](layer::Linear)
- [`Relu`](layer::Relu) and [`Relu4d`](layer::Relu4d)

Primitives are executed by an [`Engine`](engine::Engine). The [`HostEngine`](engine::HostEngine) runs on the CPU with
[`ndarray`] and [`rayon`], optionally with channel blocked layouts.

```
# fn main() -> anyhow::Result<()> {
use dnn_layers::{factory::LayerFactory, layer::{Conv2dParams, Convolution2D}};

let factory = LayerFactory::default();
let params = Conv2dParams::new([1, 1, 4, 4], [1, 1, 2, 2]);
let x = vec![1f32; 16];
let w = vec![1f32; 4];
let mut y = vec![0f32; 9];
Convolution2D::do_forward_no_bias(&factory, &params, &x, &w, &mut y)?;
assert_eq!(y, vec![4f32; 9]);
# Ok(())
# }
```

# Configuration
[`LayerFactory::new()`](factory::LayerFactory::new) and [`LayerFactory::global()`](factory::LayerFactory::global)
read:
- DNN_LAYERS_BLOCKED: "0" or "false" disables blocked layouts.
- DNN_LAYERS_THREADS: The number of threads of a dedicated thread pool, by default the global [`rayon`] pool is used.

# Logging
Uses the [`log`] facade. Cache inserts and plan creation are logged at debug, cache hits at trace.
*/
#![cfg_attr(doc_cfg, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
/// Errors.
pub mod error;
pub mod factory;
pub mod layer;
pub mod memory;
pub mod signature;

/// Result.
pub mod result {
    /// Result, see [`anyhow::Result`].
    pub use anyhow::Result;
}

#[doc(inline)]
pub use error::{KernelError, LayerError};
#[doc(inline)]
pub use factory::LayerFactory;
