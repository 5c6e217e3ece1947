use super::{Engine, ExecArgs, OpDesc, PrimitiveDesc, Role};
use crate::{
    error::KernelError,
    memory::{self, Format, MemoryDesc, BLOCK},
};
use anyhow::Result;
use ndarray::{Array, CowArray, Dimension};
use std::{
    env,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

mod conv;
mod dense;
mod norm;
mod pool;

/// Builder for [`HostEngine`].
#[derive(Clone, Debug)]
pub struct HostEngineBuilder {
    blocked: bool,
    threads: Option<usize>,
}

impl Default for HostEngineBuilder {
    fn default() -> Self {
        Self {
            blocked: true,
            threads: None,
        }
    }
}

impl HostEngineBuilder {
    /// Whether primitives may prefer channel blocked layouts.
    ///
    /// Tensors with at least 8 channels are blocked by 8, forcing reorders of plain caller buffers. Defaults to
    /// true.
    pub fn blocked(self, blocked: bool) -> Self {
        Self { blocked, ..self }
    }
    /// Runs kernels on a dedicated thread pool with `threads` threads.
    ///
    /// By default kernels run on the global rayon pool.
    pub fn threads(self, threads: Option<usize>) -> Self {
        Self { threads, ..self }
    }
    /// Builds the engine.
    ///
    /// **Errors**
    /// The thread pool could not be created.
    pub fn build(self) -> Result<HostEngine> {
        let thread_pool = if let Some(threads) = self.threads {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("dnn-layers-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(HostEngine {
            blocked: self.blocked,
            thread_pool,
            descs_built: AtomicUsize::default(),
        })
    }
}

/// Reference [`Engine`] implemented with [`ndarray`] and [`rayon`].
#[derive(Debug)]
pub struct HostEngine {
    blocked: bool,
    thread_pool: Option<rayon::ThreadPool>,
    descs_built: AtomicUsize,
}

impl Default for HostEngine {
    fn default() -> Self {
        Self {
            blocked: true,
            thread_pool: None,
            descs_built: AtomicUsize::default(),
        }
    }
}

impl HostEngine {
    /// A builder for creating the engine.
    pub fn builder() -> HostEngineBuilder {
        HostEngineBuilder::default()
    }
    /// Creates an engine configured by the environment.
    ///
    /// - `DNN_LAYERS_BLOCKED`: "0" or "false" disables blocked layouts.
    /// - `DNN_LAYERS_THREADS`: number of threads of a dedicated pool.
    ///
    /// **Errors**
    /// - `DNN_LAYERS_THREADS` is not an integer.
    /// - The thread pool could not be created.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Ok(var) = env::var("DNN_LAYERS_BLOCKED") {
            builder = builder.blocked(!(var == "0" || var.eq_ignore_ascii_case("false")));
        }
        if let Ok(var) = env::var("DNN_LAYERS_THREADS") {
            builder = builder.threads(Some(usize::from_str(&var)?));
        }
        builder.build()
    }
    /// Whether blocked layouts are enabled.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }
    /// The number of primitive descriptors built so far.
    pub fn primitive_descs_built(&self) -> usize {
        self.descs_built.load(Ordering::SeqCst)
    }
    fn preferred(&self, op: &OpDesc, role: Role) -> Result<MemoryDesc, KernelError> {
        let dims = logical_dims(op, role);
        let spatial = matches!(
            op,
            OpDesc::Convolution(..)
                | OpDesc::Deconvolution(..)
                | OpDesc::Pooling(..)
                | OpDesc::Lrn { .. }
        );
        match role.forward() {
            Role::Bias => MemoryDesc::new(dims, Format::X),
            Role::Weights if dims.len() == 4 => {
                let format = if self.blocked && dims[0] >= BLOCK && dims[1] >= BLOCK {
                    Format::OIhw8i8o
                } else {
                    Format::Oihw
                };
                MemoryDesc::new(dims, format)
            }
            Role::Weights => MemoryDesc::weights(dims),
            _ if spatial && self.blocked && dims[1] >= BLOCK => {
                MemoryDesc::new(dims, Format::NChw8c)
            }
            _ => MemoryDesc::activations(dims),
        }
    }
    fn run(&self, pd: &PrimitiveDesc, args: ExecArgs) -> Result<(), KernelError> {
        for role in pd.op().inputs() {
            let md = memory_desc(pd, role)?;
            let actual = args.get(role)?.len();
            if actual != md.len() {
                return Err(KernelError::ArgumentSize {
                    role,
                    expected: md.len(),
                    actual,
                });
            }
        }
        match pd.op() {
            OpDesc::Convolution(prop, desc) => conv::convolution(pd, *prop, desc, args),
            OpDesc::Deconvolution(prop, desc) => conv::deconvolution(pd, *prop, desc, args),
            OpDesc::Pooling(prop, desc) => pool::pooling(pd, *prop, desc, args),
            OpDesc::Lrn {
                prop,
                local_size,
                alpha,
                beta,
                k,
                ..
            } => norm::lrn(pd, *prop, *local_size, *alpha, *beta, *k, args),
            OpDesc::Softmax { prop, axis, .. } => norm::softmax(pd, *prop, *axis, args),
            OpDesc::InnerProduct { prop, .. } => dense::inner_product(pd, *prop, args),
            OpDesc::Relu { prop, .. } => dense::relu(pd, *prop, args),
        }
    }
}

impl Engine for HostEngine {
    fn primitive_desc(
        &self,
        op: &OpDesc,
        hint: Option<&PrimitiveDesc>,
    ) -> Result<PrimitiveDesc, KernelError> {
        match op {
            OpDesc::Convolution(_, desc) => conv::check(desc, false)?,
            OpDesc::Deconvolution(_, desc) => conv::check(desc, true)?,
            OpDesc::Pooling(_, desc) => pool::check(desc)?,
            OpDesc::Lrn { local_size, .. } => {
                if *local_size == 0 {
                    return Err(KernelError::Unsupported("lrn with local_size 0".into()));
                }
            }
            OpDesc::Softmax { dims, axis, .. } => {
                if *axis >= dims.len() {
                    return Err(KernelError::Unsupported(format!(
                        "softmax axis {axis} of {dims:?}"
                    )));
                }
            }
            OpDesc::InnerProduct {
                src, weights, dst, ..
            } => dense::check(*src, *weights, *dst)?,
            OpDesc::Relu { .. } => (),
        }
        let mut mds = Vec::new();
        for role in op.inputs().into_iter().chain(op.outputs()) {
            let dims = logical_dims(op, role);
            let md = match hint.and_then(|hint| hint.memory_desc(role.forward())) {
                Some(md) if md.dims() == dims.as_slice() => md.clone(),
                _ => self.preferred(op, role)?,
            };
            mds.push((role, md));
        }
        self.descs_built.fetch_add(1, Ordering::SeqCst);
        log::trace!(
            "built {:?} {} primitive: {}",
            op.prop(),
            op_name(op),
            mds.iter()
                .map(|(role, md)| format!("{role}={md}"))
                .collect::<Vec<_>>()
                .join(" ")
        );
        Ok(PrimitiveDesc::new(op.clone(), mds))
    }
    fn execute(&self, pd: &PrimitiveDesc, args: ExecArgs) -> Result<(), KernelError> {
        if let Some(thread_pool) = self.thread_pool.as_ref() {
            thread_pool.install(move || self.run(pd, args))
        } else {
            self.run(pd, args)
        }
    }
}

fn op_name(op: &OpDesc) -> &'static str {
    match op {
        OpDesc::Convolution(..) => "convolution",
        OpDesc::Deconvolution(..) => "deconvolution",
        OpDesc::Pooling(..) => "pooling",
        OpDesc::Lrn { .. } => "lrn",
        OpDesc::Softmax { .. } => "softmax",
        OpDesc::InnerProduct { .. } => "inner_product",
        OpDesc::Relu { .. } => "relu",
    }
}

fn logical_dims(op: &OpDesc, role: Role) -> Vec<usize> {
    use Role::*;
    let role = role.forward();
    match op {
        OpDesc::Convolution(_, desc) | OpDesc::Deconvolution(_, desc) => match role {
            Src => desc.src.to_vec(),
            Weights => desc.weights.to_vec(),
            Bias => vec![desc.dst[1]],
            _ => desc.dst.to_vec(),
        },
        OpDesc::Pooling(_, desc) => match role {
            Src => desc.src.to_vec(),
            _ => desc.dst.to_vec(),
        },
        OpDesc::Lrn { src, .. } => src.to_vec(),
        OpDesc::Softmax { dims, .. } | OpDesc::Relu { dims, .. } => dims.clone(),
        OpDesc::InnerProduct {
            src, weights, dst, ..
        } => match role {
            Src => src.to_vec(),
            Weights => weights.to_vec(),
            Bias => vec![weights[0]],
            _ => dst.to_vec(),
        },
    }
}

fn memory_desc(pd: &PrimitiveDesc, role: Role) -> Result<&MemoryDesc, KernelError> {
    pd.memory_desc(role)
        .ok_or(KernelError::MissingArgument(role))
}

/// Views the input `role` with its logical dims, reordering blocked data into a plain copy.
fn load<'a, D: Dimension>(
    pd: &PrimitiveDesc,
    args: &ExecArgs<'a>,
    role: Role,
) -> Result<CowArray<'a, f32, D>, KernelError> {
    let md = memory_desc(pd, role)?;
    let data = args.get(role)?;
    if md.is_plain() {
        let view = ndarray::ArrayView::from_shape(md.dims(), data)?.into_dimensionality()?;
        Ok(view.into())
    } else {
        let plain = md.to_plain();
        let mut output = vec![0f32; plain.len()];
        memory::reorder(md, data, &plain, &mut output)?;
        let array = Array::from_shape_vec(md.dims(), output)?.into_dimensionality()?;
        Ok(array.into())
    }
}

/// Writes `array` into the output `role` in the layout of the primitive.
fn store<D: Dimension>(
    pd: &PrimitiveDesc,
    args: &mut ExecArgs,
    role: Role,
    array: Array<f32, D>,
) -> Result<(), KernelError> {
    let md = memory_desc(pd, role)?;
    let output = args.take(role)?;
    if output.len() != md.len() {
        return Err(KernelError::ArgumentSize {
            role,
            expected: md.len(),
            actual: output.len(),
        });
    }
    let array = array.as_standard_layout();
    let data = array.as_slice().ok_or_else(|| KernelError::Layout {
        src: format!("strided {:?}", array.shape()),
        dst: md.to_string(),
    })?;
    memory::reorder(&md.to_plain(), data, md, output)
}
