//! Memory descriptors and reorders.
//!
//! Caller buffers are always plain, row major (`x`, `nc`, `oi`, `nchw`, `oihw`). Primitives may prefer a blocked
//! format, where channels are grouped by 8 and padded with zeros, in which case the buffer is reordered before and
//! after execution.
use crate::error::KernelError;
use ndarray::{Dimension, IntoDimension, IxDyn};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Channel block size of blocked formats.
pub const BLOCK: usize = 8;

const fn div_up(a: usize, b: usize) -> usize {
    a / b + (a % b != 0) as usize
}

const fn round_up(a: usize, b: usize) -> usize {
    div_up(a, b) * b
}

/// Physical layout of a buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    /// 1d.
    #[display(fmt = "x")]
    X,
    /// 2d activations.
    #[display(fmt = "nc")]
    Nc,
    /// 2d weights.
    #[display(fmt = "oi")]
    Oi,
    /// 4d activations.
    #[display(fmt = "nchw")]
    Nchw,
    /// 4d activations, channels blocked by 8.
    #[display(fmt = "nChw8c")]
    NChw8c,
    /// 4d weights.
    #[display(fmt = "oihw")]
    Oihw,
    /// 4d weights, output and input channels blocked by 8.
    #[display(fmt = "OIhw8i8o")]
    OIhw8i8o,
}

impl Format {
    /// The number of dimensions.
    pub fn ndim(&self) -> usize {
        match self {
            Self::X => 1,
            Self::Nc | Self::Oi => 2,
            Self::Nchw | Self::NChw8c | Self::Oihw | Self::OIhw8i8o => 4,
        }
    }
    /// Whether channels are blocked.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::NChw8c | Self::OIhw8i8o)
    }
}

/// Logical dimensions and physical [`Format`] of a buffer.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MemoryDesc {
    dims: IxDyn,
    format: Format,
}

impl MemoryDesc {
    /// Creates a new descriptor.
    ///
    /// **Errors**
    /// The dimensionality of `dims` does not match `format`.
    pub fn new<E>(dims: E, format: Format) -> Result<Self, KernelError>
    where
        E: IntoDimension,
    {
        let dims = dims.into_dimension().into_dyn();
        if dims.ndim() != format.ndim() {
            return Err(KernelError::Unsupported(format!(
                "{format} memory with dims {:?}",
                dims.slice()
            )));
        }
        Ok(Self { dims, format })
    }
    /// Plain activation layout for `dims` (`x`, `nc`, or `nchw`).
    ///
    /// **Errors**
    /// Only 1, 2, and 4 dimensions are supported.
    pub fn activations<E>(dims: E) -> Result<Self, KernelError>
    where
        E: IntoDimension,
    {
        let dims = dims.into_dimension().into_dyn();
        let format = match dims.ndim() {
            1 => Format::X,
            2 => Format::Nc,
            4 => Format::Nchw,
            ndim => {
                return Err(KernelError::Unsupported(format!(
                    "{ndim} dimensional activations"
                )))
            }
        };
        Ok(Self { dims, format })
    }
    /// Plain weights layout for `dims` (`oi` or `oihw`).
    ///
    /// **Errors**
    /// Only 2 and 4 dimensions are supported.
    pub fn weights<E>(dims: E) -> Result<Self, KernelError>
    where
        E: IntoDimension,
    {
        let dims = dims.into_dimension().into_dyn();
        let format = match dims.ndim() {
            2 => Format::Oi,
            4 => Format::Oihw,
            ndim => {
                return Err(KernelError::Unsupported(format!(
                    "{ndim} dimensional weights"
                )))
            }
        };
        Ok(Self { dims, format })
    }
    /// The logical dimensions.
    pub fn dims(&self) -> &[usize] {
        self.dims.slice()
    }
    /// The format.
    pub fn format(&self) -> Format {
        self.format
    }
    /// The plain row major descriptor with the same dims.
    pub fn to_plain(&self) -> Self {
        let format = match self.format {
            Format::NChw8c => Format::Nchw,
            Format::OIhw8i8o => Format::Oihw,
            format => format,
        };
        Self {
            dims: self.dims.clone(),
            format,
        }
    }
    /// Whether the format is plain row major.
    pub fn is_plain(&self) -> bool {
        !self.format.is_blocked()
    }
    /// The number of logical elements.
    pub fn size(&self) -> usize {
        self.dims.size()
    }
    /// The number of physical elements, including block padding.
    pub fn len(&self) -> usize {
        let d = self.dims.slice();
        match self.format {
            Format::NChw8c => d[0] * round_up(d[1], BLOCK) * d[2] * d[3],
            Format::OIhw8i8o => round_up(d[0], BLOCK) * round_up(d[1], BLOCK) * d[2] * d[3],
            _ => self.size(),
        }
    }
    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The physical offset of a 4d logical index, the descriptor must be 4 dimensional.
    pub(crate) fn offset4(&self, [a, b, h, w]: [usize; 4]) -> usize {
        let d = self.dims.slice();
        let (dh, dw) = (d[2], d[3]);
        match self.format {
            Format::NChw8c => {
                let cb = div_up(d[1], BLOCK);
                (((a * cb + b / BLOCK) * dh + h) * dw + w) * BLOCK + b % BLOCK
            }
            Format::OIhw8i8o => {
                let ib = div_up(d[1], BLOCK);
                ((((a / BLOCK) * ib + b / BLOCK) * dh + h) * dw + w) * BLOCK * BLOCK
                    + (b % BLOCK) * BLOCK
                    + a % BLOCK
            }
            _ => ((a * d[1] + b) * dh + h) * dw + w,
        }
    }
    /// The physical offset of a logical index.
    ///
    /// `None` if `index` does not have one value per dimension.
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.dims.ndim() {
            return None;
        }
        let offset = match index {
            [a, b, h, w] => self.offset4([*a, *b, *h, *w]),
            _ => index
                .iter()
                .zip(self.dims.slice())
                .fold(0, |offset, (i, d)| offset * d + i),
        };
        Some(offset)
    }
    /// Whether each element of the outer dimension is stored contiguously.
    fn outer_contiguous(&self) -> bool {
        !matches!(self.format, Format::OIhw8i8o)
    }
}

impl Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{:?}", self.format, self.dims.slice())
    }
}

/// Copies `src` into `dst`, converting between the formats of the descriptors.
///
/// Block padding of `dst` is zeroed.
///
/// **Errors**
/// - The logical dimensions differ.
/// - A buffer does not match its descriptor.
pub fn reorder(
    src_md: &MemoryDesc,
    src: &[f32],
    dst_md: &MemoryDesc,
    dst: &mut [f32],
) -> Result<(), KernelError> {
    if src_md.dims != dst_md.dims {
        return Err(KernelError::Layout {
            src: src_md.to_string(),
            dst: dst_md.to_string(),
        });
    }
    if src.len() != src_md.len() || dst.len() != dst_md.len() {
        return Err(KernelError::Layout {
            src: format!("{src_md} ({} elements)", src.len()),
            dst: format!("{dst_md} ({} elements)", dst.len()),
        });
    }
    if src_md.format == dst_md.format {
        dst.copy_from_slice(src);
        return Ok(());
    }
    if dst_md.format.is_blocked() {
        dst.fill(0.);
    }
    let dims = src_md.dims.slice();
    if dims.len() == 4 && dst_md.outer_contiguous() && !dst.is_empty() {
        let outer = dst_md.len() / dims[0];
        let (channels, height, width) = (dims[1], dims[2], dims[3]);
        dst.par_chunks_mut(outer).enumerate().for_each(|(n, dst)| {
            for c in 0..channels {
                for h in 0..height {
                    for w in 0..width {
                        dst[dst_md.offset4([0, c, h, w])] = src[src_md.offset4([n, c, h, w])];
                    }
                }
            }
        });
    } else {
        for index in ndarray::indices(src_md.dims.clone()) {
            let index = index.slice();
            let offsets = dst_md.offset(index).zip(src_md.offset(index));
            let (dst_offset, src_offset) = offsets.ok_or_else(|| KernelError::Layout {
                src: src_md.to_string(),
                dst: dst_md.to_string(),
            })?;
            dst[dst_offset] = src[src_offset];
        }
    }
    Ok(())
}
