//! Canonical cache keys.
//!
//! A [`Signature`] is the operator [`Kind`] followed by every shape parameter of an invocation, in a fixed order.
//! Each value is stored behind a type tag with a fixed width, so two different parameter tuples never encode to the
//! same bytes, and an integer `5` never equals a float `5.0`. Dimensions are unsigned and tagged apart from integers.
use std::fmt::{self, Debug, Display};

const INT_TAG: u8 = b'I';
const FLOAT_TAG: u8 = b'F';
const DOUBLE_TAG: u8 = b'D';
const DIM_TAG: u8 = b'U';

/// Operator kinds.
///
/// Each kind has its own store in the [`LayerFactory`](crate::factory::LayerFactory).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum Kind {
    /// [`Relu`](crate::layer::Relu)
    #[display(fmt = "relu")]
    Relu,
    /// [`Relu4d`](crate::layer::Relu4d)
    #[display(fmt = "relu4d")]
    Relu4d,
    /// [`MaxPool`](crate::layer::MaxPool)
    #[display(fmt = "maxpool")]
    MaxPool,
    /// [`AvgPool`](crate::layer::AvgPool)
    #[display(fmt = "avgpool")]
    AvgPool,
    /// [`Lrn`](crate::layer::Lrn)
    #[display(fmt = "lrn")]
    Lrn,
    /// [`Softmax2D`](crate::layer::Softmax2D)
    #[display(fmt = "softmax2d")]
    Softmax2d,
    /// [`Softmax4D`](crate::layer::Softmax4D)
    #[display(fmt = "softmax4d")]
    Softmax4d,
    /// [`Convolution2D`](crate::layer::Convolution2D)
    #[display(fmt = "conv2d")]
    Conv2d,
    /// [`DeConvolution2D`](crate::layer::DeConvolution2D)
    #[display(fmt = "deconv2d")]
    DeConv2d,
    /// [`Linear`](crate::layer::Linear)
    #[display(fmt = "linear")]
    Linear,
}

impl Kind {
    /// Prefix of signatures of this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Relu => "relu_",
            Self::Relu4d => "relu4d_",
            Self::MaxPool => "maxpool_",
            Self::AvgPool => "avgpool_",
            Self::Lrn => "lrn_",
            Self::Softmax2d => "softmax2d_",
            Self::Softmax4d => "softmax4d_",
            Self::Conv2d => "conv2d_",
            Self::DeConv2d => "deconv2d_",
            Self::Linear => "linear_",
        }
    }
}

/// The key of a cached layer.
///
/// Built with [`Signature::builder()`]. Immutable once built.
///
/// Displays as the kind prefix followed by one `<tag><value>_` group per parameter, ie `relu_I10_` (integers are hex).
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Signature {
    kind: Kind,
    bytes: Vec<u8>,
}

impl Signature {
    /// Starts a signature of `kind`.
    pub fn builder(kind: Kind) -> SignatureBuilder {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(kind.prefix().as_bytes());
        SignatureBuilder { kind, bytes }
    }
    /// The operator kind.
    pub fn kind(&self) -> Kind {
        self.kind
    }
    /// The encoded key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
    fn values(&self) -> Values {
        Values {
            bytes: &self.bytes[self.kind.prefix().len()..],
        }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.kind.prefix())?;
        for value in self.values() {
            match value {
                Value::Int(x) => write!(f, "I{x:x}_")?,
                Value::Dim(x) => write!(f, "I{x:x}_")?,
                Value::Float(x) => write!(f, "F{x}_")?,
                Value::Double(x) => write!(f, "D{x}_")?,
            }
        }
        Ok(())
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Value {
    Int(i64),
    Dim(u64),
    Float(f32),
    Double(f64),
}

struct Values<'a> {
    bytes: &'a [u8],
}

impl Iterator for Values<'_> {
    type Item = Value;
    fn next(&mut self) -> Option<Value> {
        let (tag, rest) = self.bytes.split_first()?;
        let width = match *tag {
            FLOAT_TAG => 4,
            INT_TAG | DIM_TAG | DOUBLE_TAG => 8,
            _ => return None,
        };
        let (x, rest) = rest.split_at(width.min(rest.len()));
        let value = match *tag {
            INT_TAG => Value::Int(i64::from_le_bytes(x.try_into().ok()?)),
            DIM_TAG => Value::Dim(u64::from_le_bytes(x.try_into().ok()?)),
            FLOAT_TAG => Value::Float(f32::from_le_bytes(x.try_into().ok()?)),
            _ => Value::Double(f64::from_le_bytes(x.try_into().ok()?)),
        };
        self.bytes = rest;
        Some(value)
    }
}

/// Builder for [`Signature`].
///
/// Values are appended in call order, the order is part of the key.
#[derive(Debug)]
pub struct SignatureBuilder {
    kind: Kind,
    bytes: Vec<u8>,
}

impl SignatureBuilder {
    /// Appends an integer.
    pub fn int(mut self, x: i64) -> Self {
        self.bytes.push(INT_TAG);
        self.bytes.extend_from_slice(&x.to_le_bytes());
        self
    }
    /// Appends a dimension.
    ///
    /// Dimensions are tagged apart from integers, so no dimension collides with a negative integer.
    pub fn dim(mut self, d: usize) -> Self {
        self.bytes.push(DIM_TAG);
        self.bytes.extend_from_slice(&(d as u64).to_le_bytes());
        self
    }
    /// Appends each of `dims`.
    pub fn dims(self, dims: &[usize]) -> Self {
        dims.iter().fold(self, |builder, d| builder.dim(*d))
    }
    /// Appends an optional dimension, `None` is encoded as the integer `-1`.
    pub fn optional_dim(self, dim: Option<usize>) -> Self {
        match dim {
            Some(d) => self.dim(d),
            None => self.int(-1),
        }
    }
    /// Appends a single precision float.
    ///
    /// Floats are compared by bits, `0.0` and `-0.0` are different keys.
    pub fn float(mut self, x: f32) -> Self {
        self.bytes.push(FLOAT_TAG);
        self.bytes.extend_from_slice(&x.to_le_bytes());
        self
    }
    /// Appends a double precision float.
    pub fn double(mut self, x: f64) -> Self {
        self.bytes.push(DOUBLE_TAG);
        self.bytes.extend_from_slice(&x.to_le_bytes());
        self
    }
    /// Finishes the signature.
    pub fn build(self) -> Signature {
        Signature {
            kind: self.kind,
            bytes: self.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_key(values: [i64; 17]) -> Signature {
        values
            .into_iter()
            .fold(Signature::builder(Kind::Conv2d), SignatureBuilder::int)
            .build()
    }

    #[test]
    fn deterministic() {
        let build = || {
            Signature::builder(Kind::Lrn)
                .dims(&[2, 3, 4, 5])
                .int(5)
                .double(1.)
                .double(1e-4)
                .double(0.75)
                .build()
        };
        let (a, b) = (build(), build());
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn single_field_changes_key() {
        let base = [1, 1, 4, 4, 1, 1, 2, 2, 1, 2, 2, 1, 1, 0, 0, 0, 0];
        let key = conv_key(base);
        for i in 0..base.len() {
            let mut values = base;
            values[i] += 1;
            assert_ne!(conv_key(values), key, "field {i}");
        }
    }

    #[test]
    fn int_float_double_distinct() {
        let int = Signature::builder(Kind::Relu).int(5).build();
        let float = Signature::builder(Kind::Relu).float(5.).build();
        let double = Signature::builder(Kind::Relu).double(5.).build();
        assert_ne!(int, float);
        assert_ne!(int, double);
        assert_ne!(float, double);
    }

    #[test]
    fn kind_is_part_of_key() {
        let relu = Signature::builder(Kind::Relu).int(16).build();
        let linear = Signature::builder(Kind::Linear).int(16).build();
        assert_ne!(relu, linear);
        let max = Signature::builder(Kind::MaxPool).dims(&[1, 2]).build();
        let avg = Signature::builder(Kind::AvgPool).dims(&[1, 2]).build();
        assert_ne!(max, avg);
    }

    #[test]
    fn value_boundaries_do_not_shift() {
        let a = Signature::builder(Kind::Softmax2d).dims(&[1, 23]).build();
        let b = Signature::builder(Kind::Softmax2d).dims(&[12, 3]).build();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_dim_is_not_a_dim() {
        let none = Signature::builder(Kind::Conv2d).optional_dim(None).build();
        let max = Signature::builder(Kind::Conv2d)
            .optional_dim(Some(usize::MAX))
            .build();
        assert_ne!(none, max);
        let dim = Signature::builder(Kind::Conv2d).dim(3).build();
        assert_eq!(Signature::builder(Kind::Conv2d).optional_dim(Some(3)).build(), dim);
        assert_ne!(Signature::builder(Kind::Conv2d).int(3).build(), dim);
    }

    #[test]
    fn display() {
        let key = Signature::builder(Kind::Linear)
            .dims(&[2, 16])
            .optional_dim(None)
            .double(0.5)
            .float(-1.5)
            .build();
        assert_eq!(
            key.to_string(),
            "linear_I2_I10_Iffffffffffffffff_D0.5_F-1.5_"
        );
        assert_eq!(key.kind(), Kind::Linear);
    }
}
