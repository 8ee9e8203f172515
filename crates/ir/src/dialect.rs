//! Tensor descriptors and shape signatures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric type class, using the DLPack type codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeCode {
    Int,
    UInt,
    Float,
    BFloat,
}

impl TypeCode {
    pub fn dlpack_code(&self) -> u8 {
        match self {
            TypeCode::Int => 0,
            TypeCode::UInt => 1,
            TypeCode::Float => 2,
            TypeCode::BFloat => 4,
        }
    }

    pub fn from_dlpack_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TypeCode::Int),
            1 => Some(TypeCode::UInt),
            2 => Some(TypeCode::Float),
            4 => Some(TypeCode::BFloat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataType {
    pub code: TypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl DataType {
    pub const fn new(code: TypeCode, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    pub const fn float32() -> Self {
        Self::new(TypeCode::Float, 32, 1)
    }

    pub const fn float16() -> Self {
        Self::new(TypeCode::Float, 16, 1)
    }

    pub const fn int32() -> Self {
        Self::new(TypeCode::Int, 32, 1)
    }

    /// Short element name used in kernel sources and signature displays.
    pub fn element_type(&self) -> String {
        let base = match (self.code, self.bits) {
            (TypeCode::Float, 32) => "f32".to_string(),
            (TypeCode::Float, 16) => "f16".to_string(),
            (TypeCode::Float, 64) => "f64".to_string(),
            (TypeCode::BFloat, 16) => "bf16".to_string(),
            (TypeCode::Int, bits) => format!("i{bits}"),
            (TypeCode::UInt, bits) => format!("u{bits}"),
            (code, bits) => format!("{code:?}{bits}").to_lowercase(),
        };
        if self.lanes > 1 {
            format!("{}x{}", base, self.lanes)
        } else {
            base
        }
    }

    /// Scalar type spelled the way CUDA sources spell it.
    pub fn cuda_type(&self) -> &'static str {
        match (self.code, self.bits) {
            (TypeCode::Float, 16) => "half",
            (TypeCode::Float, 64) => "double",
            (TypeCode::Float, _) => "float",
            (TypeCode::BFloat, _) => "__nv_bfloat16",
            (TypeCode::Int, 64) => "long",
            (TypeCode::Int, _) => "int",
            (TypeCode::UInt, 64) => "unsigned long",
            (TypeCode::UInt, _) => "unsigned",
        }
    }
}

/// Everything a backend needs to know about one tensor argument.
///
/// Equality and hashing are structural over every field, so two descriptors
/// that differ only in strides or alignment are distinct catalog keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TensorDescriptor {
    pub dtype: DataType,
    pub shape: Vec<u64>,
    pub strides: Vec<u64>,
    pub alignment: u64,
}

impl TensorDescriptor {
    /// Row-major descriptor; alignment defaults to the element bit width.
    pub fn contiguous(dtype: DataType, shape: Vec<u64>) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            dtype,
            alignment: u64::from(dtype.bits),
            shape,
            strides,
        }
    }

    pub fn float32(shape: &[u64]) -> Self {
        Self::contiguous(DataType::float32(), shape.to_vec())
    }

    pub fn with_strides(mut self, strides: Vec<u64>) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn max_dim(&self) -> Option<u64> {
        self.shape.iter().copied().max()
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .shape
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        write!(f, "{}[{}]", self.dtype.element_type(), dims)
    }
}

pub fn contiguous_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for idx in (0..shape.len().saturating_sub(1)).rev() {
        strides[idx] = strides[idx + 1] * shape[idx + 1];
    }
    strides
}

/// The ordered input descriptors of one workload instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ShapeSignature(pub Vec<TensorDescriptor>);

impl ShapeSignature {
    pub fn new(descriptors: Vec<TensorDescriptor>) -> Self {
        Self(descriptors)
    }

    pub fn descriptors(&self) -> &[TensorDescriptor] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Largest dimension across all descriptors; bounds option sampling.
    pub fn max_dim(&self) -> Option<u64> {
        self.0.iter().filter_map(TensorDescriptor::max_dim).max()
    }
}

impl From<Vec<TensorDescriptor>> for ShapeSignature {
    fn from(descriptors: Vec<TensorDescriptor>) -> Self {
        Self(descriptors)
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, descriptor) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", descriptor)?;
        }
        Ok(())
    }
}
