//! The backend compiler interface.

use crate::shape_inference;
use kernelvault_ir::{CudaDim, FrontendError, MappingOptions, ShapeSignature, TensorDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Output of one successful backend compilation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledKernel {
    pub source: String,
    pub specialized_name: String,
    pub parameters: Vec<i64>,
    /// Launch extents after tightening; never larger than requested.
    pub grid: CudaDim,
    pub block: CudaDim,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompilationError {
    #[error("entry point `{0}` is not defined by the program")]
    UnknownEntryPoint(String),
    #[error(transparent)]
    Frontend(#[from] FrontendError),
    #[error("invalid mapping options: {0}")]
    InvalidOptions(String),
    #[error("shape inference failed: {0}")]
    ShapeInference(String),
    #[error("compilation exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("{0} timed-out compilations are still running")]
    TooManyAbandoned(usize),
    #[error("{backend} backend failure: {message}")]
    Backend { backend: String, message: String },
}

/// Lowers a program, an input-shape class and mapping options into kernel
/// source. Implementations are shared across worker threads.
pub trait BackendCompiler: Send + Sync {
    fn name(&self) -> &str;

    fn compile(
        &self,
        program: &str,
        entry: &str,
        inputs: &ShapeSignature,
        options: &MappingOptions,
    ) -> Result<CompiledKernel, CompilationError>;

    fn infer_output_shapes(
        &self,
        program: &str,
        entry: &str,
        inputs: &ShapeSignature,
    ) -> Result<Vec<TensorDescriptor>, CompilationError> {
        shape_inference::infer_from_source(program, entry, inputs)
    }
}

impl<T: BackendCompiler + ?Sized> BackendCompiler for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn compile(
        &self,
        program: &str,
        entry: &str,
        inputs: &ShapeSignature,
        options: &MappingOptions,
    ) -> Result<CompiledKernel, CompilationError> {
        (**self).compile(program, entry, inputs, options)
    }

    fn infer_output_shapes(
        &self,
        program: &str,
        entry: &str,
        inputs: &ShapeSignature,
    ) -> Result<Vec<TensorDescriptor>, CompilationError> {
        (**self).infer_output_shapes(program, entry, inputs)
    }
}
