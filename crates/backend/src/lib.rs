//! Backend compilers for kernelvault.

pub mod compiler;
pub mod reference;
pub mod shape_inference;
pub mod timed;

pub use compiler::*;
pub use reference::ReferenceBackend;
pub use shape_inference::{infer_from_source, infer_outputs};
pub use timed::TimedBackend;
