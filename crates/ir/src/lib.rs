//! kernelvault data model and program frontend.

pub mod dialect;
pub mod frontend;
pub mod lexer;
pub mod library;
pub mod options;

pub use dialect::*;
pub use frontend::{parse, Definition, FrontendError, Program, SizeBindings};
pub use options::*;
