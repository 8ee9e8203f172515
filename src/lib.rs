//! kernelvault: ahead-of-time kernel search, compilation cache and catalog
//! persistence.

pub use kernelvault_backend as backend;
pub use kernelvault_catalog as catalog;
pub use kernelvault_compiler as compiler;
pub use kernelvault_ir as ir;
pub use kernelvault_search as search;
