//! Generation runtime for kernelvault: shared run context, worker pool,
//! generator loop, replay and the command line front end.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod context;
pub mod generator;
pub mod pool;
pub mod replay;
pub mod report;

#[cfg(feature = "cli")]
pub use cli::*;
pub use config::*;
pub use context::*;
pub use generator::*;
pub use pool::*;
pub use replay::*;
pub use report::*;
