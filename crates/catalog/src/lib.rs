//! Durable catalog of accepted kernel candidates.

pub mod ids;
pub mod inspect;
pub mod record;
pub mod store;

pub use ids::IdAllocator;
pub use inspect::{describe, duplicate_groups, source_digest, Field, InspectError};
pub use record::{build_version, KernelCandidate};
pub use store::{KernelCatalog, PersistenceError, FORMAT_VERSION};
