//! Repository implementations for PostgreSQL.

mod build;
mod host;
mod patch;
mod task;
mod version;

pub use build::PgBuildRepository;
pub use host::PgHostRepository;
pub use patch::{PgPatchRepository, PgProjectRefRepository};
pub use task::PgTaskRepository;
pub use version::PgVersionRepository;
