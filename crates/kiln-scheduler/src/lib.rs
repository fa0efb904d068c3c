//! Dependency closure, build assembly and patch finalization for Kiln.

pub mod assembler;
pub mod deps;
pub mod finalizer;
pub mod task_table;

pub use assembler::BuildAssembler;
pub use deps::{DependencyIncluder, include_patch_dependencies};
pub use finalizer::{PatchFinalizer, PatchedConfig};
pub use task_table::TaskIdTable;
