//! Observability dependencies for the workspace.
//!
//! Crates in this workspace do not depend on `tracing` directly; they import
//! it through this facade so that the whole workspace is guaranteed to use a
//! single version of the tracing machinery.

pub use tracing;
