//! Connection Management
//!
//! Per-endpoint liveness monitoring and the registry that routes work between the
//! primary and its replicas.

pub mod handle;
pub mod registry;

pub use handle::*;
pub use registry::*;
