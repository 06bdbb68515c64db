//! Prelude.

// Re-export errors and results.
pub use crate::res::*;

// Re-export `ahash`.
pub use ahash::AHashMap as HashMap;
pub use ahash::AHashSet as HashSet;

// Re-export `tracing` macros.
pub use tracing::{debug, error, info, trace, warn};
