//! Process lifecycle: shutdown coordination and signal handling.

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;

use std::time::Duration;

/// Bound on graceful shutdown for both binaries.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
