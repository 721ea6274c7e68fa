//! OmniDL Core - Download Engine
//!
//! This crate provides the task scheduler and transports for OmniDL.
//! It handles bounded concurrent downloads, pause/resume over HTTP range
//! requests, and coalesced progress updates.

mod error;
mod notifier;
mod scheduler;
mod store;
pub mod transport;

pub use error::*;
pub use notifier::*;
pub use scheduler::*;
pub use transport::{
    HttpTransport, RateLimiter, TransferHandle, TransferJob, TransferProgress, TransferSummary,
    Transport, TransportRegistry,
};

pub use omnidl_types as types;

use std::time::Duration;

/// Minimum spacing of progress samples and progress-only updates
pub const THROTTLE_WINDOW: Duration = Duration::from_millis(100);
