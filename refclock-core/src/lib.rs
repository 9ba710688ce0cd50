//! # refclock core
//!
//! Video reference clock: a presentation clock that follows the display's
//! vertical blank, with raw-counter fallback and adjustable speed.

pub mod clock;
pub mod config;
pub mod counter;
pub mod vsync;

pub use clock::{ClockStats, ReferenceClock, StartStatus, TrackerState, MAX_SPEED};
pub use config::{Backend, ClockConfig, ConfigError};
pub use counter::{Counter, ManualCounter, SystemCounter};
pub use vsync::{DisplayMode, VblankSource, VsyncError};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
