//! # Vertical Blank Sources
//!
//! Platform capability the reference clock tracks. A source hands out a
//! hardware vblank sequence number per display refresh and reports the
//! current display mode. The clock only ever sees this trait, so the
//! interval accounting, speed scaling and fallback logic are the same for
//! every backend.
//!
//! ```text
//! ┌──────────────┐  setup / wait_for_vblank  ┌────────────────┐
//! │ Tracking     │──────────────────────────►│ VblankSource   │
//! │ thread       │◄──────────────────────────│ (drm/timer/sim)│
//! └──────────────┘   sequence, DisplayMode   └────────────────┘
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::config::{Backend, ClockConfig};

#[cfg(all(target_os = "linux", feature = "drm"))]
pub mod drm;
pub mod sim;
pub mod timer;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum VsyncError {
    #[error("Vblank backend not available on this platform")]
    Unavailable,
    #[error("Vblank tracking disabled by configuration")]
    Disabled,
    #[error("Failed to open display device {path:?}: {source}")]
    Device {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("No active CRTC found")]
    NoActiveCrtc,
    #[error("Display context lost: {0}")]
    Lost(String),
}

// ============================================================================
// Display Mode
// ============================================================================

/// Refresh rate and resolution of the tracked output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    /// Refresh rate in Hz, 0 if the platform could not tell
    pub refresh_hz: u32,
    pub width: u32,
    pub height: u32,
}

impl DisplayMode {
    pub fn new(refresh_hz: u32, width: u32, height: u32) -> Self {
        Self {
            refresh_hz,
            width,
            height,
        }
    }
}

// ============================================================================
// Source Trait
// ============================================================================

/// Platform vertical-blank tracking.
///
/// All calls come from the clock's tracking thread.
pub trait VblankSource: Send {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Acquire platform resources. Returns the current hardware vblank
    /// sequence, the baseline for the first `wait_for_vblank`.
    fn setup(&mut self) -> Result<u64, VsyncError>;

    /// Block until the next vblank and return its hardware sequence.
    ///
    /// May return `Ok(None)` after a bounded poll period with no vblank, so
    /// the caller can check for shutdown.
    fn wait_for_vblank(&mut self) -> Result<Option<u64>, VsyncError>;

    /// Current refresh rate and resolution
    fn display_mode(&mut self) -> Result<DisplayMode, VsyncError>;

    /// Re-attach to the display after the sequence counter jumped backward,
    /// without a full setup.
    fn resync(&mut self) -> Result<(), VsyncError>;

    /// Release platform resources. Safe to call more than once.
    fn teardown(&mut self);
}

/// Source for running without display sync; setup always fails.
#[derive(Debug, Default)]
pub struct Unavailable {
    reason: Option<&'static str>,
}

impl Unavailable {
    pub fn new() -> Self {
        Self::default()
    }

    fn unsupported() -> Self {
        Self {
            reason: Some("unsupported"),
        }
    }
}

impl VblankSource for Unavailable {
    fn name(&self) -> &'static str {
        "none"
    }

    fn setup(&mut self) -> Result<u64, VsyncError> {
        match self.reason {
            Some(_) => Err(VsyncError::Unavailable),
            None => Err(VsyncError::Disabled),
        }
    }

    fn wait_for_vblank(&mut self) -> Result<Option<u64>, VsyncError> {
        Err(VsyncError::Disabled)
    }

    fn display_mode(&mut self) -> Result<DisplayMode, VsyncError> {
        Err(VsyncError::Disabled)
    }

    fn resync(&mut self) -> Result<(), VsyncError> {
        Err(VsyncError::Disabled)
    }

    fn teardown(&mut self) {}
}

/// Build the source selected by `config`
pub fn open_source(config: &ClockConfig) -> Box<dyn VblankSource> {
    match config.backend {
        Backend::None => Box::new(Unavailable::new()),
        Backend::Timer => Box::new(timer::TimerSource::new(config.timer_refresh_hz)),
        Backend::Drm => drm_source(config),
        Backend::Auto => {
            if cfg!(all(target_os = "linux", feature = "drm")) {
                drm_source(config)
            } else {
                Box::new(Unavailable::unsupported())
            }
        }
    }
}

#[cfg(all(target_os = "linux", feature = "drm"))]
fn drm_source(config: &ClockConfig) -> Box<dyn VblankSource> {
    Box::new(drm::DrmSource::new(config.drm_device.clone(), config.drm_crtc))
}

#[cfg(not(all(target_os = "linux", feature = "drm")))]
fn drm_source(_config: &ClockConfig) -> Box<dyn VblankSource> {
    Box::new(Unavailable::unsupported())
}
