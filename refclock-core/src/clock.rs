//! # Video Reference Clock
//!
//! Presentation clock locked to the display refresh:
//! - Advances in whole vblank intervals while a [`VblankSource`] is live
//! - Falls back to the raw counter when there is no usable sync source
//! - Adjustable speed so playback can be stretched to match the display
//! - [`ReferenceClock::wait`] paces a render loop to the next vblank
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ vblank  ┌──────────────┐ get_time / wait ┌──────────┐
//! │ VblankSource │────────►│ Tracking     │◄────────────────│ Render / │
//! │ (platform)   │         │ thread       │   set_speed     │ A/V sync │
//! └──────────────┘         └──────┬───────┘                 └──────────┘
//!                                 │ Mutex<ClockState> + Condvar
//!                           ┌─────┴─────┐
//!                           │  Counter  │ (raw ticks, fallback)
//!                           └───────────┘
//! ```
//!
//! Tracking loop states:
//!
//! ```text
//! Stopped ─► SettingUp ─► Tracking ─► TearDown ─► SettingUp   (mode change, source lost)
//!                │                        └─────► Stopped     (stop)
//!                └─ setup failed ─► TearDown ─► Stopped
//! ```

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ClockConfig;
use crate::counter::{ticks_to_duration, Counter, SystemCounter};
use crate::vsync::{self, DisplayMode, VblankSource, VsyncError};

/// Default bound on a vblank wait, in percent of one interval
pub const MAX_DELAY_PERCENT: u32 = 120;

/// Assumed when the platform reports a refresh rate of 0
const DEFAULT_REFRESH_HZ: i64 = 60;

/// Longest sleep of `wait()` without a sync source
const RAW_WAIT_MS: u64 = 1;

/// Pause before setting up again after the source was lost
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Fastest clock speed accepted by `set_speed`
pub const MAX_SPEED: f64 = 100.0;

// ============================================================================
// Public Types
// ============================================================================

/// Tracking loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackerState {
    Stopped,
    SettingUp,
    Tracking,
    TearDown,
}

/// Outcome of [`ReferenceClock::wait_started`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartStatus {
    /// Vblank tracking is running
    Live,
    /// Setup failed or the loop exited; time comes from the raw counter
    GaveUp,
    TimedOut,
}

/// Running counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClockStats {
    /// Setup attempts
    pub setups: u64,
    /// Vblanks observed from the source
    pub vblanks: u64,
    /// Intervals synthesized by `wait()` timeouts
    pub missed: u64,
    /// Sequence counter resets/wraps
    pub discontinuities: u64,
    pub mode_changes: u64,
}

// ============================================================================
// Clock State
// ============================================================================

struct ClockState {
    system_frequency: i64,
    adjusted_frequency: i64,
    current_time: i64,
    /// Fractional ticks carried between updates, in units of 1/refresh_rate
    tick_remainder: i64,
    clock_offset: i64,
    use_vblank: bool,
    refresh_rate: i64,
    display_mode: Option<DisplayMode>,
    last_refresh_check: i64,
    missed_intervals: i64,
    vblank_time: i64,
    /// Bumped on every vblank signal
    generation: u64,
    tracker: TrackerState,
    stats: ClockStats,
}

impl ClockState {
    fn new(system_frequency: i64) -> Self {
        Self {
            system_frequency,
            adjusted_frequency: system_frequency,
            current_time: 0,
            tick_remainder: 0,
            clock_offset: 0,
            use_vblank: false,
            refresh_rate: DEFAULT_REFRESH_HZ,
            display_mode: None,
            last_refresh_check: 0,
            missed_intervals: 0,
            vblank_time: 0,
            generation: 0,
            tracker: TrackerState::Stopped,
            stats: ClockStats::default(),
        }
    }

    /// Raw counter ticks in one vblank interval
    fn interval_ticks(&self) -> i64 {
        self.system_frequency / self.refresh_rate
    }

    /// Advance by `intervals` vblank periods at the adjusted frequency.
    ///
    /// With `check_missed`, intervals already synthesized by `wait()` are
    /// subtracted first.
    fn update_clock(&mut self, intervals: i64, check_missed: bool) {
        let mut intervals = intervals;
        if check_missed {
            intervals -= self.missed_intervals;
            self.missed_intervals = 0;
        }

        if intervals > 0 {
            let rate = self.refresh_rate as i128;
            let total = intervals as i128 * self.adjusted_frequency as i128
                + self.tick_remainder as i128;
            let ticks = i64::try_from(total / rate).unwrap_or(i64::MAX);
            self.current_time = self.current_time.saturating_add(ticks);
            self.tick_remainder = (total % rate) as i64;
        }
    }

    fn signal(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Re-read the display mode, at most once per second of clock time
    /// unless `force`. Returns true when refresh rate or resolution changed.
    fn update_refresh_rate(&mut self, source: &mut dyn VblankSource, force: bool) -> bool {
        if !force && self.current_time - self.last_refresh_check <= self.system_frequency {
            return false;
        }
        self.last_refresh_check = self.current_time;

        let mut mode = match source.display_mode() {
            Ok(mode) => mode,
            Err(e) => {
                debug!("Display mode query failed: {}", e);
                return false;
            }
        };
        if mode.refresh_hz == 0 {
            mode.refresh_hz = DEFAULT_REFRESH_HZ as u32;
        }

        // The first mode of a session is a baseline, not a change
        let changed = self.display_mode.is_some_and(|prev| prev != mode);
        if self.display_mode != Some(mode) {
            if mode.refresh_hz as i64 != self.refresh_rate {
                self.refresh_rate = mode.refresh_hz as i64;
                self.tick_remainder = 0;
            }
            debug!(
                "Detected refresh rate: {} Hz ({}x{})",
                mode.refresh_hz, mode.width, mode.height
            );
            self.display_mode = Some(mode);
        }
        changed
    }
}

// ============================================================================
// Shared (clock <-> tracking thread)
// ============================================================================

struct Shared {
    counter: Arc<dyn Counter>,
    state: Mutex<ClockState>,
    vblank: Condvar,
    started: Mutex<Option<StartStatus>>,
    started_cond: Condvar,
    stop: AtomicBool,
    max_delay_percent: i64,
    stall_timeout: Duration,
}

impl Shared {
    fn set_tracker(&self, tracker: TrackerState) {
        let mut state = self.state.lock();
        state.tracker = tracker;
        if tracker == TrackerState::SettingUp {
            state.stats.setups += 1;
        }
    }

    fn signal_started(&self, status: Option<StartStatus>) {
        *self.started.lock() = status;
        self.started_cond.notify_all();
    }

    /// Switch to vblank time after a successful setup
    fn enter_tracking(&self, source: &mut dyn VblankSource) {
        let now = self.counter.now();
        let mut state = self.state.lock();

        // A re-setup after a mode change keeps the running vblank time
        if !state.use_vblank {
            state.current_time = now - state.clock_offset;
            state.use_vblank = true;
        }
        state.display_mode = None;
        state.update_refresh_rate(source, true);
        state.missed_intervals = 0;
        state.vblank_time = now;
        state.tracker = TrackerState::Tracking;
        let refresh = state.refresh_rate;
        drop(state);

        info!("Vblank tracking live on {} at {} Hz", source.name(), refresh);
        self.signal_started(Some(StartStatus::Live));
    }

    /// Back to raw counter time, continuing from the last tracked value
    fn leave_tracking(&self) {
        let now = self.counter.now();
        let mut state = self.state.lock();
        if state.use_vblank {
            state.use_vblank = false;
            state.clock_offset = now - state.current_time;
        }
        state.tracker = TrackerState::Stopped;
        state.signal();
        drop(state);

        self.vblank.notify_all();
        self.signal_started(Some(StartStatus::GaveUp));
    }
}

// ============================================================================
// Tracking Loop
// ============================================================================

enum SessionEnd {
    SetupFailed,
    Stopped,
    ModeChanged,
    SourceLost(VsyncError),
}

fn run(shared: Arc<Shared>, mut source: Box<dyn VblankSource>) -> Box<dyn VblankSource> {
    debug!("Reference clock thread starting ({} backend)", source.name());
    {
        let mut state = shared.state.lock();
        state.adjusted_frequency = state.system_frequency;
    }

    while !shared.stop.load(Ordering::Acquire) {
        shared.set_tracker(TrackerState::SettingUp);

        let end = match source.setup() {
            Ok(sequence) => {
                shared.enter_tracking(source.as_mut());
                track(&shared, source.as_mut(), sequence)
            }
            Err(e) => {
                info!(
                    "Vblank setup failed on {}: {}, falling back to system counter",
                    source.name(),
                    e
                );
                SessionEnd::SetupFailed
            }
        };

        shared.set_tracker(TrackerState::TearDown);
        if !matches!(end, SessionEnd::SetupFailed) {
            shared.signal_started(None);
        }
        source.teardown();

        match end {
            SessionEnd::SetupFailed | SessionEnd::Stopped => break,
            SessionEnd::ModeChanged => {
                shared.state.lock().stats.mode_changes += 1;
                info!("Display mode changed, restarting vblank tracking");
            }
            SessionEnd::SourceLost(e) => {
                warn!("Vblank source lost: {}, restarting vblank tracking", e);
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }

    shared.leave_tracking();
    debug!("Reference clock thread stopped");
    source
}

/// Per-vblank loop for one setup session
fn track(shared: &Shared, source: &mut dyn VblankSource, initial: u64) -> SessionEnd {
    let mut prev = initial;
    let mut last_seen = Instant::now();

    while !shared.stop.load(Ordering::Acquire) {
        let sequence = match source.wait_for_vblank() {
            Ok(Some(sequence)) => sequence,
            Ok(None) => {
                if last_seen.elapsed() >= shared.stall_timeout {
                    return SessionEnd::SourceLost(VsyncError::Lost(format!(
                        "no vblank for {} ms",
                        shared.stall_timeout.as_millis()
                    )));
                }
                continue;
            }
            Err(e) => return SessionEnd::SourceLost(e),
        };
        last_seen = Instant::now();
        let now = shared.counter.now();

        if sequence > prev {
            let intervals = (sequence - prev).min(i64::MAX as u64) as i64;

            let mut state = shared.state.lock();
            state.vblank_time = now;
            state.update_clock(intervals, true);
            state.stats.vblanks += 1;
            state.signal();
            shared.vblank.notify_all();
            let changed = state.update_refresh_rate(source, false);
            drop(state);

            if changed {
                return SessionEnd::ModeChanged;
            }
        } else {
            warn!(
                "Vblank counter went from {} to {}, resynchronizing",
                prev, sequence
            );

            let mut state = shared.state.lock();
            state.vblank_time = now;
            state.update_clock(1, false);
            state.stats.discontinuities += 1;
            state.signal();
            drop(state);
            shared.vblank.notify_all();

            if let Err(e) = source.resync() {
                return SessionEnd::SourceLost(e);
            }
        }
        prev = sequence;
    }

    SessionEnd::Stopped
}

// ============================================================================
// Reference Clock
// ============================================================================

/// Display-synchronized presentation clock.
///
/// Construct one at the top of the application and share it by reference
/// or `Arc` with the render loop and A/V sync.
pub struct ReferenceClock {
    shared: Arc<Shared>,
    /// Parked here while the tracking thread is not running
    source: Mutex<Option<Box<dyn VblankSource>>>,
    thread: Mutex<Option<JoinHandle<Box<dyn VblankSource>>>>,
    start_timeout_ms: u64,
}

impl ReferenceClock {
    /// Create a clock with default tunables
    pub fn new(counter: Arc<dyn Counter>, source: Box<dyn VblankSource>) -> Self {
        Self::with_config(counter, source, &ClockConfig::default())
    }

    /// Create a clock with tunables from `config`
    pub fn with_config(
        counter: Arc<dyn Counter>,
        source: Box<dyn VblankSource>,
        config: &ClockConfig,
    ) -> Self {
        let frequency = counter.frequency();
        Self {
            shared: Arc::new(Shared {
                counter,
                state: Mutex::new(ClockState::new(frequency)),
                vblank: Condvar::new(),
                started: Mutex::new(None),
                started_cond: Condvar::new(),
                stop: AtomicBool::new(false),
                max_delay_percent: config.max_delay_percent.max(100) as i64,
                stall_timeout: Duration::from_millis(config.stall_timeout_ms.max(1)),
            }),
            source: Mutex::new(Some(source)),
            thread: Mutex::new(None),
            start_timeout_ms: config.start_timeout_ms,
        }
    }

    /// System counter plus the source selected by `config`
    pub fn from_config(config: &ClockConfig) -> Self {
        Self::with_config(
            Arc::new(SystemCounter::new()),
            vsync::open_source(config),
            config,
        )
    }

    /// Configured bound for [`Self::wait_started`]
    pub fn start_timeout_ms(&self) -> u64 {
        self.start_timeout_ms
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the tracking thread. Returns immediately; a second call while
    /// running does nothing. After the thread gave up, setup runs again.
    pub fn start(&self) -> std::io::Result<()> {
        let mut thread = self.thread.lock();
        match thread.take() {
            Some(handle) if handle.is_finished() => self.reclaim(handle),
            Some(handle) => {
                *thread = Some(handle);
                warn!("Reference clock already running");
                return Ok(());
            }
            None => {}
        }
        let Some(source) = self.source.lock().take() else {
            warn!("Reference clock has no vblank source");
            return Ok(());
        };

        self.shared.stop.store(false, Ordering::Release);
        self.shared.signal_started(None);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("refclock-vblank".into())
            .spawn(move || run(shared, source))
            .inspect_err(|_| self.shared.signal_started(Some(StartStatus::GaveUp)))?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop the tracking thread and wait for it to exit. Time continues
    /// from the raw counter without a jump.
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        self.reclaim(handle);
    }

    /// Join an exited or stopping tracking thread and take its source back
    fn reclaim(&self, handle: JoinHandle<Box<dyn VblankSource>>) {
        match handle.join() {
            Ok(source) => *self.source.lock() = Some(source),
            Err(_) => {
                warn!("Reference clock thread panicked");
                self.shared.leave_tracking();
            }
        }
    }

    /// Block until tracking is live or has given up, at most `timeout_ms`
    pub fn wait_started(&self, timeout_ms: u64) -> StartStatus {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut status = self.shared.started.lock();
        while status.is_none() {
            if self
                .shared
                .started_cond
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        status.unwrap_or(StartStatus::TimedOut)
    }

    /// Whether the tracking thread is alive
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn state(&self) -> TrackerState {
        self.shared.state.lock().tracker
    }

    pub fn stats(&self) -> ClockStats {
        self.shared.state.lock().stats
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Current clock time in ticks of [`Self::get_frequency`]
    pub fn get_time(&self) -> i64 {
        let state = self.shared.state.lock();
        if state.use_vblank {
            state.current_time
        } else {
            self.shared.counter.now() - state.clock_offset
        }
    }

    /// Ticks per second at 1.0x, independent of speed
    pub fn get_frequency(&self) -> i64 {
        self.shared.counter.frequency()
    }

    /// Scale the clock rate while tracking vblank. Ignored on the raw
    /// counter, which always runs at 1.0x.
    pub fn set_speed(&self, speed: f64) {
        if !speed.is_finite() || speed < 0.0 {
            warn!("Ignoring invalid clock speed {}", speed);
            return;
        }
        let speed = if speed > MAX_SPEED {
            warn!("Clock speed {} clamped to {}", speed, MAX_SPEED);
            MAX_SPEED
        } else {
            speed
        };

        let mut state = self.shared.state.lock();
        if !state.use_vblank {
            return;
        }
        let frequency = (state.system_frequency as f64 * speed) as i64;
        if frequency != state.adjusted_frequency {
            state.adjusted_frequency = frequency;
            debug!("Clock speed {:.3}%", speed * 100.0);
        }
    }

    pub fn get_speed(&self) -> f64 {
        let state = self.shared.state.lock();
        if state.use_vblank {
            state.adjusted_frequency as f64 / state.system_frequency as f64
        } else {
            1.0
        }
    }

    /// Refresh rate in Hz while tracking, -1 otherwise
    pub fn get_refresh_rate(&self) -> i32 {
        let state = self.shared.state.lock();
        if state.use_vblank {
            state.refresh_rate as i32
        } else {
            -1
        }
    }

    /// Block until the next vblank.
    ///
    /// While tracking, waits at most `max_delay_percent` of an interval past
    /// the last vblank; if none arrives one interval is synthesized. Without
    /// a sync source sleeps for up to 1 ms (`timeout_ms` only caps that).
    pub fn wait(&self, timeout_ms: u64) {
        let mut state = self.shared.state.lock();
        if !state.use_vblank {
            drop(state);
            std::thread::sleep(Duration::from_millis(timeout_ms.min(RAW_WAIT_MS)));
            return;
        }

        let interval = state.interval_ticks();
        let deadline_ticks = state.vblank_time + interval * self.shared.max_delay_percent / 100;
        let sleep_ticks = deadline_ticks - self.shared.counter.now();

        let mut late = sleep_ticks <= 0;
        if !late {
            let deadline = Instant::now() + ticks_to_duration(sleep_ticks, state.system_frequency);
            let generation = state.generation;
            while state.generation == generation {
                if self
                    .shared
                    .vblank
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    late = state.generation == generation;
                    break;
                }
            }
        }

        if late && state.use_vblank {
            let interval = state.interval_ticks();
            state.missed_intervals += 1;
            state.vblank_time += interval;
            state.update_clock(1, false);
            state.stats.missed += 1;
            debug!(
                "No vblank within {}% of an interval, advancing one interval",
                self.shared.max_delay_percent
            );
        }
    }
}

impl Drop for ReferenceClock {
    fn drop(&mut self) {
        self.stop();
    }
}
