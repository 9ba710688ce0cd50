//! Scripted display for tests and dry runs
//!
//! [`SimHandle`] drives a [`SimSource`] from another thread: push vblank
//! sequence numbers, change the display mode, make setup or resync fail, and
//! read back how often the clock called into the source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{DisplayMode, VblankSource, VsyncError};

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct SimState {
    pending: VecDeque<u64>,
    mode: DisplayMode,
    initial_sequence: u64,
    fail_setup: bool,
    fail_resync: bool,
    attached: bool,
    setups: u32,
    resyncs: u32,
    teardowns: u32,
}

struct SimShared {
    state: Mutex<SimState>,
    cond: Condvar,
}

/// Control side of a simulated display
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<SimShared>,
}

/// Source side of a simulated display, handed to the clock
pub struct SimSource {
    shared: Arc<SimShared>,
}

/// Create a connected handle/source pair
pub fn simulated_display(mode: DisplayMode) -> (SimHandle, SimSource) {
    let shared = Arc::new(SimShared {
        state: Mutex::new(SimState {
            pending: VecDeque::new(),
            mode,
            initial_sequence: 0,
            fail_setup: false,
            fail_resync: false,
            attached: false,
            setups: 0,
            resyncs: 0,
            teardowns: 0,
        }),
        cond: Condvar::new(),
    });
    (
        SimHandle {
            shared: shared.clone(),
        },
        SimSource { shared },
    )
}

impl SimHandle {
    /// Deliver a vblank with the given hardware sequence
    pub fn vblank(&self, sequence: u64) {
        self.shared.state.lock().pending.push_back(sequence);
        self.shared.cond.notify_all();
    }

    pub fn set_mode(&self, mode: DisplayMode) {
        self.shared.state.lock().mode = mode;
    }

    /// Sequence reported by the next `setup`
    pub fn set_initial_sequence(&self, sequence: u64) {
        self.shared.state.lock().initial_sequence = sequence;
    }

    pub fn fail_setup(&self, fail: bool) {
        self.shared.state.lock().fail_setup = fail;
    }

    pub fn fail_resync(&self, fail: bool) {
        self.shared.state.lock().fail_resync = fail;
    }

    /// Vblanks delivered but not yet consumed by the clock
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.state.lock().attached
    }

    pub fn setup_count(&self) -> u32 {
        self.shared.state.lock().setups
    }

    pub fn resync_count(&self) -> u32 {
        self.shared.state.lock().resyncs
    }

    pub fn teardown_count(&self) -> u32 {
        self.shared.state.lock().teardowns
    }
}

impl VblankSource for SimSource {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn setup(&mut self) -> Result<u64, VsyncError> {
        let mut state = self.shared.state.lock();
        state.setups += 1;
        if state.fail_setup {
            return Err(VsyncError::Unavailable);
        }
        state.attached = true;
        Ok(state.initial_sequence)
    }

    fn wait_for_vblank(&mut self) -> Result<Option<u64>, VsyncError> {
        let mut state = self.shared.state.lock();
        if !state.attached {
            return Err(VsyncError::Lost("not attached".into()));
        }
        if state.pending.is_empty() {
            self.shared.cond.wait_for(&mut state, POLL);
        }
        Ok(state.pending.pop_front())
    }

    fn display_mode(&mut self) -> Result<DisplayMode, VsyncError> {
        Ok(self.shared.state.lock().mode)
    }

    fn resync(&mut self) -> Result<(), VsyncError> {
        let mut state = self.shared.state.lock();
        state.resyncs += 1;
        if state.fail_resync {
            state.attached = false;
            return Err(VsyncError::Lost("resync refused".into()));
        }
        Ok(())
    }

    fn teardown(&mut self) {
        let mut state = self.shared.state.lock();
        if state.attached {
            state.attached = false;
            state.teardowns += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_delivers_in_order() {
        let (handle, mut source) = simulated_display(DisplayMode::new(60, 1920, 1080));
        handle.set_initial_sequence(7);
        assert_eq!(source.setup().unwrap(), 7);

        handle.vblank(8);
        handle.vblank(9);
        assert_eq!(source.wait_for_vblank().unwrap(), Some(8));
        assert_eq!(source.wait_for_vblank().unwrap(), Some(9));
        assert_eq!(source.wait_for_vblank().unwrap(), None);
    }

    #[test]
    fn test_sim_counts_calls() {
        let (handle, mut source) = simulated_display(DisplayMode::new(50, 720, 576));
        handle.fail_setup(true);
        assert!(source.setup().is_err());
        assert!(!handle.is_attached());

        handle.fail_setup(false);
        source.setup().unwrap();
        source.resync().unwrap();
        source.teardown();
        source.teardown();

        assert_eq!(handle.setup_count(), 2);
        assert_eq!(handle.resync_count(), 1);
        assert_eq!(handle.teardown_count(), 1);
    }
}
