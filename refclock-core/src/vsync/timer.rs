//! Software vblank generator
//!
//! Paces a fixed refresh rate off `Instant` for machines without a usable
//! display sync API (headless boxes, remote sessions). Deadlines are computed
//! from the session start, so sleep overshoot never accumulates.

use std::time::{Duration, Instant};

use super::{DisplayMode, VblankSource, VsyncError};

pub struct TimerSource {
    refresh_hz: u32,
    period: Duration,
    started: Option<Instant>,
    sequence: u64,
}

impl TimerSource {
    pub fn new(refresh_hz: u32) -> Self {
        let refresh_hz = refresh_hz.max(1);
        Self {
            refresh_hz,
            period: Duration::from_secs_f64(1.0 / refresh_hz as f64),
            started: None,
            sequence: 0,
        }
    }

    fn deadline(&self, start: Instant, sequence: u64) -> Instant {
        start + self.period.mul_f64(sequence as f64)
    }
}

impl VblankSource for TimerSource {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn setup(&mut self) -> Result<u64, VsyncError> {
        self.started = Some(Instant::now());
        self.sequence = 0;
        tracing::debug!("Timer vblank source at {} Hz", self.refresh_hz);
        Ok(0)
    }

    fn wait_for_vblank(&mut self) -> Result<Option<u64>, VsyncError> {
        let start = self
            .started
            .ok_or_else(|| VsyncError::Lost("timer source not set up".into()))?;

        let next = self.sequence + 1;
        let deadline = self.deadline(start, next);
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }

        // Report every period that has passed, like a hardware counter would
        let elapsed = start.elapsed().as_secs_f64();
        let passed = (elapsed * self.refresh_hz as f64) as u64;
        self.sequence = passed.max(next);
        Ok(Some(self.sequence))
    }

    fn display_mode(&mut self) -> Result<DisplayMode, VsyncError> {
        Ok(DisplayMode::new(self.refresh_hz, 0, 0))
    }

    fn resync(&mut self) -> Result<(), VsyncError> {
        Ok(())
    }

    fn teardown(&mut self) {
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_sequence_advances() {
        let mut source = TimerSource::new(200);
        assert_eq!(source.setup().unwrap(), 0);

        let first = source.wait_for_vblank().unwrap().unwrap();
        let second = source.wait_for_vblank().unwrap().unwrap();
        assert!(first >= 1);
        assert!(second > first);
        assert_eq!(source.display_mode().unwrap().refresh_hz, 200);
    }

    #[test]
    fn test_timer_requires_setup() {
        let mut source = TimerSource::new(60);
        assert!(source.wait_for_vblank().is_err());
        source.setup().unwrap();
        source.teardown();
        assert!(source.wait_for_vblank().is_err());
    }
}
