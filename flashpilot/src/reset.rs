//! Bootloader-entry reset and port re-enumeration tracking.
//!
//! Boards with native USB serial enter their bootloader when the host opens
//! the port at [`BOOTLOADER_TOUCH_BAUD`] and drops DTR. The board then
//! disconnects and, usually, re-enumerates under a new name. [`ResetSequencer`]
//! issues the touch and follows the port through both transitions:
//!
//! 1. snapshot the ports (`before`)
//! 2. touch the port
//! 3. Phase A: poll until the snapshot differs from `before`
//! 4. Phase B: snapshot again (`after`), poll until a port appears that is not
//!    in `after`
//!
//! Both phases share one [`Deadline`]. It is checked against the monotonic
//! clock on every iteration, so a slow enumeration call cannot stretch the
//! budget by more than one poll.

use crate::device::{DeviceIdentity, PortChange, PortSet, PortSnapshot, diff};
use crate::error::{Error, Result};
use crate::port::{BOOTLOADER_TOUCH_BAUD, SerialBackend, SerialConfig};
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Total time allowed for the port to vanish and come back.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between two enumeration attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait after a new port shows up, before anyone opens it.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Timing parameters of a reset attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTiming {
    /// Budget for both polling phases together.
    pub timeout: Duration,
    /// Sleep between two snapshots.
    pub poll_interval: Duration,
    /// Delay after the new port appeared.
    pub settle_delay: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            timeout: RESET_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            settle_delay: SETTLE_DELAY,
        }
    }
}

/// A point on the monotonic clock after which polling stops.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Sleep for `interval`, but never past the deadline.
    fn sleep(&self, interval: Duration) {
        let nap = interval.min(self.remaining());
        if !nap.is_zero() {
            thread::sleep(nap);
        }
    }
}

/// Drives the bootloader-entry reset for one port.
pub struct ResetSequencer<'a, B> {
    ports: &'a PortSet<B>,
    timing: ResetTiming,
}

impl<'a, B: SerialBackend> ResetSequencer<'a, B> {
    /// Sequencer over `ports` with the default timing.
    pub fn new(ports: &'a PortSet<B>) -> Self {
        Self {
            ports,
            timing: ResetTiming::default(),
        }
    }

    /// Override the timing parameters.
    #[must_use]
    pub fn with_timing(mut self, timing: ResetTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Reset the board on `initial` and return the port it came back on.
    ///
    /// When `wait_for_reappearance` is false the board is assumed to keep its
    /// name and `initial` is returned right after the touch.
    ///
    /// Returns [`Error::NoNewPort`] when no new port showed up in time; callers
    /// should carry on with `initial`, since some boards never change name.
    pub fn reset_and_await(
        &self,
        initial: &str,
        wait_for_reappearance: bool,
    ) -> Result<DeviceIdentity> {
        info!("Restarting {initial} in bootloader mode");

        let before = self.ports.list();
        debug!("Ports before reset: {:?}", before.iter().collect::<Vec<_>>());

        self.touch(initial);
        let deadline = Deadline::after(self.timing.timeout);

        if !wait_for_reappearance {
            return Ok(initial.to_string());
        }

        if before.is_empty() {
            // Nothing to vanish from; any visible port would count as a change.
            warn!("No ports visible before reset, skipping disconnect detection");
        } else if !self.wait_for_disconnect(&before, &deadline) {
            debug!("No disconnect observed before the deadline");
        }

        let after = self.ports.list();
        debug!("Ports after disconnect: {:?}", after.iter().collect::<Vec<_>>());

        match self.wait_for_new_port(&after, &deadline) {
            Some(port) => {
                info!("Board re-enumerated as {port}");
                thread::sleep(self.timing.settle_delay);
                Ok(port)
            },
            None => {
                warn!("No new port appeared, keeping {initial}");
                Err(Error::NoNewPort {
                    original: initial.to_string(),
                })
            },
        }
    }

    /// Open at the touch rate, drop DTR, close. Failures are only logged.
    fn touch(&self, port_name: &str) {
        let config = SerialConfig::bootloader_touch(port_name);
        debug_assert_eq!(config.baud_rate, BOOTLOADER_TOUCH_BAUD);

        let mut port = match self.ports.backend().open(&config) {
            Ok(port) => port,
            Err(e) => {
                warn!("Cannot open {port_name} for reset: {e}");
                return;
            },
        };
        if let Err(e) = port.set_dtr(false) {
            warn!("Cannot drop DTR on {port_name}: {e}");
        }
        if let Err(e) = port.close() {
            debug!("Closing {port_name} failed: {e}");
        }
    }

    /// Phase A. Returns whether any change was seen.
    fn wait_for_disconnect(&self, before: &PortSnapshot, deadline: &Deadline) -> bool {
        loop {
            let current = self.ports.list();
            let change = diff(before, &current);
            if change.is_changed() {
                debug!("Port set changed after reset: {change:?}");
                return true;
            }
            if deadline.expired() {
                return false;
            }
            deadline.sleep(self.timing.poll_interval);
        }
    }

    /// Phase B. Returns the port that appeared relative to `after`.
    fn wait_for_new_port(&self, after: &PortSnapshot, deadline: &Deadline) -> Option<String> {
        loop {
            let current = self.ports.list();
            match diff(after, &current) {
                PortChange::Changed(id) if current.contains(&id) => return Some(id),
                PortChange::Ambiguous(ids) => {
                    let seen = ids.join(", ");
                    if let Some(id) = ids.into_iter().find(|id| current.contains(id)) {
                        warn!(
                            "Several ports changed at once ({seen}); {id} was picked arbitrarily, \
                             pass the port explicitly if it is the wrong board"
                        );
                        return Some(id);
                    }
                },
                PortChange::Changed(_) | PortChange::Unchanged => {},
            }
            if deadline.expired() {
                return None;
            }
            deadline.sleep(self.timing.poll_interval);
        }
    }
}
