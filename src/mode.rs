use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::SENSING_SECONDS_MAX;

pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(60);

pub const PENDING_RESTART_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperatingMode {
    None,
    Sensing,
    Resting,
    Provisioning,
    PendingRestart,
    Restarting,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::None => "none",
            OperatingMode::Sensing => "sensing",
            OperatingMode::Resting => "resting",
            OperatingMode::Provisioning => "provisioning",
            OperatingMode::PendingRestart => "pending-restart",
            OperatingMode::Restarting => "restarting",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug)]
struct ModeTransition {
    mode: OperatingMode,
    next: OperatingMode,
    timeout: Duration,
}

// Modes missing from the table (`Restarting`, `None`) only change on request.
#[derive(Debug)]
pub struct OperatingModeMachine {
    current: OperatingMode,
    pending: Option<OperatingMode>,
    deadline: Option<Instant>,
    table: Vec<ModeTransition>,
}

impl Default for OperatingModeMachine {
    fn default() -> Self {
        OperatingModeMachine::new()
    }
}

impl OperatingModeMachine {
    pub fn new() -> Self {
        let fallback = Duration::from_secs(SENSING_SECONDS_MAX);
        OperatingModeMachine {
            current: OperatingMode::None,
            pending: None,
            deadline: None,
            table: vec![
                ModeTransition {
                    mode: OperatingMode::Resting,
                    next: OperatingMode::Sensing,
                    timeout: fallback,
                },
                // The scanner normally ends sensing itself once its window is
                // over; this entry only catches a scan that never finishes.
                ModeTransition {
                    mode: OperatingMode::Sensing,
                    next: OperatingMode::Resting,
                    timeout: fallback,
                },
                ModeTransition {
                    mode: OperatingMode::Provisioning,
                    next: OperatingMode::Provisioning,
                    timeout: PROVISIONING_TIMEOUT,
                },
                ModeTransition {
                    mode: OperatingMode::PendingRestart,
                    next: OperatingMode::Restarting,
                    timeout: PENDING_RESTART_DELAY,
                },
            ],
        }
    }

    /// Requesting the mode we are already in withdraws a pending request.
    pub fn request_transition(&mut self, mode: OperatingMode) {
        debug!("Mode change requested from {} to {}", self.current, mode);
        self.pending = (self.current != mode).then_some(mode);
    }

    /// Counts a request that has not been applied by a tick yet.
    pub fn is_in(&self, mode: OperatingMode) -> bool {
        self.mode() == mode
    }

    pub fn mode(&self) -> OperatingMode {
        self.pending.unwrap_or(self.current)
    }

    pub fn modify_timeout(&mut self, mode: OperatingMode, timeout: Duration) {
        let mut found = false;
        for transition in self.table.iter_mut().filter(|t| t.mode == mode) {
            debug!(
                "Changing timeout for {} from {:?} to {:?}",
                mode, transition.timeout, timeout
            );
            transition.timeout = timeout;
            found = true;
        }
        if !found {
            debug!("No timed transition for {mode}, timeout ignored");
        }
    }

    /// Returns the mode just entered, including a self transition.
    pub fn tick(&mut self, now: Instant) -> Option<OperatingMode> {
        let next = match self.pending.take() {
            Some(requested) => Some(requested),
            None => self.timed_transition(now),
        };

        if let Some(mode) = next {
            info!("Mode changing from {} to {}", self.current, mode);
            self.current = mode;
            self.deadline = None;
        }
        next
    }

    fn timed_transition(&mut self, now: Instant) -> Option<OperatingMode> {
        let transition = self.table.iter().find(|t| t.mode == self.current)?;
        if transition.timeout.is_zero() {
            return Some(transition.next);
        }
        match self.deadline {
            Some(deadline) if now >= deadline => Some(transition.next),
            Some(_) => None,
            None => {
                debug!(
                    "Arming timer: {} to {} in {:?}",
                    self.current, transition.next, transition.timeout
                );
                self.deadline = Some(now + transition.timeout);
                None
            }
        }
    }
}
