//! Emergency stop for procedures that die half way.
//!
//! A nod that panics after opening the phase loop, or an acquisition whose
//! future is dropped mid-integration, leaves the instrument in a state no
//! `finalize` restored. [`RunGuard`] notices that on drop and sets the shared
//! [`EmergencyStopFlag`], which makes `execute_procedure_safely` refuse every
//! later run until an operator resets the flag.

use std::sync::{Arc, Mutex};

/// Shared emergency-stop state: set when it holds a reason.
#[derive(Clone, Default)]
pub struct EmergencyStopFlag {
    reason: Arc<Mutex<Option<String>>>,
}

impl EmergencyStopFlag {
    /// Cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; the first reason is kept.
    pub fn trigger(&self, reason: impl Into<String>) {
        if let Ok(mut current) = self.reason.lock() {
            current.get_or_insert_with(|| reason.into());
        }
    }

    /// Whether runs are currently refused.
    pub fn is_triggered(&self) -> bool {
        self.reason().is_some()
    }

    /// Why the flag was set, if it is.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Clear the flag after the instrument was checked by hand.
    pub fn reset(&self) {
        if let Ok(mut current) = self.reason.lock() {
            *current = None;
        }
    }

    /// Arm a guard for the run of `procedure`.
    pub fn guard(&self, procedure: impl Into<String>) -> RunGuard {
        RunGuard {
            flag: self.clone(),
            procedure: procedure.into(),
            armed: true,
        }
    }
}

impl std::fmt::Debug for EmergencyStopFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EmergencyStopFlag").field(&self.reason()).finish()
    }
}

/// Sets its flag when dropped while still armed.
#[must_use = "a guard dropped immediately triggers the emergency stop"]
pub struct RunGuard {
    flag: EmergencyStopFlag,
    procedure: String,
    armed: bool,
}

impl RunGuard {
    /// The run ended normally, with or without an error.
    pub fn disarm(mut self) {
        self.armed = false;
    }

    /// Whether dropping the guard would set the flag.
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = if std::thread::panicking() {
            format!("{} panicked", self.procedure)
        } else {
            format!("{} was abandoned mid-run", self.procedure)
        };
        tracing::error!(procedure = %self.procedure, "emergency stop: {}", reason);
        self.flag.trigger(reason);
    }
}
