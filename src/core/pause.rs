//! Global pause signal.
//!
//! While paused, submitted messages are recorded and queued but no rounds run.
//! Lifting the pause is what triggers `resume_all` (see [`crate::hub::Hub::resume`]).

use tokio::sync::watch;

/// Read side of the pause switch.
pub trait PauseSignal: Send + Sync {
    fn is_paused(&self) -> bool;
}

/// Owner of the pause flag. Observers can watch it change.
#[derive(Debug)]
pub struct PauseController {
    state: watch::Sender<bool>,
}

impl PauseController {
    pub fn new(paused: bool) -> Self {
        let (state, _) = watch::channel(paused);
        Self { state }
    }

    /// Set the flag. Returns true if it changed.
    pub fn set_paused(&self, paused: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == paused {
                false
            } else {
                *current = paused;
                true
            }
        });
        if changed {
            tracing::info!("Flow {}", if paused { "paused" } else { "resumed" });
        }
        changed
    }

    pub fn pause(&self) -> bool {
        self.set_paused(true)
    }

    pub fn resume(&self) -> bool {
        self.set_paused(false)
    }

    pub fn toggle(&self) -> bool {
        let next = !self.is_paused();
        self.set_paused(next);
        next
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PauseSignal for PauseController {
    fn is_paused(&self) -> bool {
        *self.state.borrow()
    }
}
