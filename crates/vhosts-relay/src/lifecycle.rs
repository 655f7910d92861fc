use std::fmt;

use tokio::sync::watch;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Idle => "idle",
            State::Running => "running",
            State::Draining => "draining",
            State::Stopped => "stopped",
        })
    }
}

/// Engine run state, observable from any thread.
///
/// Transitions only move forward (`Idle → Running → Draining → Stopped`); a request to move
/// backwards is ignored.
#[derive(Clone)]
pub struct Lifecycle {
    tx: watch::Sender<State>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(State::Idle);
        Self { tx }
    }

    pub fn state(&self) -> State {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.tx.subscribe()
    }

    /// Advance to `next`. Returns true if the state changed.
    pub fn advance(&self, next: State) -> bool {
        let mut prev = next;
        let changed = self.tx.send_if_modified(|state| {
            if *state >= next {
                return false;
            }
            prev = *state;
            *state = next;
            true
        });
        if changed {
            info!(from = %prev, to = %next, "engine state changed");
        }
        changed
    }
}
