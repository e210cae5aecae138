//! Engine lifecycle states and the transition table.
//!
//! ```text
//! Stopped  → Starting → Running(v)
//! Running  → Updating(v2, p) → Reloading(v2) → Running(v2)
//! Running  → Reloading(v) → Running(v)
//! any      → Failed(e);  Failed → Starting | Updating | Reloading
//! any      → Releasing → Stopped
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::version::EngineVersion;

#[derive(Debug, Clone)]
pub enum EngineState {
    Stopped,
    Starting,
    Running(EngineVersion),
    Updating {
        version: EngineVersion,
        progress: f64,
    },
    Reloading(EngineVersion),
    Failed(Arc<EngineError>),
    Releasing,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running(_) => "running",
            EngineState::Updating { .. } => "updating",
            EngineState::Reloading(_) => "reloading",
            EngineState::Failed(_) => "failed",
            EngineState::Releasing => "releasing",
        }
    }

    pub fn version(&self) -> Option<&EngineVersion> {
        match self {
            EngineState::Running(v) | EngineState::Reloading(v) => Some(v),
            EngineState::Updating { version, .. } => Some(version),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Running(_))
    }
}

impl PartialEq for EngineState {
    fn eq(&self, other: &Self) -> bool {
        use EngineState::*;
        match (self, other) {
            (Stopped, Stopped) | (Starting, Starting) | (Releasing, Releasing) => true,
            (Running(a), Running(b)) | (Reloading(a), Reloading(b)) => a == b,
            (
                Updating {
                    version: a,
                    progress: pa,
                },
                Updating {
                    version: b,
                    progress: pb,
                },
            ) => a == b && pa == pb,
            (Failed(a), Failed(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Running(v) | EngineState::Reloading(v) => {
                write!(f, "{}({})", self.name(), v.id)
            }
            EngineState::Updating { version, progress } => {
                write!(f, "updating({}, {:.0}%)", version.id, progress * 100.0)
            }
            EngineState::Failed(e) => write!(f, "failed({e})"),
            _ => f.write_str(self.name()),
        }
    }
}

fn is_allowed(from: &EngineState, to: &EngineState) -> bool {
    use EngineState::*;
    match (from, to) {
        (Releasing, Stopped) => true,
        (Releasing, _) => false,
        (_, Releasing) => true,
        (_, Failed(_)) => true,
        (Stopped, Starting) => true,
        (Starting, Running(_)) => true,
        (Running(_), Updating { .. }) => true,
        (Updating { version: a, .. }, Updating { version: b, .. }) => a.id == b.id,
        (Updating { .. }, Reloading(_)) => true,
        (Running(_), Reloading(_)) => true,
        (Reloading(_), Running(_)) => true,
        (Failed(_), Starting | Updating { .. } | Reloading(_)) => true,
        _ => false,
    }
}

struct Inner {
    state: EngineState,
    subscribers: Vec<mpsc::UnboundedSender<EngineState>>,
}

/// Current state plus its observers.
pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: EngineState::Stopped,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Config("state lock poisoned".into()))
    }

    pub fn current(&self) -> EngineState {
        self.lock()
            .map(|inner| inner.state.clone())
            .unwrap_or(EngineState::Stopped)
    }

    /// Observe the current state, then every later transition in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineState> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = self.lock() {
            let _ = tx.send(inner.state.clone());
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Move to `next`, or fail with [`EngineError::InvalidTransition`].
    ///
    /// Progress is clamped to `[0, 1]` and never goes backwards while the
    /// same version keeps updating.
    pub fn transition(&self, next: EngineState) -> Result<EngineState> {
        let mut inner = self.lock()?;
        if !is_allowed(&inner.state, &next) {
            return Err(EngineError::InvalidTransition {
                from: inner.state.to_string(),
                to: next.to_string(),
            });
        }

        let next = match (next, &inner.state) {
            (
                EngineState::Updating { version, progress },
                EngineState::Updating {
                    progress: previous, ..
                },
            ) => EngineState::Updating {
                version,
                progress: clamp_progress(progress).max(*previous),
            },
            (EngineState::Updating { version, progress }, _) => EngineState::Updating {
                version,
                progress: clamp_progress(progress),
            },
            (next, _) => next,
        };

        tracing::debug!(from = %inner.state, to = %next, "engine state changed");
        inner.state = next.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(next.clone()).is_ok());
        Ok(next)
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: &str) -> EngineVersion {
        EngineVersion::new(id, id, format!("https://cdn/{id}.wasm"))
    }

    fn updating(id: &str, progress: f64) -> EngineState {
        EngineState::Updating {
            version: v(id),
            progress,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineState>) -> Vec<EngineState> {
        let mut out = Vec::new();
        while let Ok(state) = rx.try_recv() {
            out.push(state);
        }
        out
    }

    #[test]
    fn test_update_cycle_delivered_in_order() {
        let machine = StateMachine::new();
        machine.transition(EngineState::Starting).unwrap();
        machine.transition(EngineState::Running(v("1"))).unwrap();

        let mut rx = machine.subscribe();
        machine.transition(updating("2", 0.0)).unwrap();
        machine.transition(updating("2", 0.5)).unwrap();
        machine.transition(updating("2", 1.0)).unwrap();
        machine.transition(EngineState::Reloading(v("2"))).unwrap();
        machine.transition(EngineState::Running(v("2"))).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                EngineState::Running(v("1")),
                updating("2", 0.0),
                updating("2", 0.5),
                updating("2", 1.0),
                EngineState::Reloading(v("2")),
                EngineState::Running(v("2")),
            ]
        );
    }

    #[test]
    fn test_progress_clamped_and_monotonic() {
        let machine = StateMachine::new();
        machine.transition(EngineState::Starting).unwrap();
        machine.transition(EngineState::Running(v("1"))).unwrap();

        let s = machine.transition(updating("2", -1.0)).unwrap();
        assert_eq!(s, updating("2", 0.0));
        machine.transition(updating("2", 0.7)).unwrap();
        let s = machine.transition(updating("2", 0.3)).unwrap();
        assert_eq!(s, updating("2", 0.7));
        let s = machine.transition(updating("2", 4.0)).unwrap();
        assert_eq!(s, updating("2", 1.0));
    }

    #[test]
    fn test_progress_resets_on_new_cycle() {
        let machine = StateMachine::new();
        machine.transition(EngineState::Starting).unwrap();
        machine.transition(EngineState::Running(v("1"))).unwrap();
        machine.transition(updating("2", 0.9)).unwrap();
        machine
            .transition(EngineState::Failed(Arc::new(EngineError::Cancelled)))
            .unwrap();

        let s = machine.transition(updating("2", 0.1)).unwrap();
        assert_eq!(s, updating("2", 0.1));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let machine = StateMachine::new();
        let err = machine
            .transition(EngineState::Running(v("1")))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(err.to_string(), "invalid state transition: stopped -> running(1)");
        assert_eq!(machine.current(), EngineState::Stopped);

        machine.transition(EngineState::Starting).unwrap();
        machine.transition(EngineState::Running(v("1"))).unwrap();
        machine.transition(updating("2", 0.2)).unwrap();
        assert!(machine.transition(updating("3", 0.2)).is_err());
        assert!(machine.transition(EngineState::Starting).is_err());
    }

    #[test]
    fn test_release_from_anywhere() {
        let machine = StateMachine::new();
        machine.transition(EngineState::Starting).unwrap();
        machine.transition(EngineState::Releasing).unwrap();
        assert!(machine.transition(EngineState::Starting).is_err());
        machine.transition(EngineState::Stopped).unwrap();
        assert_eq!(machine.current(), EngineState::Stopped);
    }

    #[test]
    fn test_failed_recovers() {
        let machine = StateMachine::new();
        machine
            .transition(EngineState::Failed(Arc::new(EngineError::NotRunning)))
            .unwrap();
        machine.transition(EngineState::Starting).unwrap();
        machine.transition(EngineState::Running(v("1"))).unwrap();
        assert!(machine.current().is_running());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let machine = StateMachine::new();
        let rx = machine.subscribe();
        drop(rx);
        machine.transition(EngineState::Starting).unwrap();
        assert!(machine.lock().unwrap().subscribers.is_empty());
    }
}
