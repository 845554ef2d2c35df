//! Lock state machine with generation-keyed auto-close.
//!
//! ```text
//! Closed ──request_open──▶ Opening ──unlock ok──▶ Open ──timer/close──▶ Closing ──lock ok──▶ Closed
//!   ▲                         │                   ▲ │                       │
//!   └──────unlock failed──────┘                   │ └──request_open (re-arm)│
//!                                                 └──────lock failed────────┘
//! ```
//!
//! Every transition runs while holding the actor mutex, so requests for the
//! lock are totally ordered. Each successful open arms a timer tagged with a
//! fresh generation; a timer whose generation is no longer the armed one does
//! nothing when it fires.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::actuator::LockActuator;
use crate::constants::MAX_HOLD;
use crate::error::{ActuationError, StateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Closed => "closed",
            LockState::Opening => "opening",
            LockState::Open => "open",
            LockState::Closing => "closing",
        }
    }

    /// Edges of the transition graph.
    pub fn can_transition_to(self, to: LockState) -> bool {
        use LockState::*;
        matches!(
            (self, to),
            (Closed, Opening)
                | (Open, Opening)
                | (Opening, Open)
                | (Opening, Closed)
                | (Open, Closing)
                | (Closing, Closed)
                | (Closing, Open)
        )
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LockState,
    pub to: LockState,
    /// Generation of the most recently armed timer at the time of the change.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct AutoCloseTimer {
    pub lock_id: String,
    pub fire_at: Instant,
    pub generation: u64,
}

/// Read-only view for status polling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub lock_id: String,
    pub state: LockState,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub last_message: String,
    pub generation: u64,
    pub auto_close_in_secs: Option<u64>,
}

struct Snapshot {
    state: LockState,
    last_opened_at: Option<DateTime<Utc>>,
    last_message: String,
    generation: u64,
    timer: Option<AutoCloseTimer>,
}

struct Inner<A> {
    lock_id: String,
    actuator: A,
    /// The serialization point. Guards the abort handle of the armed timer task.
    actor: tokio::sync::Mutex<Option<AbortHandle>>,
    snapshot: Mutex<Snapshot>,
    transitions: broadcast::Sender<Transition>,
}

/// Owns the lock's observable state and its auto-close timer.
pub struct LockStateMachine<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for LockStateMachine<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: LockActuator + 'static> LockStateMachine<A> {
    pub fn new(lock_id: impl Into<String>, actuator: A) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                lock_id: lock_id.into(),
                actuator,
                actor: tokio::sync::Mutex::new(None),
                snapshot: Mutex::new(Snapshot {
                    state: LockState::Closed,
                    last_opened_at: None,
                    last_message: "Waiting for payment".to_string(),
                    generation: 0,
                    timer: None,
                }),
                transitions,
            }),
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.inner.lock_id
    }

    pub fn actuator(&self) -> &A {
        &self.inner.actuator
    }

    pub fn state(&self) -> LockState {
        self.snapshot().state
    }

    /// Current snapshot. Never waits on an in-flight transition.
    pub fn status(&self) -> LockStatus {
        let snap = self.snapshot();
        let now = Instant::now();
        LockStatus {
            lock_id: self.inner.lock_id.clone(),
            state: snap.state,
            last_opened_at: snap.last_opened_at,
            last_message: snap.last_message.clone(),
            generation: snap.generation,
            auto_close_in_secs: snap
                .timer
                .as_ref()
                .map(|t| t.fire_at.saturating_duration_since(now).as_secs()),
        }
    }

    /// The armed auto-close timer, if any.
    pub fn armed_timer(&self) -> Option<AutoCloseTimer> {
        self.snapshot().timer.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.inner.transitions.subscribe()
    }

    /// Unlock and keep the lock open for `hold`.
    ///
    /// Valid from `Closed` and `Open`; re-opening an open lock replaces its
    /// timer. `hold` is clamped to [`MAX_HOLD`]. If the unlock command fails the state returns to where it was,
    /// so an already open lock keeps its previous timer.
    pub async fn request_open(&self, hold: Duration) -> Result<(), StateError> {
        let hold = hold.min(MAX_HOLD);
        let mut armed = self.inner.actor.lock().await;

        let from = self.snapshot().state;
        if !matches!(from, LockState::Closed | LockState::Open) {
            return Err(StateError::InvalidTransition {
                from,
                operation: "open",
            });
        }

        self.set_state(LockState::Opening, |s| {
            s.last_message = "Payment confirmed, opening lock".to_string();
        });

        if let Err(e) = self.inner.actuator.unlock(&self.inner.lock_id).await {
            self.set_state(from, |s| {
                s.last_message = format!("Unlock failed: {}", e.message);
            });
            return Err(e.into());
        }

        if let Some(previous) = armed.take() {
            previous.abort();
        }
        let fire_at = Instant::now() + hold;
        let generation = self.set_state(LockState::Open, |s| {
            s.generation += 1;
            s.last_opened_at = Some(Utc::now());
            s.last_message = format!("Payment confirmed, lock open for {}s", hold.as_secs());
            s.timer = Some(AutoCloseTimer {
                lock_id: self.inner.lock_id.clone(),
                fire_at,
                generation: s.generation,
            });
        });
        *armed = Some(self.arm(generation, fire_at));

        tracing::info!(
            lock_id = %self.inner.lock_id,
            generation,
            hold_secs = hold.as_secs(),
            "lock opened"
        );
        Ok(())
    }

    /// Close an open lock now, cancelling its timer. Closing a closed lock is
    /// a no-op.
    pub async fn request_close(&self) -> Result<(), StateError> {
        let mut armed = self.inner.actor.lock().await;

        let state = self.snapshot().state;
        match state {
            LockState::Closed => return Ok(()),
            LockState::Open => {}
            from => {
                return Err(StateError::InvalidTransition {
                    from,
                    operation: "close",
                })
            }
        }

        if let Some(timer) = armed.take() {
            timer.abort();
        }
        tracing::info!(lock_id = %self.inner.lock_id, "manual close requested");
        self.close_locked().await.map_err(StateError::from)
    }

    /// Timer callback. No-op unless `generation` is still the armed one.
    async fn fire(&self, generation: u64) {
        let mut armed = self.inner.actor.lock().await;

        let (state, current) = {
            let snap = self.snapshot();
            (snap.state, snap.timer.as_ref().map(|t| t.generation))
        };
        if current != Some(generation) || state != LockState::Open {
            tracing::debug!(
                lock_id = %self.inner.lock_id,
                generation,
                current = ?current,
                "stale auto-close timer ignored"
            );
            return;
        }

        // This task is the armed one; drop its handle without aborting ourselves.
        armed.take();
        tracing::info!(lock_id = %self.inner.lock_id, generation, "auto-close timer fired");
        let _ = self.close_locked().await;
    }

    /// Open -> Closing -> Closed, or back to Open if the vendor refuses.
    /// Caller holds the actor mutex.
    async fn close_locked(&self) -> Result<(), ActuationError> {
        self.set_state(LockState::Closing, |s| {
            s.timer = None;
            s.last_message = "Closing lock".to_string();
        });

        match self.inner.actuator.lock(&self.inner.lock_id).await {
            Ok(()) => {
                self.set_state(LockState::Closed, |s| {
                    s.last_message = "Lock closed".to_string();
                });
                tracing::info!(lock_id = %self.inner.lock_id, "lock closed");
                Ok(())
            }
            Err(e) => {
                // No automatic retry; the failure stays visible in the status.
                self.set_state(LockState::Open, |s| {
                    s.last_message =
                        format!("Lock command failed, lock may still be open: {}", e.message);
                });
                tracing::error!(lock_id = %self.inner.lock_id, error = %e, "failed to close lock");
                Err(e)
            }
        }
    }

    fn arm(&self, generation: u64, fire_at: Instant) -> AbortHandle {
        let machine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            machine.fire(generation).await;
        })
        .abort_handle()
    }

    /// Apply `update`, move to `to` and publish the transition. Returns the
    /// generation after the update.
    fn set_state(&self, to: LockState, update: impl FnOnce(&mut Snapshot)) -> u64 {
        let mut snap = self.snapshot();
        let from = snap.state;
        update(&mut snap);
        snap.state = to;
        let generation = snap.generation;
        drop(snap);

        debug_assert!(from.can_transition_to(to), "invalid transition {from} -> {to}");
        tracing::debug!(
            lock_id = %self.inner.lock_id,
            %from,
            %to,
            generation,
            "lock state changed"
        );
        // No receivers is fine.
        let _ = self.inner.transitions.send(Transition {
            from,
            to,
            generation,
        });
        generation
    }

    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        match self.inner.snapshot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("lock snapshot mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
