//! Instance Connection State Machine
//!
//! Tracks the lifecycle of one instance's transport connection. Unlike a
//! typestate machine, instances live in a shared map and change state from
//! event handlers, so the state is a runtime enum and every transition is
//! checked against the table below.
//!
//! # State Diagram
//!
//! ```text
//!                      connect()
//!        IDLE ───────────────────────────► CONNECTING
//!         ▲  ▲                                │   │
//!         │  │ logout / sweep        opened() │   │ open failed
//!         │  │                                ▼   │
//!         │  └──────────────────────────── OPEN   │
//!         │                                │  │   │
//!         │                   conflict()   │  │ closed()
//!         │                                ▼  ▼   ▼
//!         │           CONFLICT_COOLDOWN    CLOSING_RETRY
//!         │                  │                  │
//!         │                  └──── retry ───────┴────► CONNECTING
//!         │
//!         └──── cooldown elapsed ──── CIRCUIT_OPEN ◄── connect() rejected
//! ```
//!
//! Each instance has at most one attempt in CONNECTING or OPEN; the
//! supervisor enforces that by checking [`InstanceStatus::is_live`] under
//! the instance lock before starting an attempt.

use crate::core::types::InstanceId;
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

/// Connection status of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Idle,
    Connecting,
    Open,
    ClosingRetry,
    ConflictCooldown,
    CircuitOpen,
}

impl InstanceStatus {
    /// Connecting or open. A live instance must not start another attempt.
    pub fn is_live(self) -> bool {
        matches!(self, InstanceStatus::Connecting | InstanceStatus::Open)
    }

    pub fn state_name(self) -> &'static str {
        match self {
            InstanceStatus::Idle => "Idle",
            InstanceStatus::Connecting => "Connecting",
            InstanceStatus::Open => "Open",
            InstanceStatus::ClosingRetry => "ClosingRetry",
            InstanceStatus::ConflictCooldown => "ConflictCooldown",
            InstanceStatus::CircuitOpen => "CircuitOpen",
        }
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        match (self, next) {
            (from, to) if from == to => false,
            (Idle | ClosingRetry | ConflictCooldown | CircuitOpen, Connecting) => true,
            (Connecting, Open) => true,
            (Connecting | Open, ClosingRetry | ConflictCooldown) => true,
            (Idle | ClosingRetry | ConflictCooldown, CircuitOpen) => true,
            (_, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

// ============================================================================
// Lifecycle data
// ============================================================================

/// Bookkeeping recorded as the instance moves through its states
#[derive(Debug, Clone)]
pub struct LifecycleData {
    pub instance_id: InstanceId,
    pub created_at: Instant,
    pub entered_at: Instant,
    pub last_opened_at: Option<Instant>,
    pub last_closed_at: Option<Instant>,
    pub open_count: u64,
    pub close_count: u64,
}

/// Current status plus lifecycle bookkeeping for one instance
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    status: InstanceStatus,
    data: LifecycleData,
}

impl ConnectionLifecycle {
    pub fn new(instance_id: InstanceId, now: Instant) -> Self {
        Self {
            status: InstanceStatus::Idle,
            data: LifecycleData {
                instance_id,
                created_at: now,
                entered_at: now,
                last_opened_at: None,
                last_closed_at: None,
                open_count: 0,
                close_count: 0,
            },
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn data(&self) -> &LifecycleData {
        &self.data
    }

    /// How long the instance has been in its current state
    pub fn time_in_state(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.data.entered_at)
    }

    /// Move to `next`, returning the previous status
    pub fn transition(
        &mut self,
        next: InstanceStatus,
        now: Instant,
    ) -> Result<InstanceStatus, TransitionError> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(TransitionError { from, to: next });
        }

        match next {
            InstanceStatus::Open => {
                self.data.last_opened_at = Some(now);
                self.data.open_count += 1;
            }
            InstanceStatus::ClosingRetry | InstanceStatus::ConflictCooldown | InstanceStatus::Idle
                if from == InstanceStatus::Open =>
            {
                self.data.last_closed_at = Some(now);
                self.data.close_count += 1;
            }
            _ => {}
        }

        self.status = next;
        self.data.entered_at = now;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> ConnectionLifecycle {
        ConnectionLifecycle::new(InstanceId::from("test"), Instant::now())
    }

    #[test]
    fn test_happy_path() {
        let mut fsm = lifecycle();
        let now = Instant::now();

        assert_eq!(fsm.status(), InstanceStatus::Idle);
        fsm.transition(InstanceStatus::Connecting, now).unwrap();
        fsm.transition(InstanceStatus::Open, now).unwrap();
        assert_eq!(fsm.status(), InstanceStatus::Open);
        assert_eq!(fsm.data().open_count, 1);
        assert!(fsm.data().last_opened_at.is_some());
    }

    #[test]
    fn test_close_and_retry() {
        let mut fsm = lifecycle();
        let now = Instant::now();

        fsm.transition(InstanceStatus::Connecting, now).unwrap();
        fsm.transition(InstanceStatus::Open, now).unwrap();
        fsm.transition(InstanceStatus::ClosingRetry, now).unwrap();
        assert_eq!(fsm.data().close_count, 1);

        fsm.transition(InstanceStatus::Connecting, now).unwrap();
        assert_eq!(fsm.status(), InstanceStatus::Connecting);
    }

    #[test]
    fn test_cannot_connect_twice() {
        let mut fsm = lifecycle();
        let now = Instant::now();

        fsm.transition(InstanceStatus::Connecting, now).unwrap();
        let err = fsm.transition(InstanceStatus::Connecting, now).unwrap_err();
        assert_eq!(err.from, InstanceStatus::Connecting);

        fsm.transition(InstanceStatus::Open, now).unwrap();
        assert!(fsm.transition(InstanceStatus::Connecting, now).is_err());
    }

    #[test]
    fn test_idle_cannot_jump_to_open() {
        let mut fsm = lifecycle();
        assert!(fsm.transition(InstanceStatus::Open, Instant::now()).is_err());
        assert_eq!(fsm.status(), InstanceStatus::Idle);
    }

    #[test]
    fn test_circuit_open_only_from_inactive_states() {
        assert!(InstanceStatus::Idle.can_transition_to(InstanceStatus::CircuitOpen));
        assert!(InstanceStatus::ClosingRetry.can_transition_to(InstanceStatus::CircuitOpen));
        assert!(!InstanceStatus::Open.can_transition_to(InstanceStatus::CircuitOpen));
        assert!(!InstanceStatus::Connecting.can_transition_to(InstanceStatus::CircuitOpen));
        assert!(InstanceStatus::CircuitOpen.can_transition_to(InstanceStatus::Idle));
    }

    #[test]
    fn test_any_state_can_go_idle() {
        use InstanceStatus::*;
        for status in [Connecting, Open, ClosingRetry, ConflictCooldown, CircuitOpen] {
            assert!(status.can_transition_to(InstanceStatus::Idle), "{}", status);
        }
    }

    #[test]
    fn test_live_states() {
        assert!(InstanceStatus::Connecting.is_live());
        assert!(InstanceStatus::Open.is_live());
        assert!(!InstanceStatus::ClosingRetry.is_live());
        assert!(!InstanceStatus::ConflictCooldown.is_live());
    }
}
