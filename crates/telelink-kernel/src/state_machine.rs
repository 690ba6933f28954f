//! [`OperatingStateMachine`] – legal operating-mode transitions.
//!
//! [`next_mode`] is the one transition table. [`transition`],
//! [`can_transition`] and [`available_events`] are derived from it, so the
//! guards can never disagree with the transitions they guard.
//!
//! | Mode | Accepted events |
//! |---|---|
//! | `IDLE` | `start_reception`, `start_delivery`, `start_charging`, `fault` |
//! | `RECEPTION` | `stop_reception`, `start_delivery`, `start_charging`, `fault` |
//! | `DELIVERY` | `complete_delivery`, `cancel_delivery`, `fault` |
//! | `CHARGING` | `resume`, `interrupt` |
//! | `ERROR` | `reset` |

use std::collections::VecDeque;

use telelink_types::{ModeEvent, OperatingMode, TransitionRejected};
use tracing::{info, warn};

/// Number of accepted transitions remembered for diagnostics.
pub const HISTORY_CAPACITY: usize = 32;

/// Look up the mode reached by firing `event` in `mode`, or `None` when the
/// event is not accepted there.
pub fn next_mode(mode: OperatingMode, event: ModeEvent) -> Option<OperatingMode> {
    use ModeEvent as E;
    use OperatingMode as M;

    match (mode, event) {
        (M::Idle, E::StartReception) => Some(M::Reception),
        (M::Idle, E::StartDelivery) => Some(M::Delivery),
        (M::Idle, E::StartCharging) => Some(M::Charging),
        (M::Idle, E::Fault) => Some(M::Error),

        (M::Reception, E::StopReception) => Some(M::Idle),
        (M::Reception, E::StartDelivery) => Some(M::Delivery),
        (M::Reception, E::StartCharging) => Some(M::Charging),
        (M::Reception, E::Fault) => Some(M::Error),

        (M::Delivery, E::CompleteDelivery) => Some(M::Idle),
        (M::Delivery, E::CancelDelivery) => Some(M::Idle),
        (M::Delivery, E::Fault) => Some(M::Error),

        (M::Charging, E::Resume) => Some(M::Idle),
        (M::Charging, E::Interrupt) => Some(M::Error),

        (M::Error, E::Reset) => Some(M::Idle),

        _ => None,
    }
}

/// An accepted mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: OperatingMode,
    pub next: OperatingMode,
    pub event: ModeEvent,
}

/// Pure transition function: every `(mode, event)` pair yields either a
/// [`Transition`] or a [`TransitionRejected`].
pub fn transition(mode: OperatingMode, event: ModeEvent) -> Result<Transition, TransitionRejected> {
    next_mode(mode, event)
        .map(|next| Transition {
            previous: mode,
            next,
            event,
        })
        .ok_or(TransitionRejected { mode, event })
}

pub fn can_transition(mode: OperatingMode, event: ModeEvent) -> bool {
    next_mode(mode, event).is_some()
}

/// Events accepted in `mode`, in declaration order.
pub fn available_events(mode: OperatingMode) -> Vec<ModeEvent> {
    ModeEvent::ALL
        .into_iter()
        .filter(|event| can_transition(mode, *event))
        .collect()
}

/// Holder of the single current [`OperatingMode`].
///
/// The mode starts at `IDLE` and only changes through [`fire`](Self::fire).
#[derive(Debug)]
pub struct OperatingStateMachine {
    current: OperatingMode,
    history: VecDeque<Transition>,
}

impl Default for OperatingStateMachine {
    fn default() -> Self {
        Self {
            current: OperatingMode::Idle,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }
}

impl OperatingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> OperatingMode {
        self.current
    }

    /// Apply `event` to the current mode.
    ///
    /// A rejected event is logged as a warning and leaves the mode unchanged.
    pub fn fire(&mut self, event: ModeEvent) -> Result<Transition, TransitionRejected> {
        match transition(self.current, event) {
            Ok(t) => {
                info!(previous = %t.previous, next = %t.next, event = %event, "operating mode changed");
                self.current = t.next;
                if self.history.len() == HISTORY_CAPACITY {
                    self.history.pop_front();
                }
                self.history.push_back(t);
                Ok(t)
            }
            Err(rejected) => {
                warn!(mode = %rejected.mode, event = %event, "transition rejected");
                Err(rejected)
            }
        }
    }

    pub fn can_fire(&self, event: ModeEvent) -> bool {
        can_transition(self.current, event)
    }

    pub fn available_events(&self) -> Vec<ModeEvent> {
        available_events(self.current)
    }

    /// Accepted transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }
}
