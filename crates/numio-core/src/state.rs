//! The activation state machine.
//!
//! A pure validator over state pairs; the kernel is the only caller that may
//! act on its verdicts. Any transition not listed below is a programming bug
//! and surfaces as `InvalidTransition`.
//!
//! ```text
//! INIT      → RESERVED
//! RESERVED  → ACTIVE | FAILED | CANCELLED
//! ACTIVE    → RECEIVED | EXPIRED | CANCELLED
//! EXPIRED   → REFUNDED
//! FAILED    → REFUNDED
//! CANCELLED → REFUNDED
//! RECEIVED, REFUNDED : terminal
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NumioError;

/// Lifecycle state of an activation (one purchase order).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ActivationState {
    Init,
    Reserved,
    Active,
    Received,
    Expired,
    Cancelled,
    Failed,
    Refunded,
}

impl ActivationState {
    /// States reachable from `self` in a single accepted transition.
    pub fn allowed(self) -> &'static [ActivationState] {
        use ActivationState::*;
        match self {
            Init => &[Reserved],
            Reserved => &[Active, Failed, Cancelled],
            Active => &[Received, Expired, Cancelled],
            Expired => &[Refunded],
            Failed => &[Refunded],
            Cancelled => &[Refunded],
            Received | Refunded => &[],
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActivationState::Received | ActivationState::Refunded)
    }

    /// A refundable state is one the refund path may leave from.
    pub fn is_refundable(self) -> bool {
        matches!(
            self,
            ActivationState::Expired | ActivationState::Failed | ActivationState::Cancelled
        )
    }

    /// Short machine label, used in history rows, metrics and event payloads.
    pub fn label(self) -> &'static str {
        match self {
            ActivationState::Init => "INIT",
            ActivationState::Reserved => "RESERVED",
            ActivationState::Active => "ACTIVE",
            ActivationState::Received => "RECEIVED",
            ActivationState::Expired => "EXPIRED",
            ActivationState::Cancelled => "CANCELLED",
            ActivationState::Failed => "FAILED",
            ActivationState::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Validate a transition. Returns `Ok(())` when `to ∈ allowed(from)`.
pub fn check_transition(
    from: ActivationState,
    to: ActivationState,
) -> Result<(), NumioError> {
    if from.allowed().contains(&to) {
        Ok(())
    } else {
        Err(NumioError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActivationState::*;

    const ALL: [ActivationState; 8] =
        [Init, Reserved, Active, Received, Expired, Cancelled, Failed, Refunded];

    #[test]
    fn happy_path_is_legal() {
        check_transition(Init, Reserved).unwrap();
        check_transition(Reserved, Active).unwrap();
        check_transition(Active, Received).unwrap();
    }

    #[test]
    fn refund_paths_are_legal() {
        for from in [Expired, Failed, Cancelled] {
            check_transition(from, Refunded).unwrap();
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for from in [Received, Refunded] {
            for to in ALL {
                assert!(
                    check_transition(from, to).is_err(),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn skipping_active_is_illegal() {
        assert!(check_transition(Reserved, Received).is_err());
        assert!(check_transition(Reserved, Expired).is_err());
        assert!(check_transition(Init, Active).is_err());
    }

    #[test]
    fn refundable_set_is_exact() {
        for s in ALL {
            assert_eq!(
                s.is_refundable(),
                matches!(s, Expired | Failed | Cancelled),
                "{s}"
            );
        }
    }

    #[test]
    fn allowed_and_terminal_agree() {
        for s in ALL {
            assert_eq!(s.is_terminal(), s.allowed().is_empty(), "{s}");
        }
    }
}
