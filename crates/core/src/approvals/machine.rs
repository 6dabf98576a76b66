use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::{ApprovalAction, ApprovalStatus};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("invalid approval transition from {state} using action {action}")]
pub struct TransitionError {
    pub state: ApprovalStatus,
    pub action: ApprovalAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ApprovalStatus,
    pub to: ApprovalStatus,
    pub action: ApprovalAction,
    pub opens_cycle: bool,
}

pub const INITIAL_STATE: ApprovalStatus = ApprovalStatus::NotSubmitted;

/// The complete approval lifecycle. Anything not listed here is rejected.
pub fn transition(
    current: ApprovalStatus,
    action: ApprovalAction,
) -> Result<Transition, TransitionError> {
    use ApprovalAction::{Approve, Reject, Resubmit, Submit, Withdraw};
    use ApprovalStatus::{Approved, NotSubmitted, Pending, Rejected};

    let to = match (current, action) {
        (NotSubmitted, Submit) => Pending,
        (Pending, Approve) => Approved,
        (Pending, Reject) => Rejected,
        (Pending, Withdraw) => NotSubmitted,
        (Rejected, Resubmit) => Pending,
        _ => return Err(TransitionError { state: current, action }),
    };

    Ok(Transition { from: current, to, action, opens_cycle: action.opens_cycle() })
}

pub fn can_apply(current: ApprovalStatus, action: ApprovalAction) -> bool {
    transition(current, action).is_ok()
}

#[cfg(test)]
mod tests {
    use super::{can_apply, transition, TransitionError, INITIAL_STATE};
    use crate::domain::approval::{ApprovalAction, ApprovalStatus};

    const STATES: [ApprovalStatus; 4] = [
        ApprovalStatus::NotSubmitted,
        ApprovalStatus::Pending,
        ApprovalStatus::Approved,
        ApprovalStatus::Rejected,
    ];

    fn legal_table() -> Vec<(ApprovalStatus, ApprovalAction, ApprovalStatus)> {
        vec![
            (ApprovalStatus::NotSubmitted, ApprovalAction::Submit, ApprovalStatus::Pending),
            (ApprovalStatus::Pending, ApprovalAction::Approve, ApprovalStatus::Approved),
            (ApprovalStatus::Pending, ApprovalAction::Reject, ApprovalStatus::Rejected),
            (ApprovalStatus::Pending, ApprovalAction::Withdraw, ApprovalStatus::NotSubmitted),
            (ApprovalStatus::Rejected, ApprovalAction::Resubmit, ApprovalStatus::Pending),
        ]
    }

    #[test]
    fn every_pair_outside_the_table_is_rejected() {
        let table = legal_table();
        for state in STATES {
            for action in ApprovalAction::ALL {
                let expected =
                    table.iter().find(|(from, on, _)| *from == state && *on == action);
                match (transition(state, action), expected) {
                    (Ok(outcome), Some((_, _, to))) => {
                        assert_eq!(outcome.from, state);
                        assert_eq!(outcome.to, *to);
                    }
                    (Err(error), None) => {
                        assert_eq!(error, TransitionError { state, action });
                    }
                    (result, expected) => {
                        panic!("{state:?} + {action:?}: got {result:?}, expected {expected:?}")
                    }
                }
            }
        }
    }

    #[test]
    fn only_submit_and_resubmit_open_cycles() {
        let submit = transition(INITIAL_STATE, ApprovalAction::Submit).expect("submit");
        let resubmit =
            transition(ApprovalStatus::Rejected, ApprovalAction::Resubmit).expect("resubmit");
        let approve =
            transition(ApprovalStatus::Pending, ApprovalAction::Approve).expect("approve");

        assert!(submit.opens_cycle);
        assert!(resubmit.opens_cycle);
        assert!(!approve.opens_cycle);
    }

    #[test]
    fn terminal_states_accept_nothing_but_resubmission_after_rejection() {
        for action in ApprovalAction::ALL {
            assert!(!can_apply(ApprovalStatus::Approved, action));
        }
        let after_reject: Vec<ApprovalAction> = ApprovalAction::ALL
            .into_iter()
            .filter(|action| can_apply(ApprovalStatus::Rejected, *action))
            .collect();
        assert_eq!(after_reject, vec![ApprovalAction::Resubmit]);
    }

    #[test]
    fn replaying_the_same_actions_is_deterministic() {
        let actions = [
            ApprovalAction::Submit,
            ApprovalAction::Reject,
            ApprovalAction::Resubmit,
            ApprovalAction::Approve,
        ];
        let run = || {
            actions.iter().try_fold(INITIAL_STATE, |state, action| {
                transition(state, *action).map(|outcome| outcome.to)
            })
        };

        assert_eq!(run(), Ok(ApprovalStatus::Approved));
        assert_eq!(run(), run());
    }
}
