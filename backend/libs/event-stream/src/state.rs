//! Subscription lifecycle state machine.
//!
//! ```text
//! Created -> Connecting -> Polling <-> Handling -> Committing -> Polling
//!                 |            |           |            |
//!                 +------------+-----------+------------+--> Closed | Failed
//! ```
//!
//! `Closed` and `Failed` are terminal.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Created,
    Connecting,
    Polling,
    Handling,
    Committing,
    Closed,
    Failed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Closed | SubscriptionState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed) => true,
            (Created, Connecting) => true,
            (Created, Closed) => true,
            (Connecting, Polling) | (Connecting, Closed) => true,
            (Polling, Handling) | (Polling, Committing) | (Polling, Closed) => true,
            (Handling, Polling) | (Handling, Committing) => true,
            (Committing, Polling) | (Committing, Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriptionState::Created => "created",
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Polling => "polling",
            SubscriptionState::Handling => "handling",
            SubscriptionState::Committing => "committing",
            SubscriptionState::Closed => "closed",
            SubscriptionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
