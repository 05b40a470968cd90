//! Configuration wizard sessions.
//!
//! A two-step conversation per (chat, user): first the delay, then the
//! delayed message. Sessions belong to the member who started them;
//! other members' messages in the chat are not wizard input.

use crate::trigger::TriggerKind;

pub const MIN_DELAY_SECS: i64 = 1;
pub const MAX_DELAY_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardStep {
    AwaitingDelay,
    AwaitingMessage,
}

#[derive(Debug, Clone)]
pub struct WizardSession {
    pub kind: TriggerKind,
    pub step: WizardStep,
    pub pending_delay: Option<i64>,
    pub chat_id: i64,
    pub initiator: i64,
}

impl WizardSession {
    pub fn new(kind: TriggerKind, chat_id: i64, initiator: i64) -> Self {
        Self {
            kind,
            step: WizardStep::AwaitingDelay,
            pending_delay: None,
            chat_id,
            initiator,
        }
    }

    /// Advance from AwaitingDelay. Invalid input leaves the step unchanged
    /// and the caller re-prompts.
    pub fn accept_delay(&mut self, text: &str) -> Option<i64> {
        let delay = parse_delay_input(text)?;
        self.pending_delay = Some(delay);
        self.step = WizardStep::AwaitingMessage;
        Some(delay)
    }
}

/// Only an integer in [1, 3600] counts as a valid delay.
pub fn parse_delay_input(text: &str) -> Option<i64> {
    let delay: i64 = text.trim().parse().ok()?;
    if (MIN_DELAY_SECS..=MAX_DELAY_SECS).contains(&delay) {
        Some(delay)
    } else {
        None
    }
}
