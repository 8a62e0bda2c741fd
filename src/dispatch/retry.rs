//! Status transition applied after every transmit attempt.

use crate::message::MessageStatus;
use crate::modem::TransmitOutcome;

/// What to record for a message after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub status: MessageStatus,
    pub retries: u32,
    pub requeue: bool,
}

impl Decision {
    /// Retired without ever being accepted by a modem.
    pub fn is_terminal_failure(&self) -> bool {
        !self.requeue && self.status != MessageStatus::Processed
    }
}

/// Every attempt counts against `retry_limit`, whatever its outcome. Only
/// non-processed messages still under the limit go back in the queue.
pub fn decide(previous_retries: u32, outcome: TransmitOutcome, retry_limit: u32) -> Decision {
    let retries = previous_retries.saturating_add(1);
    let status = match outcome {
        TransmitOutcome::Sent => MessageStatus::Processed,
        TransmitOutcome::DeviceError => MessageStatus::Failed,
        TransmitOutcome::Indeterminate => MessageStatus::Pending,
    };
    Decision {
        status,
        retries,
        requeue: status != MessageStatus::Processed && retries < retry_limit,
    }
}
