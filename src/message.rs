//! Message model shared by the store, the dispatch queue and the workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Delivery state of a queued SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Processed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One SMS and its delivery bookkeeping.
///
/// The durable store owns the authoritative copy; queue entries are clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub recipient: String,
    pub body: String,
    pub status: MessageStatus,
    pub retries: u32,
    /// Device that last attempted transmission; empty until the first attempt.
    #[serde(default)]
    pub device: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Build a fresh pending message with a random v4 id.
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            recipient: recipient.into(),
            body: body.into(),
            status: MessageStatus::Pending,
            retries: 0,
            device: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True while the message may still be handed to a device.
    pub fn is_eligible(&self, retry_limit: u32) -> bool {
        self.status != MessageStatus::Processed && self.retries < retry_limit
    }
}
