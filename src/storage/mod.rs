//! # Storage Module - Durable Message Queue
//!
//! The store is the single source of truth for every SMS the gateway has accepted.
//! In-memory queue entries are copies; each attempt's result is written back here
//! before any requeue decision is acted on, so a restart can always rediscover the
//! outstanding work with [`MessageStore::fetch_pending`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsgate::message::Message;
//! use smsgate::storage::{MessageStore, SledStoreBuilder};
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = SledStoreBuilder::new("./data/messages").retry_limit(3).open()?;
//!     store.insert(&Message::new("+15551234567", "hello"))?;
//!     for pending in store.fetch_pending(10)? {
//!         println!("{} -> {}", pending.id, pending.recipient);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Concurrent callers (workers, the refill controller, the intake path) share one
//! store behind an `Arc`; every operation is safe to interleave.

pub mod errors;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use sled::IVec;

use crate::message::{Message, MessageStatus};

pub use errors::StoreError;

const TREE_MESSAGES: &str = "sms";

/// Persistence contract the dispatch core relies on.
pub trait MessageStore: Send + Sync {
    /// Persist a new record. Fails with [`StoreError::AlreadyExists`] on a duplicate id.
    fn insert(&self, message: &Message) -> Result<(), StoreError>;

    /// Merge delivery fields into an existing record.
    fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        retries: u32,
        device: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Up to `limit` records still eligible for transmission, oldest first.
    fn fetch_pending(&self, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// Every stored record, for reporting.
    fn fetch_all(&self) -> Result<Vec<Message>, StoreError>;

    fn get(&self, id: &str) -> Result<Message, StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Per-status counts over the whole store.
///
/// `retired` holds messages still marked pending that used up every attempt
/// without a clear answer from the modem; they are no longer dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: usize,
    pub processed: usize,
    pub failed: usize,
    pub retired: usize,
}

impl StatusSummary {
    pub fn from_messages<'a>(
        messages: impl IntoIterator<Item = &'a Message>,
        retry_limit: u32,
    ) -> Self {
        let mut summary = StatusSummary::default();
        for message in messages {
            match message.status {
                MessageStatus::Pending if message.retries >= retry_limit => summary.retired += 1,
                MessageStatus::Pending => summary.pending += 1,
                MessageStatus::Processed => summary.processed += 1,
                MessageStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.pending + self.processed + self.failed + self.retired
    }
}

/// Summarize any store against the dispatcher's retry limit.
pub fn status_summary(
    store: &dyn MessageStore,
    retry_limit: u32,
) -> Result<StatusSummary, StoreError> {
    let all = store.fetch_all()?;
    Ok(StatusSummary::from_messages(&all, retry_limit))
}

/// Helper builder so tests can easily create throwaway stores with custom paths.
pub struct SledStoreBuilder {
    path: PathBuf,
    retry_limit: u32,
}

impl SledStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry_limit: 3,
        }
    }

    /// Attempts after which `fetch_pending` stops returning a message.
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn open(self) -> Result<SledStore, StoreError> {
        SledStore::open_with_limit(self.path, self.retry_limit)
    }
}

/// Sled-backed message store keyed by message id.
pub struct SledStore {
    _db: sled::Db,
    messages: sled::Tree,
    retry_limit: u32,
}

impl SledStore {
    fn open_with_limit<P: AsRef<Path>>(path: P, retry_limit: u32) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let messages = db.open_tree(TREE_MESSAGES)?;
        debug!(
            "Opened message store at {} ({} records)",
            path_ref.display(),
            messages.len()
        );
        Ok(Self {
            _db: db,
            messages,
            retry_limit,
        })
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    fn serialize(message: &Message) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(message)?)
    }

    fn deserialize(bytes: &IVec) -> Result<Message, StoreError> {
        Ok(bincode::deserialize::<Message>(bytes)?)
    }

    fn scan(&self) -> Result<Vec<Message>, StoreError> {
        let mut out = Vec::new();
        for entry in self.messages.iter() {
            let (_, value) = entry?;
            out.push(Self::deserialize(&value)?);
        }
        Ok(out)
    }
}

impl MessageStore for SledStore {
    fn insert(&self, message: &Message) -> Result<(), StoreError> {
        let bytes = Self::serialize(message)?;
        let swapped =
            self.messages
                .compare_and_swap(message.id.as_bytes(), None::<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Err(StoreError::AlreadyExists(message.id.clone()));
        }
        self.messages.flush()?;
        Ok(())
    }

    fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        retries: u32,
        device: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = id.as_bytes();
        loop {
            let Some(current) = self.messages.get(key)? else {
                return Err(StoreError::NotFound(id.to_string()));
            };
            let mut record = Self::deserialize(&current)?;
            record.status = status;
            record.retries = retries;
            record.device = device.to_string();
            record.updated_at = updated_at;
            let bytes = Self::serialize(&record)?;
            // Retry when another writer changed the record underneath us.
            if self
                .messages
                .compare_and_swap(key, Some(current), Some(bytes))?
                .is_ok()
            {
                break;
            }
        }
        self.messages.flush()?;
        Ok(())
    }

    fn fetch_pending(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut pending: Vec<Message> = self
            .scan()?
            .into_iter()
            .filter(|m| m.is_eligible(self.retry_limit))
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    fn fetch_all(&self) -> Result<Vec<Message>, StoreError> {
        let mut all = self.scan()?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    fn get(&self, id: &str) -> Result<Message, StoreError> {
        let Some(bytes) = self.messages.get(id.as_bytes())? else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        Self::deserialize(&bytes)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.messages.flush()?;
        Ok(())
    }
}
