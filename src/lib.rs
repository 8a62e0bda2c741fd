//! # smsgate - SMS Gateway for Attached GSM Modems
//!
//! smsgate accepts text messages, stores them durably and pushes them out through one or
//! more GSM modems attached over serial links. Every accepted message gets bounded
//! delivery attempts, and anything not yet delivered is rediscovered from the store
//! after a crash or restart.
//!
//! ## Features
//!
//! - **Durable Intake**: Messages are written to a sled database before any work is scheduled.
//! - **Bounded Dispatch Buffer**: A fixed-size in-memory queue refilled from the store below a watermark.
//! - **One Worker per Modem**: Independently paced devices drain the same queue.
//! - **Text and PDU Modes**: Plain ASCII goes out in text mode; anything else is UCS2-encoded in PDU mode,
//!   split into concatenated segments when longer than 70 characters.
//! - **Bounded Retries**: Every attempt counts; messages retire after the configured retry limit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smsgate::config::Config;
//! use smsgate::dispatch;
//! use smsgate::modem::modems_from_config;
//! use smsgate::storage::SledStoreBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("smsgate.toml").await?;
//!     let store = SledStoreBuilder::new(config.storage.database_path())
//!         .retry_limit(config.dispatch.retry_limit)
//!         .open()?;
//!     let handle = dispatch::start(
//!         Arc::new(store),
//!         modems_from_config(&config.devices),
//!         config.dispatch.settings(),
//!     );
//!     let id = handle.submit_new_message("+15551234567", "hello")?;
//!     println!("queued {}", id);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`dispatch`] - Dispatch buffer, refill controller, worker pool and retry tracker
//! - [`modem`] - AT command driver, serial link and PDU encoder
//! - [`storage`] - Durable message store
//! - [`message`] - Message model
//! - [`config`] - Configuration loading and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Intake      │ ← submit_new_message
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Dispatch     │ ← buffer, refill controller, workers
//! └─────────────────┘
//!     │          │
//! ┌────────┐ ┌────────┐
//! │ Modems │ │ Store  │
//! └────────┘ └────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod logutil;
pub mod message;
pub mod metrics;
pub mod modem;
pub mod storage;
