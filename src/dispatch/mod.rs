//! Bounded dispatch queue, refill controller and worker pool.
//!
//! Work flows like this:
//!
//! * Intake calls [`Dispatcher::submit_new_message`]. The record is inserted in the
//!   store first, then the refill controller is woken.
//! * The refill controller ([`Dispatcher::run_refill`]) sleeps until woken or until the
//!   long poll timeout fires. When the buffer is below `buffer_low` it tops it up from
//!   [`MessageStore::fetch_pending`].
//! * One worker per connected modem ([`worker::run_worker`]) takes messages from the
//!   buffer, transmits, records the outcome and asks for a requeue when needed.
//!
//! The wake-up signal is a capacity-1 channel written with `try_send`. It is lossy on
//! purpose: a second wake-up while one is already latched is dropped, since the single
//! pending wake-up already covers it.
//!
//! A requeue never pushes into the buffer directly. The message stays pending in the
//! store and the next refill picks it up, so one logical message occupies at most
//! one buffer slot.

pub mod retry;
pub mod worker;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DispatchSettings;
use crate::logutil::escape_log;
use crate::message::Message;
use crate::metrics;
use crate::modem::Modem;
use crate::storage::{MessageStore, StoreError};

pub use retry::{decide, Decision};

/// Bookkeeping deciding when a submission should wake the refill controller.
#[derive(Debug)]
struct WakeGate {
    since_last: u32,
    last_wakeup: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared state between intake, the refill controller and the workers.
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    settings: DispatchSettings,
    tx: mpsc::Sender<Message>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    gate: Mutex<WakeGate>,
    in_flight: Mutex<HashSet<String>>,
}

impl Dispatcher {
    /// Build the queue. The wake latch starts armed so the first refill cycle runs
    /// immediately and recovers backlog left by a previous run.
    pub fn new(store: Arc<dyn MessageStore>, settings: DispatchSettings) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.buffer_size.max(1));
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let _ = wake_tx.try_send(());
        // Backdated so the first resubmission after start is not held back by the timer.
        let last_wakeup = Instant::now()
            .checked_sub(settings.wakeup_timeout)
            .unwrap_or_else(Instant::now);
        Arc::new(Self {
            store,
            settings,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            wake_tx,
            wake_rx: tokio::sync::Mutex::new(wake_rx),
            gate: Mutex::new(WakeGate {
                since_last: 0,
                last_wakeup,
            }),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Messages currently sitting in the buffer.
    pub fn occupancy(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Number of messages buffered or being transmitted.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Latch a wake-up for the refill controller. Returns false when one was already
    /// pending, in which case this request merges into it.
    pub fn wake(&self) -> bool {
        self.wake_tx.try_send(()).is_ok()
    }

    /// Accept a new SMS: persist it, then wake the refill controller.
    pub fn submit_new_message(&self, recipient: &str, body: &str) -> Result<String, StoreError> {
        let message = Message::new(recipient, body);
        self.submit(&message, true)?;
        Ok(message.id)
    }

    /// Enqueue-side policy. New messages are inserted before any wake-up, so a crash in
    /// between only delays them until the next poll. Resubmissions wake the refill
    /// controller only when enough submissions or enough time piled up since the last
    /// wake-up.
    pub fn submit(&self, message: &Message, is_new: bool) -> Result<(), StoreError> {
        if is_new {
            info!(
                "New message {} for {}: {}",
                message.id,
                message.recipient,
                escape_log(&message.body)
            );
            self.store.insert(message)?;
        }
        let mut gate = lock(&self.gate);
        gate.since_last = gate.since_last.saturating_add(1);
        let due = is_new
            || gate.since_last > self.settings.wakeup_count_threshold
            || gate.last_wakeup.elapsed() > self.settings.wakeup_timeout;
        if due {
            debug!("submit: waking refill controller ({})", message.id);
            self.wake();
            gate.since_last = 0;
            gate.last_wakeup = Instant::now();
        } else {
            debug!(
                "submit: {} submissions since last wake-up",
                gate.since_last
            );
        }
        Ok(())
    }

    /// Next message for a worker; waits while the buffer is empty. Workers queue on the
    /// receiver lock in arrival order, so no device is favoured.
    pub async fn take(&self) -> Option<Message> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Forget `id` once a worker has persisted its attempt.
    pub fn release(&self, id: &str) {
        lock(&self.in_flight).remove(id);
    }

    /// One refill pass. Does nothing (and skips the store) while occupancy is at or
    /// above the watermark; otherwise fetches up to the free capacity and pushes every
    /// record not already in flight. Each claimed record is re-read and pushed as
    /// stored now; one that changed since the scan is left to the next cycle.
    /// Returns how many messages were pushed.
    ///
    /// Pushing waits for space when producers raced us to the free slots.
    pub async fn refill_once(&self) -> Result<usize, StoreError> {
        let occupancy = self.occupancy();
        if occupancy >= self.settings.buffer_low {
            debug!("refill: {} buffered, nothing to do", occupancy);
            return Ok(0);
        }
        let deficit = self.settings.buffer_size.saturating_sub(occupancy);
        debug!("refill: fetching up to {} pending messages", deficit);
        metrics::inc_refill_fetches();
        let pending = self.store.fetch_pending(deficit)?;
        debug!("refill: {} pending messages found", pending.len());

        let mut pushed = 0;
        for snapshot in pending {
            let claimed = lock(&self.in_flight).insert(snapshot.id.clone());
            if !claimed {
                continue;
            }
            let id = snapshot.id.clone();
            // A worker may have recorded an attempt and released the id after the scan.
            let message = match self.store.get(&id) {
                Ok(current) if self.still_dispatchable(&snapshot, &current) => current,
                Ok(_) => {
                    debug!("refill: {} changed since the scan, skipping", id);
                    self.release(&id);
                    continue;
                }
                Err(e) => {
                    warn!("refill: could not re-read {}: {}", id, e);
                    self.release(&id);
                    continue;
                }
            };
            if self.tx.send(message).await.is_err() {
                self.release(&id);
                warn!("refill: dispatch buffer closed");
                break;
            }
            pushed += 1;
        }
        Ok(pushed)
    }

    fn still_dispatchable(&self, snapshot: &Message, current: &Message) -> bool {
        current.is_eligible(self.settings.retry_limit)
            && current.retries == snapshot.retries
            && current.updated_at == snapshot.updated_at
    }

    /// Wait for a latched wake-up or the long poll timeout, whichever comes first.
    /// Returns true when woken by the signal.
    pub async fn wait_for_wake(&self) -> bool {
        let mut wake_rx = self.wake_rx.lock().await;
        tokio::select! {
            signal = wake_rx.recv() => signal.is_some(),
            _ = tokio::time::sleep(self.settings.long_poll_timeout) => false,
        }
    }

    /// Refill controller loop. Runs for the life of the dispatcher.
    pub async fn run_refill(self: Arc<Self>) {
        info!("Refill controller started");
        loop {
            if self.wait_for_wake().await {
                debug!("refill: woken up by signal");
            } else {
                debug!("refill: woken up by timeout");
                info!("Dispatch stats: {}", metrics::snapshot());
            }
            metrics::inc_refill_cycles();
            if let Err(e) = self.refill_once().await {
                error!("refill: failed to load pending messages: {}", e);
            }
        }
    }
}

/// Running dispatcher: its refill task and one worker per connected modem.
pub struct DispatcherHandle {
    pub dispatcher: Arc<Dispatcher>,
    /// Devices that connected and joined the pool.
    pub devices: Vec<String>,
    refill: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn submit_new_message(&self, recipient: &str, body: &str) -> Result<String, StoreError> {
        self.dispatcher.submit_new_message(recipient, body)
    }

    /// Stop the refill controller and every worker.
    pub fn abort(&self) {
        self.refill.abort();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Connect every modem, then start the refill controller and one worker per modem
/// that connected. Modems that fail to connect are logged and left out for good.
///
/// Must be called from within a Tokio runtime.
pub fn start(
    store: Arc<dyn MessageStore>,
    modems: Vec<Box<dyn Modem>>,
    settings: DispatchSettings,
) -> DispatcherHandle {
    info!(
        "Starting dispatcher: buffer {} (low {}), retry limit {}, {} device(s)",
        settings.buffer_size,
        settings.buffer_low,
        settings.retry_limit,
        modems.len()
    );
    let dispatcher = Dispatcher::new(store, settings);

    let mut devices = Vec::new();
    let mut workers = Vec::new();
    for mut modem in modems {
        if let Err(e) = modem.connect() {
            error!("{}: error connecting: {}", modem.device_id(), e);
            continue;
        }
        devices.push(modem.device_id().to_string());
        workers.push(tokio::spawn(worker::run_worker(dispatcher.clone(), modem)));
    }
    if devices.is_empty() {
        warn!("No modem connected; messages stay queued in the store");
    }
    let refill = tokio::spawn(dispatcher.clone().run_refill());

    DispatcherHandle {
        dispatcher,
        devices,
        refill,
        workers,
    }
}
