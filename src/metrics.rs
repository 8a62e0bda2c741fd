//! Process-wide dispatch counters.
//!
//! Logged by the refill controller on every long poll timeout and once at shutdown.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static TRANSMIT_OK: AtomicU64 = AtomicU64::new(0);
static TRANSMIT_ERROR: AtomicU64 = AtomicU64::new(0);
static TRANSMIT_INDETERMINATE: AtomicU64 = AtomicU64::new(0);
static REQUEUED: AtomicU64 = AtomicU64::new(0);
static RETIRED_FAILED: AtomicU64 = AtomicU64::new(0);
static REFILL_CYCLES: AtomicU64 = AtomicU64::new(0);
static REFILL_FETCHES: AtomicU64 = AtomicU64::new(0);

pub fn inc_transmit_ok() {
    TRANSMIT_OK.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transmit_error() {
    TRANSMIT_ERROR.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transmit_indeterminate() {
    TRANSMIT_INDETERMINATE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_requeued() {
    REQUEUED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_retired_failed() {
    RETIRED_FAILED.fetch_add(1, Ordering::Relaxed);
}
/// One wake-up of the refill controller, whatever it decided.
pub fn inc_refill_cycles() {
    REFILL_CYCLES.fetch_add(1, Ordering::Relaxed);
}
/// One store query issued by the refill controller.
pub fn inc_refill_fetches() {
    REFILL_FETCHES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub transmit_ok: u64,
    pub transmit_error: u64,
    pub transmit_indeterminate: u64,
    pub requeued: u64,
    pub retired_failed: u64,
    pub refill_cycles: u64,
    pub refill_fetches: u64,
}

impl Snapshot {
    pub fn attempts(&self) -> u64 {
        self.transmit_ok + self.transmit_error + self.transmit_indeterminate
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempts={} ok={} error={} indeterminate={} requeued={} retired={} refills={}/{}",
            self.attempts(),
            self.transmit_ok,
            self.transmit_error,
            self.transmit_indeterminate,
            self.requeued,
            self.retired_failed,
            self.refill_fetches,
            self.refill_cycles
        )
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        transmit_ok: TRANSMIT_OK.load(Ordering::Relaxed),
        transmit_error: TRANSMIT_ERROR.load(Ordering::Relaxed),
        transmit_indeterminate: TRANSMIT_INDETERMINATE.load(Ordering::Relaxed),
        requeued: REQUEUED.load(Ordering::Relaxed),
        retired_failed: RETIRED_FAILED.load(Ordering::Relaxed),
        refill_cycles: REFILL_CYCLES.load(Ordering::Relaxed),
        refill_fetches: REFILL_FETCHES.load(Ordering::Relaxed),
    }
}
