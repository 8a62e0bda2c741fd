//! Test utilities & fixtures.
//! Scripted modem links and store wrappers shared by the integration tests.
#![allow(dead_code)] // Each test binary uses a different subset.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use smsgate::config::DispatchSettings;
use smsgate::message::{Message, MessageStatus};
use smsgate::modem::{GsmModem, MessageReference, SerialLink, CTRL_Z};
use smsgate::storage::{MessageStore, SledStore, SledStoreBuilder, StoreError};

pub const SUBMIT_OK: &str = "\r\n+CMGS: 17\r\n\r\nOK\r\n";
pub const SUBMIT_ERROR: &str = "\r\nERROR\r\n";

type Responder = Box<dyn FnMut(&str) -> Vec<Vec<u8>> + Send>;

/// Everything written to a [`ScriptedLink`], plus how often it was read.
#[derive(Clone, Default)]
pub struct LinkLog {
    commands: Arc<Mutex<Vec<String>>>,
    reads: Arc<AtomicUsize>,
}

impl LinkLog {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Bodies terminated with CTRL-Z, i.e. one per submitted SMS or segment.
    pub fn submissions(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.ends_with(CTRL_Z))
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// In-memory modem: every write is recorded and answered with the chunks the
/// responder returns, handed out one per `read`.
pub struct ScriptedLink {
    log: LinkLog,
    responder: Responder,
    pending: VecDeque<Vec<u8>>,
}

impl ScriptedLink {
    pub fn new(responder: impl FnMut(&str) -> Vec<Vec<u8>> + Send + 'static) -> (Self, LinkLog) {
        let log = LinkLog::default();
        (
            Self {
                log: log.clone(),
                responder: Box::new(responder),
                pending: VecDeque::new(),
            },
            log,
        )
    }
}

impl SerialLink for ScriptedLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let command = String::from_utf8_lossy(bytes).into_owned();
        self.pending = (self.responder)(&command).into();
        self.log.commands.lock().unwrap().push(command);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.log.reads.fetch_add(1, Ordering::SeqCst);
        let Some(mut chunk) = self.pending.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.pending.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

/// Typical modem: `OK` for mode switches, a prompt for `AT+CMGS`, and `final_reply`
/// once the CTRL-Z terminated body arrives.
pub fn modem_replying(final_reply: &'static str) -> impl FnMut(&str) -> Vec<Vec<u8>> + Send {
    move |command: &str| {
        if command.ends_with(CTRL_Z) {
            vec![final_reply.as_bytes().to_vec()]
        } else if command.starts_with("AT+CMGS") {
            vec![b"\r\n> ".to_vec()]
        } else {
            vec![b"\r\nOK\r\n".to_vec()]
        }
    }
}

pub fn scripted_modem(
    device_id: &str,
    final_reply: &'static str,
    references: Arc<MessageReference>,
) -> (GsmModem, LinkLog) {
    let (link, log) = ScriptedLink::new(modem_replying(final_reply));
    (GsmModem::with_link(device_id, Box::new(link), references), log)
}

pub fn open_store(dir: &tempfile::TempDir, retry_limit: u32) -> SledStore {
    SledStoreBuilder::new(dir.path().join("messages"))
        .retry_limit(retry_limit)
        .open()
        .expect("open store")
}

/// Settings tuned for fast tests: every resubmission wakes the refill controller.
pub fn fast_settings(retry_limit: u32) -> DispatchSettings {
    DispatchSettings {
        buffer_size: 8,
        buffer_low: 4,
        wakeup_timeout: Duration::from_secs(3600),
        wakeup_count_threshold: 0,
        long_poll_timeout: Duration::from_millis(200),
        retry_limit,
        pacing: Duration::from_micros(1),
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn status_of(store: &dyn MessageStore, id: &str) -> (MessageStatus, u32) {
    let m = store.get(id).expect("message stored");
    (m.status, m.retries)
}

type FetchHook = Box<dyn FnOnce(&SledStore) + Send>;

fn injected(what: &str) -> StoreError {
    StoreError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("injected {} failure", what),
    ))
}

/// Take one unit from `counter` if any is left.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Store wrapper counting `fetch_pending` calls, optionally failing the next
/// `fetch_pending`/`update_status` calls, and optionally running a hook right
/// after a fetch has taken its snapshot (a worker writing concurrently).
pub struct InstrumentedStore {
    pub inner: SledStore,
    pub fetches: AtomicUsize,
    pub failing_updates: AtomicUsize,
    pub failing_fetches: AtomicUsize,
    after_fetch: Mutex<Option<FetchHook>>,
}

impl InstrumentedStore {
    pub fn new(inner: SledStore) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(0),
            after_fetch: Mutex::new(None),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Run `hook` against the inner store once, right after the next successful fetch.
    pub fn after_next_fetch(&self, hook: impl FnOnce(&SledStore) + Send + 'static) {
        *self.after_fetch.lock().unwrap() = Some(Box::new(hook));
    }
}

impl MessageStore for InstrumentedStore {
    fn insert(&self, message: &Message) -> Result<(), StoreError> {
        self.inner.insert(message)
    }

    fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        retries: u32,
        device: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if take_one(&self.failing_updates) {
            return Err(injected("update"));
        }
        self.inner
            .update_status(id, status, retries, device, updated_at)
    }

    fn fetch_pending(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_fetches) {
            return Err(injected("fetch"));
        }
        let snapshot = self.inner.fetch_pending(limit)?;
        let hook = self.after_fetch.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        Ok(snapshot)
    }

    fn fetch_all(&self) -> Result<Vec<Message>, StoreError> {
        self.inner.fetch_all()
    }

    fn get(&self, id: &str) -> Result<Message, StoreError> {
        self.inner.get(id)
    }
}
