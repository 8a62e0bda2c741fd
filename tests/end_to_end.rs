mod common;

use std::sync::Arc;
use std::time::Duration;

use smsgate::config::DeviceConfig;
use smsgate::dispatch;
use smsgate::message::{Message, MessageStatus};
use smsgate::metrics;
use smsgate::modem::{GsmModem, MessageReference, Modem};
use smsgate::storage::{status_summary, MessageStore};
use tempfile::TempDir;

use common::*;

const WAIT: Duration = Duration::from_secs(10);

fn fleet(modem: GsmModem) -> Vec<Box<dyn Modem>> {
    vec![Box::new(modem)]
}

#[tokio::test]
async fn ascii_message_is_delivered_in_text_mode() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 3));
    let (modem, log) = scripted_modem("m0", SUBMIT_OK, Arc::new(MessageReference::new()));
    let handle = dispatch::start(store.clone(), fleet(modem), fast_settings(3));
    assert_eq!(handle.devices, vec!["m0".to_string()]);

    let id = handle.submit_new_message("+15551234", "hello there").unwrap();
    let delivered = wait_until(WAIT, || {
        status_of(store.as_ref(), &id).0 == MessageStatus::Processed
    })
    .await;
    handle.abort();
    assert!(delivered);

    let stored = store.get(&id).unwrap();
    assert_eq!(stored.retries, 1);
    assert_eq!(stored.device, "m0");
    assert_eq!(
        log.commands(),
        vec![
            "AT+CMGF=1\r".to_string(),
            "AT+CMGS=\"15551234\"\r".to_string(),
            "hello there\u{1A}".to_string(),
        ]
    );
}

#[tokio::test]
async fn long_unicode_message_goes_out_as_three_segments() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 3));
    let (modem, log) = scripted_modem("m0", SUBMIT_OK, Arc::new(MessageReference::new()));
    let handle = dispatch::start(store.clone(), fleet(modem), fast_settings(3));

    let id = handle
        .submit_new_message("+15551234", &"ж".repeat(150))
        .unwrap();
    let delivered = wait_until(WAIT, || {
        status_of(store.as_ref(), &id).0 == MessageStatus::Processed
    })
    .await;
    handle.abort();
    assert!(delivered);

    let submissions = log.submissions();
    assert_eq!(submissions.len(), 3);
    for (i, submission) in submissions.iter().enumerate() {
        // "00" SMSC, then the TPDU; segment index sits at the end of the header.
        assert_eq!(&submission[34..36], format!("{:02X}", i + 1));
    }
}

#[tokio::test]
async fn device_errors_are_retried_until_the_limit() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 3));
    let (modem, log) = scripted_modem("m0", SUBMIT_ERROR, Arc::new(MessageReference::new()));
    let before = metrics::snapshot();
    let handle = dispatch::start(store.clone(), fleet(modem), fast_settings(3));

    let id = handle.submit_new_message("+15551234", "doomed").unwrap();
    let retired = wait_until(WAIT, || {
        status_of(store.as_ref(), &id) == (MessageStatus::Failed, 3)
    })
    .await;
    assert!(retired);

    // Give the refill controller a few more cycles to prove nothing else goes out.
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.abort();
    assert_eq!(log.submissions().len(), 3);
    assert!(store.fetch_pending(10).unwrap().is_empty());
    assert_eq!(handle.dispatcher.in_flight(), 0);

    // Counters are process-wide and other tests run alongside.
    let after = metrics::snapshot();
    assert!(after.transmit_error >= before.transmit_error + 3);
    assert!(after.requeued >= before.requeued + 2);
    assert!(after.retired_failed >= before.retired_failed + 1);
}

#[tokio::test]
async fn silent_modem_leaves_messages_pending_after_the_limit() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 2));
    let (link, log) = ScriptedLink::new(|_: &str| Vec::new());
    let modem = GsmModem::with_link("mute", Box::new(link), Arc::new(MessageReference::new()));
    let handle = dispatch::start(store.clone(), fleet(modem), fast_settings(2));

    let id = handle.submit_new_message("+15551234", "anyone there").unwrap();
    let exhausted = wait_until(WAIT, || status_of(store.as_ref(), &id).1 == 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.abort();
    assert!(exhausted);

    assert_eq!(status_of(store.as_ref(), &id), (MessageStatus::Pending, 2));
    assert_eq!(log.submissions().len(), 2);
    assert!(store.fetch_pending(10).unwrap().is_empty());

    let summary = status_summary(store.as_ref(), 2).unwrap();
    assert_eq!((summary.pending, summary.retired), (0, 1));
}

#[tokio::test]
async fn backlog_from_a_previous_run_is_recovered_at_start() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 3));
    let backlog: Vec<Message> = (0..5)
        .map(|i| Message::new("+15551234", format!("left over {}", i)))
        .collect();
    for m in &backlog {
        store.insert(m).unwrap();
    }

    // No long poll to fall back on: only the armed wake latch can start the first cycle.
    let mut settings = fast_settings(3);
    settings.long_poll_timeout = Duration::from_secs(3600);
    let (modem, log) = scripted_modem("m0", SUBMIT_OK, Arc::new(MessageReference::new()));
    let handle = dispatch::start(store.clone(), fleet(modem), settings);

    let drained = wait_until(WAIT, || {
        backlog
            .iter()
            .all(|m| status_of(store.as_ref(), &m.id).0 == MessageStatus::Processed)
    })
    .await;
    handle.abort();
    assert!(drained);
    assert_eq!(log.submissions().len(), 5);
}

#[tokio::test]
async fn modem_that_fails_to_connect_is_left_out() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 3));
    let ghost = GsmModem::new(
        &DeviceConfig {
            device_id: "ghost".to_string(),
            port: "/dev/smsgate-no-such-port".to_string(),
            ..DeviceConfig::default()
        },
        Arc::new(MessageReference::new()),
    );
    let (modem, log) = scripted_modem("m0", SUBMIT_OK, Arc::new(MessageReference::new()));
    let modems: Vec<Box<dyn Modem>> = vec![Box::new(ghost), Box::new(modem)];
    let handle = dispatch::start(store.clone(), modems, fast_settings(3));
    assert_eq!(handle.devices, vec!["m0".to_string()]);

    let id = handle.submit_new_message("+15551234", "still works").unwrap();
    let delivered = wait_until(WAIT, || {
        status_of(store.as_ref(), &id).0 == MessageStatus::Processed
    })
    .await;
    handle.abort();
    assert!(delivered);
    assert_eq!(store.get(&id).unwrap().device, "m0");
    assert_eq!(log.submissions().len(), 1);
}

#[tokio::test]
async fn store_failure_does_not_stop_the_worker() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InstrumentedStore::new(open_store(&dir, 3)));
    store.fail_next_updates(1);
    let (modem, log) = scripted_modem("m0", SUBMIT_OK, Arc::new(MessageReference::new()));
    let handle = dispatch::start(store.clone(), fleet(modem), fast_settings(3));

    let first = handle.submit_new_message("+15551234", "first").unwrap();
    let second = handle.submit_new_message("+15551234", "second").unwrap();
    let delivered = wait_until(WAIT, || {
        [&first, &second]
            .iter()
            .all(|id| status_of(store.as_ref(), id).0 == MessageStatus::Processed)
    })
    .await;
    handle.abort();
    assert!(delivered);

    // One attempt went unrecorded, so one message went out twice.
    assert_eq!(log.submissions().len(), 3);
    assert_eq!(store.get(&first).unwrap().retries, 1);
    assert_eq!(store.get(&second).unwrap().retries, 1);
}

#[tokio::test]
async fn two_modems_share_the_load() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 3));
    let refs = Arc::new(MessageReference::new());
    let (a, log_a) = scripted_modem("a", SUBMIT_OK, refs.clone());
    let (b, log_b) = scripted_modem("b", SUBMIT_OK, refs);
    let modems: Vec<Box<dyn Modem>> = vec![Box::new(a), Box::new(b)];
    let handle = dispatch::start(store.clone(), modems, fast_settings(3));
    assert_eq!(handle.devices.len(), 2);

    let ids: Vec<String> = (0..6)
        .map(|i| {
            handle
                .submit_new_message("+15551234", &format!("bulk {}", i))
                .unwrap()
        })
        .collect();
    let delivered = wait_until(WAIT, || {
        ids.iter()
            .all(|id| status_of(store.as_ref(), id).0 == MessageStatus::Processed)
    })
    .await;
    handle.abort();
    assert!(delivered);
    assert_eq!(log_a.submissions().len() + log_b.submissions().len(), 6);
    for id in &ids {
        let device = store.get(id).unwrap().device;
        assert!(device == "a" || device == "b");
    }
}

#[tokio::test]
async fn backlog_survives_a_failed_first_fetch() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InstrumentedStore::new(open_store(&dir, 3)));
    let backlog: Vec<Message> = (0..3)
        .map(|i| Message::new("+15551234", format!("left over {}", i)))
        .collect();
    for m in &backlog {
        store.insert(m).unwrap();
    }
    store.fail_next_fetches(1);

    // The armed latch runs the first cycle, which fails; the long poll retries.
    let (modem, log) = scripted_modem("m0", SUBMIT_OK, Arc::new(MessageReference::new()));
    let handle = dispatch::start(store.clone(), fleet(modem), fast_settings(3));

    let drained = wait_until(WAIT, || {
        backlog
            .iter()
            .all(|m| status_of(store.as_ref(), &m.id).0 == MessageStatus::Processed)
    })
    .await;
    handle.abort();
    assert!(drained);
    assert!(store.fetches() >= 2);
    assert_eq!(log.submissions().len(), 3);
}

#[tokio::test]
async fn oversized_message_is_retired_without_touching_the_modem() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir, 3));
    let (modem, log) = scripted_modem("m0", SUBMIT_OK, Arc::new(MessageReference::new()));
    let handle = dispatch::start(store.clone(), fleet(modem), fast_settings(3));

    // 256 segments of 67 characters: one more than the header can number.
    let id = handle
        .submit_new_message("+15551234", &"ж".repeat(67 * 256))
        .unwrap();
    let retired = wait_until(WAIT, || {
        status_of(store.as_ref(), &id) == (MessageStatus::Failed, 3)
    })
    .await;
    handle.abort();
    assert!(retired);
    assert!(log.commands().is_empty());
}
