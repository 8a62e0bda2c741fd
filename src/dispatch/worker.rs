//! Per-modem worker loop.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};

use super::retry::decide;
use super::Dispatcher;
use crate::logutil::escape_log;
use crate::message::{Message, MessageStatus};
use crate::metrics;
use crate::modem::{Modem, ModemError, TransmitOutcome};

/// Drain the dispatch buffer through one modem until the buffer closes.
///
/// Each message is transmitted, its outcome persisted (terminal failures included),
/// and, when the retry tracker says so, resubmitted through [`Dispatcher::submit`].
pub async fn run_worker(dispatcher: Arc<Dispatcher>, mut modem: Box<dyn Modem>) {
    let device_id = modem.device_id().to_string();
    info!("{}: worker started", device_id);
    while let Some(mut message) = dispatcher.take().await {
        info!("{}: processing {}", device_id, message.id);

        let recipient = message.recipient.clone();
        let body = message.body.clone();
        // Serial reads block for up to the link timeout; keep them off the async threads.
        let joined = tokio::task::spawn_blocking(move || {
            let result = modem.transmit(&recipient, &body);
            (modem, result)
        })
        .await;
        let (returned, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!("{}: device task failed, worker stopping: {}", device_id, e);
                dispatcher.release(&message.id);
                return;
            }
        };
        modem = returned;

        let outcome = match result {
            Ok(response) => TransmitOutcome::classify(&response),
            Err(e @ ModemError::TooManySegments { .. }) => {
                warn!("{}: rejecting {}: {}", device_id, message.id, e);
                TransmitOutcome::DeviceError
            }
            Err(e) => {
                warn!("{}: transmit of {} failed: {}", device_id, message.id, e);
                TransmitOutcome::Indeterminate
            }
        };
        record_outcome(&device_id, &mut message, outcome, &dispatcher);
        tokio::time::sleep(dispatcher.settings().pacing).await;
    }
    debug!("{}: dispatch buffer closed, worker exiting", device_id);
}

/// Apply the retry tracker, persist, release the in-flight slot and resubmit when
/// another attempt is due. Store failures are logged; the worker carries on.
fn record_outcome(
    device_id: &str,
    message: &mut Message,
    outcome: TransmitOutcome,
    dispatcher: &Dispatcher,
) {
    let decision = decide(message.retries, outcome, dispatcher.settings().retry_limit);
    message.status = decision.status;
    message.retries = decision.retries;
    message.device = device_id.to_string();
    message.updated_at = Utc::now();

    match outcome {
        TransmitOutcome::Sent => metrics::inc_transmit_ok(),
        TransmitOutcome::DeviceError => metrics::inc_transmit_error(),
        TransmitOutcome::Indeterminate => metrics::inc_transmit_indeterminate(),
    }
    info!(
        "{}: {} -> {} (attempt {})",
        device_id, message.id, message.status, message.retries
    );

    if let Err(e) = dispatcher.store().update_status(
        &message.id,
        message.status,
        message.retries,
        &message.device,
        message.updated_at,
    ) {
        error!(
            "{}: failed to record status of {}: {}",
            device_id, message.id, e
        );
    }
    dispatcher.release(&message.id);

    if decision.requeue {
        metrics::inc_requeued();
        if let Err(e) = dispatcher.submit(message, false) {
            error!("{}: failed to requeue {}: {}", device_id, message.id, e);
        }
    } else if decision.is_terminal_failure() {
        metrics::inc_retired_failed();
        warn!(
            "{}: giving up on {} to {} after {} attempts (last status {}): {}",
            device_id,
            message.id,
            message.recipient,
            message.retries,
            message.status,
            escape_log(&message.body)
        );
    } else if message.status == MessageStatus::Processed {
        debug!("{}: {} delivered to modem", device_id, message.id);
    }
}
