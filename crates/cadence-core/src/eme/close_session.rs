//! Closing sessions which may not be initialized yet
//!
//! The platform is allowed to reject `close()` with an "InvalidStateError"
//! when the CDM did not finish initializing the session. Such closes are
//! retried, each retry waiting for either a backoff delay or a sign that the
//! session became usable (a message or key statuses change), whichever
//! comes first.

use crate::config::SessionClosingConfig;
use crate::eme::platform::{MediaKeySession, SessionEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Close a session, retrying while it is not initialized.
///
/// Never fails: a close which could not be done is only logged. Returns
/// `true` if the session was closed.
#[instrument(skip_all, fields(session_id = %session.session_id()))]
pub async fn safe_close(
    session: &Arc<dyn MediaKeySession>,
    config: &SessionClosingConfig,
    cancel: &CancellationToken,
) -> bool {
    // Subscribe before the first attempt so no event is missed in between
    let mut events = session.subscribe();
    let mut retry_count = 0u32;

    loop {
        let err = match session.close().await {
            Ok(()) => {
                debug!("EME: Session closed");
                return true;
            }
            Err(err) => err,
        };

        if !err.is_invalid_state() || !session.session_id().is_empty() {
            warn!(error = %err, "EME: Could not close session");
            return false;
        }
        if retry_count >= config.max_retry {
            warn!(retry_count, "EME: Session still not initialized, giving up closing it");
            return false;
        }

        retry_count += 1;
        let delay = config.backoff.delay_for(retry_count);
        debug!(retry_count, delay_ms = delay.as_millis() as u64, "EME: Session not initialized yet, retrying close");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("EME: Session closing cancelled");
                return false;
            }
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_initialization_sign(&mut events) => {}
        }
    }
}

/// Resolves on the first event showing the session may now be usable
async fn wait_for_initialization_sign(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Message { .. }) | Ok(SessionEvent::KeyStatusesChange) => return,
            Ok(SessionEvent::KeyError(_)) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
