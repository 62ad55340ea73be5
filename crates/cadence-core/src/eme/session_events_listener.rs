//! Per-session event handling
//!
//! ```text
//!            key message                     license
//!   Idle ───────────────► AwaitingLicense ───────────► Updating ──► Idle
//!     │                                                   ▲
//!     └── key statuses change ──► evaluation (+ user hook)┘
//!
//!   closed ──► end of stream        key error ──► fatal error
//! ```
//!
//! Events of a session are handled one after the other: a license fetched
//! for a message is applied before the next event is looked at, so two
//! `update` calls never run concurrently on the same session.

use crate::config::EmeConfig;
use crate::eme::key_statuses::check_key_statuses;
use crate::eme::platform::{MediaKeySession, SessionEvent};
use crate::eme::types::{KeySystemOption, KeysUpdate, UpdateReason};
use crate::error::{Error, Result};
use crate::utils::{event_stream, retry_with_backoff, EventSink, RetryPolicy};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event produced while listening to a session
#[derive(Debug, Clone)]
pub enum SessionListenerEvent {
    /// The CDM sent a message, a license is being fetched
    Message { message_type: String, message: Bytes },
    /// The license fetcher had nothing to apply
    NoUpdate,
    Updated { license: Bytes, reason: UpdateReason },
    KeysUpdate(KeysUpdate),
    Warning(Error),
}

/// Listen to a session until it is closed.
///
/// `events` must have been obtained from the session before any action which
/// could trigger a message (typically `generate_request`). The stream fails
/// on the first fatal error, which is a [`Error::BlacklistedSession`] when
/// only this session should be considered unusable.
pub fn session_events_listener(
    session: Arc<dyn MediaKeySession>,
    options: KeySystemOption,
    key_system: String,
    events: broadcast::Receiver<SessionEvent>,
    config: EmeConfig,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<SessionListenerEvent>> {
    event_stream(move |sink| async move {
        let listener = Listener {
            session,
            options,
            key_system,
            config,
            cancel,
            sink,
        };
        listener.run(events).await
    })
}

struct Listener {
    session: Arc<dyn MediaKeySession>,
    options: KeySystemOption,
    key_system: String,
    config: EmeConfig,
    cancel: CancellationToken,
    sink: EventSink<SessionListenerEvent>,
}

impl Listener {
    async fn run(self, mut events: broadcast::Receiver<SessionEvent>) -> Result<()> {
        info!(session_id = %self.session.session_id(), "EME: Binding session events");

        if !self.session.key_statuses().is_empty() {
            self.evaluate_key_statuses()?;
        }

        let session = self.session.clone();
        let closed = session.closed();
        tokio::pin!(closed);

        loop {
            let event = tokio::select! {
                _ = &mut closed => break,
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                event = events.recv() => event,
            };

            let handling = match event {
                Ok(SessionEvent::KeyError(message)) => return Err(Error::KeyError(message)),
                Ok(SessionEvent::Message {
                    message_type,
                    message,
                }) => {
                    let message_type = message_type
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| "license-request".to_string());
                    futures::future::Either::Left(self.handle_message(message_type, message))
                }
                Ok(SessionEvent::KeyStatusesChange) => {
                    futures::future::Either::Right(self.handle_key_statuses_change())
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "EME: Missed session events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            tokio::select! {
                _ = &mut closed => break,
                result = handling => result?,
            }
        }

        debug!("EME: Session closed, unbinding session events");
        Ok(())
    }

    fn emit(&self, event: SessionListenerEvent) {
        self.sink.emit(event);
    }

    fn evaluate_key_statuses(&self) -> Result<()> {
        let statuses = self.session.key_statuses();
        let result = check_key_statuses(&statuses, &self.options, &self.key_system)?;
        for warning in result.warnings {
            self.emit(SessionListenerEvent::Warning(warning));
        }
        self.emit(SessionListenerEvent::KeysUpdate(result.keys));
        Ok(())
    }

    async fn handle_message(&self, message_type: String, message: Bytes) -> Result<()> {
        info!(message_type = %message_type, "EME: Received message event");
        self.emit(SessionListenerEvent::Message {
            message_type: message_type.clone(),
            message: message.clone(),
        });

        let license = self.fetch_license(message, message_type).await?;
        self.update_session(license, UpdateReason::KeyMessage).await
    }

    async fn fetch_license(&self, message: Bytes, message_type: String) -> Result<Option<Bytes>> {
        let license_config = self.options.get_license_config;
        let timeout = license_config.timeout_duration(self.config.default_license_timeout);
        let total_retry = license_config
            .retry
            .unwrap_or(self.config.default_license_retry);
        let fetcher = self.options.get_license.clone();

        let run = || {
            let fetcher = fetcher.clone();
            let message = message.clone();
            let message_type = message_type.clone();
            async move {
                let request = fetcher.get_license(message, &message_type);
                match timeout {
                    Some(duration) => match tokio::time::timeout(duration, request).await {
                        Ok(result) => result.map_err(Error::KeyLoad),
                        Err(_) => Err(Error::KeyLoadTimeout {
                            timeout_ms: duration.as_millis() as u64,
                        }),
                    },
                    None => request.await.map_err(Error::KeyLoad),
                }
            }
        };

        let sink = self.sink.clone();
        let mut on_retry = move |err: &Error, retry_count: u32| {
            warn!(retry_count, error = %err, "EME: License request failed, retrying");
            sink.emit(SessionListenerEvent::Warning(err.clone()));
        };
        let should_retry = |err: &Error| match err {
            Error::KeyLoadTimeout { .. } => true,
            Error::KeyLoad(license_err) => !license_err.no_retry,
            _ => false,
        };

        let result = retry_with_backoff(
            run,
            RetryPolicy {
                backoff: self.config.license_backoff,
                total_retry,
                should_retry: &should_retry,
                on_retry: &mut on_retry,
            },
            &self.cancel,
        )
        .await;

        match result {
            Err(Error::KeyLoad(err)) if err.fallback_on_last_try => {
                warn!("EME: Last license request attempt failed, blacklisting the current session");
                Err(Error::blacklisted(Error::KeyLoad(err)))
            }
            other => other,
        }
    }

    async fn handle_key_statuses_change(&self) -> Result<()> {
        info!("EME: Key statuses change event received");
        self.evaluate_key_statuses()?;

        let Some(handler) = self.options.on_key_statuses_change.clone() else {
            return Ok(());
        };
        let statuses = self.session.key_statuses();
        let license = handler
            .on_key_statuses_change(&statuses, &self.key_system)
            .await
            .map_err(Error::KeyStatusChange)?;
        self.update_session(license, UpdateReason::KeyStatusChange).await
    }

    async fn update_session(&self, license: Option<Bytes>, reason: UpdateReason) -> Result<()> {
        let Some(license) = license else {
            info!("EME: No license given, skipping session.update");
            self.emit(SessionListenerEvent::NoUpdate);
            return Ok(());
        };

        info!("EME: Updating session with license");
        self.session
            .update(&license)
            .await
            .map_err(Error::KeyUpdate)?;
        info!("EME: Session update succeeded");
        self.emit(SessionListenerEvent::Updated { license, reason });
        Ok(())
    }
}
