//! Single-flight renewal of the access credential.
//!
//! The coordinator is either idle or refreshing. The first caller that needs
//! a new access credential flips it to refreshing and spawns the one renewal
//! call; every caller, the first included, parks a oneshot handle in a FIFO
//! queue. When the renewal settles the store is updated (or cleared) first,
//! then the queue is drained in registration order. Settling is conditional:
//! if the session the renewal started from was logged out or replaced in the
//! meantime, the store is left alone and waiters get `Superseded`.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::security::audit_log::AuditLogger;
use crate::security::auth::{RenewalResponse, SessionEvent};
use crate::security::credential_store::{CredentialPair, CredentialStore};
use crate::transport::{Method, OutgoingRequest, Transport};

/// Upper bound on one renewal round-trip.
pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenewalError {
    #[error("no refresh credential available")]
    MissingRefresh,
    #[error("refresh credential rejected with status {0}")]
    Rejected(u16),
    #[error("renewal did not settle within {0:?}")]
    Timeout(Duration),
    #[error("renewal transport failure: {0}")]
    Transport(String),
    #[error("malformed renewal response: {0}")]
    Malformed(String),
    #[error("renewal task ended without settling")]
    Abandoned,
    #[error("session changed while renewing")]
    Superseded,
}

type Waiter = oneshot::Sender<Result<String, RenewalError>>;

#[derive(Debug, Default)]
struct RenewalState {
    refreshing: bool,
    waiters: VecDeque<Waiter>,
}

pub struct RenewalCoordinator {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    refresh_path: String,
    timeout: Duration,
    state: Mutex<RenewalState>,
    events: broadcast::Sender<SessionEvent>,
    audit: AuditLogger,
}

impl std::fmt::Debug for RenewalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalCoordinator")
            .field("refresh_path", &self.refresh_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RenewalCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        refresh_path: impl Into<String>,
        timeout: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            transport,
            store,
            refresh_path: refresh_path.into(),
            timeout,
            state: Mutex::new(RenewalState::default()),
            events,
            audit: AuditLogger::new(),
        }
    }

    /// Obtain a usable access credential after `stale_access` was found
    /// wanting (rejected, or about to expire).
    ///
    /// If a renewal already replaced `stale_access` while this caller was on
    /// its way here, the current credential is returned without another
    /// round-trip. Otherwise the caller joins (or starts) the in-flight
    /// renewal and waits for it to settle.
    pub async fn renew(self: &Arc<Self>, stale_access: Option<&str>) -> Result<String, RenewalError> {
        let receiver = {
            let mut state = self.state.lock().await;

            if !state.refreshing {
                match self.store.access().await {
                    Some(current) if Some(current.as_str()) != stale_access => {
                        debug!("access credential already renewed, reusing it");
                        return Ok(current);
                    }
                    // Torn down by a failed renewal (already signalled) or a logout.
                    None if stale_access.is_some() => {
                        debug!("session cleared while request was in flight");
                        return Err(RenewalError::MissingRefresh);
                    }
                    _ => {}
                }
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);

            if state.refreshing {
                debug!(waiters = state.waiters.len(), "joined in-flight renewal");
            } else {
                state.refreshing = true;
                tokio::spawn(Arc::clone(self).run_renewal());
            }
            rx
        };

        receiver.await.unwrap_or(Err(RenewalError::Abandoned))
    }

    /// Whether a renewal is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        self.state.lock().await.refreshing
    }

    /// Number of callers parked on the in-flight renewal.
    pub async fn pending_waiters(&self) -> usize {
        self.state.lock().await.waiters.len()
    }

    /// Clear the session and raise the re-authentication signal, once: a
    /// store that is already empty produces no second event.
    pub async fn expire_session(&self, reason: &str) {
        match self.store.clear().await {
            Ok(true) => {
                self.audit.session_expired(reason);
                let _ = self.events.send(SessionEvent::Expired);
            }
            Ok(false) => debug!(reason, "session already cleared"),
            Err(err) => {
                warn!(error = %err, "failed to clear persisted credentials");
                self.audit.session_expired(reason);
                let _ = self.events.send(SessionEvent::Expired);
            }
        }
    }

    async fn run_renewal(self: Arc<Self>) {
        self.audit.renewal_started(self.pending_waiters().await);

        // The session this renewal serves; settling only touches the store
        // while it is still the one held.
        let origin = self.store.get().await;

        let outcome = match tokio::time::timeout(self.timeout, self.exchange(origin.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(RenewalError::Timeout(self.timeout)),
        };

        match outcome {
            Ok((pair, rotated)) => {
                let access = pair.access.clone();
                let outcome = match self.store.replace_if(origin.as_ref(), pair).await {
                    Ok(true) => Ok(access),
                    Ok(false) => Err(RenewalError::Superseded),
                    Err(err) => {
                        warn!(error = %err, "renewed credentials could not be persisted");
                        Ok(access)
                    }
                };
                let waiters = self.take_waiters().await;
                match outcome {
                    Ok(access) => {
                        self.audit.renewal_succeeded(rotated, waiters.len());
                        info!(rotated, waiters = waiters.len(), "access credential renewed");
                        let _ = self.events.send(SessionEvent::Renewed);
                        release(waiters, Ok(access));
                    }
                    Err(err) => {
                        info!(waiters = waiters.len(), "session replaced during renewal, result dropped");
                        release(waiters, Err(err));
                    }
                }
            }
            Err(err) => {
                let expired = match self.store.clear_if(origin.as_ref()).await {
                    Ok(had_pair) => had_pair,
                    Err(store_err) => {
                        warn!(error = %store_err, "failed to clear persisted credentials");
                        origin.is_some()
                    }
                };
                let waiters = self.take_waiters().await;
                self.audit.renewal_failed(&err.to_string(), waiters.len());
                warn!(error = %err, waiters = waiters.len(), expired, "renewal failed");
                if expired {
                    let _ = self.events.send(SessionEvent::Expired);
                }
                release(waiters, Err(err));
            }
        }
    }

    async fn take_waiters(&self) -> VecDeque<Waiter> {
        let mut state = self.state.lock().await;
        state.refreshing = false;
        std::mem::take(&mut state.waiters)
    }

    /// The renewal round-trip. Keeps the old refresh credential when the
    /// server does not rotate it.
    async fn exchange(
        &self,
        origin: Option<&CredentialPair>,
    ) -> Result<(CredentialPair, bool), RenewalError> {
        let refresh = origin
            .and_then(|pair| pair.refresh.clone())
            .ok_or(RenewalError::MissingRefresh)?;

        let request = OutgoingRequest::new(Method::Post, self.refresh_path.as_str())
            .with_body(json!({ "refresh": refresh }));

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        if !response.is_success() {
            return Err(RenewalError::Rejected(response.status));
        }

        let body: RenewalResponse = serde_json::from_str(&response.body)
            .map_err(|e| RenewalError::Malformed(e.to_string()))?;

        let rotated = body.refresh.is_some();
        let pair = CredentialPair::new(body.access, Some(body.refresh.unwrap_or(refresh)));
        Ok((pair, rotated))
    }
}

fn release(waiters: VecDeque<Waiter>, outcome: Result<String, RenewalError>) {
    for waiter in waiters {
        // A waiter whose caller went away is simply skipped.
        let _ = waiter.send(outcome.clone());
    }
}
