//! The authenticated request pipeline.
//!
//! Every call goes through [`ApiClient::request`]: the access credential is
//! attached (after a proactive renewal when it is about to expire), a 401 is
//! answered by joining the single-flight renewal and retrying exactly once,
//! other failures are normalized into [`ApiError`], cacheable reads are
//! memoized and successful writes invalidate their resource before
//! returning. A read that was in flight across an invalidation is returned
//! but not memoized.

pub mod config;
pub mod error;
pub mod resources;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, ResponseCache};
use crate::security::audit_log::AuditLogger;
use crate::security::auth::{LoginResponse, SessionEvent, UserSummary};
use crate::security::credential_store::{CredentialPair, CredentialStore, FileStorage};
use crate::security::freshness::FreshnessPolicy;
use crate::security::token_refresh::RenewalCoordinator;
use crate::transport::{HttpTransport, Method, OutgoingRequest, RawResponse, Transport};

pub use config::{ClientConfig, Endpoints};
pub use error::{ApiError, ServerErrorBody};
pub use resources::{Resource, Resources};

/// One call as the application describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: BTreeMap<String, String>,
    body: Option<Value>,
    cacheable: bool,
    invalidates: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
            cacheable: false,
            invalidates: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Memoize the result. Only honored for reads.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Override the cache prefix a successful write invalidates.
    pub fn invalidates(mut self, prefix: impl Into<String>) -> Self {
        self.invalidates = Some(prefix.into());
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable && !self.method.is_mutating()
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.path, &self.query)
    }

    /// Explicit override, else the first path segment.
    pub fn invalidation_prefix(&self) -> Option<String> {
        if !self.method.is_mutating() {
            return None;
        }
        self.invalidates.clone().or_else(|| {
            self.path
                .split('/')
                .find(|segment| !segment.is_empty())
                .map(String::from)
        })
    }

    fn outgoing(&self, bearer: Option<String>) -> OutgoingRequest {
        OutgoingRequest {
            method: self.method,
            path: self.path.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            bearer,
        }
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    coordinator: Arc<RenewalCoordinator>,
    cache: ResponseCache,
    freshness: FreshnessPolicy,
    endpoints: Endpoints,
    events: broadcast::Sender<SessionEvent>,
    audit: AuditLogger,
}

/// Shared handle to the client; clones are cheap and see the same session,
/// renewal state and cache.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoints", &self.inner.endpoints)
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, store: CredentialStore, config: &ClientConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        let coordinator = Arc::new(RenewalCoordinator::new(
            transport.clone(),
            store.clone(),
            config.endpoints.refresh.clone(),
            config.renewal_timeout(),
            events.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                transport,
                store,
                coordinator,
                cache: ResponseCache::new(config.cache_ttl()),
                freshness: FreshnessPolicy::new(config.renewal_margin_secs, config.stale_after_secs),
                endpoints: config.endpoints.clone(),
                events,
                audit: AuditLogger::new(),
            }),
        }
    }

    /// HTTP transport plus the session file, restoring any saved session.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.base_url.clone(), config.request_timeout())?;
        let storage = FileStorage::new(config.storage_path());
        let store = CredentialStore::restore(Arc::new(storage)).context("restoring saved session")?;
        Ok(Self::new(Arc::new(transport), store, config))
    }

    pub async fn request(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let key = request.is_cacheable().then(|| request.cache_key());
        let mut generation = 0;
        if let Some(key) = &key {
            if let Some(hit) = self.inner.cache.get(key).await {
                debug!(key = %key, "cache hit");
                return Ok(hit);
            }
            generation = self.inner.cache.generation().await;
        }

        let access = self.prepare_access().await?;
        let mut response = self.send(&request, access.clone()).await?;
        if response.is_unauthorized() {
            response = self.retry_after_renewal(&request, access).await?;
        }

        if !response.is_success() {
            let err = ApiError::from_response(response.status, &response.body);
            debug!(
                method = %request.method,
                path = %request.path,
                status = response.status,
                error = %err,
                "request failed"
            );
            return Err(err);
        }

        let value = decode_body(&response)?;

        if let Some(prefix) = request.invalidation_prefix() {
            let removed = self.inner.cache.invalidate(Some(&prefix)).await;
            debug!(prefix = %prefix, removed, "invalidated cached reads after write");
        }
        if let Some(key) = key {
            self.inner.cache.set_if_current(key, value.clone(), generation).await;
        }
        Ok(value)
    }

    /// Current access credential, renewed first when it is about to expire.
    async fn prepare_access(&self) -> Result<Option<String>, ApiError> {
        let Some(pair) = self.inner.store.get().await else {
            return Ok(None);
        };
        if pair.has_refresh() && self.inner.freshness.needs_renewal_soon(&pair.access, Utc::now()) {
            debug!("access credential near expiry, renewing before send");
            let access = self.inner.coordinator.renew(Some(&pair.access)).await?;
            return Ok(Some(access));
        }
        Ok(Some(pair.access))
    }

    async fn send(&self, request: &ApiRequest, access: Option<String>) -> Result<RawResponse, ApiError> {
        let outgoing = request.outgoing(access);
        Ok(self.inner.transport.send(&outgoing).await?)
    }

    async fn retry_after_renewal(
        &self,
        request: &ApiRequest,
        rejected: Option<String>,
    ) -> Result<RawResponse, ApiError> {
        debug!(path = %request.path, "access credential rejected, renewing");
        let access = self.inner.coordinator.renew(rejected.as_deref()).await?;

        let response = self.send(request, Some(access)).await?;
        if response.is_unauthorized() {
            warn!(path = %request.path, "request rejected again after renewal");
            self.inner
                .coordinator
                .expire_session("request rejected after renewal")
                .await;
            return Err(ApiError::AuthExpired(
                "request rejected after renewal".to_string(),
            ));
        }
        Ok(response)
    }

    /// Exchange username and password for a fresh session.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserSummary, ApiError> {
        let request = OutgoingRequest::new(Method::Post, self.inner.endpoints.login.as_str())
            .with_body(json!({ "username": username, "password": password }));

        let response = match self.inner.transport.send(&request).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                self.inner.audit.login_failed(username, Some(response.status));
                self.discard_session().await;
                return Err(ApiError::from_response(response.status, &response.body));
            }
            Err(err) => {
                self.inner.audit.login_failed(username, None);
                self.discard_session().await;
                return Err(err.into());
            }
        };

        let login: LoginResponse =
            serde_json::from_str(&response.body).map_err(|e| ApiError::Decode(e.to_string()))?;

        let pair = CredentialPair::new(login.access, Some(login.refresh));
        if let Err(err) = self.inner.store.set(pair).await {
            warn!(error = %err, "session could not be persisted");
        }
        if let Err(err) = self.inner.store.set_user(login.user.clone()).await {
            warn!(error = %err, "user summary could not be persisted");
        }
        self.inner.cache.invalidate(None).await;

        self.inner.audit.logged_in(username);
        info!(username, "login successful");
        let _ = self.inner.events.send(SessionEvent::LoggedIn {
            username: username.to_string(),
        });
        Ok(login.user)
    }

    /// Best-effort server logout, then the local session and cache are
    /// dropped regardless of the outcome.
    pub async fn logout(&self) {
        if let Some(pair) = self.inner.store.get().await {
            let mut request = OutgoingRequest::new(Method::Post, self.inner.endpoints.logout.as_str())
                .with_bearer(Some(pair.access.clone()));
            if let Some(refresh) = &pair.refresh {
                request = request.with_body(json!({ "refresh": refresh }));
            }
            match self.inner.transport.send(&request).await {
                Ok(resp) if resp.is_success() => debug!("server session closed"),
                Ok(resp) => debug!(status = resp.status, "server logout refused, ignoring"),
                Err(err) => debug!(error = %err, "server logout unreachable, ignoring"),
            }
        }

        let username = self.inner.store.user().await.and_then(|u| u.username);
        self.discard_session().await;
        self.inner.audit.logged_out(username.as_deref());
        let _ = self.inner.events.send(SessionEvent::LoggedOut);
    }

    async fn discard_session(&self) {
        if let Err(err) = self.inner.store.clear().await {
            warn!(error = %err, "failed to clear persisted credentials");
        }
        self.inner.cache.invalidate(None).await;
    }

    /// Renew now, regardless of the access credential's expiry.
    pub async fn refresh_now(&self) -> Result<(), ApiError> {
        let current = self.inner.store.access().await;
        self.inner.coordinator.renew(current.as_deref()).await?;
        Ok(())
    }

    /// The logged-in user's profile, fetched through the pipeline.
    pub async fn profile(&self) -> Result<Value, ApiError> {
        self.request(ApiRequest::get(self.inner.endpoints.profile.as_str()))
            .await
    }

    pub async fn clear_cache(&self, prefix: Option<&str>) -> usize {
        self.inner.cache.invalidate(prefix).await
    }

    pub async fn credential(&self) -> Option<CredentialPair> {
        self.inner.store.get().await
    }

    pub async fn user(&self) -> Option<UserSummary> {
        self.inner.store.user().await
    }

    /// Coarse pre-check: has the session outlived its expected lifetime?
    pub async fn is_credential_stale(&self) -> bool {
        let login_time = self.inner.store.login_time().await;
        self.inner.freshness.is_stale(login_time, Utc::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }
}

fn decode_body(response: &RawResponse) -> Result<Value, ApiError> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&response.body).map_err(|e| ApiError::Decode(e.to_string()))
}
