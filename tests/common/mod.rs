#![allow(dead_code)]

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use urbanvital_client::security::CredentialStore;
use urbanvital_client::transport::mock::{unsigned_jwt, ScriptedTransport};
use urbanvital_client::transport::{OutgoingRequest, RawResponse, TransportError};
use urbanvital_client::{ApiClient, ClientConfig};

pub const LOGIN: &str = "/auth/login/";
pub const REFRESH: &str = "/auth/token/refresh/";
pub const LOGOUT: &str = "/auth/logout/";

pub fn test_config() -> ClientConfig {
    ClientConfig::new("http://api.test")
}

pub fn client_with(transport: Arc<ScriptedTransport>) -> ApiClient {
    ApiClient::new(transport, CredentialStore::in_memory(), &test_config())
}

pub fn transport<F>(handler: F) -> Arc<ScriptedTransport>
where
    F: Fn(&OutgoingRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
{
    Arc::new(ScriptedTransport::new(handler))
}

pub fn ok(body: serde_json::Value) -> Result<RawResponse, TransportError> {
    Ok(RawResponse::json(200, &body))
}

pub fn unauthorized() -> Result<RawResponse, TransportError> {
    Ok(RawResponse::json(
        401,
        &json!({"detail": "Given token not valid for any token type"}),
    ))
}

pub fn login_ok(access: &str, refresh: &str) -> Result<RawResponse, TransportError> {
    ok(json!({
        "access": access,
        "refresh": refresh,
        "username": "ama",
        "email": "ama@clinic.test",
        "is_staff": true,
        "is_superuser": false
    }))
}

/// JWT-shaped access credential expiring `secs` from now.
pub fn token_expiring_in(secs: i64, id: &str) -> String {
    unsigned_jwt(&json!({"exp": Utc::now().timestamp() + secs, "jti": id}))
}

/// Requests for `path` that carried `token`, polled until `n` are seen.
pub async fn wait_for_sends(transport: &ScriptedTransport, predicate: impl Fn(&OutgoingRequest) -> bool, n: usize) {
    for _ in 0..400 {
        if transport.requests().iter().filter(|r| predicate(r)).count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} matching requests", n);
}

pub fn is_api_call(request: &OutgoingRequest) -> bool {
    !request.path.starts_with("/auth/")
}
