//! Scripted in-process transport for exercising the client without a server.
//!
//! Every request is recorded before it is answered, so tests can observe what
//! is in flight. A path can be gated: sends to it park until the gate is
//! released, which lets a test hold a renewal open while other callers queue.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::transport::{OutgoingRequest, RawResponse, Transport, TransportError};

type Handler = dyn Fn(&OutgoingRequest) -> Result<RawResponse, TransportError> + Send + Sync;

pub struct ScriptedTransport {
    handler: Box<Handler>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    latency: Option<Duration>,
    log: Mutex<Vec<OutgoingRequest>>,
}

/// Holds sends to one path until released.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    /// Let exactly one parked (or future) send through.
    pub fn release_one(&self) {
        self.0.add_permits(1);
    }

    pub fn open(&self) {
        self.0.add_permits(1024);
    }
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&OutgoingRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            gates: Mutex::new(HashMap::new()),
            latency: None,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn gate(&self, path: &str) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), semaphore.clone());
        Gate(semaphore)
    }

    pub fn requests(&self) -> Vec<OutgoingRequest> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    pub fn count_with_bearer(&self, path: &str, token: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path == path && r.bearer.as_deref() == Some(token))
            .count()
    }
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("latency", &self.latency)
            .field("recorded", &self.requests().len())
            .finish()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &OutgoingRequest) -> Result<RawResponse, TransportError> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let gate = self
            .gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.path)
            .cloned();
        if let Some(gate) = gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(TransportError::Network("gate closed".to_string())),
            }
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        (self.handler)(request)
    }
}

/// Build an unsigned JWT-shaped token carrying the given claims.
pub fn unsigned_jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{}.{}.sig", header, payload)
}
