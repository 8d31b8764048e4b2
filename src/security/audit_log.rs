use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn logged_in(&self, username: &str) {
        info!(target: "audit", event = "logged_in", username);
    }

    pub fn login_failed(&self, username: &str, status: Option<u16>) {
        warn!(target: "audit", event = "login_failed", username, status = status.unwrap_or(0));
    }

    pub fn logged_out(&self, username: Option<&str>) {
        info!(target: "audit", event = "logged_out", username = username.unwrap_or(""));
    }

    pub fn renewal_started(&self, waiters: usize) {
        info!(target: "audit", event = "renewal_started", waiters);
    }

    pub fn renewal_succeeded(&self, rotated: bool, waiters: usize) {
        info!(target: "audit", event = "renewal_succeeded", rotated, waiters);
    }

    pub fn renewal_failed(&self, reason: &str, waiters: usize) {
        warn!(target: "audit", event = "renewal_failed", reason, waiters);
    }

    pub fn session_expired(&self, reason: &str) {
        warn!(target: "audit", event = "session_expired", reason);
    }
}
