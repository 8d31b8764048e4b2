use serde::{Deserialize, Serialize};

/// Who is logged in, as reported by the login endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

/// Body returned by the login endpoint: a token pair plus user fields.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    #[serde(flatten)]
    pub user: UserSummary,
}

/// Body returned by the refresh endpoint. `refresh` is present only when the
/// server rotates refresh credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct RenewalResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Session lifecycle notifications. `Expired` is the re-authentication
/// signal: the session is gone and the user must log in again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { username: String },
    Renewed,
    Expired,
    LoggedOut,
}

/// Login credentials from environment.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("URBANVITAL_USERNAME").ok()?;
        let password = std::env::var("URBANVITAL_PASSWORD").ok()?;
        Some(Self { username, password })
    }
}
