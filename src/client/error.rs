//! Error taxonomy seen by callers of the client.
//!
//! Auth failures are resolved inside the client: a caller only ever sees
//! `AuthExpired` or `RenewalTimeout` once renewal (and the single retry) has
//! been given its chance. Everything else carries a message fit for display.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::security::token_refresh::RenewalError;
use crate::transport::TransportError;

pub const GENERIC_MESSAGE: &str = "Something went wrong. Please try again.";
pub const NETWORK_MESSAGE: &str = "Unable to reach the server. Check your connection and try again.";

/// Known shapes of a server error body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerErrorBody {
    Detail { detail: String },
    Message { message: String },
    Fields(BTreeMap<String, FieldMessages>),
    Unknown(Value),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldMessages {
    One(String),
    Many(Vec<String>),
}

impl FieldMessages {
    fn into_vec(self) -> Vec<String> {
        match self {
            FieldMessages::One(message) => vec![message],
            FieldMessages::Many(messages) => messages,
        }
    }
}

impl ServerErrorBody {
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| ServerErrorBody::Unknown(Value::String(body.to_string())))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("session expired: {0}")]
    AuthExpired(String),

    #[error("credential renewal timed out after {0:?}")]
    RenewalTimeout(Duration),

    #[error("validation failed: {}", format_fields(.fields))]
    Validation { fields: BTreeMap<String, Vec<String>> },

    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },

    #[error("response body is not valid JSON: {0}")]
    Decode(String),
}

impl From<RenewalError> for ApiError {
    fn from(err: RenewalError) -> Self {
        match err {
            RenewalError::Timeout(bound) => ApiError::RenewalTimeout(bound),
            other => ApiError::AuthExpired(other.to_string()),
        }
    }
}

fn format_fields(fields: &BTreeMap<String, Vec<String>>) -> String {
    fields
        .iter()
        .map(|(field, messages)| format!("{}: {}", field, messages.join(" ")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ApiError {
    /// Normalize a non-success, non-auth response.
    pub fn from_response(status: u16, body: &str) -> Self {
        match ServerErrorBody::parse(body) {
            ServerErrorBody::Detail { detail: message }
            | ServerErrorBody::Message { message } => ApiError::Server { status, message },
            ServerErrorBody::Fields(fields) if status == 400 && !fields.is_empty() => {
                ApiError::Validation {
                    fields: fields
                        .into_iter()
                        .map(|(field, messages)| (field, messages.into_vec()))
                        .collect(),
                }
            }
            _ => ApiError::Server {
                status,
                message: GENERIC_MESSAGE.to_string(),
            },
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::AuthExpired(_) | ApiError::RenewalTimeout(_))
    }

    /// Message to show the user, if any. Auth errors have none: they end in
    /// a redirect to login, and a notice on top of that is just noise.
    pub fn notice(&self) -> Option<String> {
        match self {
            ApiError::AuthExpired(_) | ApiError::RenewalTimeout(_) => None,
            ApiError::Transport(_) => Some(NETWORK_MESSAGE.to_string()),
            ApiError::Validation { fields } => Some(format_fields(fields)),
            ApiError::Server { message, .. } => Some(message.clone()),
            ApiError::Decode(_) => Some(GENERIC_MESSAGE.to_string()),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            ApiError::Validation { .. } => Some(400),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_is_preferred() {
        let err = ApiError::from_response(404, r#"{"detail":"Not found."}"#);
        assert_eq!(
            err,
            ApiError::Server {
                status: 404,
                message: "Not found.".into()
            }
        );
        assert_eq!(err.notice().as_deref(), Some("Not found."));
    }

    #[test]
    fn message_is_used_without_detail() {
        let err = ApiError::from_response(409, r#"{"message":"Patient already checked in","code":7}"#);
        assert_eq!(err.notice().as_deref(), Some("Patient already checked in"));
    }

    #[test]
    fn field_errors_become_validation() {
        let err = ApiError::from_response(
            400,
            r#"{"phone":["This field is required."],"email":"Enter a valid email address."}"#,
        );
        match &err {
            ApiError::Validation { fields } => {
                assert_eq!(fields["phone"], vec!["This field is required."]);
                assert_eq!(fields["email"], vec!["Enter a valid email address."]);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert_eq!(
            err.notice().as_deref(),
            Some("email: Enter a valid email address.; phone: This field is required.")
        );
    }

    #[test]
    fn unknown_shapes_fall_back_to_generic() {
        for body in ["<html>502 Bad Gateway</html>", "", r#"{"items":[{"qty":["bad"]}]}"#, "[1,2]"] {
            let err = ApiError::from_response(502, body);
            assert_eq!(err.notice().as_deref(), Some(GENERIC_MESSAGE), "body {:?}", body);
        }
    }

    #[test]
    fn field_map_outside_400_is_generic() {
        let err = ApiError::from_response(500, r#"{"phone":["boom"]}"#);
        assert_eq!(err.notice().as_deref(), Some(GENERIC_MESSAGE));
    }

    #[test]
    fn body_shapes_parse_explicitly() {
        assert!(matches!(
            ServerErrorBody::parse(r#"{"detail":"x"}"#),
            ServerErrorBody::Detail { .. }
        ));
        assert!(matches!(
            ServerErrorBody::parse(r#"{"message":"x"}"#),
            ServerErrorBody::Message { .. }
        ));
        assert!(matches!(
            ServerErrorBody::parse(r#"{"name":["x"]}"#),
            ServerErrorBody::Fields(_)
        ));
        assert!(matches!(
            ServerErrorBody::parse(r#"{"detail":{"nested":true}}"#),
            ServerErrorBody::Unknown(_)
        ));
    }

    #[test]
    fn auth_errors_are_silent() {
        let expired = ApiError::from(RenewalError::Rejected(401));
        assert!(expired.is_auth());
        assert!(expired.notice().is_none());

        let timeout = ApiError::from(RenewalError::Timeout(Duration::from_secs(15)));
        assert_eq!(timeout, ApiError::RenewalTimeout(Duration::from_secs(15)));
        assert!(timeout.notice().is_none());
    }

    #[test]
    fn transport_errors_get_network_notice() {
        let err = ApiError::from(TransportError::Network("connection refused".into()));
        assert_eq!(err.notice().as_deref(), Some(NETWORK_MESSAGE));
        assert!(!err.is_auth());
    }
}
