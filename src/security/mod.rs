pub mod audit_log;
pub mod auth;
pub mod credential_store;
pub mod freshness;
pub mod token_refresh;

pub use auth::{SessionEvent, UserSummary};
pub use credential_store::{CredentialPair, CredentialStore, FileStorage, MemoryStorage};
pub use freshness::FreshnessPolicy;
pub use token_refresh::{RenewalCoordinator, RenewalError};
