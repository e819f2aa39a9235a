//! Anagrafe HTTP client
//!
//! Two cooperating pieces:
//!
//! - [`SessionStore`] owns the persisted token pair and role, tracks expiry and
//!   keeps the access token alive with a proactive refresh timer.
//! - [`Gateway`] attaches the access token to outgoing requests and recovers
//!   from a `401` with a single shared refresh followed by a replay.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod session;

pub use client::error::{ApiError, ClientError, ErrorKind};
pub use client::gateway::Gateway;
pub use client::{ApiClient, ApiClientBuilder};
pub use session::storage::{
    FileTokenStore, MemoryTokenStore, StorageError, StoredTokens, TokenStore,
};
pub use session::{AuthBackend, AuthStatus, Session, SessionConfig, SessionStore};
