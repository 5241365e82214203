//! Data models exposed by the session manager.
//!
//! - `AuthState`, `AccountId`: claims derived from the backend-issued JWT
//! - `Profile`, `Address`: the cached operator profile
//! - `IdentitySnapshot`, `SessionState`, `ProviderUser`: identity-provider session state

pub mod auth;
pub mod identity;
pub mod profile;

pub use auth::{AccountId, AuthState};
pub use identity::{IdentitySnapshot, ProviderUser, SessionState};
pub use profile::{Address, Profile};
