//! Core library for the back-office console.
//!
//! This crate owns everything the console shell needs to talk to the
//! backend on behalf of a signed-in operator:
//!
//! - [`auth`]: the session manager coordinating the backend-issued JWT
//!   and the identity-provider token triple
//! - [`storage`]: durable client-side key/value storage for both credential sets
//! - [`api`]: the REST client with bearer-token injection
//! - [`config`]: per-environment configuration
//! - [`models`]: the auth and profile records exposed to consumers

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;

pub use api::{ApiClient, ApiError, BearerSource};
pub use auth::{AuthGate, IdentityEvent, IdentitySession, SessionManager};
pub use config::Config;
pub use models::{AccountId, AuthState, IdentitySnapshot, Profile, ProviderUser, SessionState};
pub use storage::TokenStore;
