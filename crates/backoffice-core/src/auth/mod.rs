//! Authentication for the back-office console.
//!
//! Two credential flows coexist and are deliberately kept apart:
//!
//! - `CustomSession`: the backend-issued JWT, decoded locally for the
//!   operator's account and role
//! - `IdentitySession`: the identity-provider token triple, the only
//!   credential ever sent as a bearer token
//!
//! `SessionManager` owns both and is the single entry point for consumers.

pub mod claims;
pub mod custom;
pub mod identity;
pub mod keycloak;
pub mod pkce;
pub mod provider;
pub mod session;

pub use claims::TokenDecodeError;
pub use custom::CustomSession;
pub use identity::{IdentityEvent, IdentityEvents, IdentitySession, PendingLogin};
pub use keycloak::KeycloakClient;
pub use provider::{IdentityError, IdentityProvider, InitOptions, OnLoad, PkceMethod, TokenSet};
pub use session::{AuthGate, SessionManager};
