//! REST client for the back-office backend.
//!
//! Every request passes through a single bearer hook: when the identity
//! session holds an access token it is sent as `Authorization: Bearer ...`,
//! otherwise the request goes out unmodified.

pub mod client;
pub mod error;

pub use client::{ApiClient, BearerSource};
pub use error::ApiError;
pub use reqwest::Method;
